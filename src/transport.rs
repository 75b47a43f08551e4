//! Byte streams to the instruments and line framing on top of them.
//!
//! Drivers work with any interface implementing [embedded_io::Read] &
//! [embedded_io::Write] plus the small [`Transport`] extension. Replies are
//! single lines; multi-field replies are comma separated.

use embedded_io::{Read as _, Write as _};
use log::debug;
use thiserror::Error;

use crate::{
    config::{DataBits, FlowControl, Keithley6487Config, Parity},
    error::Error,
};

/// A reliable byte stream to one instrument.
pub trait Transport: embedded_io::Read + embedded_io::Write {
    /// Human readable status of the last bus operation, appended to communication errors.
    fn status_report(&self) -> String {
        String::new()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn status_report(&self) -> String {
        (**self).status_report()
    }
}

/// A typed single line reply.
pub trait ParseReply: Sized {
    /// What the reply is, for error messages.
    const NAME: &'static str;

    fn parse(line: &str) -> Option<Self>;
}

impl ParseReply for u32 {
    const NAME: &'static str = "integer";

    fn parse(line: &str) -> Option<Self> {
        line.trim().trim_start_matches('+').parse().ok()
    }
}

impl ParseReply for f64 {
    const NAME: &'static str = "number";

    fn parse(line: &str) -> Option<Self> {
        line.trim().parse().ok()
    }
}

/// Failure while exchanging a line with the device.
#[derive(Error, Debug)]
pub enum LineError<E: embedded_io::Error> {
    #[error("transport error: {0:?}")]
    Io(E),
    #[error("the stream was closed by the device")]
    Closed,
    #[error("reply is longer than {0} bytes")]
    Overflow(usize),
    #[error("reply is not valid text")]
    Encoding,
    #[error("reply '{line}' has an incorrect format, expected {expected}")]
    Format { expected: &'static str, line: String },
}

/// Writes terminated command lines and reads reply lines.
pub struct LineLink<S: Transport, const L: usize = 256> {
    stream: S,
    /// Bytes received past the end of the last returned line.
    pending: heapless::Vec<u8, L>,
    terminator: &'static str,
}

impl<S: Transport, const L: usize> LineLink<S, L> {
    pub fn new(stream: S, terminator: &'static str) -> Self {
        Self {
            stream,
            pending: heapless::Vec::new(),
            terminator,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Write one command line.
    pub fn write_line(&mut self, line: &str) -> Result<(), LineError<S::Error>> {
        debug!("> {line}");
        self.stream.write_all(line.as_bytes()).map_err(LineError::Io)?;
        self.stream
            .write_all(self.terminator.as_bytes())
            .map_err(LineError::Io)?;
        self.stream.flush().map_err(LineError::Io)
    }

    /// Read one reply line, without its terminator.
    pub fn read_line(&mut self) -> Result<String, LineError<S::Error>> {
        loop {
            if let Some(end) = self.pending.iter().position(|&byte| byte == b'\n') {
                return self.take_line(end, end + 1);
            }
            if self.pending.len() == L {
                self.pending.clear();
                return Err(LineError::Overflow(L));
            }
            let mut chunk = [0u8; 32];
            let room = core::cmp::min(chunk.len(), L - self.pending.len());
            match self.stream.read(&mut chunk[..room]) {
                Ok(0) => return Err(LineError::Closed),
                Ok(count) => {
                    // Room was checked above.
                    let _ = self.pending.extend_from_slice(&chunk[..count]);
                }
                Err(e) => {
                    // A reply cut short by a timeout is never a valid line.
                    if !self.pending.is_empty() {
                        debug!("dropping {} bytes of an unterminated reply", self.pending.len());
                        self.pending.clear();
                    }
                    return Err(LineError::Io(e));
                }
            }
        }
    }

    /// Read one reply line and parse it.
    pub fn read<T: ParseReply>(&mut self) -> Result<T, LineError<S::Error>> {
        let line = self.read_line()?;
        T::parse(&line).ok_or(LineError::Format {
            expected: T::NAME,
            line,
        })
    }

    /// Drop any buffered reply bytes.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn take_line(&mut self, end: usize, consumed: usize) -> Result<String, LineError<S::Error>> {
        let line = core::str::from_utf8(&self.pending[..end])
            .map(|text| text.trim_end_matches('\r').to_owned())
            .map_err(|_| LineError::Encoding);
        let mut rest: heapless::Vec<u8, L> = heapless::Vec::new();
        let _ = rest.extend_from_slice(&self.pending[consumed..]);
        self.pending = rest;
        let line = line?;
        debug!("< {line}");
        Ok(line)
    }

    /// Fold a line failure into a crate error, attaching the transport status report.
    pub fn error(&self, operation: &'static str, context: impl Into<String>, error: LineError<S::Error>) -> Error {
        let mut detail = error.to_string();
        let report = self.stream.status_report();
        if !report.is_empty() {
            detail.push('\n');
            detail.push_str(&report);
        }
        Error::communication(operation, context).with_detail(detail)
    }
}

/// A `std::io::Error` usable as an [embedded_io::Error].
#[derive(Error, Debug)]
#[error(transparent)]
pub struct IoError(#[from] std::io::Error);

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// An RS-232 link opened with the `serialport` crate.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    last_error: Option<String>,
}

impl SerialLink {
    /// Open the serial port described by `config`.
    pub fn open(config: &Keithley6487Config) -> serialport::Result<Self> {
        let data_bits = match config.data_bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let flow_control = match config.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
        };
        let parity = match config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .flow_control(flow_control)
            .parity(parity)
            .stop_bits(serialport::StopBits::One)
            .timeout(config.timeout)
            .open()?;
        Ok(Self {
            port,
            last_error: None,
        })
    }

    fn record<T>(&mut self, result: std::io::Result<T>) -> Result<T, IoError> {
        result.map_err(|e| {
            self.last_error = Some(e.to_string());
            IoError(e)
        })
    }
}

impl embedded_io::ErrorType for SerialLink {
    type Error = IoError;
}

impl embedded_io::Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let result = std::io::Read::read(&mut self.port, buf);
        self.record(result)
    }
}

impl embedded_io::Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let result = std::io::Write::write(&mut self.port, buf);
        self.record(result)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        let result = std::io::Write::flush(&mut self.port);
        self.record(result)
    }
}

impl Transport for SerialLink {
    fn status_report(&self) -> String {
        let name = self.port.name().unwrap_or_else(|| "serial port".to_owned());
        match &self.last_error {
            Some(error) => format!("{name}: last error: {error}"),
            None => format!("{name}: no errors"),
        }
    }
}

#[cfg(feature = "gpib")]
pub use visa::VisaLink;

#[cfg(feature = "gpib")]
mod visa {
    use std::{
        ffi::CString,
        io::{Read, Write},
        time::Duration,
    };

    use visa_rs::prelude::*;

    use super::{IoError, Transport};

    /// A GPIB link opened through the VISA library.
    pub struct VisaLink {
        // Declared before the resource manager so the session closes first.
        instrument: Instrument,
        _manager: DefaultRM,
        resource: String,
        last_error: Option<String>,
    }

    impl VisaLink {
        /// Open a VISA resource such as `GPIB0::16::INSTR`.
        pub fn open(resource: &str, timeout: Duration) -> Result<Self, String> {
            let manager = DefaultRM::new().map_err(|e| format!("VISA resource manager: {e:?}"))?;
            let name = CString::new(resource).map_err(|e| e.to_string())?;
            let instrument = manager
                .open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| format!("VISA open '{resource}': {e:?}"))?;
            Ok(Self {
                instrument,
                _manager: manager,
                resource: resource.to_owned(),
                last_error: None,
            })
        }

        fn record<T>(&mut self, result: std::io::Result<T>) -> Result<T, IoError> {
            result.map_err(|e| {
                self.last_error = Some(e.to_string());
                IoError(e)
            })
        }
    }

    impl embedded_io::ErrorType for VisaLink {
        type Error = IoError;
    }

    impl embedded_io::Read for VisaLink {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let result = (&self.instrument).read(buf);
            self.record(result)
        }
    }

    impl embedded_io::Write for VisaLink {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            let result = (&self.instrument).write(buf);
            self.record(result)
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            let result = (&self.instrument).flush();
            self.record(result)
        }
    }

    impl Transport for VisaLink {
        fn status_report(&self) -> String {
            match &self.last_error {
                Some(error) => format!("{}: last error: {error}", self.resource),
                None => format!("{}: no errors", self.resource),
            }
        }
    }
}
