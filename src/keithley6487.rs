//! Driver for the Keithley 6487 picoammeter / voltage source over RS-232.
//!
//! The instrument speaks SCPI. Every setting command is followed by a read of
//! the error queue (`SYST:ERR?`) and of the questionable event register
//! (`STAT:QUES:EVEN?`), see [`Keithley6487::send_and_check`].

use log::{info, warn};
use modular_bitfield::prelude::*;

use crate::{
    config::Keithley6487Config,
    device::{Measurement, Value, VoltageSource},
    error::{Error, ErrorKind, Result, Severity},
    scaling::ScalingFactors,
    transport::{LineLink, ParseReply, SerialLink, Transport},
    units::{Amperes, Volts},
};

/// Largest output magnitude, the source always runs on its 500 V range.
pub const MAX_VOLTAGE: Volts = Volts(500.0);
/// Largest current limit the source supports.
pub const MAX_COMPLIANCE: Amperes = Amperes(25e-3);
pub const ACCURACY: Volts = Volts(0.1);

const IDENTITY_PREFIX: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 6487";
const VOLTAGE_RANGE: u32 = 500;
const OPERATION_COMPLETE: u32 = 1;

/// Questionable event register.
#[bitfield]
#[derive(Debug)]
pub struct QuestionableStatus {
    #[skip]
    __: B8,
    /// Calibration summary.
    pub calibration: bool,
    #[skip]
    __: B5,
    /// A command was executed with a warning (parameter ignored, out of range, ...).
    pub command_warning: bool,
    #[skip]
    __: B1,
}

impl QuestionableStatus {
    pub fn from_register(value: u16) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }

    pub fn has_warnings(&self) -> bool {
        self.calibration() || self.command_warning()
    }

    pub fn message(&self) -> String {
        let mut lines = Vec::new();
        if self.calibration() {
            lines.push("Calibration summary");
        }
        if self.command_warning() {
            lines.push("Command warning");
        }
        lines.join("\n")
    }
}

impl ParseReply for QuestionableStatus {
    const NAME: &'static str = "event register";

    fn parse(line: &str) -> Option<Self> {
        let value: u16 = line.trim().trim_start_matches('+').parse().ok()?;
        Some(Self::from_register(value))
    }
}

/// An entry of the error queue, e.g. `-222,"Parameter data out of range"`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SystemError {
    code: i32,
    message: String,
}

impl ParseReply for SystemError {
    const NAME: &'static str = "error queue entry";

    fn parse(line: &str) -> Option<Self> {
        let (code, message) = line.trim().split_once(',')?;
        Some(Self {
            code: code.trim().parse().ok()?,
            message: message.trim().trim_matches('"').to_owned(),
        })
    }
}

/// `READ?` reply with `FORM:ELEM READ,VSO`: the current followed by the source voltage.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    current: f64,
    voltage: f64,
}

impl ParseReply for Reading {
    const NAME: &'static str = "current and voltage";

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(',');
        let current = fields.next()?.trim().trim_end_matches('A').parse().ok()?;
        let voltage = fields.next()?.trim().trim_end_matches('V').parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self { current, voltage })
    }
}

/// You can create a Keithley6487 over any [`Transport`]; [`Keithley6487::open`] uses a serial port.
pub struct Keithley6487<S: Transport> {
    link: LineLink<S>,
    scaling: ScalingFactors,
    /// Current limit committed by the last successful `set`.
    current_limit: Option<Amperes>,
    initialized: bool,
}

impl Keithley6487<SerialLink> {
    /// Open the serial port named in `config` and bring the instrument to a known state.
    pub fn open(config: &Keithley6487Config) -> Result<Self> {
        let link = SerialLink::open(config).map_err(|e| {
            Error::connection(
                "Keithley6487::open",
                format!("Unable to connect to the device on '{}'.", config.port),
            )
            .with_detail(e.to_string())
        })?;
        Self::with_transport(link)
    }
}

impl<S: Transport> Keithley6487<S> {
    /// Reset the instrument, check its identity and select current measurement.
    pub fn with_transport(stream: S) -> Result<Self> {
        let mut device = Self {
            link: LineLink::new(stream, "\n"),
            scaling: ScalingFactors::default(),
            current_limit: None,
            initialized: false,
        };
        device.handshake().map_err(|e| match e.kind() {
            ErrorKind::Communication => e.into_kind(ErrorKind::Connection),
            _ => e,
        })?;
        device.initialized = true;
        info!("Keithley6487: connected.");
        Ok(device)
    }

    fn handshake(&mut self) -> Result<()> {
        self.send("*RST")?;
        self.send("*IDN?")?;
        let identity = self
            .link
            .read_line()
            .map_err(|e| self.link.error("Keithley6487::connect", "Unable to read the identification.", e))?;
        if !identity.starts_with(IDENTITY_PREFIX) {
            return Err(Error::connection(
                "Keithley6487::connect",
                format!("Connected device is not supported. Device identified itself as '{identity}'."),
            ));
        }
        self.send("FUNC 'CURR'")?;
        self.send("FORM:ELEM READ,VSO")
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.link.write_line(command).map_err(|e| {
            self.link.error(
                "Keithley6487::send",
                format!("Unable to send a command to the device. Command = '{command}'."),
                e,
            )
        })
    }

    /// Send `command`, then fail if the error queue holds an error or a questionable event is flagged.
    pub fn send_and_check(&mut self, command: &str) -> Result<()> {
        self.send(command)?;

        self.send("SYST:ERR?")?;
        let error: SystemError = self.read()?;
        if error.code != 0 {
            return Err(Error::device_reported(
                "Keithley6487::send_and_check",
                Severity::Error,
                command,
                format!("{}: {}", error.code, error.message),
            ));
        }

        self.send("STAT:QUES:EVEN?")?;
        let status: QuestionableStatus = self.read()?;
        if status.has_warnings() {
            return Err(Error::device_reported(
                "Keithley6487::send_and_check",
                Severity::Warning,
                command,
                status.message(),
            ));
        }
        Ok(())
    }

    fn read<T: ParseReply>(&mut self) -> Result<T> {
        self.link
            .read::<T>()
            .map_err(|e| self.link.error("Keithley6487::read", "Unable to read data from the device.", e))
    }

    fn last_operation_is_completed(&mut self) -> Result<bool> {
        self.send("*OPC?")?;
        let status: u32 = self.read()?;
        Ok(status == OPERATION_COMPLETE)
    }
}

impl<S: Transport> VoltageSource for Keithley6487<S> {
    fn set(&mut self, value: Value) -> Result<Value> {
        // Written so that NaN fails the range checks.
        if !(value.voltage.abs() <= MAX_VOLTAGE) {
            return Err(Error::validation(
                "Keithley6487::set",
                format!("Voltage {} is too high. Maximal allowed voltage is {MAX_VOLTAGE}.", value.voltage),
            ));
        }
        if !(value.compliance.abs() <= MAX_COMPLIANCE) {
            return Err(Error::validation(
                "Keithley6487::set",
                format!(
                    "Compliance {} is too high. Maximal allowed current limit is {MAX_COMPLIANCE}.",
                    value.compliance
                ),
            ));
        }

        let voltage = self.scaling.voltage_to_field(value.voltage);
        let current_limit = self.scaling.current_to_field(value.compliance.abs());
        self.send_and_check(&format!("SOUR:VOLT:RANG {VOLTAGE_RANGE}"))?;
        self.send_and_check(&format!("SOUR:VOLT {voltage}"))?;
        self.send_and_check(&format!("SOUR:VOLT:ILIM {current_limit}"))?;
        self.send_and_check("SOUR:VOLT:STAT ON")?;
        if !self.last_operation_is_completed()? {
            return Err(Error::new(ErrorKind::DeviceReported, "Keithley6487::set", "Voltage was not set."));
        }

        // The instrument rounds the limit up to one of its fixed ranges.
        self.send("SOUR:VOLT:ILIM?")?;
        let current_limit: f64 = self.read()?;
        let current_limit = self.scaling.field_to_current(current_limit).abs();
        self.current_limit = Some(current_limit);
        Ok(Value::new(value.voltage, current_limit))
    }

    fn accuracy(&mut self, _voltage: Volts) -> Result<Volts> {
        Ok(ACCURACY)
    }

    fn measure(&mut self) -> Result<Measurement> {
        self.send("READ?")?;
        let reading: Reading = self.read()?;
        let current = self.scaling.field_to_current(reading.current);
        let voltage = self.scaling.field_to_voltage(reading.voltage);
        let in_compliance = self.current_limit.is_some_and(|limit| current.abs() >= limit);
        Ok(Measurement::now(current, voltage, in_compliance))
    }

    fn off(&mut self) -> Result<()> {
        self.send_and_check("SOUR:VOLT:STAT OFF")?;
        if !self.last_operation_is_completed()? {
            return Err(Error::new(
                ErrorKind::DeviceReported,
                "Keithley6487::off",
                "Voltage is not turned off.",
            ));
        }
        self.current_limit = None;
        Ok(())
    }
}

impl<S: Transport> Drop for Keithley6487<S> {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        if let Err(e) = self.off() {
            warn!("Keithley6487: unable to switch the output off.\n{}", e.full_message());
        }
        // Back to the power-on state and to front panel control.
        for command in ["*RST", "SYST:LOC"] {
            if let Err(e) = self.send(command) {
                warn!("Keithley6487: unable to send '{command}'.\n{}", e.full_message());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::MockSerial;

    const IDENTITY: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 6487,1234567,A04   Jun 22 2004 13:24:31/A02  /K";
    const NO_ERROR: &str = "0,\"No error\"";

    fn queue_checked(mock: &mut MockSerial) {
        mock.queue_reply(NO_ERROR);
        mock.queue_reply("0");
    }

    fn connect(mock: &mut MockSerial) -> Keithley6487<&mut MockSerial> {
        mock.queue_reply(IDENTITY);
        Keithley6487::with_transport(mock).unwrap()
    }

    fn queue_set(mock: &mut MockSerial, current_limit: &str) {
        for _ in 0..4 {
            queue_checked(mock);
        }
        mock.queue_reply("1");
        mock.queue_reply(current_limit);
    }

    #[test]
    fn handshake_sequence() {
        let mut mock = MockSerial::new();
        let device = connect(&mut mock);
        assert_eq!(
            device.link.stream().written_lines(),
            vec!["*RST", "*IDN?", "FUNC 'CURR'", "FORM:ELEM READ,VSO"]
        );
    }

    #[test]
    fn wrong_identity_is_a_connection_error() {
        let mut mock = MockSerial::new();
        mock.queue_reply("KEITHLEY INSTRUMENTS INC.,MODEL 6485,1234567");
        let error = Keithley6487::with_transport(&mut mock).err().unwrap();
        assert_eq!(error.kind(), ErrorKind::Connection);
        assert!(error.message().contains("MODEL 6485"));
        // Nothing is sent on drop of a half initialized driver.
        assert_eq!(mock.written_lines(), vec!["*RST", "*IDN?"]);
    }

    #[test]
    fn missing_identity_is_a_connection_error() {
        let mut mock = MockSerial::new();
        let error = Keithley6487::with_transport(&mut mock).err().unwrap();
        assert_eq!(error.kind(), ErrorKind::Connection);
    }

    #[test]
    fn out_of_range_values_are_rejected_without_io() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        device.link.stream_mut().clear_written_data();

        let error = device.set(Value::new(Volts(500.1), Amperes(1e-3))).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
        let error = device.set(Value::new(Volts(-600.0), Amperes(1e-3))).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
        let error = device.set(Value::new(Volts(10.0), Amperes(0.03))).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
        let error = device.set(Value::new(Volts(f64::NAN), Amperes(1e-3))).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
        let error = device.set(Value::new(Volts(10.0), Amperes(f64::NAN))).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(device.link.stream().written_data().is_empty());
    }

    #[test]
    fn set_sequence() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        device.link.stream_mut().clear_written_data();
        queue_set(device.link.stream_mut(), "2.500000E-03");

        let value = Value::new(Volts(10.0), Amperes(2.5e-3));
        assert_eq!(device.set(value).unwrap(), value);
        assert_eq!(
            device.link.stream().written_lines(),
            vec![
                "SOUR:VOLT:RANG 500",
                "SYST:ERR?",
                "STAT:QUES:EVEN?",
                "SOUR:VOLT 10",
                "SYST:ERR?",
                "STAT:QUES:EVEN?",
                "SOUR:VOLT:ILIM 0.0025",
                "SYST:ERR?",
                "STAT:QUES:EVEN?",
                "SOUR:VOLT:STAT ON",
                "SYST:ERR?",
                "STAT:QUES:EVEN?",
                "*OPC?",
                "SOUR:VOLT:ILIM?",
            ]
        );
        assert_eq!(device.link.stream().unread(), 0);
    }

    #[test]
    fn device_error_is_reported_with_message() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        device
            .link
            .stream_mut()
            .queue_reply("-222,\"Parameter data out of range\"");

        let error = device.send_and_check("SOUR:VOLT 10").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DeviceReported);
        assert!(error.message().contains("an error"));
        assert!(error.message().contains("'SOUR:VOLT 10'"));
        assert_eq!(error.detail(), Some("-222: Parameter data out of range"));
    }

    #[test]
    fn questionable_event_is_a_warning() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        device.link.stream_mut().queue_reply(NO_ERROR);
        device.link.stream_mut().queue_reply("16384");

        let error = device.send_and_check("SOUR:VOLT:ILIM 0.0025").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DeviceReported);
        assert!(error.message().contains("a warning"));
        assert_eq!(error.detail(), Some("Command warning"));
    }

    #[test]
    fn incomplete_operation_fails_set() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        for _ in 0..4 {
            queue_checked(device.link.stream_mut());
        }
        device.link.stream_mut().queue_reply("0");
        let error = device.set(Value::new(Volts(10.0), Amperes(1e-3))).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DeviceReported);
    }

    #[test]
    fn compliance_follows_the_committed_limit() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        queue_set(device.link.stream_mut(), "+2.500000E-03");
        let committed = device.set(Value::new(Volts(10.0), Amperes(1e-3))).unwrap();
        assert_eq!(committed, Value::new(Volts(10.0), Amperes(2.5e-3)));

        device.link.stream_mut().queue_reply("+2.000000E-09A,+1.000000E+01");
        let measurement = device.measure().unwrap();
        assert_eq!(measurement.current, Amperes(2e-9));
        assert_eq!(measurement.voltage, Volts(10.0));
        assert!(!measurement.in_compliance);

        // Above the requested limit, below the one the instrument applied.
        device.link.stream_mut().queue_reply("-1.000100E-03,-1.000000E+01");
        assert!(!device.measure().unwrap().in_compliance);

        device.link.stream_mut().queue_reply("-2.500000E-03,-1.000000E+01");
        assert!(device.measure().unwrap().in_compliance);
    }

    #[test]
    fn unreadable_current_limit_fails_set() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        queue_set(device.link.stream_mut(), "garbage");
        let error = device.set(Value::new(Volts(10.0), Amperes(1e-3))).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Communication);
        assert!(device.current_limit.is_none());
    }

    #[test]
    fn off_twice() {
        let mut mock = MockSerial::new();
        let mut device = connect(&mut mock);
        for _ in 0..2 {
            queue_checked(device.link.stream_mut());
            device.link.stream_mut().queue_reply("1");
        }
        assert!(device.off().is_ok());
        assert!(device.off().is_ok());
    }

    #[test]
    fn drop_resets_and_returns_to_local() {
        let mut mock = MockSerial::new();
        drop(connect(&mut mock));
        let written = mock.written_lines();
        assert_eq!(&written[written.len() - 2..], ["*RST", "SYST:LOC"]);
        assert!(written.contains(&"SOUR:VOLT:STAT OFF".to_owned()));
    }

    #[test]
    fn replies() {
        assert_eq!(
            SystemError::parse("0,\"No error\""),
            Some(SystemError {
                code: 0,
                message: "No error".to_owned()
            })
        );
        assert!(SystemError::parse("garbage").is_none());
        assert!(Reading::parse("1.0,2.0,3.0").is_none());
        assert!(QuestionableStatus::parse("256").unwrap().calibration());
        assert!(!QuestionableStatus::parse("0").unwrap().has_warnings());
        assert!(!QuestionableStatus::parse("1").unwrap().has_warnings());
    }
}
