//! Our error types for the voltage source control core.
//!
//! Every failure carries the operation it originated from, a short message
//! suitable for a status line and an optional diagnostic detail. Front ends
//! show [`Error::short_message`] and log [`Error::full_message`].

use strum_macros::{Display, IntoStaticStr};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// The category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Unknown device key or unusable configuration value.
    #[strum(to_string = "Configuration error")]
    Configuration,
    /// Unable to open the link, handshake failed or the device identified itself as something else.
    #[strum(to_string = "Connection error")]
    Connection,
    /// Transport I/O failure or a reply that could not be parsed.
    #[strum(to_string = "Communication error")]
    Communication,
    /// The device flagged an error or a warning after a command.
    #[strum(to_string = "Error on device")]
    DeviceReported,
    /// Requested value is out of range or ramp parameters are invalid.
    #[strum(to_string = "Invalid parameters")]
    Validation,
    /// Lifecycle misuse.
    #[strum(to_string = "Internal error")]
    Internal,
}

/// How serious a device reported condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Severity {
    #[strum(to_string = "an error")]
    Error,
    #[strum(to_string = "a warning")]
    Warning,
}

/// A failure raised anywhere in the core.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{operation}] {kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    operation: &'static str,
    message: String,
    detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
            detail: None,
        }
    }

    pub fn configuration(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, operation, message)
    }

    pub fn connection(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, operation, message)
    }

    pub fn communication(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Communication, operation, message)
    }

    pub fn validation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, operation, message)
    }

    pub fn internal(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, operation, message)
    }

    /// The device flagged `severity` after executing `command`; `device_message` is the device's own text.
    pub fn device_reported(
        operation: &'static str,
        severity: Severity,
        command: &str,
        device_message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::DeviceReported,
            operation,
            format!("Device reported {severity} after executing the last command = '{command}'."),
        )
        .with_detail(device_message)
    }

    /// Attach diagnostic text (device message, transport status report, ...).
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Re-categorise an error while keeping its text, e.g. a handshake I/O failure becoming a connection error.
    pub(crate) fn into_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The operation the failure originated from.
    pub fn header(&self) -> &'static str {
        self.operation
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Terse, UI grade text.
    pub fn short_message(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }

    /// Diagnostic grade text including the originating operation and any detail.
    pub fn full_message(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{self}\n{detail}"),
            None => self.to_string(),
        }
    }
}
