//! The capability set every voltage source implements.

use core::fmt;

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    units::{Amperes, Volts},
};

/// A commanded operating point.
///
/// `compliance` bounds the current the source will supply before it stops
/// regulating voltage and enters compliance mode.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Value {
    pub voltage: Volts,
    pub compliance: Amperes,
}

impl Value {
    pub const fn new(voltage: Volts, compliance: Amperes) -> Self {
        Self {
            voltage,
            compliance,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, compliance {}", self.voltage, self.compliance)
    }
}

/// The result of one read of the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub current: Amperes,
    pub voltage: Volts,
    pub timestamp: DateTime<Utc>,
    /// Whether the source was in compliance mode when the reading was taken.
    pub in_compliance: bool,
}

impl Measurement {
    /// Create a measurement stamped with the current time.
    pub fn now(current: Amperes, voltage: Volts, in_compliance: bool) -> Self {
        Self {
            current,
            voltage,
            timestamp: Utc::now(),
            in_compliance,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} ({}){}",
            self.current,
            self.voltage,
            self.timestamp.format("%H:%M:%S%.3f"),
            if self.in_compliance { " in compliance" } else { "" }
        )
    }
}

/// A programmable voltage source.
///
/// Implemented by the protocol drivers, the simulated source and the
/// [`GuardedSource`](crate::guard::GuardedSource) decorator.
pub trait VoltageSource {
    /// Apply `value` and switch the output on.
    ///
    /// Returns the value actually committed, which the device may have clamped or corrected.
    fn set(&mut self, value: Value) -> Result<Value>;

    /// The smallest voltage difference the device can resolve around `voltage`.
    fn accuracy(&mut self, voltage: Volts) -> Result<Volts>;

    /// Read current and voltage from the device.
    fn measure(&mut self) -> Result<Measurement>;

    /// Switch the output off.
    ///
    /// Must be safe to call repeatedly, and drivers call it from `Drop`.
    fn off(&mut self) -> Result<()>;
}

impl<T: VoltageSource + ?Sized> VoltageSource for Box<T> {
    fn set(&mut self, value: Value) -> Result<Value> {
        (**self).set(value)
    }

    fn accuracy(&mut self, voltage: Volts) -> Result<Volts> {
        (**self).accuracy(voltage)
    }

    fn measure(&mut self) -> Result<Measurement> {
        (**self).measure()
    }

    fn off(&mut self) -> Result<()> {
        (**self).off()
    }
}
