//! Unit scale factors for ASCII command fields.
//!
//! Instruments speaking SCPI expect plain numbers in a fixed unit. The scale
//! factor says how much one unit of the ASCII field is worth, e.g. a voltage
//! factor of 1 V means the field is in volts and a factor of 1 mV would mean
//! it is in millivolts.

use crate::units::{Amperes, Volts};

/// Scale factors converting physical quantities to and from command fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingFactors {
    /// Value of one unit of a voltage field.
    pub voltage: Volts,
    /// Value of one unit of a current field.
    pub current: Amperes,
}

impl Default for ScalingFactors {
    /// Default to fields in base SI units.
    fn default() -> Self {
        Self::SI
    }
}

impl ScalingFactors {
    /// Fields expressed in volts and amperes.
    pub const SI: Self = Self::new(Volts(1.0), Amperes(1.0));

    pub const fn new(voltage: Volts, current: Amperes) -> Self {
        Self { voltage, current }
    }

    /// Convert a voltage into the number written to the device.
    #[inline]
    pub fn voltage_to_field(&self, voltage: Volts) -> f64 {
        voltage / self.voltage
    }

    /// Convert a voltage field read from the device.
    #[inline]
    pub fn field_to_voltage(&self, field: f64) -> Volts {
        self.voltage * field
    }

    /// Convert a current into the number written to the device.
    #[inline]
    pub fn current_to_field(&self, current: Amperes) -> f64 {
        current / self.current
    }

    /// Convert a current field read from the device.
    #[inline]
    pub fn field_to_current(&self, field: f64) -> Amperes {
        self.current * field
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn si_fields_are_identity() {
        let factors = ScalingFactors::default();
        assert_eq!(factors.voltage_to_field(Volts(12.5)), 12.5);
        assert_eq!(factors.field_to_current(2.5e-3), Amperes(2.5e-3));
    }

    #[test]
    fn milli_fields() {
        let factors = ScalingFactors::new(Volts(1e-3), Amperes(1e-3));
        assert!((factors.voltage_to_field(Volts(1.5)) - 1500.0).abs() < 1e-9);
        assert!((factors.field_to_voltage(250.0).value() - 0.25).abs() < 1e-12);
        assert!((factors.current_to_field(Amperes(0.02)) - 20.0).abs() < 1e-9);
    }
}
