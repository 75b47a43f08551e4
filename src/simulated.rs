//! A voltage source without hardware: the output drives an ideal resistor.

use log::debug;

use crate::{
    config::SimulatedConfig,
    device::{Measurement, Value, VoltageSource},
    error::Result,
    units::{Amperes, Ohms, Volts},
};

/// Smallest voltage step the simulated source resolves.
pub const ACCURACY: Volts = Volts(0.1);

/// Simulated source loaded with a fixed resistance.
#[derive(Debug)]
pub struct SimulatedSource {
    resistance: Ohms,
    voltage: Volts,
    compliance: Amperes,
    on: bool,
}

impl SimulatedSource {
    pub fn new(resistance: Ohms) -> Self {
        Self {
            resistance,
            voltage: Volts::ZERO,
            compliance: Amperes::ZERO,
            on: false,
        }
    }

    /// Build the source described by `config`, blocking for its connection delay first.
    pub fn connect(config: &SimulatedConfig) -> Self {
        debug!(
            "SimulatedSource: connecting in {:?} to {}.",
            config.connection_delay, config.resistance
        );
        std::thread::sleep(config.connection_delay);
        Self::new(config.resistance)
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl VoltageSource for SimulatedSource {
    fn set(&mut self, value: Value) -> Result<Value> {
        debug!("SimulatedSource: set value {value}.");
        self.voltage = value.voltage;
        self.compliance = value.compliance;
        self.on = true;
        Ok(value)
    }

    fn accuracy(&mut self, _voltage: Volts) -> Result<Volts> {
        Ok(ACCURACY)
    }

    fn measure(&mut self) -> Result<Measurement> {
        let current = self.voltage / self.resistance;
        let in_compliance = self.on && current.abs() >= self.compliance.abs();
        let measurement = Measurement::now(current, self.voltage, in_compliance);
        debug!("SimulatedSource: measured {measurement}.");
        Ok(measurement)
    }

    fn off(&mut self) -> Result<()> {
        debug!("SimulatedSource: turn off.");
        self.voltage = Volts::ZERO;
        self.on = false;
        Ok(())
    }
}
