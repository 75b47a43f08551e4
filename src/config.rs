//! Connection and behaviour parameters for the supported voltage sources.
//!
//! All structs implement [`Default`] with the values the instruments ship
//! with, and can be (de)serialized with `serde`. Loading them from a file is
//! left to the application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::units::{Ohms, Volts};

/// Top level configuration handed to the [`Registry`](crate::registry::Registry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry key of the device to connect to.
    pub voltage_source: String,
    /// Keep every measurement taken through the guarded source in memory.
    pub save_measurements: bool,
    pub keithley237: Keithley237Config,
    pub keithley6487: Keithley6487Config,
    pub fake: SimulatedConfig,
    pub ramp: RampConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            voltage_source: "Keithley237".to_owned(),
            save_measurements: true,
            keithley237: Keithley237Config::default(),
            keithley6487: Keithley6487Config::default(),
            fake: SimulatedConfig::default(),
            ramp: RampConfig::default(),
        }
    }
}

/// Keithley 237 on a GPIB bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Keithley237Config {
    /// VISA resource name of the instrument.
    pub resource: String,
    /// Resolved to the nearest supported filter mode.
    pub readings_to_average: u32,
    /// Resolved to the nearest supported integration time mode.
    #[serde(with = "humantime_serde")]
    pub integration_time: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Keithley237Config {
    fn default() -> Self {
        Self {
            resource: "GPIB0::16::INSTR".to_owned(),
            readings_to_average: 4,
            integration_time: Duration::from_micros(16_670),
            timeout: Duration::from_secs(3),
        }
    }
}

/// RS-232 character size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Seven,
    Eight,
}

/// The 6487 supports no flow control or XON/XOFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Keithley 6487 on a serial port.
///
/// The serial settings must match the instrument's RS-232 menu, with the line
/// terminator set to LF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Keithley6487Config {
    pub port: String,
    pub baud_rate: u32,
    pub flow_control: FlowControl,
    pub parity: Parity,
    pub data_bits: DataBits,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Keithley6487Config {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_owned(),
            baud_rate: 9600,
            flow_control: FlowControl::None,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            timeout: Duration::from_secs(3),
        }
    }
}

/// In-memory source behaving like a resistor connected to the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub resistance: Ohms,
    /// Time spent "connecting".
    #[serde(with = "humantime_serde")]
    pub connection_delay: Duration,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            resistance: Ohms(100e6),
            connection_delay: Duration::from_secs(5),
        }
    }
}

/// How EnableVoltage and DisableVoltage ramp the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    pub step: Volts,
    #[serde(with = "humantime_serde")]
    pub delay_between_steps: Duration,
    /// Measure after every step and stop at the first reading in compliance.
    pub check_compliance: bool,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            step: Volts(10.0),
            delay_between_steps: Duration::from_secs(1),
            check_compliance: true,
        }
    }
}
