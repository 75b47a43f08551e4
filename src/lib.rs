//! This crate provides the control core for programmable laboratory voltage sources.
//!
//! Supported devices:
//! * Keithley 237 high voltage source measure unit, over GPIB (`gpib` feature, needs a VISA runtime)
//! * Keithley 6487 picoammeter / voltage source, over RS-232
//! * `Fake`, an in-memory source behaving like a resistor, for testing front ends without hardware
//!
//! Each device implements [`VoltageSource`]. The [`Registry`] builds the
//! configured one and wraps it in a [`GuardedSource`], which serializes access
//! from several threads and ramps the output in steps. The [`Controller`]
//! drives the guarded source from a queue of [`Command`]s on a single worker
//! and reports outcomes through callbacks.
//!
//! The Keithley 6487 serial port should be configured on the instrument like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Parity: None
//! * Flow control: None
//! * Terminator: LF

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod guard;
pub mod keithley237;
pub mod keithley6487;
pub mod modes;
pub mod registry;
pub mod scaling;
pub mod simulated;
pub mod transport;
pub mod units;

#[cfg(test)]
mod mock_serial;

pub use config::Config;
pub use controller::{Command, Controller, ControllerHandle};
pub use device::{Measurement, Value, VoltageSource};
pub use error::{Error, ErrorKind, Result};
pub use guard::GuardedSource;
pub use registry::Registry;
pub use units::{Amperes, Ohms, Volts};
