//! Device registry: from a configured device name to a guarded device handle.
//!
//! The [`Registry`] is the explicit context of the control core. It owns the
//! [`Config`], a map from device names to constructors and the cached handle
//! of the device currently in use.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use log::info;
use parking_lot::Mutex;

use crate::{
    config::Config,
    device::VoltageSource,
    error::{Error, Result},
    guard::GuardedSource,
    keithley6487::Keithley6487,
    simulated::SimulatedSource,
};

/// Builds a device from the configuration.
pub type SourceMaker = Box<dyn Fn(&Config) -> Result<Box<dyn VoltageSource + Send>> + Send + Sync>;

#[derive(Default)]
struct Cache {
    active: Option<Arc<GuardedSource>>,
    /// The last released handle, until every user dropped it.
    retired: Weak<GuardedSource>,
}

pub struct Registry {
    config: Config,
    makers: BTreeMap<String, SourceMaker>,
    cache: Mutex<Cache>,
}

impl Registry {
    /// A registry knowing the built-in devices `Keithley237`, `Keithley6487` and `Fake`.
    pub fn new(config: Config) -> Self {
        let mut registry = Self {
            config,
            makers: BTreeMap::new(),
            cache: Mutex::new(Cache::default()),
        };
        registry.register("Keithley237", keithley237);
        registry.register("Keithley6487", |config: &Config| {
            let device = Keithley6487::open(&config.keithley6487)?;
            Ok(Box::new(device) as Box<dyn VoltageSource + Send>)
        });
        registry.register("Fake", |config: &Config| {
            Ok(Box::new(SimulatedSource::connect(&config.fake)) as Box<dyn VoltageSource + Send>)
        });
        registry
    }

    /// Add a device constructor, replacing any previous one with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, maker: F)
    where
        F: Fn(&Config) -> Result<Box<dyn VoltageSource + Send>> + Send + Sync + 'static,
    {
        self.makers.insert(name.into(), Box::new(maker));
    }

    /// Names of the supported devices, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.makers.keys().map(String::as_str).collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The guarded handle of the configured device, constructing it on first use.
    ///
    /// Fails while a previously released handle is still alive somewhere, as
    /// only one instance may talk to the instrument.
    pub fn get(&self) -> Result<Arc<GuardedSource>> {
        let mut cache = self.cache.lock();
        if let Some(device) = &cache.active {
            return Ok(device.clone());
        }
        if cache.retired.strong_count() > 0 {
            return Err(Error::internal(
                "Registry::get",
                "The previous voltage source is still in use and can not be replaced yet.",
            ));
        }

        let name = &self.config.voltage_source;
        let maker = self.makers.get(name).ok_or_else(|| {
            Error::configuration("Registry::get", format!("Voltage source '{name}' not found."))
                .with_detail(format!("Supported voltage sources: {}.", self.names().join(", ")))
        })?;
        let device = maker(&self.config)?;
        info!("Registry: connected to voltage source '{name}'.");

        let device = Arc::new(GuardedSource::new(device, self.config.save_measurements));
        cache.active = Some(device.clone());
        Ok(device)
    }

    /// Drop the cached handle. The device is destroyed once the last user drops its handle.
    pub fn release(&self) {
        let mut cache = self.cache.lock();
        if let Some(device) = cache.active.take() {
            cache.retired = Arc::downgrade(&device);
        }
    }
}

#[cfg(feature = "gpib")]
fn keithley237(config: &Config) -> Result<Box<dyn VoltageSource + Send>> {
    let device = crate::keithley237::Keithley237::open(&config.keithley237)?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "gpib"))]
fn keithley237(_config: &Config) -> Result<Box<dyn VoltageSource + Send>> {
    Err(Error::connection(
        "Registry::keithley237",
        "GPIB support not compiled in (enable the `gpib` feature).",
    ))
}
