//! Thread safe decorator around one voltage source.
//!
//! [`GuardedSource`] owns its device and serializes every call to it with a
//! reentrant lock, so a thread already inside the guard (for example from a
//! measurement callback) can call back into it without deadlocking while
//! other threads wait. It also remembers the last committed value to skip
//! redundant writes, keeps a measurement history and implements the stepped
//! voltage ramp.

use std::{cell::RefCell, sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::{
    device::{Measurement, Value, VoltageSource},
    error::{Error, Result},
    units::Volts,
};

/// Invoked with every measurement taken through the guard.
pub type MeasurementCallback = Arc<dyn Fn(&Measurement) + Send + Sync>;

struct State {
    device: Box<dyn VoltageSource + Send>,
    current_value: Value,
    is_on: bool,
    save_measurements: bool,
    measurements: Vec<Measurement>,
    on_measurement: Option<MeasurementCallback>,
}

/// A voltage source shared between threads.
pub struct GuardedSource {
    state: ReentrantMutex<RefCell<State>>,
}

/// Holds the guard's lock until dropped. Sessions nest on the owning thread.
#[must_use = "the guard is unlocked as soon as the session is dropped"]
pub struct SourceLock<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<State>>,
}

impl GuardedSource {
    /// Take ownership of `device`. With `save_measurements` every measurement is kept in memory.
    pub fn new(device: Box<dyn VoltageSource + Send>, save_measurements: bool) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(State {
                device,
                current_value: Value::default(),
                is_on: false,
                save_measurements,
                measurements: Vec::new(),
                on_measurement: None,
            })),
        }
    }

    /// Apply `value`, unless the output is already on at exactly this value.
    pub fn set(&self, value: Value) -> Result<Value> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.is_on || state.current_value != value {
            state.current_value = state.device.set(value)?;
            state.is_on = true;
        } else {
            debug!("GuardedSource: {value} already applied.");
        }
        Ok(state.current_value)
    }

    pub fn accuracy(&self, voltage: Volts) -> Result<Volts> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.device.accuracy(voltage)
    }

    /// Read the device, record the measurement and pass it to the measurement callback.
    pub fn measure(&self) -> Result<Measurement> {
        let guard = self.state.lock();
        let (measurement, callback) = {
            let mut state = guard.borrow_mut();
            let measurement = state.device.measure()?;
            if state.save_measurements {
                state.measurements.push(measurement);
            }
            (measurement, state.on_measurement.clone())
        };
        // The state is no longer borrowed: the callback may call back into the guard.
        if let Some(callback) = callback {
            callback(&measurement);
        }
        Ok(measurement)
    }

    /// Switch the output off. The cached voltage is reset even when the device fails.
    pub fn off(&self) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let result = state.device.off();
        state.current_value.voltage = Volts::ZERO;
        state.is_on = false;
        result
    }

    /// Ramp the output to `target.voltage` in steps of `step`.
    ///
    /// Sleeps `delay_between_steps` after every write. With `check_compliance`
    /// a measurement is taken after each step and the ramp stops at the first
    /// one in compliance, returning `false`. Returns `true` once the target is
    /// reached within the device accuracy.
    pub fn gradual_set(
        &self,
        target: Value,
        step: Volts,
        delay_between_steps: Duration,
        check_compliance: bool,
    ) -> Result<bool> {
        if !(step.value() > 0.0 && step.value().is_finite()) {
            return Err(Error::validation(
                "GuardedSource::gradual_set",
                format!("Invalid voltage step = {step}. The voltage step should be greater than zero."),
            ));
        }
        if !(target.voltage.value().is_finite() && target.compliance.value().is_finite()) {
            return Err(Error::validation(
                "GuardedSource::gradual_set",
                format!("Invalid target value = {target}. The voltage and the compliance should be finite."),
            ));
        }

        let _session = self.lock();
        info!("GuardedSource: ramping to {target} in steps of {step}.");
        loop {
            let current = self.current_value().voltage;
            let delta = target.voltage - current;
            let accuracy = self.accuracy(target.voltage)?;
            if delta.abs() < accuracy {
                break;
            }
            // The final write always lands exactly on the target.
            let last_step = delta.abs() - step < accuracy;
            let voltage = match (last_step, delta > Volts::ZERO) {
                (true, _) => target.voltage,
                (false, true) => current + step,
                (false, false) => current - step,
            };

            self.set(Value::new(voltage, target.compliance))?;
            std::thread::sleep(delay_between_steps);

            if check_compliance {
                let measurement = self.measure()?;
                if measurement.in_compliance {
                    warn!("GuardedSource: ramp stopped at {voltage}, device is in compliance ({measurement}).");
                    return Ok(false);
                }
            }
            if last_step {
                break;
            }
        }
        info!("GuardedSource: ramp to {} completed.", target.voltage);
        Ok(true)
    }

    /// Lock the guard until the returned session is dropped.
    ///
    /// Other threads calling into the guard block meanwhile. The owning thread
    /// may keep calling guard operations and may lock again.
    pub fn lock(&self) -> SourceLock<'_> {
        SourceLock {
            _guard: self.state.lock(),
        }
    }

    /// Lock the guard without a session object. Pair with [`GuardedSource::raw_unlock`].
    pub fn raw_lock(&self) {
        core::mem::forget(self.state.lock());
    }

    /// Release one level of a lock taken with [`GuardedSource::raw_lock`].
    ///
    /// # Safety
    ///
    /// The current thread must hold a lock taken by `raw_lock` that was not
    /// released yet. Unbalanced calls, or calls from another thread, leave the
    /// lock in an undefined state.
    pub unsafe fn raw_unlock(&self) {
        // SAFETY: the caller holds a forgotten guard of this lock.
        unsafe { self.state.force_unlock() }
    }

    /// Last committed value. The voltage is zero after an `off`.
    pub fn current_value(&self) -> Value {
        self.state.lock().borrow().current_value
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().borrow().is_on
    }

    /// Copy of the measurement history.
    pub fn measurements(&self) -> Vec<Measurement> {
        self.state.lock().borrow().measurements.clone()
    }

    pub fn set_on_measurement(&self, callback: Option<MeasurementCallback>) {
        self.state.lock().borrow_mut().on_measurement = callback;
    }
}

impl VoltageSource for GuardedSource {
    fn set(&mut self, value: Value) -> Result<Value> {
        GuardedSource::set(self, value)
    }

    fn accuracy(&mut self, voltage: Volts) -> Result<Volts> {
        GuardedSource::accuracy(self, voltage)
    }

    fn measure(&mut self) -> Result<Measurement> {
        GuardedSource::measure(self)
    }

    fn off(&mut self) -> Result<()> {
        GuardedSource::off(self)
    }
}
