//! Single worker command dispatcher.
//!
//! A [`Controller`] owns a FIFO of [`Command`]s drained by one worker, either
//! on the calling thread with [`Controller::run`] or on a dedicated thread with
//! [`Controller::spawn`]. Outcomes are delivered to registered callbacks; a
//! failing command never stops the worker.
//!
//! Callbacks are invoked on a snapshot of the callback list taken under the
//! lock, after the lock is released, so a callback may register further
//! callbacks or submit new commands.

use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{Arc, Weak},
    thread::JoinHandle,
};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use strum_macros::{Display, EnumIter, IntoStaticStr};

use crate::{
    device::{Measurement, Value},
    error::{Error, Result},
    guard::{GuardedSource, MeasurementCallback},
    registry::Registry,
    units::Volts,
};

/// Control operations processed by the worker, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, IntoStaticStr)]
pub enum Command {
    /// Stop the worker once the commands queued so far are processed.
    Exit,
    Connect,
    Disconnect,
    /// Ramp to the target value set with [`ControllerHandle::set_target`].
    EnableVoltage,
    /// Ramp down to zero and switch the output off.
    DisableVoltage,
}

pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    measurement: Vec<MeasurementCallback>,
    compliance: Vec<MeasurementCallback>,
    error: Vec<ErrorCallback>,
    connect_successful: Vec<NotifyCallback>,
    connect_failed: Vec<ErrorCallback>,
    disconnect_successful: Vec<NotifyCallback>,
    disconnect_failed: Vec<ErrorCallback>,
}

struct Inner {
    queue: VecDeque<Command>,
    callbacks: Callbacks,
    can_run: bool,
    is_running: bool,
    has_run: bool,
    target: Option<Value>,
}

struct Shared {
    inner: ReentrantMutex<RefCell<Inner>>,
    /// Set by every submission, cleared by the worker before it drains the queue.
    pending: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        f(&mut inner)
    }

    fn send(&self, command: Command) {
        self.with(|inner| inner.queue.push_back(command));
        *self.pending.lock() = true;
        self.wake.notify_one();
    }

    fn wait_for_commands(&self) {
        let mut pending = self.pending.lock();
        while !*pending {
            self.wake.wait(&mut pending);
        }
        *pending = false;
    }

    fn snapshot<T: Clone>(&self, select: impl FnOnce(&Callbacks) -> &Vec<T>) -> Vec<T> {
        self.with(|inner| select(&inner.callbacks).clone())
    }

    fn notify_error(&self, e: &Error) {
        error!("Controller: {}", e.full_message());
        for callback in self.snapshot(|callbacks| &callbacks.error) {
            callback(e);
        }
    }

    fn notify_measurement(&self, measurement: &Measurement) {
        for callback in self.snapshot(|callbacks| &callbacks.measurement) {
            callback(measurement);
        }
        if measurement.in_compliance {
            for callback in self.snapshot(|callbacks| &callbacks.compliance) {
                callback(measurement);
            }
        }
    }

    fn notify_connect(&self, result: Result<()>) {
        match result {
            Ok(()) => {
                for callback in self.snapshot(|callbacks| &callbacks.connect_successful) {
                    callback();
                }
            }
            Err(e) => {
                error!("Controller: {}", e.full_message());
                for callback in self.snapshot(|callbacks| &callbacks.connect_failed) {
                    callback(&e);
                }
            }
        }
    }

    fn notify_disconnect(&self, result: Result<()>) {
        match result {
            Ok(()) => {
                for callback in self.snapshot(|callbacks| &callbacks.disconnect_successful) {
                    callback();
                }
            }
            Err(e) => {
                error!("Controller: {}", e.full_message());
                for callback in self.snapshot(|callbacks| &callbacks.disconnect_failed) {
                    callback(&e);
                }
            }
        }
    }
}

/// Cloneable access to a controller: command submission and callback registration.
///
/// Safe to use from any thread, including from inside callbacks.
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<Shared>,
}

impl ControllerHandle {
    /// Queue `command`. Never blocks on the worker.
    pub fn send_command(&self, command: Command) {
        debug!("Controller: queued {command}.");
        self.shared.send(command);
    }

    /// Value used by [`Command::EnableVoltage`].
    pub fn set_target(&self, target: Option<Value>) {
        self.shared.with(|inner| inner.target = target);
    }

    pub fn target(&self) -> Option<Value> {
        self.shared.with(|inner| inner.target)
    }

    /// Whether a worker is processing commands.
    pub fn is_running(&self) -> bool {
        self.shared.with(|inner| inner.is_running)
    }

    pub fn add_on_measurement_callback(&self, callback: impl Fn(&Measurement) + Send + Sync + 'static) {
        self.shared
            .with(|inner| inner.callbacks.measurement.push(Arc::new(callback)));
    }

    /// Called with measurements taken while the source is in compliance.
    pub fn add_on_compliance_callback(&self, callback: impl Fn(&Measurement) + Send + Sync + 'static) {
        self.shared
            .with(|inner| inner.callbacks.compliance.push(Arc::new(callback)));
    }

    /// Called with failures of EnableVoltage and DisableVoltage.
    pub fn add_on_error_callback(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared.with(|inner| inner.callbacks.error.push(Arc::new(callback)));
    }

    pub fn add_on_connect_successful_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared
            .with(|inner| inner.callbacks.connect_successful.push(Arc::new(callback)));
    }

    pub fn add_on_connect_failed_callback(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared
            .with(|inner| inner.callbacks.connect_failed.push(Arc::new(callback)));
    }

    pub fn add_on_disconnect_successful_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared
            .with(|inner| inner.callbacks.disconnect_successful.push(Arc::new(callback)));
    }

    pub fn add_on_disconnect_failed_callback(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared
            .with(|inner| inner.callbacks.disconnect_failed.push(Arc::new(callback)));
    }
}

/// The command dispatcher.
///
/// A controller runs its worker once. It must not be dropped while the worker
/// is running: send [`Command::Exit`] and wait for the worker first.
pub struct Controller {
    handle: ControllerHandle,
    registry: Arc<Registry>,
}

impl Controller {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            handle: ControllerHandle {
                shared: Arc::new(Shared {
                    inner: ReentrantMutex::new(RefCell::new(Inner {
                        queue: VecDeque::new(),
                        callbacks: Callbacks::default(),
                        can_run: true,
                        is_running: false,
                        has_run: false,
                        target: None,
                    })),
                    pending: Mutex::new(false),
                    wake: Condvar::new(),
                }),
            },
            registry,
        }
    }

    pub fn handle(&self) -> &ControllerHandle {
        &self.handle
    }

    pub fn send_command(&self, command: Command) {
        self.handle.send_command(command);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Process commands on the calling thread until [`Command::Exit`].
    pub fn run(&self) -> Result<()> {
        self.start()?.run();
        Ok(())
    }

    /// Process commands on a new thread until [`Command::Exit`].
    pub fn spawn(&self) -> Result<JoinHandle<()>> {
        let worker = self.start()?;
        let shared = worker.shared.clone();
        std::thread::Builder::new()
            .name("voltage-source-controller".to_owned())
            .spawn(move || worker.run())
            .map_err(|e| {
                shared.with(|inner| inner.is_running = false);
                Error::internal("Controller::spawn", format!("Unable to start the worker thread: {e}"))
            })
    }

    /// Fails with an invalid usage error while the worker is running.
    pub fn check_stopped(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::internal(
                "Controller::check_stopped",
                "Invalid usage. The object should not be destroyed while working thread is still running.",
            ));
        }
        Ok(())
    }

    /// The worker counts as running from here until its loop has exited.
    fn start(&self) -> Result<Worker> {
        let shared = &self.handle.shared;
        shared.with(|inner| {
            if inner.has_run {
                return Err(Error::internal(
                    "Controller::run",
                    "Invalid usage. The worker can run only once.",
                ));
            }
            inner.has_run = true;
            inner.is_running = true;
            Ok(())
        })?;
        Ok(Worker {
            shared: shared.clone(),
            registry: self.registry.clone(),
            device: None,
        })
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.check_stopped() {
            if !std::thread::panicking() {
                std::panic::panic_any(e);
            }
        }
    }
}

/// State owned by the running worker.
struct Worker {
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    device: Option<Arc<GuardedSource>>,
}

impl Worker {
    fn run(mut self) {
        info!("Controller: worker started.");
        loop {
            self.shared.wait_for_commands();
            while let Some(command) = self.shared.with(|inner| inner.queue.pop_front()) {
                debug!("Controller: processing {command}.");
                if let Err(e) = self.execute(command) {
                    self.shared.notify_error(&e);
                }
            }
            if !self.shared.with(|inner| inner.can_run) {
                break;
            }
        }
        self.release_device();
        self.shared.with(|inner| inner.is_running = false);
        info!("Controller: worker stopped.");
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Exit => {
                self.shared.with(|inner| inner.can_run = false);
                Ok(())
            }
            Command::Connect => {
                let result = self.connect();
                self.shared.notify_connect(result);
                Ok(())
            }
            Command::Disconnect => {
                let result = self.disconnect();
                self.shared.notify_disconnect(result);
                Ok(())
            }
            Command::EnableVoltage => self.enable_voltage(),
            Command::DisableVoltage => self.disable_voltage(),
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Err(Error::connection(
                "Controller::connect",
                "The voltage source is already connected.",
            ));
        }
        let device = self.registry.get()?;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        device.set_on_measurement(Some(Arc::new(move |measurement: &Measurement| {
            if let Some(shared) = shared.upgrade() {
                shared.notify_measurement(measurement);
            }
        })));
        self.device = Some(device);
        Ok(())
    }

    /// Switch off and drop the device. The handle is released whatever `off` returns.
    fn disconnect(&mut self) -> Result<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let result = device.off();
        device.set_on_measurement(None);
        drop(device);
        self.registry.release();
        result
    }

    fn device(&self) -> Result<Arc<GuardedSource>> {
        self.device
            .clone()
            .ok_or_else(|| Error::internal("Controller", "The voltage source is not connected."))
    }

    fn enable_voltage(&mut self) -> Result<()> {
        let device = self.device()?;
        let target = self.shared.with(|inner| inner.target).ok_or_else(|| {
            Error::validation("Controller::enable_voltage", "No target value to set is provided.")
        })?;
        let ramp = &self.registry.config().ramp;
        if !device.gradual_set(target, ramp.step, ramp.delay_between_steps, ramp.check_compliance)? {
            warn!("Controller: voltage ramp to {target} stopped, the source is in compliance.");
        }
        Ok(())
    }

    fn disable_voltage(&mut self) -> Result<()> {
        let device = self.device()?;
        let ramp = &self.registry.config().ramp;
        if device.is_on() {
            let zero = Value::new(Volts::ZERO, device.current_value().compliance);
            device.gradual_set(zero, ramp.step, ramp.delay_between_steps, false)?;
        }
        device.off()
    }

    fn release_device(&mut self) {
        if let Some(device) = self.device.take() {
            if let Err(e) = device.off() {
                warn!("Controller: unable to switch the output off on exit.\n{}", e.full_message());
            }
            device.set_on_measurement(None);
            drop(device);
            self.registry.release();
        }
    }
}
