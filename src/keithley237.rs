//! Driver for the Keithley 237 high voltage source measure unit on GPIB.
//!
//! The 237 speaks the device dependent command (DDC) grammar: a letter
//! followed by comma separated arguments, executed when an `X` is received.
//! Status is read back through the `U` family of commands, which return
//! fixed format status words.

use core::fmt::Display;

use fugit::MicrosDurationU32;
use log::{debug, info, warn};
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display as DisplayMacro, EnumCount as EnumCountMacro, EnumIter};

use crate::{
    config::Keithley237Config,
    device::{Measurement, Value, VoltageSource},
    error::{Error, ErrorKind, Result, Severity},
    modes::ModeTable,
    transport::{LineLink, ParseReply, Transport},
    units::{Amperes, Volts},
};

/// Largest output magnitude (1100 V range).
pub const MAX_VOLTAGE: Volts = Volts(1100.0);
/// Largest compliance magnitude.
pub const MAX_COMPLIANCE: Amperes = Amperes(0.01);
pub const ACCURACY: Volts = Volts(0.1);

/// Machine status words start with the model number.
const IDENTITY_PREFIX: &str = "237";
/// `B` range argument selecting the 1100 V range.
const VOLTAGE_RANGE_MODE: u8 = 4;
/// `L` range argument selecting auto range.
const CURRENT_AUTORANGE_MODE: u8 = 0;

/// Averaging filter: `P<mode>X`.
pub static FILTER_MODES: ModeTable<u32> = ModeTable::new("Filter", "readings to average", &[1, 2, 4, 8, 16, 32]);

/// Integration time: `S<mode>X`.
pub static INTEGRATION_TIME_MODES: ModeTable<MicrosDurationU32> = ModeTable::new(
    "Integration Time",
    "interval",
    &[
        MicrosDurationU32::from_ticks(416),
        MicrosDurationU32::from_ticks(4_000),
        MicrosDurationU32::from_ticks(16_670),
        MicrosDurationU32::from_ticks(20_000),
    ],
);

mod commands {
    pub const EXECUTE: &str = "X";
    pub const RESTORE_FACTORY_DEFAULTS: &str = "J0";
    pub const SET_FILTER: &str = "P";
    pub const SET_INTEGRATION_TIME: &str = "S";
    /// Source and measure values, ASCII with prefix and no suffix, one line from the dc buffer.
    pub const SET_OUTPUT_FORMAT: &str = "G5,1,0";
    /// Source voltage, dc function.
    pub const SET_SOURCE_AND_FUNCTION: &str = "F0,0";
    pub const SET_COMPLIANCE: &str = "L";
    pub const SET_BIAS: &str = "B";
    pub const OPERATE: &str = "N1";
    pub const STANDBY: &str = "N0";
    pub const IMMEDIATE_TRIGGER: &str = "H0";
    pub const SEND_MACHINE_STATUS: &str = "U0";
    pub const SEND_ERROR_STATUS: &str = "U1";
    pub const SEND_COMPLIANCE_VALUE: &str = "U5";
    pub const SEND_WARNING_STATUS: &str = "U9";
}

/// A bit of a fixed length `0`/`1` status word.
pub trait StatusFlag: IntoEnumIterator + EnumCount + Display + Copy {
    /// Text preceding the bits in the reply.
    const PREFIX: &'static str;
}

/// Bits of the `U1` error status word, most significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCountMacro, DisplayMacro)]
pub enum ErrorFlag {
    #[strum(to_string = "Trigger overrun")]
    TriggerOverrun,
    #[strum(to_string = "Illegal device dependent command")]
    IllegalCommand,
    #[strum(to_string = "Illegal device dependent command option")]
    IllegalCommandOption,
    #[strum(to_string = "Interlock present")]
    InterlockPresent,
    #[strum(to_string = "Illegal measure range")]
    IllegalMeasureRange,
    #[strum(to_string = "Illegal source range")]
    IllegalSourceRange,
    #[strum(to_string = "Invalid sweep mix")]
    InvalidSweepMix,
    #[strum(to_string = "Log cannot cross zero")]
    LogCannotCrossZero,
    #[strum(to_string = "Autoranging source with pulse sweep")]
    AutorangingPulseSweep,
    #[strum(to_string = "In calibration")]
    InCalibration,
    #[strum(to_string = "In standby")]
    InStandby,
    #[strum(to_string = "Unit is a 236")]
    UnitIs236,
    #[strum(to_string = "IOU DPRAM failed")]
    DpramFailed,
    #[strum(to_string = "IOU EEROM failed")]
    EeromFailed,
    #[strum(to_string = "IOU calibration checksum error")]
    CalibrationChecksum,
    #[strum(to_string = "DPRAM lockup")]
    DpramLockup,
    #[strum(to_string = "DPRAM link error")]
    DpramLink,
    #[strum(to_string = "Calibration ADC zero error")]
    CalibrationAdcZero,
    #[strum(to_string = "Calibration ADC gain error")]
    CalibrationAdcGain,
    #[strum(to_string = "Calibration source zero error")]
    CalibrationSourceZero,
    #[strum(to_string = "Calibration source gain error")]
    CalibrationSourceGain,
    #[strum(to_string = "Calibration common mode error")]
    CalibrationCommonMode,
    #[strum(to_string = "Calibration compliance error")]
    CalibrationCompliance,
    #[strum(to_string = "Calibration value error")]
    CalibrationValue,
    #[strum(to_string = "Calibration constants error")]
    CalibrationConstants,
    #[strum(to_string = "Calibration invalid error")]
    CalibrationInvalid,
}

impl StatusFlag for ErrorFlag {
    const PREFIX: &'static str = "ERS";
}

/// Bits of the `U9` warning status word, most significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCountMacro, DisplayMacro)]
pub enum WarningFlag {
    #[strum(to_string = "Uncalibrated")]
    Uncalibrated,
    #[strum(to_string = "Temporary calibration")]
    TemporaryCalibration,
    #[strum(to_string = "Value out of range")]
    ValueOutOfRange,
    #[strum(to_string = "Sweep buffer filled")]
    SweepBufferFilled,
    #[strum(to_string = "No sweep points, must create")]
    NoSweepPoints,
    #[strum(to_string = "Pulse times not met")]
    PulseTimesNotMet,
    #[strum(to_string = "Not in remote")]
    NotInRemote,
    #[strum(to_string = "Measure range changed")]
    MeasureRangeChanged,
    #[strum(to_string = "Measurement overflow or sweep aborted")]
    MeasurementOverflow,
    #[strum(to_string = "Pending trigger")]
    PendingTrigger,
}

impl StatusFlag for WarningFlag {
    const PREFIX: &'static str = "WRS";
}

/// A decoded error or warning status word.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus<F> {
    active: Vec<F>,
}

impl<F: StatusFlag> DeviceStatus<F> {
    pub fn is_clear(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active(&self) -> &[F] {
        &self.active
    }

    /// One line per active flag.
    pub fn message(&self) -> String {
        self.active
            .iter()
            .map(|flag| flag.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<F: StatusFlag> ParseReply for DeviceStatus<F> {
    const NAME: &'static str = "status word";

    fn parse(line: &str) -> Option<Self> {
        let bits = line.trim().strip_prefix(F::PREFIX)?;
        if bits.len() != F::COUNT || !bits.bytes().all(|bit| bit == b'0' || bit == b'1') {
            return None;
        }
        let active = F::iter()
            .zip(bits.bytes())
            .filter(|&(_, bit)| bit == b'1')
            .map(|(flag, _)| flag)
            .collect();
        Some(Self { active })
    }
}

/// The fields of the `U0` machine status word this driver uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MachineStatus {
    operate: bool,
}

impl ParseReply for MachineStatus {
    const NAME: &'static str = "machine status word";

    fn parse(line: &str) -> Option<Self> {
        let body = line.trim().strip_prefix(IDENTITY_PREFIX)?;
        let body = body.strip_prefix("MST").unwrap_or(body);
        let index = body.find('N')?;
        let mode = body[index + 1..].chars().next()?.to_digit(10)?;
        Some(Self { operate: mode == 1 })
    }
}

/// `U5` reply, e.g. `ICP+1.000E-03`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ComplianceValue(Amperes);

impl ParseReply for ComplianceValue {
    const NAME: &'static str = "compliance value";

    fn parse(line: &str) -> Option<Self> {
        let value = line.trim().strip_prefix("ICP")?.parse().ok()?;
        Some(Self(Amperes(value)))
    }
}

/// One line from the dc buffer, e.g. `NSDCV+1.0000E+01,NMDCI+1.0000E-07`.
///
/// Each field starts with a status character (`N` normal, `C` compliance, ...)
/// followed by the source/measure tag, the function and the quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    voltage: Volts,
    current: Amperes,
    in_compliance: bool,
}

impl Reading {
    fn field(field: &str, tag: &str) -> Option<(f64, bool)> {
        let mut chars = field.chars();
        let status = chars.next()?;
        let number = chars.as_str().strip_prefix(tag)?;
        Some((number.parse().ok()?, status == 'C'))
    }
}

impl ParseReply for Reading {
    const NAME: &'static str = "source and measure values";

    fn parse(line: &str) -> Option<Self> {
        let (source, measure) = line.trim().split_once(',')?;
        let (voltage, source_compliance) = Self::field(source, "SDCV")?;
        let (current, measure_compliance) = Self::field(measure, "MDCI")?;
        Some(Self {
            voltage: Volts(voltage),
            current: Amperes(current),
            in_compliance: source_compliance || measure_compliance,
        })
    }
}

/// You can create a Keithley237 over any [`Transport`]; with the `gpib` feature
/// [`Keithley237::open`] connects through VISA.
pub struct Keithley237<S: Transport> {
    link: LineLink<S>,
    /// Set once the handshake completed; only then is the output switched off on drop.
    initialized: bool,
}

#[cfg(feature = "gpib")]
impl Keithley237<crate::transport::VisaLink> {
    /// Open the GPIB resource named in `config` and bring the instrument to a known state.
    pub fn open(config: &Keithley237Config) -> Result<Self> {
        let link = crate::transport::VisaLink::open(&config.resource, config.timeout).map_err(|e| {
            Error::connection(
                "Keithley237::open",
                format!("Unable to connect to the device '{}'.", config.resource),
            )
            .with_detail(e)
        })?;
        Self::with_transport(link, config)
    }
}

impl<S: Transport> Keithley237<S> {
    /// Restore defaults, check the identity and apply the configured filter and integration time.
    pub fn with_transport(stream: S, config: &Keithley237Config) -> Result<Self> {
        let filter_mode = FILTER_MODES.nearest(config.readings_to_average);
        let micros = u32::try_from(config.integration_time.as_micros()).unwrap_or(u32::MAX);
        let integration_mode = INTEGRATION_TIME_MODES.nearest(MicrosDurationU32::from_ticks(micros));
        if let (Some(readings), Some(interval)) = (
            FILTER_MODES.value(filter_mode),
            INTEGRATION_TIME_MODES.value(integration_mode),
        ) {
            debug!("Keithley237: averaging {readings} readings, integrating over {} us.", interval.ticks());
        }

        let mut device = Self {
            link: LineLink::new(stream, "\n"),
            initialized: false,
        };
        device.prepare();
        device
            .handshake(filter_mode, integration_mode)
            .map_err(|e| match e.kind() {
                ErrorKind::Communication => e.into_kind(ErrorKind::Connection),
                _ => e,
            })?;
        device.initialized = true;
        info!("Keithley237: connected to '{}'.", config.resource);
        Ok(device)
    }

    /// Execute whatever is left in the input buffer; failures here are expected and cleared.
    fn prepare(&mut self) {
        if let Err(e) = self.link.write_line(commands::EXECUTE) {
            debug!("Keithley237: ignoring prepare failure: {e}");
            self.link.clear();
        }
    }

    fn handshake(&mut self, filter_mode: u8, integration_mode: u8) -> Result<()> {
        self.send_and_check(commands::RESTORE_FACTORY_DEFAULTS)?;

        self.send(commands::SEND_MACHINE_STATUS)?;
        let identity = self
            .link
            .read_line()
            .map_err(|e| self.link.error("Keithley237::connect", "Unable to read the machine status.", e))?;
        if !identity.starts_with(IDENTITY_PREFIX) {
            return Err(Error::connection(
                "Keithley237::connect",
                format!("Connected device is not supported. Device identified itself as '{identity}'."),
            ));
        }

        self.send_and_check(&format!("{}{filter_mode}", commands::SET_FILTER))?;
        self.send_and_check(&format!("{}{integration_mode}", commands::SET_INTEGRATION_TIME))?;
        self.send_and_check(commands::SET_OUTPUT_FORMAT)
    }

    /// Send one command followed by the execute character.
    fn send(&mut self, command: &str) -> Result<()> {
        let line = format!("{command}{}", commands::EXECUTE);
        self.link.write_line(&line).map_err(|e| {
            self.link.error(
                "Keithley237::send",
                format!("Unable to send a command to the device. Command = '{line}'."),
                e,
            )
        })
    }

    /// Send `command`, then fail if the error or warning status word has any bit set.
    pub fn send_and_check(&mut self, command: &str) -> Result<()> {
        self.send(command)?;
        let executed = format!("{command}{}", commands::EXECUTE);

        self.send(commands::SEND_ERROR_STATUS)?;
        let errors: DeviceStatus<ErrorFlag> = self.read()?;
        if !errors.is_clear() {
            return Err(Error::device_reported(
                "Keithley237::send_and_check",
                Severity::Error,
                &executed,
                errors.message(),
            ));
        }

        self.send(commands::SEND_WARNING_STATUS)?;
        let warnings: DeviceStatus<WarningFlag> = self.read()?;
        if !warnings.is_clear() {
            return Err(Error::device_reported(
                "Keithley237::send_and_check",
                Severity::Warning,
                &executed,
                warnings.message(),
            ));
        }
        Ok(())
    }

    fn read<T: ParseReply>(&mut self) -> Result<T> {
        self.link
            .read::<T>()
            .map_err(|e| self.link.error("Keithley237::read", "Unable to read data from the device.", e))
    }
}

impl<S: Transport> VoltageSource for Keithley237<S> {
    fn set(&mut self, value: Value) -> Result<Value> {
        // Written so that NaN fails the range checks.
        if !(value.voltage.abs() <= MAX_VOLTAGE) {
            return Err(Error::validation(
                "Keithley237::set",
                format!(
                    "Voltage value is out of range. Requested voltage value to set is {}. Maximal supported absolute value is {MAX_VOLTAGE}.",
                    value.voltage
                ),
            ));
        }
        if !(value.compliance.abs() <= MAX_COMPLIANCE) {
            return Err(Error::validation(
                "Keithley237::set",
                format!(
                    "Compliance value is out of range. Requested compliance value to set is {}. Maximal supported absolute value is {MAX_COMPLIANCE}.",
                    value.compliance
                ),
            ));
        }

        self.send_and_check(commands::SET_SOURCE_AND_FUNCTION)?;
        self.send_and_check(&format!(
            "{}{:.4E},{CURRENT_AUTORANGE_MODE}",
            commands::SET_COMPLIANCE,
            value.compliance.value()
        ))?;
        self.send_and_check(&format!(
            "{}{:.4E},{VOLTAGE_RANGE_MODE},0",
            commands::SET_BIAS,
            value.voltage.value()
        ))?;
        self.send_and_check(commands::OPERATE)?;
        self.send_and_check(commands::IMMEDIATE_TRIGGER)?;

        self.send(commands::SEND_MACHINE_STATUS)?;
        let status: MachineStatus = self.read()?;
        if !status.operate {
            return Err(Error::new(
                ErrorKind::DeviceReported,
                "Keithley237::set",
                format!(
                    "Unable to set a voltage = {} and compliance = {}. After execution of all required commands the device is still not in the operate mode.",
                    value.voltage, value.compliance
                ),
            ));
        }

        self.send(commands::SEND_COMPLIANCE_VALUE)?;
        let ComplianceValue(compliance) = self.read()?;
        let measurement = self.measure()?;
        Ok(Value::new(measurement.voltage, compliance))
    }

    fn accuracy(&mut self, _voltage: Volts) -> Result<Volts> {
        Ok(ACCURACY)
    }

    fn measure(&mut self) -> Result<Measurement> {
        let reading: Reading = self.read()?;
        Ok(Measurement::now(reading.current, reading.voltage, reading.in_compliance))
    }

    fn off(&mut self) -> Result<()> {
        self.send_and_check(commands::STANDBY)
    }
}

impl<S: Transport> Drop for Keithley237<S> {
    fn drop(&mut self) {
        if self.initialized {
            if let Err(e) = self.off() {
                warn!("Keithley237: unable to switch the output off.\n{}", e.full_message());
            }
        }
    }
}
