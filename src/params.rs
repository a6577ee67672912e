//! Parameter tables and validation.
//!
//! Every configurable value of an instrument is described by a [`ParameterSpec`]
//! (bound, unit, integral flag, device default). A [`DeviceModel`] owns the table
//! for one hardware variant; the session engine consults it before any value is
//! encoded, so an out-of-range value never reaches the wire.
//!
//! Validation is pure and synchronous and may be called without holding the
//! session lock.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

// ============================================================================
// Constants
// ============================================================================

/// Elements per column in quadro mode (a whole column fires at once).
pub const QUADRO_GROUP_SIZE: u8 = 4;

const GAIN_MAX_DB: f64 = 36.0;
const FREQUENCY_MIN_KHZ: f64 = 10.0;
const FREQUENCY_MAX_KHZ: f64 = 100.0;
const AVERAGING_MAX: f64 = 16.0;
const PULSE_RATE_MAX_HZ: f64 = 100.0;
const BURST_PERIODS_MIN: f64 = 0.5;
const BURST_PERIODS_MAX: f64 = 10.0;

static A1052: Lazy<DeviceModel> =
    Lazy::new(|| DeviceModel::new("A1052", 32, 4).with_explicit_transmitter(true));

// ============================================================================
// Parameter identifiers
// ============================================================================

/// Named, bounded parameter of the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterId {
    /// Receiver gain in dB.
    Gain,
    /// Operating frequency in kHz.
    Frequency,
    /// Number of A-scans averaged on the device per delivered capture.
    Averaging,
    /// Pulse repetition rate in Hz, 0 means unlimited.
    PulseRepetitionRate,
    /// Number of periods in the transmitted burst.
    BurstPeriods,
    /// Element index used in single-transmitter mode.
    SingleTransmitter,
    /// Column index used in quadro-transmitter mode.
    QuadroTransmitter,
    /// Bit mask of lit LEDs.
    LedMask,
}

impl ParameterId {
    pub const ALL: [ParameterId; 8] = [
        ParameterId::Gain,
        ParameterId::Frequency,
        ParameterId::Averaging,
        ParameterId::PulseRepetitionRate,
        ParameterId::BurstPeriods,
        ParameterId::SingleTransmitter,
        ParameterId::QuadroTransmitter,
        ParameterId::LedMask,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParameterId::Gain => "gain",
            ParameterId::Frequency => "frequency",
            ParameterId::Averaging => "averaging",
            ParameterId::PulseRepetitionRate => "pulse_repetition_rate",
            ParameterId::BurstPeriods => "burst_periods",
            ParameterId::SingleTransmitter => "single_transmitter",
            ParameterId::QuadroTransmitter => "quadro_transmitter",
            ParameterId::LedMask => "led_mask",
        }
    }

    /// Code used in the SetParameter command payload.
    pub fn code(self) -> u8 {
        match self {
            ParameterId::Gain => 0x01,
            ParameterId::Frequency => 0x02,
            ParameterId::Averaging => 0x03,
            ParameterId::PulseRepetitionRate => 0x04,
            ParameterId::BurstPeriods => 0x05,
            ParameterId::SingleTransmitter => 0x06,
            ParameterId::QuadroTransmitter => 0x07,
            ParameterId::LedMask => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.code() == code)
    }

    fn index(self) -> usize {
        self.code() as usize - 1
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParameterId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|id| id.name() == normalized)
            .ok_or_else(|| ValidationError::UnknownParameter(s.to_string()))
    }
}

/// Transmitter arrangement used by an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitterMode {
    /// One element fires.
    Single,
    /// One column of four elements fires together.
    Quadro,
}

impl TransmitterMode {
    /// Parameter holding the selector for this mode.
    pub fn parameter(self) -> ParameterId {
        match self {
            TransmitterMode::Single => ParameterId::SingleTransmitter,
            TransmitterMode::Quadro => ParameterId::QuadroTransmitter,
        }
    }

    pub fn wire_code(self) -> u8 {
        match self {
            TransmitterMode::Single => 1,
            TransmitterMode::Quadro => 2,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TransmitterMode::Single),
            2 => Some(TransmitterMode::Quadro),
            _ => None,
        }
    }
}

impl fmt::Display for TransmitterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitterMode::Single => f.write_str("single"),
            TransmitterMode::Quadro => f.write_str("quadro"),
        }
    }
}

// ============================================================================
// Parameter table
// ============================================================================

/// Bound and metadata of one parameter for a given device model.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub id: ParameterId,
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
    /// Fractional values are rejected when set.
    pub integral: bool,
    /// Value the device assumes after a fresh connection, `None` if unset.
    pub default: Option<f64>,
}

impl ParameterSpec {
    fn new(id: ParameterId, unit: &'static str, min: f64, max: f64, integral: bool) -> Self {
        Self {
            id,
            unit,
            min,
            max,
            integral,
            default: None,
        }
    }

    fn with_default(mut self, default: f64) -> Self {
        self.default = Some(default);
        self
    }

    /// Check `value` against this bound.
    pub fn check(&self, value: f64) -> Result<f64, ValidationError> {
        // NaN fails both comparisons, so it is reported as out of range.
        if !(value >= self.min && value <= self.max) {
            return Err(ValidationError::OutOfRange {
                parameter: self.id,
                value,
                min: self.min,
                max: self.max,
            });
        }
        if self.integral && value.fract() != 0.0 {
            return Err(ValidationError::NotIntegral {
                parameter: self.id,
                value,
            });
        }
        Ok(value)
    }
}

/// Capabilities and parameter bounds of one instrument variant.
///
/// The session engine is generic over this table; adding a model with a
/// different channel count is a matter of constructing another value.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceModel {
    name: String,
    channel_count: u8,
    led_count: u8,
    requires_explicit_transmitter: bool,
    specs: Vec<ParameterSpec>,
}

impl DeviceModel {
    /// Build the standard parameter table for a model with `channel_count`
    /// transducer elements and `led_count` LEDs.
    pub fn new(name: impl Into<String>, channel_count: u8, led_count: u8) -> Self {
        let channel_count = channel_count.max(1);
        let led_count = led_count.min(8);
        let columns = (channel_count / QUADRO_GROUP_SIZE).max(1);
        let led_max = ((1u16 << led_count) - 1) as f64;

        let specs = vec![
            ParameterSpec::new(ParameterId::Gain, "dB", 0.0, GAIN_MAX_DB, true).with_default(0.0),
            ParameterSpec::new(
                ParameterId::Frequency,
                "kHz",
                FREQUENCY_MIN_KHZ,
                FREQUENCY_MAX_KHZ,
                false,
            )
            .with_default(50.0),
            ParameterSpec::new(ParameterId::Averaging, "count", 1.0, AVERAGING_MAX, true)
                .with_default(1.0),
            ParameterSpec::new(
                ParameterId::PulseRepetitionRate,
                "Hz",
                0.0,
                PULSE_RATE_MAX_HZ,
                false,
            )
            .with_default(0.0),
            ParameterSpec::new(
                ParameterId::BurstPeriods,
                "periods",
                BURST_PERIODS_MIN,
                BURST_PERIODS_MAX,
                false,
            )
            .with_default(1.0),
            ParameterSpec::new(
                ParameterId::SingleTransmitter,
                "index",
                0.0,
                (channel_count - 1) as f64,
                true,
            ),
            ParameterSpec::new(
                ParameterId::QuadroTransmitter,
                "column",
                0.0,
                (columns - 1) as f64,
                true,
            ),
            ParameterSpec::new(ParameterId::LedMask, "mask", 0.0, led_max, true).with_default(0.0),
        ];

        Self {
            name: name.into(),
            channel_count,
            led_count,
            requires_explicit_transmitter: false,
            specs,
        }
    }

    /// The 32-channel (8 columns x 4 rows) A1052 instrument.
    pub fn a1052() -> Self {
        A1052.clone()
    }

    /// Require a transmitter to be selected before acquisition instead of
    /// falling back to index 0.
    pub fn with_explicit_transmitter(mut self, required: bool) -> Self {
        self.requires_explicit_transmitter = required;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_count(&self) -> u8 {
        self.channel_count
    }

    pub fn led_count(&self) -> u8 {
        self.led_count
    }

    pub fn requires_explicit_transmitter(&self) -> bool {
        self.requires_explicit_transmitter
    }

    pub fn spec(&self, id: ParameterId) -> &ParameterSpec {
        &self.specs[id.index()]
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    /// Validate `value` for parameter `id`, returning the accepted value.
    pub fn validate(&self, id: ParameterId, value: f64) -> Result<f64, ValidationError> {
        self.spec(id).check(value)
    }

    /// Validate by parameter name (case-insensitive, `-` or `_` separated).
    pub fn validate_named(
        &self,
        name: &str,
        value: f64,
    ) -> Result<(ParameterId, f64), ValidationError> {
        let id: ParameterId = name.parse()?;
        self.validate(id, value).map(|v| (id, v))
    }

    /// Parameter values the device assumes on a fresh connection.
    pub fn defaults(&self) -> ParameterSet {
        let mut set = ParameterSet::default();
        for spec in &self.specs {
            if let Some(default) = spec.default {
                set.set(spec.id, default);
            }
        }
        set
    }
}

// ============================================================================
// Parameter set
// ============================================================================

/// Current validated value of each parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParameterSet {
    values: BTreeMap<ParameterId, f64>,
}

impl ParameterSet {
    pub fn get(&self, id: ParameterId) -> Option<f64> {
        self.values.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParameterId, f64)> + '_ {
        self.values.iter().map(|(id, v)| (*id, *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn set(&mut self, id: ParameterId, value: f64) {
        self.values.insert(id, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn a1052_bounds_follow_channel_count() {
        let model = DeviceModel::a1052();
        assert_eq!(model.channel_count(), 32);
        assert_eq!(model.spec(ParameterId::SingleTransmitter).max, 31.0);
        assert_eq!(model.spec(ParameterId::QuadroTransmitter).max, 7.0);
        assert_eq!(model.spec(ParameterId::LedMask).max, 15.0);
        assert!(model.requires_explicit_transmitter());
    }

    #[test]
    fn accepts_values_on_the_bounds() {
        let model = DeviceModel::a1052();
        assert_eq!(model.validate(ParameterId::Gain, 0.0), Ok(0.0));
        assert_eq!(model.validate(ParameterId::Gain, 36.0), Ok(36.0));
        assert_eq!(model.validate(ParameterId::BurstPeriods, 0.5), Ok(0.5));
        assert_eq!(model.validate(ParameterId::PulseRepetitionRate, 0.0), Ok(0.0));
        assert_eq!(model.validate(ParameterId::Frequency, 100.0), Ok(100.0));
    }

    #[test]
    fn rejects_out_of_range_and_fractional() {
        let model = DeviceModel::a1052();
        assert!(matches!(
            model.validate(ParameterId::Gain, 200.0),
            Err(ValidationError::OutOfRange { max, .. }) if max == 36.0
        ));
        assert!(matches!(
            model.validate(ParameterId::Averaging, 0.0),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            model.validate(ParameterId::Averaging, 2.5),
            Err(ValidationError::NotIntegral { .. })
        ));
        assert!(matches!(
            model.validate(ParameterId::SingleTransmitter, 32.0),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(model.validate(ParameterId::Frequency, f64::NAN).is_err());
        assert!(model.validate(ParameterId::Frequency, f64::INFINITY).is_err());
    }

    #[test]
    fn parses_names_loosely() {
        assert_eq!("Gain".parse::<ParameterId>(), Ok(ParameterId::Gain));
        assert_eq!(
            "pulse-repetition-rate".parse::<ParameterId>(),
            Ok(ParameterId::PulseRepetitionRate)
        );
        assert!(matches!(
            "volume".parse::<ParameterId>(),
            Err(ValidationError::UnknownParameter(_))
        ));
        for id in ParameterId::ALL {
            assert_eq!(ParameterId::from_code(id.code()), Some(id));
        }
    }

    #[test]
    fn defaults_leave_transmitters_unset() {
        let defaults = DeviceModel::a1052().defaults();
        assert_eq!(defaults.get(ParameterId::Averaging), Some(1.0));
        assert_eq!(defaults.get(ParameterId::SingleTransmitter), None);
        assert_eq!(defaults.get(ParameterId::QuadroTransmitter), None);
    }

    #[test]
    fn small_models_still_have_a_quadro_column() {
        let model = DeviceModel::new("probe", 2, 1);
        assert_eq!(model.spec(ParameterId::QuadroTransmitter).max, 0.0);
        assert_eq!(model.spec(ParameterId::LedMask).max, 1.0);
        assert!(!model.requires_explicit_transmitter());
    }

    proptest! {
        #[test]
        fn every_value_outside_its_bound_is_rejected(
            idx in 0usize..ParameterId::ALL.len(),
            excess in 0.001f64..1.0e6,
            below in any::<bool>(),
        ) {
            let model = DeviceModel::a1052();
            let spec = model.spec(ParameterId::ALL[idx]);
            let value = if below { spec.min - excess } else { spec.max + excess };
            let rejected = matches!(
                model.validate(spec.id, value),
                Err(ValidationError::OutOfRange { .. })
            );
            prop_assert!(rejected);
        }

        #[test]
        fn every_whole_value_inside_its_bound_is_accepted(
            idx in 0usize..ParameterId::ALL.len(),
            frac in 0.0f64..=1.0,
        ) {
            let model = DeviceModel::a1052();
            let spec = model.spec(ParameterId::ALL[idx]);
            let value = (spec.min + (spec.max - spec.min) * frac).round().clamp(spec.min, spec.max);
            prop_assert_eq!(model.validate(spec.id, value), Ok(value));
        }
    }
}
