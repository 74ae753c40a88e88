use serde::{Deserialize, Serialize};
use std::ops::BitOr;

use crate::error::SweepError;

/// Slack added before flooring the step count so that decimal ranges
/// (e.g. 50.3 -> 50.5 in 0.01 deg steps) are not lost to binary rounding
const STEP_COUNT_EPSILON: f64 = 1e-9;

/// Upper bound on positions visited in one sweep
pub const MAX_STEP_COUNT: usize = 1_000_000;

/// Parameters of one sweep invocation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// First commanded angle in degrees
    pub start_angle: f64,
    /// End of the range in degrees (not visited unless it lies on the step grid)
    pub end_angle: f64,
    /// Signed increment per step in degrees, never zero
    pub step_angle: f64,
    /// Number of scope records captured at each step
    pub records_per_step: usize,
}

impl SweepConfig {
    pub fn new(
        start_angle: f64,
        end_angle: f64,
        step_angle: f64,
        records_per_step: usize,
    ) -> Result<Self, SweepError> {
        let config = Self {
            start_angle,
            end_angle,
            step_angle,
            records_per_step,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        if !self.start_angle.is_finite() || !self.end_angle.is_finite() {
            return Err(SweepError::InvalidConfig(format!(
                "sweep range must be finite (got {} to {})",
                self.start_angle, self.end_angle
            )));
        }
        if !self.step_angle.is_finite() || self.step_angle == 0.0 {
            return Err(SweepError::InvalidConfig(format!(
                "step_angle must be finite and non-zero, got: {}",
                self.step_angle
            )));
        }
        if self.records_per_step == 0 {
            return Err(SweepError::InvalidConfig(
                "records_per_step must be greater than zero".to_string(),
            ));
        }
        let ratio = (self.end_angle - self.start_angle) / self.step_angle;
        if !ratio.is_finite() || ratio > MAX_STEP_COUNT as f64 {
            return Err(SweepError::InvalidConfig(format!(
                "{} -> {} deg in {} deg steps exceeds {} steps",
                self.start_angle, self.end_angle, self.step_angle, MAX_STEP_COUNT
            )));
        }
        Ok(())
    }

    /// floor((end - start) / step), clamped at zero for ranges that run
    /// against the step direction
    pub fn step_count(&self) -> usize {
        let ratio = (self.end_angle - self.start_angle) / self.step_angle;
        if !ratio.is_finite() || ratio <= 0.0 {
            return 0;
        }
        (ratio + STEP_COUNT_EPSILON).floor() as usize
    }

    /// Nominal target of step `index` (0-based) on the fixed grid
    pub fn grid_target(&self, index: usize) -> f64 {
        self.start_angle + (index as f64 + 1.0) * self.step_angle
    }

    /// Number of (angle, voltage, noise) entries a fully successful sweep
    /// yields, `None` if that count does not fit in `usize`
    pub fn expected_entries(&self) -> Option<usize> {
        self.step_count().checked_mul(self.records_per_step)
    }
}

/// How the next target angle is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStrategy {
    /// Read the stage position back and add one step to it
    #[default]
    ReadBack,
    /// Walk the fixed grid `start + k * step` regardless of servo error
    Accumulate,
}

/// Integrity bits reported by the scope with each record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct RecordFlags(u32);

impl RecordFlags {
    pub const NONE: RecordFlags = RecordFlags(0);
    pub const DATA_LOSS: RecordFlags = RecordFlags(1 << 0);
    pub const MISSED_TRIGGER: RecordFlags = RecordFlags(1 << 1);
    pub const TRANSFER_FAILURE: RecordFlags = RecordFlags(1 << 2);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: RecordFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for RecordFlags {
    type Output = RecordFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        RecordFlags(self.0 | rhs.0)
    }
}

impl From<u32> for RecordFlags {
    fn from(bits: u32) -> Self {
        RecordFlags(bits)
    }
}

/// One captured waveform plus the metadata the scope attaches to it.
///
/// Fields are private: a record is assembled once by the acquisition side
/// and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    flags: RecordFlags,
    total_sample_count: usize,
    samples: Vec<f64>,
    timestamp: u64,
    trigger_timestamp: u64,
    sample_interval: f64,
}

impl RawRecord {
    /// Record whose declared sample count matches the payload
    pub fn new(samples: Vec<f64>, sample_interval: f64) -> Self {
        Self {
            flags: RecordFlags::NONE,
            total_sample_count: samples.len(),
            samples,
            timestamp: 0,
            trigger_timestamp: 0,
            sample_interval,
        }
    }

    pub fn with_flags(mut self, flags: impl Into<RecordFlags>) -> Self {
        self.flags = flags.into();
        self
    }

    /// Override the sample count declared in the record header
    pub fn with_total_sample_count(mut self, total_sample_count: usize) -> Self {
        self.total_sample_count = total_sample_count;
        self
    }

    /// Timestamps in device clock ticks
    pub fn with_timestamps(mut self, timestamp: u64, trigger_timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self.trigger_timestamp = trigger_timestamp;
        self
    }

    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    pub fn total_sample_count(&self) -> usize {
        self.total_sample_count
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn trigger_timestamp(&self) -> u64 {
        self.trigger_timestamp
    }

    pub fn sample_interval(&self) -> f64 {
        self.sample_interval
    }

    /// Sample times in seconds relative to the trigger.
    ///
    /// The last sample sits one interval before the record timestamp, shifted
    /// by the timestamp/trigger offset converted with the device clockbase.
    pub fn time_axis(&self, clockbase_hz: f64) -> Vec<f64> {
        let n = self.samples.len() as f64;
        let offset = (self.timestamp as f64 - self.trigger_timestamp as f64) / clockbase_hz;
        (0..self.samples.len())
            .map(|k| (k as f64 - n) * self.sample_interval + offset)
            .collect()
    }
}

/// Records handed back by one acquisition, tagged with the requested count
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordBatch {
    requested: usize,
    records: Vec<RawRecord>,
}

impl RecordBatch {
    pub fn new(requested: usize, records: Vec<RawRecord>) -> Self {
        Self { requested, records }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RawRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.records.len() >= self.requested
    }
}

/// Integrity summary for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub has_data_loss: bool,
    pub has_missed_trigger: bool,
    pub has_transfer_failure: bool,
    pub sample_count_consistent: bool,
}

impl ValidationReport {
    /// Any of the scope's warning bits set
    pub fn has_warnings(&self) -> bool {
        self.has_data_loss || self.has_missed_trigger || self.has_transfer_failure
    }

    pub fn is_usable(&self) -> bool {
        self.sample_count_consistent
    }
}

/// Mean and population standard deviation of one record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSample {
    pub mean: f64,
    pub standard_deviation: f64,
}

/// Parallel angle/voltage/noise columns of a sweep.
///
/// Entries are only added through [`SweepResult::push`], so the three
/// columns always have the same length.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SweepResult {
    angles: Vec<f64>,
    voltages: Vec<f64>,
    noises: Vec<f64>,
}

impl SweepResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from three columns, rejecting mismatched lengths
    pub fn from_columns(
        angles: Vec<f64>,
        voltages: Vec<f64>,
        noises: Vec<f64>,
    ) -> Result<Self, SweepError> {
        if angles.len() != voltages.len() || angles.len() != noises.len() {
            return Err(SweepError::Parse(format!(
                "column lengths differ: {} angles, {} voltages, {} noises",
                angles.len(),
                voltages.len(),
                noises.len()
            )));
        }
        Ok(Self {
            angles,
            voltages,
            noises,
        })
    }

    pub fn push(&mut self, angle: f64, sample: StatSample) {
        self.angles.push(angle);
        self.voltages.push(sample.mean);
        self.noises.push(sample.standard_deviation);
    }

    pub fn angles(&self) -> &[f64] {
        &self.angles
    }

    pub fn voltages(&self) -> &[f64] {
        &self.voltages
    }

    pub fn noises(&self) -> &[f64] {
        &self.noises
    }

    pub fn len(&self) -> usize {
        self.angles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }

    /// Rows as (angle, voltage, noise)
    pub fn rows(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.angles
            .iter()
            .zip(&self.voltages)
            .zip(&self.noises)
            .map(|((a, v), n)| (*a, *v, *n))
    }
}
