use ndarray::ArrayView1;

use crate::error::SweepError;
use crate::types::{RawRecord, StatSample};

/// Reduces validated records to (mean, spread)
pub struct StatsReducer;

impl StatsReducer {
    /// Arithmetic mean and population standard deviation of the samples
    pub fn reduce(record: &RawRecord) -> Result<StatSample, SweepError> {
        Self::reduce_samples(record.samples())
    }

    pub fn reduce_samples(samples: &[f64]) -> Result<StatSample, SweepError> {
        let arr = ArrayView1::from(samples);
        let mean = arr.mean().ok_or(SweepError::EmptyRecord)?;
        let standard_deviation = arr.std(0.0);
        Ok(StatSample {
            mean,
            standard_deviation,
        })
    }
}
