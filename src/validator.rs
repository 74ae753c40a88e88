use log::warn;

use crate::types::{RawRecord, RecordBatch, RecordFlags, ValidationReport};

/// Outcome of validating one batch
#[derive(Debug, Clone, Default)]
pub struct BatchValidation {
    /// Usable records with their reports, in batch order
    pub accepted: Vec<(RawRecord, ValidationReport)>,
    /// Batch positions and reports of records dropped for a sample-count mismatch
    pub dropped: Vec<(usize, ValidationReport)>,
}

impl BatchValidation {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }

    /// Accepted records carrying at least one warning bit
    pub fn flagged_count(&self) -> usize {
        self.accepted
            .iter()
            .filter(|(_, report)| report.has_warnings())
            .count()
    }
}

/// Checks scope records for integrity flags and payload size
pub struct RecordValidator;

impl RecordValidator {
    /// Report for a single record
    ///
    /// An empty payload never counts as consistent, even when the header
    /// also declares zero samples.
    pub fn inspect(record: &RawRecord) -> ValidationReport {
        let flags = record.flags();
        ValidationReport {
            has_data_loss: flags.contains(RecordFlags::DATA_LOSS),
            has_missed_trigger: flags.contains(RecordFlags::MISSED_TRIGGER),
            has_transfer_failure: flags.contains(RecordFlags::TRANSFER_FAILURE),
            sample_count_consistent: !record.samples().is_empty()
                && record.samples().len() == record.total_sample_count(),
        }
    }

    /// Split a batch into usable and dropped records.
    ///
    /// Warning bits are logged and kept on the report; only a sample-count
    /// mismatch removes a record.
    pub fn validate(batch: RecordBatch) -> BatchValidation {
        let total = batch.len();
        let mut validation = BatchValidation::default();

        for (index, record) in batch.into_records().into_iter().enumerate() {
            let report = Self::inspect(&record);
            let record_idx = format!("{}/{}", index, total);

            if report.has_data_loss {
                warn!("Scope record {} flag indicates data loss", record_idx);
            }
            if report.has_missed_trigger {
                warn!("Scope record {} indicates missed trigger", record_idx);
            }
            if report.has_transfer_failure {
                warn!(
                    "Scope record {} indicates transfer failure (corrupt data)",
                    record_idx
                );
            }

            if report.sample_count_consistent {
                validation.accepted.push((record, report));
            } else {
                warn!(
                    "Scope record {} size ({}) does not match total samples ({}), dropping it",
                    record_idx,
                    record.samples().len(),
                    record.total_sample_count()
                );
                validation.dropped.push((index, report));
            }
        }

        validation
    }
}
