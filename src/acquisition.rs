use log::{debug, info, warn};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use crate::error::SweepError;
use crate::hardware::{AcquisitionGuard, AcquisitionPort};
use crate::types::RecordBatch;
use crate::utils::{PollError, poll_with_timeout};

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Timestamp clock of the scope module
pub const DEFAULT_CLOCKBASE_HZ: f64 = 1.8e9;

/// How a capture ended, always carrying whatever the module held
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// The module reported the requested count with the last record complete
    Completed(RecordBatch),
    /// The timeout expired first; the batch may be short or empty
    TimedOut(RecordBatch),
    /// Shutdown was requested while polling
    Interrupted(RecordBatch),
}

impl CaptureOutcome {
    pub fn batch(&self) -> &RecordBatch {
        match self {
            CaptureOutcome::Completed(batch)
            | CaptureOutcome::TimedOut(batch)
            | CaptureOutcome::Interrupted(batch) => batch,
        }
    }

    pub fn into_batch(self) -> RecordBatch {
        match self {
            CaptureOutcome::Completed(batch)
            | CaptureOutcome::TimedOut(batch)
            | CaptureOutcome::Interrupted(batch) => batch,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, CaptureOutcome::Completed(_))
    }
}

enum PollExit {
    Converged,
    Interrupted,
}

/// Drives the scope module through one capture at a time
pub struct AcquisitionSession<A: AcquisitionPort> {
    port: A,
    timeout: Duration,
    poll_interval: Duration,
    shutdown_requested: Option<Arc<AtomicBool>>,
}

impl<A: AcquisitionPort> AcquisitionSession<A> {
    pub fn new(port: A) -> Self {
        Self {
            port,
            timeout: DEFAULT_CAPTURE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_requested: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set shutdown flag checked once per poll iteration
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown_requested = Some(flag);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn port(&self) -> &A {
        &self.port
    }


    /// Capture `expected_count` records.
    ///
    /// Polls until the module has at least `expected_count` records and the
    /// record in flight is complete, or until the timeout. Stop, read-out and
    /// release happen on both paths; release also happens when any module
    /// call fails. Returns within `timeout + poll_interval` plus the time of
    /// the module calls themselves.
    pub fn capture(&mut self, expected_count: usize) -> Result<CaptureOutcome, SweepError> {
        if expected_count == 0 {
            return Err(SweepError::InvalidRequest(
                "capture needs at least one record".to_string(),
            ));
        }

        let timeout = self.timeout;
        let poll_interval = self.poll_interval;
        let shutdown = self.shutdown_requested.clone();

        let mut guard = AcquisitionGuard::new(&mut self.port);
        guard.port().start()?;

        let port = guard.port();
        let polled = poll_with_timeout(
            || -> Result<Option<PollExit>, SweepError> {
                if shutdown
                    .as_ref()
                    .is_some_and(|flag| flag.load(Ordering::SeqCst))
                {
                    return Ok(Some(PollExit::Interrupted));
                }
                let records = port.records_acquired()?;
                let progress = port.fraction_complete()?;
                debug!(
                    "Scope module has acquired {} records (requested {}). Progress of current segment {:.1}%",
                    records,
                    expected_count,
                    100.0 * progress
                );
                if records >= expected_count && progress >= 1.0 {
                    Ok(Some(PollExit::Converged))
                } else {
                    Ok(None)
                }
            },
            timeout,
            poll_interval,
        );

        let exit = match polled {
            Ok(exit) => exit,
            Err(PollError::ConditionError(e)) => return Err(e),
            Err(PollError::Timeout) => None,
        };

        if exit.is_none() {
            warn!(
                "Scope module did not return {} records after {:.1} s - forcing stop",
                expected_count,
                timeout.as_secs_f64()
            );
        }

        let port = guard.port();
        port.stop()?;
        let mut records = port.read_batch()?;
        if let Err(e) = guard.release() {
            warn!("Scope module finish failed after read-out: {}", e);
        }

        if records.len() > expected_count {
            let excess = records.len() - expected_count;
            debug!(
                "Scope module held {} records, keeping the latest {}",
                records.len(),
                expected_count
            );
            records.drain(..excess);
        }

        let batch = RecordBatch::new(expected_count, records);
        Ok(match exit {
            Some(PollExit::Converged) => CaptureOutcome::Completed(batch),
            Some(PollExit::Interrupted) => {
                info!(
                    "Capture interrupted with {}/{} records",
                    batch.len(),
                    expected_count
                );
                CaptureOutcome::Interrupted(batch)
            }
            None => CaptureOutcome::TimedOut(batch),
        })
    }
}
