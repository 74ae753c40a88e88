use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use crate::acquisition::{AcquisitionSession, CaptureOutcome, DEFAULT_CLOCKBASE_HZ};
use crate::config::StageConfig;
use crate::error::SweepError;
use crate::hardware::{AcquisitionPort, PositionPort, StageSession};
use crate::logger::Logger;
use crate::stats::StatsReducer;
use crate::types::{StepStrategy, SweepConfig, SweepResult, ValidationReport};
use crate::utils::{PollError, poll_until};
use crate::validator::RecordValidator;

/// Waits and stepping behaviour around each move
#[derive(Debug, Clone, PartialEq)]
pub struct SweepTiming {
    pub settle_after_start: Duration,
    pub settle_after_step: Duration,
    /// Required agreement between target and read-back position, if any
    pub position_tolerance: Option<f64>,
    pub settle_timeout: Duration,
    pub settle_poll_interval: Duration,
    pub step_strategy: StepStrategy,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            settle_after_start: Duration::from_secs(2),
            settle_after_step: Duration::from_millis(250),
            position_tolerance: None,
            settle_timeout: Duration::from_secs(1),
            settle_poll_interval: Duration::from_millis(20),
            step_strategy: StepStrategy::ReadBack,
        }
    }
}

impl From<&StageConfig> for SweepTiming {
    fn from(config: &StageConfig) -> Self {
        Self {
            settle_after_start: config.settle_after_start(),
            settle_after_step: config.settle_after_step(),
            position_tolerance: config.position_tolerance_deg,
            settle_timeout: config.settle_timeout(),
            ..Self::default()
        }
        .with_step_strategy(config.step_strategy)
    }
}

impl SweepTiming {
    /// No waits at all, for simulated hardware
    pub fn immediate() -> Self {
        Self {
            settle_after_start: Duration::ZERO,
            settle_after_step: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_step_strategy(mut self, strategy: StepStrategy) -> Self {
        self.step_strategy = strategy;
        self
    }

    pub fn with_position_tolerance(mut self, tolerance: f64, settle_timeout: Duration) -> Self {
        self.position_tolerance = Some(tolerance);
        self.settle_timeout = settle_timeout;
        self
    }
}

/// Where the controller is in a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    MovingToStart,
    SettlingAfterStart,
    Moving { step: usize },
    Settling { step: usize },
    Acquiring { step: usize },
    Reducing { step: usize },
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Every requested record was reduced
    Reduced,
    /// Some records were reduced, others timed out or were dropped
    Partial,
    Skipped(String),
}

/// What happened at one sweep position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub index: usize,
    pub target: f64,
    /// Read-back position, absent when the stage could not be read
    pub position: Option<f64>,
    pub status: StepStatus,
    pub records_requested: usize,
    pub records_received: usize,
    pub records_dropped: usize,
    pub flagged_records: usize,
}

/// One line of the experiment log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub step: StepSummary,
    pub reports: Vec<ValidationReport>,
    /// Sample time span of each accepted record relative to its trigger
    pub record_windows: Vec<RecordWindow>,
}

/// First and last sample time of a record, in seconds from the trigger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordWindow {
    pub start_s: f64,
    pub end_s: f64,
}

/// Why a sweep stopped
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed,
    /// `step` is `None` when the move to the start angle failed
    MotionFault { step: Option<usize>, reason: String },
    Cancelled { step: Option<usize> },
}

/// Result of [`SweepController::run_sweep`]
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub result: SweepResult,
    pub termination: Termination,
    pub steps: Vec<StepSummary>,
}

impl SweepReport {
    fn empty() -> Self {
        Self {
            result: SweepResult::new(),
            termination: Termination::Completed,
            steps: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.termination == Termination::Completed
    }

    pub fn skipped_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Skipped(_)))
            .count()
    }

    pub fn dropped_records(&self) -> usize {
        self.steps.iter().map(|s| s.records_dropped).sum()
    }
}

/// Steps the waveplate through a range and acquires at every position
///
/// Owns the stage and the acquisition session for its lifetime. A sweep
/// degrades to partial data on per-step failures; only a failed connection
/// is returned as an error, and a motion fault ends the sweep early with the
/// data gathered so far.
pub struct SweepController<P: PositionPort, A: AcquisitionPort> {
    stage: P,
    acquisition: AcquisitionSession<A>,
    timing: SweepTiming,
    state: SweepState,
    shutdown_requested: Option<Arc<AtomicBool>>,
    step_logger: Option<Logger<StepLogEntry>>,
    clockbase_hz: f64,
}

impl<P: PositionPort, A: AcquisitionPort> SweepController<P, A> {
    pub fn new(stage: P, acquisition: AcquisitionSession<A>) -> Self {
        Self {
            stage,
            acquisition,
            timing: SweepTiming::default(),
            state: SweepState::Idle,
            shutdown_requested: None,
            step_logger: None,
            clockbase_hz: DEFAULT_CLOCKBASE_HZ,
        }
    }

    pub fn with_timing(mut self, timing: SweepTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Write one JSON line per step
    pub fn with_step_logger(mut self, logger: Logger<StepLogEntry>) -> Self {
        self.step_logger = Some(logger);
        self
    }

    /// Set shutdown flag for graceful termination
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown_requested = Some(flag.clone());
        self.acquisition.set_shutdown_flag(flag);
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Device clock used to place record samples in time for the step log
    pub fn with_clockbase(mut self, clockbase_hz: f64) -> Self {
        self.clockbase_hz = clockbase_hz;
        self
    }

    /// Run one sweep.
    ///
    /// An empty range returns an empty report without touching hardware.
    /// The stage is connected for the duration of the call and disconnected
    /// on every way out of it.
    pub fn run_sweep(&mut self, config: &SweepConfig) -> Result<SweepReport, SweepError> {
        config.validate()?;
        self.state = SweepState::Idle;

        let step_count = config.step_count();
        if step_count == 0 {
            info!(
                "Sweep {:.4} -> {:.4} deg in {:.4} deg steps has no steps, nothing to do",
                config.start_angle, config.end_angle, config.step_angle
            );
            self.state = SweepState::Done;
            return Ok(SweepReport::empty());
        }

        let stage = match StageSession::connect(&mut self.stage) {
            Ok(stage) => stage,
            Err(e) => {
                error!("Cannot start sweep: {}", e);
                self.state = SweepState::Failed;
                return Err(e);
            }
        };

        info!(
            "Sweeping {:.4} -> {:.4} deg in {} steps of {:.4} deg, {} records per step",
            config.start_angle, config.end_angle, step_count, config.step_angle, config.records_per_step
        );

        let (termination, stage, result, steps) = {
            let mut run = SweepRun {
                stage,
                acquisition: &mut self.acquisition,
                timing: &self.timing,
                state: &mut self.state,
                shutdown: self.shutdown_requested.as_deref(),
                logger: self.step_logger.as_mut(),
                clockbase_hz: self.clockbase_hz,
                config,
                step_count,
                result: SweepResult::new(),
                steps: Vec::new(),
            };
            let termination = run.execute();
            let SweepRun {
                stage,
                result,
                steps,
                ..
            } = run;
            (termination, stage, result, steps)
        };
        if let Err(e) = stage.disconnect() {
            warn!("Stage disconnect failed: {}", e);
        }
        if let Some(logger) = self.step_logger.as_mut() {
            if let Err(e) = logger.flush() {
                warn!("Could not flush step log: {}", e);
            }
        }

        self.state = match termination {
            Termination::MotionFault { .. } => SweepState::Failed,
            _ => SweepState::Done,
        };

        let report = SweepReport {
            result,
            termination,
            steps,
        };
        info!(
            "Finished sweep: {} entries, {} skipped steps, {} dropped records ({:?})",
            report.result.len(),
            report.skipped_steps(),
            report.dropped_records(),
            report.termination
        );
        Ok(report)
    }
}

/// Per-invocation state borrowed from the controller while connected
struct SweepRun<'a, P: PositionPort, A: AcquisitionPort> {
    stage: StageSession<'a, P>,
    acquisition: &'a mut AcquisitionSession<A>,
    timing: &'a SweepTiming,
    state: &'a mut SweepState,
    shutdown: Option<&'a AtomicBool>,
    logger: Option<&'a mut Logger<StepLogEntry>>,
    clockbase_hz: f64,
    config: &'a SweepConfig,
    step_count: usize,
    result: SweepResult,
    steps: Vec<StepSummary>,
}

/// Why a step ended the sweep
enum StepAbort {
    Fault(SweepError),
    Cancelled,
}

impl<P: PositionPort, A: AcquisitionPort> SweepRun<'_, P, A> {
    fn transition(&mut self, next: SweepState) {
        debug!("Sweep state {:?} -> {:?}", *self.state, next);
        *self.state = next;
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn execute(&mut self) -> Termination {
        if self.is_shutdown_requested() {
            info!("Shutdown requested before the sweep started");
            return Termination::Cancelled { step: None };
        }

        self.transition(SweepState::MovingToStart);
        let start = self.config.start_angle;
        info!("Moving waveplate to start angle {:.4} deg", start);
        if let Err(e) = self.stage.move_to(start) {
            error!("Motion fault on move to start: {}", e);
            return Termination::MotionFault {
                step: None,
                reason: e.to_string(),
            };
        }

        self.transition(SweepState::SettlingAfterStart);
        match self.settle(start, self.timing.settle_after_start) {
            Ok(position) => info!("Waveplate at start, position {:.4} deg", position),
            Err(e) if e.is_fatal() => {
                error!("Motion fault while settling at start: {}", e);
                return Termination::MotionFault {
                    step: None,
                    reason: e.to_string(),
                };
            }
            Err(e) => warn!("{}; continuing with sweep", e),
        }

        for index in 0..self.step_count {
            if self.is_shutdown_requested() {
                info!("Shutdown requested before step {}", index);
                return Termination::Cancelled { step: Some(index) };
            }

            match self.run_step(index) {
                Ok(()) => {}
                Err(StepAbort::Fault(e)) => {
                    error!("Aborting sweep at step {}: {}", index, e);
                    return Termination::MotionFault {
                        step: Some(index),
                        reason: e.to_string(),
                    };
                }
                Err(StepAbort::Cancelled) => {
                    info!("Sweep cancelled during step {}", index);
                    return Termination::Cancelled { step: Some(index) };
                }
            }
        }

        Termination::Completed
    }

    fn next_target(&mut self, index: usize) -> Result<f64, SweepError> {
        match self.timing.step_strategy {
            StepStrategy::ReadBack => {
                let position = self.read_position(self.config.grid_target(index))?;
                Ok(position + self.config.step_angle)
            }
            StepStrategy::Accumulate => Ok(self.config.grid_target(index)),
        }
    }

    /// Read-back position; a failed read is a motion fault on `target`
    fn read_position(&mut self, target: f64) -> Result<f64, SweepError> {
        self.stage
            .current_position()
            .map_err(|e| SweepError::MotionFault {
                target,
                reason: format!("position read-back failed: {}", e),
            })
    }

    /// Sleep for `delay`, then return the read-back position once it is
    /// within tolerance of `target` (or immediately without a tolerance)
    fn settle(&mut self, target: f64, delay: Duration) -> Result<f64, SweepError> {
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let Some(tolerance) = self.timing.position_tolerance else {
            return self.read_position(target);
        };

        let stage = &mut self.stage;
        let mut last = f64::NAN;
        let polled = poll_until(
            || -> Result<bool, SweepError> {
                last = stage.current_position()?;
                Ok((last - target).abs() <= tolerance)
            },
            self.timing.settle_timeout,
            self.timing.settle_poll_interval,
        );

        match polled {
            Ok(()) => Ok(last),
            Err(PollError::Timeout) => Err(SweepError::SettlingTimeout {
                target,
                position: last,
                tolerance,
            }),
            Err(PollError::ConditionError(e)) => Err(SweepError::MotionFault {
                target,
                reason: format!("position read-back failed: {}", e),
            }),
        }
    }

    fn run_step(&mut self, index: usize) -> Result<(), StepAbort> {
        let requested = self.config.records_per_step;

        self.transition(SweepState::Moving { step: index });
        let target = self.next_target(index).map_err(StepAbort::Fault)?;
        self.stage.move_to(target).map_err(StepAbort::Fault)?;

        self.transition(SweepState::Settling { step: index });
        let position = match self.settle(target, self.timing.settle_after_step) {
            Ok(position) => position,
            Err(e) if e.is_fatal() => return Err(StepAbort::Fault(e)),
            Err(e) => {
                warn!("Step {}: {}, skipping step", index, e);
                let position = match e {
                    SweepError::SettlingTimeout { position, .. } if position.is_finite() => {
                        Some(position)
                    }
                    _ => None,
                };
                self.skip_step(index, target, position, e.to_string());
                return Ok(());
            }
        };
        info!(
            "Step {}/{}: target {:.4} deg, position {:.4} deg",
            index + 1,
            self.step_count,
            target,
            position
        );

        if self.is_shutdown_requested() {
            return Err(StepAbort::Cancelled);
        }

        self.transition(SweepState::Acquiring { step: index });
        let outcome = match self.acquisition.capture(requested) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Step {}: acquisition failed ({}), skipping step", index, e);
                self.skip_step(index, target, Some(position), e.to_string());
                return Ok(());
            }
        };
        let interrupted = matches!(outcome, CaptureOutcome::Interrupted(_));
        let batch = outcome.into_batch();

        if batch.is_empty() {
            let reason = if interrupted {
                "capture interrupted before any record arrived".to_string()
            } else {
                format!("acquisition timed out with 0/{} records", requested)
            };
            warn!("Step {}: {}, skipping step", index, reason);
            self.skip_step(index, target, Some(position), reason);
            return if interrupted {
                Err(StepAbort::Cancelled)
            } else {
                Ok(())
            };
        }

        self.transition(SweepState::Reducing { step: index });
        let received = batch.len();
        let validation = RecordValidator::validate(batch);
        let flagged = validation.flagged_count();
        let mut dropped = validation.dropped_count();
        let mut reports: Vec<ValidationReport> =
            validation.dropped.iter().map(|(_, report)| *report).collect();

        let mut windows = Vec::with_capacity(validation.accepted.len());
        let mut reduced = 0;
        for (record, report) in &validation.accepted {
            reports.push(*report);
            let axis = record.time_axis(self.clockbase_hz);
            if let (Some(start_s), Some(end_s)) = (axis.first(), axis.last()) {
                windows.push(RecordWindow {
                    start_s: *start_s,
                    end_s: *end_s,
                });
            }
            match StatsReducer::reduce(record) {
                Ok(sample) => {
                    self.result.push(position, sample);
                    reduced += 1;
                }
                Err(e) => {
                    warn!("Step {}: could not reduce record ({}), dropping it", index, e);
                    dropped += 1;
                }
            }
        }

        let status = if reduced == requested {
            StepStatus::Reduced
        } else if reduced == 0 {
            StepStatus::Skipped(format!("no usable records out of {}", received))
        } else {
            StepStatus::Partial
        };
        self.finish_step(
            StepSummary {
                index,
                target,
                position: Some(position),
                status,
                records_requested: requested,
                records_received: received,
                records_dropped: dropped,
                flagged_records: flagged,
            },
            reports,
            windows,
        );

        if interrupted {
            Err(StepAbort::Cancelled)
        } else {
            Ok(())
        }
    }

    fn skip_step(&mut self, index: usize, target: f64, position: Option<f64>, reason: String) {
        self.finish_step(
            StepSummary {
                index,
                target,
                position,
                status: StepStatus::Skipped(reason),
                records_requested: self.config.records_per_step,
                records_received: 0,
                records_dropped: 0,
                flagged_records: 0,
            },
            Vec::new(),
            Vec::new(),
        );
    }

    fn finish_step(
        &mut self,
        summary: StepSummary,
        reports: Vec<ValidationReport>,
        record_windows: Vec<RecordWindow>,
    ) {
        if let Some(logger) = self.logger.as_mut() {
            let entry = StepLogEntry {
                timestamp: Utc::now(),
                step: summary.clone(),
                reports,
                record_windows,
            };
            if let Err(e) = logger.add(entry) {
                warn!("Could not write step log entry: {}", e);
            }
        }
        self.steps.push(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ScopeLog, SimulatedScope, SimulatedStage, StageLog};
    use crate::types::{RawRecord, RecordFlags};
    use parking_lot::Mutex;

    struct Rig {
        controller: SweepController<SimulatedStage, SimulatedScope>,
        stage_log: Arc<Mutex<StageLog>>,
        scope_log: Arc<Mutex<ScopeLog>>,
    }

    fn rig(stage: SimulatedStage, scope: SimulatedScope, timing: SweepTiming) -> Rig {
        let stage_log = stage.log_handle();
        let scope = scope.with_angle_source(stage.angle_handle());
        let scope_log = scope.log_handle();
        let acquisition = AcquisitionSession::new(scope)
            .with_timeout(Duration::from_millis(40))
            .with_poll_interval(Duration::from_millis(1));
        Rig {
            controller: SweepController::new(stage, acquisition).with_timing(timing),
            stage_log,
            scope_log,
        }
    }

    fn default_rig() -> Rig {
        rig(
            SimulatedStage::new("83835052"),
            SimulatedScope::new(),
            SweepTiming::immediate(),
        )
    }

    fn assert_aligned(result: &SweepResult) {
        assert_eq!(result.angles().len(), result.voltages().len());
        assert_eq!(result.angles().len(), result.noises().len());
    }

    #[test]
    fn test_full_sweep_collects_every_record() {
        let mut rig = default_rig();
        let config = SweepConfig::new(50.3, 50.5, 0.01, 5).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert!(report.is_completed());
        assert_eq!(report.result.len(), 100);
        assert_aligned(&report.result);
        assert_eq!(report.steps.len(), 20);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Reduced));
        assert_eq!(rig.controller.state(), SweepState::Done);

        let stage_log = rig.stage_log.lock();
        assert_eq!(stage_log.moves.len(), 21);
        assert_eq!(stage_log.moves[0], 50.3);
        assert_eq!((stage_log.connects, stage_log.disconnects), (1, 1));
        let scope_log = rig.scope_log.lock();
        assert_eq!(scope_log.starts, 20);
        assert_eq!(scope_log.finishes, 20);
    }

    #[test]
    fn test_angles_follow_step_then_batch_order() {
        let mut rig = default_rig();
        let config = SweepConfig::new(0.0, 3.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        let angles = report.result.angles();
        assert_eq!(angles.len(), 6);
        for (i, expected) in [1.0, 1.0, 2.0, 2.0, 3.0, 3.0].iter().enumerate() {
            assert!((angles[i] - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_voltage_tracks_waveplate_angle() {
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_signal(1.0, 0.0, 0.0),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 45.0, 22.5, 1).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        let voltages = report.result.voltages();
        assert!((voltages[0] - 0.5).abs() < 1e-9);
        assert!(voltages[1].abs() < 1e-9);
        assert!(report.result.noises().iter().all(|n| n.abs() < 1e-12));
    }

    #[test]
    fn test_empty_range_touches_no_hardware() {
        let mut rig = default_rig();
        let config = SweepConfig::new(10.0, 5.0, 0.5, 3).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert!(report.result.is_empty());
        assert!(report.steps.is_empty());
        let stage_log = rig.stage_log.lock();
        assert_eq!(stage_log.connects, 0);
        assert!(stage_log.moves.is_empty());
        assert_eq!(rig.scope_log.lock().starts, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut rig = default_rig();
        let config = SweepConfig {
            start_angle: 0.0,
            end_angle: 1.0,
            step_angle: 0.0,
            records_per_step: 1,
        };
        assert!(matches!(
            rig.controller.run_sweep(&config),
            Err(SweepError::InvalidConfig(_))
        ));
        assert_eq!(rig.stage_log.lock().connects, 0);
    }

    #[test]
    fn test_oversized_sweep_rejected_before_connect() {
        let mut rig = default_rig();
        let config = SweepConfig {
            start_angle: 0.0,
            end_angle: 1.0,
            step_angle: 1e-300,
            records_per_step: 5,
        };
        assert!(matches!(
            rig.controller.run_sweep(&config),
            Err(SweepError::InvalidConfig(_))
        ));
        assert_eq!(rig.stage_log.lock().connects, 0);
        assert_eq!(rig.controller.state(), SweepState::Idle);
    }

    #[test]
    fn test_connection_failure_is_fatal() {
        let mut rig = rig(
            SimulatedStage::new("sim").with_connect_failure(),
            SimulatedScope::new(),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 1.0, 0.5, 1).unwrap();

        let result = rig.controller.run_sweep(&config);

        assert!(matches!(result, Err(SweepError::Connection(_))));
        assert_eq!(rig.controller.state(), SweepState::Failed);
        assert!(rig.stage_log.lock().moves.is_empty());
    }

    #[test]
    fn test_timed_out_step_is_skipped() {
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_stall(1, 0),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 4.0, 1.0, 3).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert!(report.is_completed());
        assert_eq!(report.result.len(), 9);
        assert_aligned(&report.result);
        assert_eq!(report.skipped_steps(), 1);
        assert!(matches!(report.steps[1].status, StepStatus::Skipped(_)));
        assert_eq!(rig.scope_log.lock().finishes, 4);
        assert_eq!(rig.stage_log.lock().moves.len(), 5);
    }

    #[test]
    fn test_partial_batch_is_reduced() {
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_stall(0, 2),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 2.0, 1.0, 4).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert_eq!(report.result.len(), 6);
        assert_eq!(report.steps[0].status, StepStatus::Partial);
        assert_eq!(report.steps[0].records_received, 2);
        assert_eq!(report.steps[1].status, StepStatus::Reduced);
    }

    #[test]
    fn test_acquisition_error_skips_step() {
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_start_failure(0),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 3.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert!(report.is_completed());
        assert_eq!(report.result.len(), 4);
        assert!(matches!(report.steps[0].status, StepStatus::Skipped(_)));
        assert_eq!(rig.scope_log.lock().finishes, 3);
    }

    #[test]
    fn test_sample_count_mismatch_excluded() {
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_short_record(1),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 3.0, 1.0, 3).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert_eq!(report.result.len(), 6);
        assert_aligned(&report.result);
        assert_eq!(report.dropped_records(), 3);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Partial));
    }

    #[test]
    fn test_flagged_record_still_contributes() {
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_record_flags(0, RecordFlags::DATA_LOSS),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 2.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert_eq!(report.result.len(), 4);
        assert!(report.steps.iter().all(|s| s.flagged_records == 1));
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Reduced));
    }

    #[test]
    fn test_motion_fault_returns_partial_result() {
        // move 1 is the start, move 3 is the second step
        let mut rig = rig(
            SimulatedStage::new("sim").with_fault_on_move(3),
            SimulatedScope::new(),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 5.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert!(matches!(
            report.termination,
            Termination::MotionFault { step: Some(1), .. }
        ));
        assert_eq!(report.result.len(), 2);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(rig.controller.state(), SweepState::Failed);
        let stage_log = rig.stage_log.lock();
        assert_eq!(stage_log.moves.len(), 3);
        assert_eq!(stage_log.disconnects, 1);
    }

    #[test]
    fn test_motion_fault_on_start_move() {
        let mut rig = rig(
            SimulatedStage::new("sim").with_fault_on_move(1),
            SimulatedScope::new(),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 5.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert!(matches!(
            report.termination,
            Termination::MotionFault { step: None, .. }
        ));
        assert!(report.result.is_empty());
        assert_eq!(rig.scope_log.lock().starts, 0);
        assert_eq!(rig.stage_log.lock().disconnects, 1);
    }

    #[test]
    fn test_readback_uses_measured_position() {
        let mut rig = rig(
            SimulatedStage::new("sim").with_servo_error(0.003),
            SimulatedScope::new(),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(10.0, 10.3, 0.1, 1).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        let moves = rig.stage_log.lock().moves.clone();
        assert_eq!(moves.len(), 4);
        for k in 0..3 {
            let expected_target = 10.0 + (k as f64 + 1.0) * 0.103;
            assert!((moves[k + 1] - expected_target).abs() < 1e-9);
            assert!((report.result.angles()[k] - (expected_target + 0.003)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_accumulate_walks_fixed_grid() {
        let mut rig = rig(
            SimulatedStage::new("sim").with_servo_error(0.003),
            SimulatedScope::new(),
            SweepTiming::immediate().with_step_strategy(StepStrategy::Accumulate),
        );
        let config = SweepConfig::new(10.0, 10.3, 0.1, 1).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        let moves = rig.stage_log.lock().moves.clone();
        for k in 0..3 {
            let grid = 10.0 + (k as f64 + 1.0) * 0.1;
            assert!((moves[k + 1] - grid).abs() < 1e-9);
            assert!((report.result.angles()[k] - (grid + 0.003)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_settling_timeout_skips_steps() {
        let mut rig = rig(
            SimulatedStage::new("sim").with_servo_error(0.01),
            SimulatedScope::new(),
            SweepTiming::immediate()
                .with_step_strategy(StepStrategy::Accumulate)
                .with_position_tolerance(0.001, Duration::from_millis(5)),
        );
        let config = SweepConfig::new(0.0, 3.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert!(report.is_completed());
        assert!(report.result.is_empty());
        assert_eq!(report.skipped_steps(), 3);
        let position = report.steps[0].position.unwrap();
        assert!((position - 1.01).abs() < 1e-9);
        assert_eq!(rig.scope_log.lock().starts, 0);
        assert_eq!(rig.stage_log.lock().moves.len(), 4);
    }

    #[test]
    fn test_settle_waits_for_lagging_encoder() {
        let mut rig = rig(
            SimulatedStage::new("sim").with_position_lag(3),
            SimulatedScope::new(),
            SweepTiming::immediate()
                .with_step_strategy(StepStrategy::Accumulate)
                .with_position_tolerance(1e-6, Duration::from_millis(500)),
        );
        let config = SweepConfig::new(0.0, 2.0, 1.0, 1).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert_eq!(report.result.len(), 2);
        assert!((report.result.angles()[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_shutdown_before_start() {
        let mut rig = default_rig();
        rig.controller
            .set_shutdown_flag(Arc::new(AtomicBool::new(true)));
        let config = SweepConfig::new(0.0, 3.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert_eq!(report.termination, Termination::Cancelled { step: None });
        let stage_log = rig.stage_log.lock();
        assert!(stage_log.moves.is_empty());
        assert_eq!(stage_log.disconnects, 1);
    }

    /// Scope that raises the shutdown flag when the given capture starts
    struct InterruptingScope {
        inner: SimulatedScope,
        flag: Arc<AtomicBool>,
        trip_on_start: usize,
        starts: usize,
    }

    impl AcquisitionPort for InterruptingScope {
        fn start(&mut self) -> Result<(), SweepError> {
            if self.starts == self.trip_on_start {
                self.flag.store(true, Ordering::SeqCst);
            }
            self.starts += 1;
            self.inner.start()
        }

        fn records_acquired(&mut self) -> Result<usize, SweepError> {
            self.inner.records_acquired()
        }

        fn fraction_complete(&mut self) -> Result<f64, SweepError> {
            self.inner.fraction_complete()
        }

        fn stop(&mut self) -> Result<(), SweepError> {
            self.inner.stop()
        }

        fn read_batch(&mut self) -> Result<Vec<RawRecord>, SweepError> {
            self.inner.read_batch()
        }

        fn finish(&mut self) -> Result<(), SweepError> {
            self.inner.finish()
        }
    }

    #[test]
    fn test_shutdown_mid_sweep_releases_everything() {
        let stage = SimulatedStage::new("sim");
        let stage_log = stage.log_handle();
        let scope = SimulatedScope::new();
        let scope_log = scope.log_handle();
        let flag = Arc::new(AtomicBool::new(false));
        let port = InterruptingScope {
            inner: scope,
            flag: flag.clone(),
            trip_on_start: 1,
            starts: 0,
        };
        let acquisition = AcquisitionSession::new(port)
            .with_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(1));
        let mut controller =
            SweepController::new(stage, acquisition).with_timing(SweepTiming::immediate());
        controller.set_shutdown_flag(flag);
        let config = SweepConfig::new(0.0, 5.0, 1.0, 2).unwrap();

        let report = controller.run_sweep(&config).unwrap();

        assert_eq!(report.termination, Termination::Cancelled { step: Some(1) });
        assert_eq!(report.result.len(), 2);
        assert_eq!(controller.state(), SweepState::Done);
        assert_eq!(scope_log.lock().finishes, 2);
        let stage_log = stage_log.lock();
        assert_eq!(stage_log.moves.len(), 3);
        assert_eq!(stage_log.disconnects, 1);
    }

    #[test]
    fn test_readback_failure_ends_sweep_with_partial_data() {
        // read 1 settles at start, reads 2 and 3 belong to step 0
        let mut rig = rig(
            SimulatedStage::new("sim").with_read_failure(4),
            SimulatedScope::new(),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 5.0, 1.0, 2).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        match &report.termination {
            Termination::MotionFault { step, reason } => {
                assert_eq!(*step, Some(1));
                assert!(reason.contains("2.0000 deg"));
                assert!(reason.contains("position read-back failed"));
            }
            other => panic!("unexpected termination {:?}", other),
        }
        assert_eq!(report.result.len(), 2);
        assert_eq!(rig.controller.state(), SweepState::Failed);
        let stage_log = rig.stage_log.lock();
        assert_eq!(stage_log.moves.len(), 2);
        assert_eq!(stage_log.disconnects, 1);
    }

    #[test]
    fn test_step_log_records_time_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("windows.jsonl");
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new()
                .with_samples_per_record(4)
                .with_short_record(0),
            SweepTiming::immediate(),
        );
        rig.controller = rig
            .controller
            .with_clockbase(1.8e9)
            .with_step_logger(Logger::new(path.clone(), 1, false));
        let config = SweepConfig::new(0.0, 1.0, 1.0, 3).unwrap();

        rig.controller.run_sweep(&config).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let entry: StepLogEntry = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        let dt = 1024.0 / 1.8e9;
        assert_eq!(entry.reports.len(), 3);
        assert_eq!(entry.record_windows.len(), 2);
        for window in &entry.record_windows {
            assert!((window.start_s + 4.0 * dt).abs() < 1e-15);
            assert!((window.end_s + dt).abs() < 1e-15);
        }
    }

    #[test]
    fn test_step_log_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.jsonl");
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_record_flags(1, RecordFlags::MISSED_TRIGGER),
            SweepTiming::immediate(),
        );
        rig.controller = rig
            .controller
            .with_step_logger(Logger::new(path.clone(), 100, false));
        let config = SweepConfig::new(0.0, 3.0, 1.0, 2).unwrap();

        rig.controller.run_sweep(&config).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<StepLogEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].step.index, 2);
        assert_eq!(entries[0].reports.len(), 2);
        assert!(entries[0].reports[1].has_missed_trigger);
    }

    #[test]
    fn test_timing_from_stage_config() {
        let stage = StageConfig {
            position_tolerance_deg: Some(0.02),
            step_strategy: StepStrategy::Accumulate,
            ..StageConfig::default()
        };
        let timing = SweepTiming::from(&stage);
        assert_eq!(timing.settle_after_start, Duration::from_secs(2));
        assert_eq!(timing.settle_after_step, Duration::from_millis(250));
        assert_eq!(timing.position_tolerance, Some(0.02));
        assert_eq!(timing.step_strategy, StepStrategy::Accumulate);
    }

    #[test]
    fn test_batch_trimmed_to_requested() {
        let mut rig = rig(
            SimulatedStage::new("sim"),
            SimulatedScope::new().with_records_per_tick(4),
            SweepTiming::immediate(),
        );
        let config = SweepConfig::new(0.0, 2.0, 1.0, 3).unwrap();

        let report = rig.controller.run_sweep(&config).unwrap();

        assert_eq!(report.result.len(), 6);
        assert!(report.steps.iter().all(|s| s.records_received == 3));
    }
}
