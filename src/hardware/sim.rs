//! Hardware-free stand-ins for the rotation stage and the scope module.
//!
//! The stage publishes its physical angle through a shared handle; the scope
//! reads that handle to synthesize the transmitted intensity of a half-wave
//! plate between parallel polarizers, `V = A * cos^2(2 * (theta - axis))`,
//! plus uniform noise from a seeded generator.

use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::interface::{AcquisitionPort, ConnectionInfo, PositionPort};
use crate::error::SweepError;
use crate::types::{RawRecord, RecordFlags};

/// Commands received by a [`SimulatedStage`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageLog {
    pub connects: usize,
    pub disconnects: usize,
    pub moves: Vec<f64>,
    pub position_reads: usize,
}

/// Simulated DC-servo rotation stage
pub struct SimulatedStage {
    serial_number: String,
    angle: Arc<Mutex<f64>>,
    reported: f64,
    servo_error: f64,
    lag_reads: usize,
    pending_reads: usize,
    fault_on_move: Option<usize>,
    fail_on_read: Option<usize>,
    fail_connect: bool,
    connected: bool,
    log: Arc<Mutex<StageLog>>,
}

impl SimulatedStage {
    pub fn new(serial_number: &str) -> Self {
        Self {
            serial_number: serial_number.to_string(),
            angle: Arc::new(Mutex::new(0.0)),
            reported: 0.0,
            servo_error: 0.0,
            lag_reads: 0,
            pending_reads: 0,
            fault_on_move: None,
            fail_on_read: None,
            fail_connect: false,
            connected: false,
            log: Arc::new(Mutex::new(StageLog::default())),
        }
    }

    /// Every move lands `error` degrees off its target
    pub fn with_servo_error(mut self, error: f64) -> Self {
        self.servo_error = error;
        self
    }

    /// The encoder keeps reporting the previous angle for `reads` reads after a move
    pub fn with_position_lag(mut self, reads: usize) -> Self {
        self.lag_reads = reads;
        self
    }

    /// The `n`-th move command (1-based) reports a motion fault
    pub fn with_fault_on_move(mut self, n: usize) -> Self {
        self.fault_on_move = Some(n);
        self
    }

    /// The `n`-th position read (1-based) fails as if the encoder stopped answering
    pub fn with_read_failure(mut self, n: usize) -> Self {
        self.fail_on_read = Some(n);
        self
    }

    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Physical angle, shared with a [`SimulatedScope`]
    pub fn angle_handle(&self) -> Arc<Mutex<f64>> {
        self.angle.clone()
    }

    pub fn log_handle(&self) -> Arc<Mutex<StageLog>> {
        self.log.clone()
    }
}

impl PositionPort for SimulatedStage {
    fn connect(&mut self) -> Result<ConnectionInfo, SweepError> {
        if self.fail_connect {
            return Err(SweepError::Connection(format!(
                "no controller with serial number {}",
                self.serial_number
            )));
        }
        self.log.lock().connects += 1;
        self.connected = true;
        Ok(ConnectionInfo {
            serial_number: self.serial_number.clone(),
            description: "Simulated DC servo rotation stage".to_string(),
        })
    }

    fn move_to(&mut self, angle: f64) -> Result<(), SweepError> {
        if !self.connected {
            return Err(SweepError::MotionFault {
                target: angle,
                reason: "controller not connected".to_string(),
            });
        }
        let move_count = {
            let mut log = self.log.lock();
            log.moves.push(angle);
            log.moves.len()
        };
        if self.fault_on_move == Some(move_count) {
            return Err(SweepError::MotionFault {
                target: angle,
                reason: "servo following error".to_string(),
            });
        }

        let mut physical = self.angle.lock();
        self.reported = *physical;
        *physical = angle + self.servo_error;
        self.pending_reads = self.lag_reads;
        Ok(())
    }

    fn current_position(&mut self) -> Result<f64, SweepError> {
        if !self.connected {
            return Err(SweepError::Connection("controller not connected".to_string()));
        }
        let reads = {
            let mut log = self.log.lock();
            log.position_reads += 1;
            log.position_reads
        };
        if self.fail_on_read == Some(reads) {
            return Err(SweepError::Connection(format!(
                "controller {} stopped answering position requests",
                self.serial_number
            )));
        }
        if self.pending_reads > 0 {
            self.pending_reads -= 1;
            return Ok(self.reported);
        }
        Ok(*self.angle.lock())
    }

    fn disconnect(&mut self) -> Result<(), SweepError> {
        self.log.lock().disconnects += 1;
        self.connected = false;
        Ok(())
    }
}

/// Calls received by a [`SimulatedScope`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeLog {
    pub starts: usize,
    pub polls: usize,
    pub stops: usize,
    pub reads: usize,
    pub finishes: usize,
}

/// Simulated scope module
///
/// Every `records_acquired` poll advances the capture by one tick; a record
/// completes every `ticks_per_record` ticks and `fraction_complete` reports
/// progress through the record in flight.
pub struct SimulatedScope {
    angle: Arc<Mutex<f64>>,
    amplitude: f64,
    axis_deg: f64,
    noise: f64,
    samples_per_record: usize,
    sample_interval: f64,
    ticks_per_record: usize,
    records_per_tick: usize,
    history_length: usize,
    stalls: HashMap<usize, usize>,
    start_failures: HashSet<usize>,
    record_flags: HashMap<usize, RecordFlags>,
    short_records: HashSet<usize>,
    rng: StdRng,
    clock: u64,
    acquisition: usize,
    running: bool,
    ticks: usize,
    log: Arc<Mutex<ScopeLog>>,
}

impl Default for SimulatedScope {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedScope {
    pub fn new() -> Self {
        Self {
            angle: Arc::new(Mutex::new(0.0)),
            amplitude: 1.0,
            axis_deg: 0.0,
            noise: 0.01,
            samples_per_record: 64,
            sample_interval: 1.0 / 1.8e9 * 1024.0,
            ticks_per_record: 1,
            records_per_tick: 1,
            history_length: 20,
            stalls: HashMap::new(),
            start_failures: HashSet::new(),
            record_flags: HashMap::new(),
            short_records: HashSet::new(),
            rng: StdRng::seed_from_u64(0x5eed),
            clock: 0,
            acquisition: 0,
            running: false,
            ticks: 0,
            log: Arc::new(Mutex::new(ScopeLog::default())),
        }
    }

    /// Read the waveplate angle from a stage's [`SimulatedStage::angle_handle`]
    pub fn with_angle_source(mut self, angle: Arc<Mutex<f64>>) -> Self {
        self.angle = angle;
        self
    }

    pub fn with_signal(mut self, amplitude: f64, axis_deg: f64, noise: f64) -> Self {
        self.amplitude = amplitude;
        self.axis_deg = axis_deg;
        self.noise = noise.abs();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_samples_per_record(mut self, samples: usize) -> Self {
        self.samples_per_record = samples;
        self
    }

    pub fn with_ticks_per_record(mut self, ticks: usize) -> Self {
        self.ticks_per_record = ticks.max(1);
        self
    }

    /// Records completed per finished tick; values above the requested
    /// count make the module hold more records than asked for
    pub fn with_records_per_tick(mut self, records: usize) -> Self {
        self.records_per_tick = records;
        self
    }

    /// Acquisition number `acquisition` (0-based) never gets past `max_records`
    pub fn with_stall(mut self, acquisition: usize, max_records: usize) -> Self {
        self.stalls.insert(acquisition, max_records);
        self
    }

    /// `start` of acquisition number `acquisition` (0-based) fails
    pub fn with_start_failure(mut self, acquisition: usize) -> Self {
        self.start_failures.insert(acquisition);
        self
    }

    /// Record `index` of every batch carries `flags`
    pub fn with_record_flags(mut self, index: usize, flags: RecordFlags) -> Self {
        self.record_flags.insert(index, flags);
        self
    }

    /// Record `index` of every batch declares one more sample than it carries
    pub fn with_short_record(mut self, index: usize) -> Self {
        self.short_records.insert(index);
        self
    }

    pub fn log_handle(&self) -> Arc<Mutex<ScopeLog>> {
        self.log.clone()
    }

    fn acquired(&self) -> usize {
        let completed = (self.ticks / self.ticks_per_record) * self.records_per_tick;
        match self.stalls.get(&self.acquisition) {
            Some(max) => completed.min(*max),
            None => completed,
        }
    }

    fn is_stalled(&self) -> bool {
        self.stalls
            .get(&self.acquisition)
            .is_some_and(|max| self.acquired() >= *max)
    }

    fn intensity(&self) -> f64 {
        let theta = (*self.angle.lock() - self.axis_deg).to_radians();
        self.amplitude * (2.0 * theta).cos().powi(2)
    }

    fn synthesize(&mut self, index: usize) -> RawRecord {
        let level = self.intensity();
        let noise = self.noise;
        let samples: Vec<f64> = (0..self.samples_per_record)
            .map(|_| {
                if noise > 0.0 {
                    level + self.rng.gen_range(-noise..noise)
                } else {
                    level
                }
            })
            .collect();

        self.clock += self.samples_per_record as u64 * 1024;
        let mut record = RawRecord::new(samples, self.sample_interval)
            .with_timestamps(self.clock, self.clock);
        if let Some(flags) = self.record_flags.get(&index) {
            record = record.with_flags(*flags);
        }
        if self.short_records.contains(&index) {
            record = record.with_total_sample_count(self.samples_per_record + 1);
        }
        record
    }
}

impl AcquisitionPort for SimulatedScope {
    fn start(&mut self) -> Result<(), SweepError> {
        let acquisition = {
            let mut log = self.log.lock();
            log.starts += 1;
            log.starts - 1
        };
        self.acquisition = acquisition;
        if self.start_failures.contains(&acquisition) {
            return Err(SweepError::Acquisition(format!(
                "scope module refused to execute (acquisition {})",
                acquisition
            )));
        }
        self.running = true;
        self.ticks = 0;
        Ok(())
    }

    fn records_acquired(&mut self) -> Result<usize, SweepError> {
        self.log.lock().polls += 1;
        if !self.running {
            return Err(SweepError::Acquisition("scope module not running".to_string()));
        }
        if !self.is_stalled() {
            self.ticks += 1;
        }
        Ok(self.acquired())
    }

    fn fraction_complete(&mut self) -> Result<f64, SweepError> {
        if self.is_stalled() {
            return Ok(0.0);
        }
        let in_flight = self.ticks % self.ticks_per_record;
        if in_flight == 0 {
            Ok(1.0)
        } else {
            Ok(in_flight as f64 / self.ticks_per_record as f64)
        }
    }

    fn stop(&mut self) -> Result<(), SweepError> {
        self.log.lock().stops += 1;
        self.running = false;
        Ok(())
    }

    fn read_batch(&mut self) -> Result<Vec<RawRecord>, SweepError> {
        self.log.lock().reads += 1;
        let count = self.acquired().min(self.history_length);
        debug!("Simulated scope returning {} records", count);
        Ok((0..count).map(|i| self.synthesize(i)).collect())
    }

    fn finish(&mut self) -> Result<(), SweepError> {
        self.log.lock().finishes += 1;
        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_reports_servo_error() {
        let mut stage = SimulatedStage::new("sim").with_servo_error(0.002);
        stage.connect().unwrap();
        stage.move_to(10.0).unwrap();
        assert!((stage.current_position().unwrap() - 10.002).abs() < 1e-12);
    }

    #[test]
    fn test_stage_position_lag() {
        let mut stage = SimulatedStage::new("sim").with_position_lag(2);
        stage.connect().unwrap();
        stage.move_to(5.0).unwrap();
        assert_eq!(stage.current_position().unwrap(), 0.0);
        assert_eq!(stage.current_position().unwrap(), 0.0);
        assert_eq!(stage.current_position().unwrap(), 5.0);
    }

    #[test]
    fn test_scope_follows_stage_angle() {
        let stage = SimulatedStage::new("sim");
        let angle = stage.angle_handle();
        let mut scope = SimulatedScope::new()
            .with_angle_source(angle.clone())
            .with_signal(2.0, 0.0, 0.0);

        *angle.lock() = 22.5;
        scope.start().unwrap();
        assert_eq!(scope.records_acquired().unwrap(), 1);
        let records = scope.read_batch().unwrap();
        assert_eq!(records.len(), 1);
        assert!((records[0].samples()[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_scope_progress_within_record() {
        let mut scope = SimulatedScope::new().with_ticks_per_record(4);
        scope.start().unwrap();
        assert_eq!(scope.records_acquired().unwrap(), 0);
        assert_eq!(scope.fraction_complete().unwrap(), 0.25);
        scope.records_acquired().unwrap();
        scope.records_acquired().unwrap();
        assert_eq!(scope.records_acquired().unwrap(), 1);
        assert_eq!(scope.fraction_complete().unwrap(), 1.0);
    }

    #[test]
    fn test_scope_stall_and_corruption() {
        let mut scope = SimulatedScope::new()
            .with_stall(0, 2)
            .with_short_record(1)
            .with_record_flags(0, RecordFlags::DATA_LOSS);
        scope.start().unwrap();
        for _ in 0..5 {
            scope.records_acquired().unwrap();
        }
        assert_eq!(scope.records_acquired().unwrap(), 2);
        let records = scope.read_batch().unwrap();
        assert!(records[0].flags().contains(RecordFlags::DATA_LOSS));
        assert_eq!(records[1].total_sample_count(), records[1].samples().len() + 1);
    }

    #[test]
    fn test_stage_read_failure() {
        let mut stage = SimulatedStage::new("sim").with_read_failure(2);
        stage.connect().unwrap();
        stage.move_to(1.0).unwrap();
        assert_eq!(stage.current_position().unwrap(), 1.0);
        assert!(matches!(
            stage.current_position(),
            Err(SweepError::Connection(_))
        ));
        assert_eq!(stage.current_position().unwrap(), 1.0);
    }

    fn capture_one(seed: u64) -> Vec<f64> {
        let mut scope = SimulatedScope::new()
            .with_seed(seed)
            .with_samples_per_record(8);
        scope.start().unwrap();
        scope.records_acquired().unwrap();
        scope.read_batch().unwrap().remove(0).samples().to_vec()
    }

    #[test]
    fn test_scope_noise_follows_seed() {
        let first = capture_one(7);
        assert_eq!(first.len(), 8);
        assert_eq!(first, capture_one(7));
        assert_ne!(first, capture_one(8));
    }
}
