use crate::error::SweepError;
use crate::types::RawRecord;

/// Identity of a connected motion controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub serial_number: String,
    pub description: String,
}

/// Rotation stage holding the optical element
///
/// Implemented by vendor bindings and by [`SimulatedStage`](super::SimulatedStage).
/// Angles are absolute, in degrees.
pub trait PositionPort {
    /// Open the connection to the motion controller
    ///
    /// Failure here is fatal: no sweep can start without a stage.
    fn connect(&mut self) -> Result<ConnectionInfo, SweepError>;

    /// Command an absolute move
    ///
    /// Blocks until the controller has accepted the command. Mechanical
    /// transients are handled by the caller's settle delay. Any error is
    /// treated as a motion fault.
    fn move_to(&mut self, angle: f64) -> Result<(), SweepError>;

    /// Position as currently reported by the encoder
    fn current_position(&mut self) -> Result<f64, SweepError>;

    /// Stop polling the controller and release it
    fn disconnect(&mut self) -> Result<(), SweepError>;
}

/// Scope acquisition module of the data-acquisition instrument
///
/// One capture is `start` → poll `records_acquired`/`fraction_complete` →
/// `stop` → `read_batch` → `finish`. `finish` releases the module and has to
/// run even when an earlier call failed.
pub trait AcquisitionPort {
    /// Arm the module and enable the scope
    fn start(&mut self) -> Result<(), SweepError>;

    /// Records received and processed since `start`
    fn records_acquired(&mut self) -> Result<usize, SweepError>;

    /// Progress of the record currently being captured, in [0, 1]
    fn fraction_complete(&mut self) -> Result<f64, SweepError>;

    /// Disable the scope
    fn stop(&mut self) -> Result<(), SweepError>;

    /// Records held by the module, oldest first
    fn read_batch(&mut self) -> Result<Vec<RawRecord>, SweepError>;

    /// Release the module; it must be started again before the next capture
    fn finish(&mut self) -> Result<(), SweepError>;
}
