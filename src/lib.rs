pub mod acquisition;
pub mod config;
pub mod error;
pub mod export;
pub mod hardware;
pub mod logger;
pub mod stats;
pub mod sweep;
pub mod types;
pub mod utils;
pub mod validator;

pub use acquisition::{AcquisitionSession, CaptureOutcome};
pub use config::{AppConfig, load_config, load_config_or_default};
pub use error::SweepError;
pub use hardware::{
    AcquisitionGuard, AcquisitionPort, ConnectionInfo, PositionPort, SimulatedScope,
    SimulatedStage, StageSession,
};
pub use logger::Logger;
pub use stats::StatsReducer;
pub use sweep::{
    RecordWindow, StepLogEntry, StepStatus, StepSummary, SweepController, SweepReport, SweepState,
    SweepTiming, Termination,
};
pub use types::{
    RawRecord, RecordBatch, RecordFlags, StatSample, StepStrategy, SweepConfig, SweepResult,
    ValidationReport,
};
pub use validator::{BatchValidation, RecordValidator};
