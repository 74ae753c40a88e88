use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Motion fault while moving to {target:.4} deg: {reason}")]
    MotionFault { target: f64, reason: String },
    #[error(
        "Stage did not settle at {target:.4} deg (last position {position:.4} deg, tolerance {tolerance:.4} deg)"
    )]
    SettlingTimeout {
        target: f64,
        position: f64,
        tolerance: f64,
    },
    #[error("Acquisition error: {0}")]
    Acquisition(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Record has no samples")]
    EmptyRecord,
    #[error("IO error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Table error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl SweepError {
    /// Errors that end the sweep instead of costing a single step
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SweepError::Connection(_) | SweepError::MotionFault { .. }
        )
    }
}
