pub mod interface;
pub mod session;
pub mod sim;

pub use interface::{AcquisitionPort, ConnectionInfo, PositionPort};
pub use session::{AcquisitionGuard, StageSession};
pub use sim::{ScopeLog, SimulatedScope, SimulatedStage, StageLog};
