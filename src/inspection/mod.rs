//! Point queue, run state and the orchestrated inspection run.

pub mod orchestrator;
pub mod queue;
pub mod state;

pub use orchestrator::{
    InspectionOrchestrator, PointResult, PointStatus, RunHandle, RunOptions, RunOutcome, RunReport,
};
pub use queue::{PointQueue, PointStore};
pub use state::{RunLock, RunState, RunStateCell};
