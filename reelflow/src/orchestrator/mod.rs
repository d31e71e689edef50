//! Run orchestration.
//!
//! [`GenerationService`] admits runs and spawns one task per run;
//! [`Orchestrator`] drives that task through invalidation, the stage plan,
//! checkpoints and feedback re-plans; [`AppContext`] carries the shared
//! collaborators.

mod context;
mod runner;
mod service;
mod state;

pub use context::{AppContext, AppContextBuilder};
pub use runner::{Orchestrator, RunJob, FINALIZED_EXTERNALLY};
pub use service::{GenerationService, StartRequest, CANCELLED_BY_USER};
pub use state::ReplanState;
