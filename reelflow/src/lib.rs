//! # Reelflow
//!
//! Orchestration core for a multi-stage media generation pipeline.
//!
//! A run walks a fixed, ordered list of stages (onboarding, direction,
//! scriptwriting, character and storyboard images, shot videos, the final
//! merge) over one project scope. Reelflow provides:
//!
//! - **Admission**: at most one active run per scope or per artifact
//! - **Checkpoints**: runs pause after each stage until a human confirms
//! - **Re-planning**: feedback is classified and the run restarts at the
//!   right stage, wiping or preserving downstream artifacts
//! - **Resilient batches**: per-artifact asset calls with retries that never
//!   let one failure block its siblings
//! - **Cancellation**: superseding or cancelling a run always leaves a
//!   terminal record behind
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reelflow::prelude::*;
//!
//! let stages = StageRegistry::builder()
//!     .register(Arc::new(MyOnboarding))
//!     // ... one executor per stage
//!     .build()?;
//! let app = AppContext::builder(stages)
//!     .with_config(ReelflowConfig::from_env()?)
//!     .build()?;
//! let service = GenerationService::new(app);
//! service.recover_on_startup().await?;
//!
//! let run = service.start_run(StartRequest::new(ScopeKey::scope(42))).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod repair;
pub mod stages;
pub mod store;
pub mod testing;
pub mod transport;


/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{CheckpointChannel, InMemorySignalStore, SignalStore};
    pub use crate::config::ReelflowConfig;
    pub use crate::errors::{
        AdmissionConflictError, ReelflowError, RepairError, Result, TransportError,
        UnknownStageError,
    };
    pub use crate::events::{
        BroadcastEventSink, EventNotifier, EventSink, LoggingEventSink, NoOpEventSink, RunEvent,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{AppContext, GenerationService, StartRequest};
    pub use crate::planner::{Invalidation, InvalidationPlanner};
    pub use crate::registry::ScopeTaskRegistry;
    pub use crate::stages::{
        AssetGenerator, AssetStage, Composer, MergeStage, ReviewStage, Routing, StageContext,
        StageExecutor, StageId, StageRegistry, TextModel,
    };
    pub use crate::store::{
        ArtifactDraft, ArtifactKind, InMemoryRepository, LocalAssetStore, Repository, RunStatus,
        ScopeKey,
    };
    pub use crate::transport::{RetryConfig, RetryingCaller};
}
