//! Persistence: run records, stage logs, scopes, artifacts and asset files.

mod assets;
mod models;
mod repository;

pub use assets::{AssetPurger, LocalAssetStore, NoOpAssetPurger};
pub use models::{
    Artifact, ArtifactDraft, ArtifactId, ArtifactKind, AssetSlot, LogRole, RunId, RunMode,
    RunState, RunStatus, Scope, ScopeId, ScopeKey, ScopeStatus, StageLogEntry,
};
pub use repository::{InMemoryRepository, Repository, SERVICE_RESTARTED};
