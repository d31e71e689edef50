//! Persistence seam for runs, stage logs, scopes and artifacts.
//!
//! The orchestrator only talks to [`Repository`]; [`InMemoryRepository`] is
//! the reference backend used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use super::models::{
    Artifact, ArtifactDraft, ArtifactId, ArtifactKind, LogRole, RunId, RunState, RunStatus, Scope,
    ScopeId, ScopeKey, StageLogEntry,
};
use crate::errors::{AdmissionConflictError, ReelflowError, Result};

/// Error text stored on runs swept at startup.
pub const SERVICE_RESTARTED: &str = "Service restarted";

/// Storage backend for orchestrator state.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Atomically checks for an active run on an overlapping scope and, if
    /// none exists, inserts a new queued run for `key`.
    async fn admit_run(&self, key: &ScopeKey) -> Result<RunState>;

    /// Returns the active run overlapping `key`, if any.
    async fn active_run(&self, key: &ScopeKey) -> Result<Option<RunState>>;

    /// Loads a run.
    async fn get_run(&self, id: RunId) -> Result<RunState>;

    /// Writes a non-terminal update. Returns false, without writing, when the
    /// stored run is already terminal.
    async fn update_run(&self, run: &RunState) -> Result<bool>;

    /// Moves a run to a terminal status exactly once. Returns false when the
    /// run was already terminal.
    async fn finish_run(&self, id: RunId, status: RunStatus, error: Option<String>)
        -> Result<bool>;

    /// Marks every active run cancelled with `error`; returns how many changed.
    async fn sweep_active_runs(&self, error: &str) -> Result<usize>;

    /// Appends a stage log entry.
    async fn append_log(
        &self,
        run_id: RunId,
        stage_name: &str,
        role: LogRole,
        content: &str,
    ) -> Result<StageLogEntry>;

    /// Returns the newest `user` entry of a run.
    async fn latest_user_entry(&self, run_id: RunId) -> Result<Option<StageLogEntry>>;

    /// Returns every entry of a run in append order.
    async fn run_log(&self, run_id: RunId) -> Result<Vec<StageLogEntry>>;

    /// Loads a scope.
    async fn get_scope(&self, id: ScopeId) -> Result<Scope>;

    /// Inserts or replaces a scope.
    async fn save_scope(&self, scope: &Scope) -> Result<()>;

    /// Lists a scope's artifacts of `kind` in ordinal order.
    async fn list_artifacts(&self, scope_id: ScopeId, kind: ArtifactKind) -> Result<Vec<Artifact>>;

    /// Loads one artifact.
    async fn get_artifact(&self, id: ArtifactId) -> Result<Option<Artifact>>;

    /// Inserts a new artifact built from `draft`.
    async fn insert_artifact(&self, scope_id: ScopeId, draft: &ArtifactDraft) -> Result<Artifact>;

    /// Replaces an existing artifact.
    async fn save_artifact(&self, artifact: &Artifact) -> Result<()>;

    /// Deletes artifacts and returns the removed rows.
    async fn delete_artifacts(&self, ids: &[ArtifactId]) -> Result<Vec<Artifact>>;
}

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, RunState>,
    logs: Vec<StageLogEntry>,
    scopes: HashMap<ScopeId, Scope>,
    artifacts: BTreeMap<ArtifactId, Artifact>,
    next_log_id: u64,
    next_artifact_id: ArtifactId,
}

/// In-memory repository.
///
/// A single lock guards all tables, so every trait method is atomic.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a run as-is. Used to seed state left by a previous process.
    pub fn insert_run(&self, run: RunState) {
        self.tables.lock().runs.insert(run.id, run);
    }

    /// Returns the number of active runs overlapping `key`.
    #[must_use]
    pub fn active_count(&self, key: &ScopeKey) -> usize {
        self.tables
            .lock()
            .runs
            .values()
            .filter(|r| r.status.is_active() && r.key().overlaps(key))
            .count()
    }

    /// Returns the number of stored artifacts across all scopes.
    #[must_use]
    pub fn artifact_count(&self) -> usize {
        self.tables.lock().artifacts.len()
    }
}

fn find_active<'a>(tables: &'a Tables, key: &ScopeKey) -> Option<&'a RunState> {
    tables
        .runs
        .values()
        .filter(|r| r.status.is_active() && r.key().overlaps(key))
        .min_by_key(|r| r.created_at)
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn admit_run(&self, key: &ScopeKey) -> Result<RunState> {
        let mut tables = self.tables.lock();
        if !tables.scopes.contains_key(&key.scope_id) {
            return Err(ReelflowError::NotFound(format!("scope {}", key.scope_id)));
        }
        if let Some(active) = find_active(&tables, key) {
            return Err(AdmissionConflictError::new(*key, active.id).into());
        }
        let run = RunState::queued(key);
        tables.runs.insert(run.id, run.clone());
        debug!(run_id = %run.id, scope = %key, "Run admitted");
        Ok(run)
    }

    async fn active_run(&self, key: &ScopeKey) -> Result<Option<RunState>> {
        let tables = self.tables.lock();
        Ok(find_active(&tables, key).cloned())
    }

    async fn get_run(&self, id: RunId) -> Result<RunState> {
        self.tables
            .lock()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| ReelflowError::NotFound(format!("run {id}")))
    }

    async fn update_run(&self, run: &RunState) -> Result<bool> {
        let mut tables = self.tables.lock();
        let stored = tables
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| ReelflowError::NotFound(format!("run {}", run.id)))?;
        if stored.status.is_terminal() {
            return Ok(false);
        }
        *stored = run.clone();
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn finish_run(
        &self,
        id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        let stored = tables
            .runs
            .get_mut(&id)
            .ok_or_else(|| ReelflowError::NotFound(format!("run {id}")))?;
        if stored.status.is_terminal() {
            return Ok(false);
        }
        stored.status = status;
        if status == RunStatus::Succeeded {
            stored.current_stage = None;
            stored.progress = 1.0;
        }
        if error.is_some() {
            stored.error = error;
        }
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn sweep_active_runs(&self, error: &str) -> Result<usize> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let mut swept = 0;
        for run in tables.runs.values_mut().filter(|r| r.status.is_active()) {
            run.status = RunStatus::Cancelled;
            run.error = Some(error.to_string());
            run.updated_at = now;
            swept += 1;
        }
        if swept > 0 {
            info!(swept, "Swept runs left active by a previous process");
        }
        Ok(swept)
    }

    async fn append_log(
        &self,
        run_id: RunId,
        stage_name: &str,
        role: LogRole,
        content: &str,
    ) -> Result<StageLogEntry> {
        let mut tables = self.tables.lock();
        tables.next_log_id += 1;
        let entry = StageLogEntry {
            id: tables.next_log_id,
            run_id,
            stage_name: stage_name.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        tables.logs.push(entry.clone());
        Ok(entry)
    }

    async fn latest_user_entry(&self, run_id: RunId) -> Result<Option<StageLogEntry>> {
        Ok(self
            .tables
            .lock()
            .logs
            .iter()
            .rev()
            .find(|e| e.run_id == run_id && e.role == LogRole::User)
            .cloned())
    }

    async fn run_log(&self, run_id: RunId) -> Result<Vec<StageLogEntry>> {
        Ok(self
            .tables
            .lock()
            .logs
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_scope(&self, id: ScopeId) -> Result<Scope> {
        self.tables
            .lock()
            .scopes
            .get(&id)
            .cloned()
            .ok_or_else(|| ReelflowError::NotFound(format!("scope {id}")))
    }

    async fn save_scope(&self, scope: &Scope) -> Result<()> {
        self.tables.lock().scopes.insert(scope.id, scope.clone());
        Ok(())
    }

    async fn list_artifacts(&self, scope_id: ScopeId, kind: ArtifactKind) -> Result<Vec<Artifact>> {
        let mut rows: Vec<Artifact> = self
            .tables
            .lock()
            .artifacts
            .values()
            .filter(|a| a.scope_id == scope_id && a.kind == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.ordinal, a.id));
        Ok(rows)
    }

    async fn get_artifact(&self, id: ArtifactId) -> Result<Option<Artifact>> {
        Ok(self.tables.lock().artifacts.get(&id).cloned())
    }

    async fn insert_artifact(&self, scope_id: ScopeId, draft: &ArtifactDraft) -> Result<Artifact> {
        let mut tables = self.tables.lock();
        tables.next_artifact_id += 1;
        let artifact = Artifact {
            id: tables.next_artifact_id,
            scope_id,
            kind: draft.kind,
            ordinal: draft.ordinal,
            label: draft.label.clone(),
            description: draft.description.clone(),
            image_url: None,
            video_url: None,
        };
        tables.artifacts.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.artifacts.get_mut(&artifact.id) {
            Some(stored) => {
                *stored = artifact.clone();
                Ok(())
            }
            None => Err(ReelflowError::NotFound(format!("artifact {}", artifact.id))),
        }
    }

    async fn delete_artifacts(&self, ids: &[ArtifactId]) -> Result<Vec<Artifact>> {
        let mut tables = self.tables.lock();
        Ok(ids
            .iter()
            .filter_map(|id| tables.artifacts.remove(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo_with_scope(id: ScopeId) -> InMemoryRepository {
        let repo = InMemoryRepository::new();
        repo.save_scope(&Scope::new(id, "demo")).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_admit_rejects_overlapping_active_run() {
        let repo = repo_with_scope(1).await;
        let key = ScopeKey::scope(1);
        let first = repo.admit_run(&key).await.unwrap();

        let err = repo.admit_run(&key).await.unwrap_err();
        match err {
            ReelflowError::AdmissionConflict(conflict) => assert_eq!(conflict.active_run, first.id),
            other => panic!("unexpected error: {other}"),
        }

        let pinned = ScopeKey::resource(1, ArtifactKind::Shot, 4);
        assert!(repo.admit_run(&pinned).await.is_err());
        assert_eq!(repo.active_count(&key), 1);
    }

    #[tokio::test]
    async fn test_admit_allows_disjoint_resources() {
        let repo = repo_with_scope(1).await;
        repo.admit_run(&ScopeKey::resource(1, ArtifactKind::Shot, 1))
            .await
            .unwrap();
        repo.admit_run(&ScopeKey::resource(1, ArtifactKind::Shot, 2))
            .await
            .unwrap();
        assert!(repo.admit_run(&ScopeKey::scope(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_admit_unknown_scope() {
        let repo = InMemoryRepository::new();
        let err = repo.admit_run(&ScopeKey::scope(9)).await.unwrap_err();
        assert!(matches!(err, ReelflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_finish_run_is_exactly_once() {
        let repo = repo_with_scope(1).await;
        let run = repo.admit_run(&ScopeKey::scope(1)).await.unwrap();

        assert!(repo
            .finish_run(run.id, RunStatus::Failed, Some("boom".into()))
            .await
            .unwrap());
        assert!(!repo
            .finish_run(run.id, RunStatus::Cancelled, None)
            .await
            .unwrap());

        let stored = repo.get_run(run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));

        // Terminal runs no longer accept progress updates.
        assert!(!repo.update_run(&run).await.unwrap());
        // And the scope is free again.
        assert!(repo.admit_run(&ScopeKey::scope(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_active_runs() {
        let repo = repo_with_scope(1).await;
        let mut stuck = RunState::queued(&ScopeKey::scope(1));
        stuck.status = RunStatus::Running;
        repo.insert_run(stuck.clone());
        let mut done = RunState::queued(&ScopeKey::scope(1));
        done.status = RunStatus::Succeeded;
        repo.insert_run(done.clone());

        assert_eq!(repo.sweep_active_runs(SERVICE_RESTARTED).await.unwrap(), 1);

        let swept = repo.get_run(stuck.id).await.unwrap();
        assert_eq!(swept.status, RunStatus::Cancelled);
        assert_eq!(swept.error.as_deref(), Some(SERVICE_RESTARTED));
        assert_eq!(repo.get_run(done.id).await.unwrap().status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_latest_user_entry() {
        let repo = InMemoryRepository::new();
        let run = RunId::new();
        repo.append_log(run, "orchestrator", LogRole::System, "started")
            .await
            .unwrap();
        let first = repo.append_log(run, "user", LogRole::User, "more red").await.unwrap();
        let second = repo.append_log(run, "user", LogRole::User, "less red").await.unwrap();
        assert!(second.id > first.id);

        let latest = repo.latest_user_entry(run).await.unwrap().unwrap();
        assert_eq!(latest.content, "less red");
        assert_eq!(repo.run_log(run).await.unwrap().len(), 3);
        assert!(repo.latest_user_entry(RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_artifacts_listed_in_ordinal_order() {
        let repo = repo_with_scope(1).await;
        repo.insert_artifact(1, &ArtifactDraft::new(ArtifactKind::Shot, 2, "b"))
            .await
            .unwrap();
        repo.insert_artifact(1, &ArtifactDraft::new(ArtifactKind::Shot, 1, "a"))
            .await
            .unwrap();
        repo.insert_artifact(1, &ArtifactDraft::new(ArtifactKind::Character, 1, "hero"))
            .await
            .unwrap();

        let shots = repo.list_artifacts(1, ArtifactKind::Shot).await.unwrap();
        let labels: Vec<_> = shots.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "b"]);

        let deleted = repo.delete_artifacts(&[shots[0].id, 999]).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(repo.artifact_count(), 2);
    }
}
