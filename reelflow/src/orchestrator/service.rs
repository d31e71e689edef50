//! The caller-facing surface: admission, cancellation, feedback and
//! checkpoint confirmation.

use std::sync::Arc;
use tracing::{debug, info};

use super::{AppContext, Orchestrator, RunJob};
use crate::cancellation::CancellationToken;
use crate::errors::{AdmissionConflictError, ReelflowError, Result};
use crate::events::RunEvent;
use crate::registry::{ScopeTask, TaskId};
use crate::stages::StageId;
use crate::store::{
    LogRole, RunId, RunState, RunStatus, ScopeKey, StageLogEntry, SERVICE_RESTARTED,
};

/// Reason recorded when a caller cancels a run.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Stage-log author of human feedback.
const USER: &str = "user";

/// A request to start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// The scope (optionally pinned) the run owns.
    pub key: ScopeKey,
    /// The stage to start at; defaults to the first stage of the plan.
    pub start_stage: Option<String>,
    /// Skip checkpoints; defaults to true only for pinned runs.
    pub unattended: Option<bool>,
    /// Free-form notes handed to every stage.
    pub notes: Option<String>,
}

impl StartRequest {
    /// Creates a request for `key` with every option defaulted.
    #[must_use]
    pub fn new(key: ScopeKey) -> Self {
        Self {
            key,
            start_stage: None,
            unattended: None,
            notes: None,
        }
    }

    /// Sets the starting stage by name.
    #[must_use]
    pub fn with_start_stage(mut self, stage: impl Into<String>) -> Self {
        self.start_stage = Some(stage.into());
        self
    }

    /// Sets whether checkpoints are skipped.
    #[must_use]
    pub fn with_unattended(mut self, unattended: bool) -> Self {
        self.unattended = Some(unattended);
        self
    }

    /// Sets the request notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Starts, steers and stops runs.
#[derive(Debug, Clone)]
pub struct GenerationService {
    app: Arc<AppContext>,
    orchestrator: Orchestrator,
}

impl GenerationService {
    /// Creates a service over `app`.
    #[must_use]
    pub fn new(app: Arc<AppContext>) -> Self {
        let orchestrator = Orchestrator::new(app.clone());
        Self { app, orchestrator }
    }

    /// Returns the application context.
    #[must_use]
    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    /// Admits and spawns a run.
    ///
    /// The start stage is validated before anything is written. Fails with
    /// an admission conflict when an overlapping run is still active.
    pub async fn start_run(&self, request: StartRequest) -> Result<RunState> {
        let key = request.key;
        let pinned = key.pinned();
        let pinned_kind = pinned.map(|(kind, _)| kind);

        let start = match request.start_stage.as_deref() {
            Some(name) => StageId::resolve_start(name, pinned_kind)?,
            None => pinned_kind.map_or(StageId::Onboarding, StageId::first_producing),
        };
        if let Some((kind, id)) = pinned {
            let artifact = self.app.repo.get_artifact(id).await?;
            if !artifact.is_some_and(|a| a.scope_id == key.scope_id && a.kind == kind) {
                return Err(ReelflowError::NotFound(format!(
                    "{kind} {id} in scope {}",
                    key.scope_id
                )));
            }
        }

        let run = self.app.repo.admit_run(&key).await?;
        info!(run_id = %run.id, scope = %key, start_stage = %start, "Run admitted");
        self.spawn(RunJob {
            run_id: run.id,
            key,
            start,
            unattended: request.unattended.unwrap_or(pinned.is_some()),
            notes: request.notes,
        });
        Ok(run)
    }

    /// Attaches feedback to a scope.
    ///
    /// A run parked at a checkpoint for exactly this key is resumed with the
    /// feedback; otherwise a new run starts at the review stage.
    pub async fn submit_feedback(&self, key: ScopeKey, text: &str) -> Result<RunState> {
        if text.trim().is_empty() {
            return Err(ReelflowError::InvalidRequest("feedback is empty".into()));
        }

        if let Some(active) = self.app.repo.active_run(&key).await? {
            if active.key() == key && self.app.awaiting_stage(active.id).is_some() {
                debug!(run_id = %active.id, "Resuming parked run with feedback");
                self.confirm(active.id, Some(text)).await?;
                return Ok(active);
            }
            return Err(AdmissionConflictError::new(key, active.id).into());
        }

        let run = self.app.repo.admit_run(&key).await?;
        self.app
            .repo
            .append_log(run.id, USER, LogRole::User, text)
            .await?;
        info!(run_id = %run.id, scope = %key, "Feedback run admitted");
        self.spawn(RunJob {
            run_id: run.id,
            key,
            start: StageId::Review,
            unattended: key.pinned().is_some(),
            notes: None,
        });
        Ok(run)
    }

    /// Confirms the checkpoint of `run_id`, recording `feedback` first so
    /// the run reads it after waking.
    pub async fn confirm(&self, run_id: RunId, feedback: Option<&str>) -> Result<()> {
        let run = self.app.repo.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(ReelflowError::InvalidRequest(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }
        if let Some(text) = feedback.filter(|t| !t.trim().is_empty()) {
            self.app
                .repo
                .append_log(run_id, USER, LogRole::User, text)
                .await?;
        }
        self.app.checkpoints.signal(run_id).await
    }

    /// Cancels the active run of `key`.
    ///
    /// A whole-scope key also reaches a run pinned to one of the scope's
    /// artifacts; a pinned key only reaches its own run. Returns false when
    /// there is nothing to cancel. A run with no live task in this process is
    /// finalized directly.
    pub async fn cancel(&self, key: &ScopeKey) -> Result<bool> {
        if self.app.tasks.cancel(key, CANCELLED_BY_USER) {
            return Ok(true);
        }
        let Some(run) = self
            .app
            .repo
            .active_run(key)
            .await?
            .filter(|run| run.key() == *key || key.pinned().is_none())
        else {
            return Ok(false);
        };
        let run_key = run.key();
        if run_key != *key && self.app.tasks.cancel(&run_key, CANCELLED_BY_USER) {
            info!(run_id = %run.id, scope = %key, "Cancelled pinned run through its scope");
            return Ok(true);
        }

        let finished = self
            .app
            .repo
            .finish_run(run.id, RunStatus::Cancelled, Some(CANCELLED_BY_USER.to_string()))
            .await?;
        if finished {
            info!(run_id = %run.id, scope = %key, "Cancelled run without a live task");
            self.app
                .events
                .notify(
                    key.scope_id,
                    RunEvent::RunCancelled {
                        run_id: run.id,
                        reason: CANCELLED_BY_USER.to_string(),
                    },
                )
                .await;
            self.app.checkpoints.release(run.id).await?;
        }
        Ok(finished)
    }

    /// Sweeps runs left active by a previous process to `cancelled`.
    pub async fn recover_on_startup(&self) -> Result<usize> {
        self.app.repo.sweep_active_runs(SERVICE_RESTARTED).await
    }

    /// Loads a run.
    pub async fn get_run(&self, run_id: RunId) -> Result<RunState> {
        self.app.repo.get_run(run_id).await
    }

    /// Returns a run's stage log.
    pub async fn run_log(&self, run_id: RunId) -> Result<Vec<StageLogEntry>> {
        self.app.repo.run_log(run_id).await
    }

    /// Returns true if this process has a live task for `key`.
    #[must_use]
    pub fn is_running(&self, key: &ScopeKey) -> bool {
        self.app.tasks.is_running(key)
    }

    fn spawn(&self, job: RunJob) -> TaskId {
        let id = TaskId::next();
        let token = Arc::new(CancellationToken::new());
        let key = job.key;

        let handle = {
            let app = self.app.clone();
            let orchestrator = self.orchestrator.clone();
            let token = token.clone();
            tokio::spawn(async move {
                orchestrator.execute(job, token).await;
                app.tasks.release(&key, id);
            })
        };
        self.app.tasks.register(key, ScopeTask::new(id, token, handle));
        id
    }
}
