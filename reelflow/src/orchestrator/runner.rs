//! Drives one run: invalidation, stage sequencing, checkpoints, re-planning
//! and the single terminal write.

use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{AppContext, ReplanState};
use crate::cancellation::CancellationToken;
use crate::errors::{ReelflowError, Result};
use crate::events::RunEvent;
use crate::planner::Invalidation;
use crate::stages::{PreserveSet, Routing, StageContext, StageId, TargetIds};
use crate::store::{
    ArtifactId, ArtifactKind, AssetSlot, LogRole, RunId, RunMode, RunState, RunStatus, ScopeKey, ScopeStatus,
};

/// Error text used when the stored run became terminal under the task.
pub const FINALIZED_EXTERNALLY: &str = "Run finalized externally";

/// Stage-log author of orchestrator bookkeeping.
const ORCHESTRATOR: &str = "orchestrator";

/// What a run task was admitted to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunJob {
    /// The admitted run.
    pub run_id: RunId,
    /// The scope it owns.
    pub key: ScopeKey,
    /// The first stage to execute; `Review` classifies feedback first.
    pub start: StageId,
    /// Skip every checkpoint.
    pub unattended: bool,
    /// Free-form request notes handed to every stage.
    pub notes: Option<String>,
}

/// The invalidation in force for the current plan.
#[derive(Debug, Clone, Default)]
struct Revision {
    mode: RunMode,
    preserve: Option<PreserveSet>,
    target_ids: TargetIds,
}

/// Executes runs against an [`AppContext`].
#[derive(Debug, Clone)]
pub struct Orchestrator {
    app: Arc<AppContext>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(app: Arc<AppContext>) -> Self {
        Self { app }
    }

    /// Runs `job` to a terminal state and returns it.
    ///
    /// Cancelling `token` interrupts the run at its next suspension point;
    /// the terminal state is still persisted.
    pub async fn execute(&self, job: RunJob, token: Arc<CancellationToken>) -> RunStatus {
        let span = info_span!(
            "run",
            run_id = %job.run_id,
            scope_id = job.key.scope_id,
            start_stage = %job.start,
        );
        self.drive(job, token).instrument(span).await
    }

    async fn drive(&self, job: RunJob, token: Arc<CancellationToken>) -> RunStatus {
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(ReelflowError::Cancelled(
                token.reason().unwrap_or_else(|| "Cancelled".to_string()),
            )),
            result = self.sequence(&job, &token) => result,
        };
        let status = self.finalize(&job, outcome).await;

        self.app.awaiting.remove(&job.run_id);
        if let Err(e) = self.app.checkpoints.release(job.run_id).await {
            warn!(error = %e, "Failed to release checkpoint keys");
        }
        status
    }

    async fn sequence(&self, job: &RunJob, token: &Arc<CancellationToken>) -> Result<()> {
        let repo = &self.app.repo;
        let mut run = repo.get_run(job.run_id).await?;
        run.status = RunStatus::Running;
        run.progress = 0.0;
        self.persist(&run).await?;
        self.notify(job, RunEvent::RunStarted {
            run_id: job.run_id,
            scope_id: job.key.scope_id,
        })
        .await;
        info!("Run started");

        let max_replans = self.app.config.orchestrator.max_replans;
        let mut consumed_feedback: Option<u64> = None;
        let (mut state, mut revision) = if job.start == StageId::Review {
            let latest = repo
                .latest_user_entry(job.run_id)
                .await?
                .filter(|entry| !entry.content.trim().is_empty());
            let feedback = match latest {
                Some(entry) => {
                    consumed_feedback = Some(entry.id);
                    Some(entry.content)
                }
                None => job.notes.clone(),
            };
            let routing = self.classify(job, feedback, token).await?;
            let revision = self.invalidate(job, &routing).await?;
            let plan = resolve_plan(routing.target_stage, job.key.pinned());
            (
                ReplanState::new(plan, max_replans).continuing_from(StageId::Review),
                revision,
            )
        } else {
            let start = restart_stage(job.start, job.key.pinned());
            self.app
                .planner
                .plan(&job.key, start, &Invalidation::Full)
                .await?;
            let plan = resolve_plan(start, job.key.pinned());
            (ReplanState::new(plan, max_replans), Revision::default())
        };

        while let Some(stage) = state.current() {
            if let Some(from) = state.handoff_from() {
                self.notify(job, RunEvent::AgentHandoff {
                    from_stage: from,
                    to_stage: stage,
                })
                .await;
            }

            run.status = RunStatus::Running;
            run.current_stage = Some(stage);
            run.progress = state.progress();
            run.mode = revision.mode;
            self.persist(&run).await?;
            self.notify(job, RunEvent::RunProgress {
                run_id: job.run_id,
                current_stage: stage,
                phase: stage.phase(),
                progress: run.progress,
            })
            .await;

            let ctx = self.stage_context(job, stage, &revision, token);
            self.invoke(stage, &ctx).await?;

            if state.is_last() {
                if job.key.pinned().is_none() {
                    self.mark_ready(job).await?;
                }
                state.advance();
                continue;
            }
            if job.unattended {
                state.advance();
                continue;
            }

            self.checkpoint(job, stage).await?;

            let feedback = repo
                .latest_user_entry(job.run_id)
                .await?
                .filter(|entry| Some(entry.id) != consumed_feedback)
                .filter(|entry| !entry.content.trim().is_empty());
            match feedback {
                Some(entry) => {
                    info!(after_stage = %stage, "Confirmation carried feedback, re-planning");
                    consumed_feedback = Some(entry.id);
                    let routing = self.classify(job, Some(entry.content), token).await?;
                    state.replan(resolve_plan(routing.target_stage, job.key.pinned()))?;
                    revision = self.invalidate(job, &routing).await?;
                }
                None => state.advance(),
            }
        }
        Ok(())
    }

    /// Runs the classifier on `feedback` and sanitizes its routing.
    async fn classify(
        &self,
        job: &RunJob,
        feedback: Option<String>,
        token: &Arc<CancellationToken>,
    ) -> Result<Routing> {
        let default_stage = self.app.config.orchestrator.default_feedback_stage;
        if let Some(text) = feedback.as_deref() {
            self.app
                .repo
                .append_log(job.run_id, ORCHESTRATOR, LogRole::System, &format!("Reviewing feedback: {text}"))
                .await?;
        }
        let ctx = self
            .stage_context(job, StageId::Review, &Revision::default(), token)
            .with_feedback(feedback);
        let routing = self
            .invoke(StageId::Review, &ctx)
            .await?
            .unwrap_or_else(|| Routing::full(default_stage, "Classifier returned no routing"));

        let mut target = routing.target_stage;
        if !target.is_restart_target() {
            let fallback = Routing::fallback_stage(routing.feedback_type.as_deref(), default_stage);
            warn!(
                requested = %target,
                fallback = %fallback,
                "Classifier chose a stage that cannot be restarted"
            );
            target = fallback;
        }
        let pinned_target = restart_stage(target, job.key.pinned());
        if pinned_target != target {
            debug!(
                requested = %target,
                restart = %pinned_target,
                "Moved restart onto a stage producing the pinned artifact"
            );
        }
        Ok(Routing {
            target_stage: pinned_target,
            ..routing
        })
    }

    /// Resolves and applies the invalidation a routing asks for.
    async fn invalidate(&self, job: &RunJob, routing: &Routing) -> Result<Revision> {
        let planner = &self.app.planner;
        let invalidation = planner.resolve(job.key.scope_id, routing).await?;
        planner
            .plan(&job.key, routing.target_stage, &invalidation)
            .await?;
        Ok(Revision {
            mode: invalidation.mode(),
            preserve: invalidation.preserve().cloned(),
            target_ids: match invalidation {
                Invalidation::Full => TargetIds::default(),
                Invalidation::Incremental(_) => routing.target_ids.clone(),
            },
        })
    }

    async fn invoke(&self, stage: StageId, ctx: &StageContext) -> Result<Option<Routing>> {
        debug!(stage = %stage, "Invoking stage");
        self.app
            .stages
            .get(stage)
            .run(ctx)
            .await
            .map_err(|e| ReelflowError::stage(stage.as_str(), e))
    }

    /// Parks the run after `stage` until confirmed. A timeout is fatal.
    async fn checkpoint(&self, job: &RunJob, stage: StageId) -> Result<()> {
        let checkpoints = &self.app.checkpoints;
        checkpoints.clear(job.run_id).await?;

        let copy = stage.completion();
        self.app.awaiting.insert(job.run_id, stage);
        self.notify(job, RunEvent::RunAwaitingConfirm {
            run_id: job.run_id,
            stage,
            message: copy.message(),
            completed: copy.completed.to_string(),
            next_step: copy.next_step.to_string(),
            question: copy.question.to_string(),
        })
        .await;
        info!(stage = %stage, "Awaiting confirmation");

        let confirmed = checkpoints
            .await_signal(job.run_id, self.app.config.checkpoint.confirm_timeout())
            .await;
        self.app.awaiting.remove(&job.run_id);
        if !confirmed? {
            return Err(ReelflowError::CheckpointTimeout {
                stage: stage.to_string(),
            });
        }

        self.notify(job, RunEvent::RunConfirmed {
            run_id: job.run_id,
            stage,
        })
        .await;
        Ok(())
    }

    async fn mark_ready(&self, job: &RunJob) -> Result<()> {
        let mut scope = self.app.repo.get_scope(job.key.scope_id).await?;
        scope.status = ScopeStatus::Ready;
        self.app.repo.save_scope(&scope).await?;
        self.notify(job, RunEvent::ScopeUpdated {
            scope_id: scope.id,
            status: scope.status,
            aggregate_asset_url: scope.aggregate_asset_url,
        })
        .await;
        Ok(())
    }

    /// Writes the terminal state exactly once and announces it.
    async fn finalize(&self, job: &RunJob, outcome: Result<()>) -> RunStatus {
        let (status, error, event) = match outcome {
            Ok(()) => {
                info!("Run completed");
                (
                    RunStatus::Succeeded,
                    None,
                    RunEvent::RunCompleted { run_id: job.run_id },
                )
            }
            Err(ReelflowError::Cancelled(reason)) => {
                info!(reason = %reason, "Run cancelled");
                (
                    RunStatus::Cancelled,
                    Some(reason.clone()),
                    RunEvent::RunCancelled {
                        run_id: job.run_id,
                        reason,
                    },
                )
            }
            Err(e) => {
                error!(error = %e, "Run failed");
                let message = e.user_message(self.app.config.orchestrator.error_message_limit);
                if let Err(log_err) = self
                    .app
                    .repo
                    .append_log(job.run_id, ORCHESTRATOR, LogRole::System, &format!("Run failed: {message}"))
                    .await
                {
                    warn!(error = %log_err, "Failed to record failure in the run log");
                }
                (
                    RunStatus::Failed,
                    Some(message.clone()),
                    RunEvent::RunFailed {
                        run_id: job.run_id,
                        error: message,
                    },
                )
            }
        };

        match self.app.repo.finish_run(job.run_id, status, error).await {
            Ok(true) => {
                self.notify(job, event).await;
                status
            }
            Ok(false) => {
                debug!("Run already terminal, keeping stored outcome");
                match self.app.repo.get_run(job.run_id).await {
                    Ok(run) => run.status,
                    Err(_) => status,
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to persist terminal state");
                status
            }
        }
    }

    /// Writes a non-terminal update, treating an already terminal run as
    /// cancelled under us.
    async fn persist(&self, run: &RunState) -> Result<()> {
        if self.app.repo.update_run(run).await? {
            Ok(())
        } else {
            Err(ReelflowError::Cancelled(FINALIZED_EXTERNALLY.to_string()))
        }
    }

    fn stage_context(
        &self,
        job: &RunJob,
        stage: StageId,
        revision: &Revision,
        token: &Arc<CancellationToken>,
    ) -> StageContext {
        let settings = &self.app.config.orchestrator;
        StageContext::new(
            job.run_id,
            job.key,
            stage,
            self.app.repo.clone(),
            self.app.planner.clone(),
            self.app.events.clone(),
        )
        .with_mode(revision.mode)
        .with_preserve(revision.preserve.clone())
        .with_target_ids(revision.target_ids.clone())
        .with_notes(job.notes.clone())
        .with_default_feedback_stage(settings.default_feedback_stage)
        .with_batch_concurrency(settings.batch_concurrency)
        .with_retry(self.app.retry.clone())
        .with_token(token.clone())
    }

    async fn notify(&self, job: &RunJob, event: RunEvent) {
        self.app.events.notify(job.key.scope_id, event).await;
    }
}

/// Returns the stage a run restarting at `target` actually begins with.
///
/// Pinned runs begin at the first stage producing their artifact kind, so
/// invalidation and the plan always agree on which slots are regenerated.
fn restart_stage(target: StageId, pinned: Option<(ArtifactKind, ArtifactId)>) -> StageId {
    match pinned {
        Some((kind, _)) => target
            .plan_from(Some(kind))
            .first()
            .copied()
            .unwrap_or_else(|| StageId::first_producing(kind)),
        None => target,
    }
}

/// Builds the plan from `target`, keeping pinned runs on stages that
/// produce their artifact.
fn resolve_plan(target: StageId, pinned: Option<(ArtifactKind, ArtifactId)>) -> Vec<StageId> {
    let kind = pinned.map(|(kind, _)| kind);
    restart_stage(target, pinned).plan_from(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_plan_unpinned() {
        assert_eq!(
            resolve_plan(StageId::VideoGenerator, None),
            vec![StageId::VideoGenerator, StageId::VideoMerger]
        );
    }

    #[test]
    fn test_resolve_plan_pinned_skips_other_kinds() {
        assert_eq!(
            resolve_plan(StageId::Scriptwriter, Some((ArtifactKind::Character, 4))),
            vec![StageId::CharacterArtist]
        );
        assert_eq!(
            resolve_plan(StageId::StoryboardArtist, Some((ArtifactKind::Shot, 4))),
            vec![StageId::StoryboardArtist, StageId::VideoGenerator]
        );
    }

    #[test]
    fn test_restart_stage_follows_pinned_kind() {
        let character = Some((ArtifactKind::Character, 4));
        let shot = Some((ArtifactKind::Shot, 9));

        assert_eq!(restart_stage(StageId::VideoMerger, character), StageId::CharacterArtist);
        assert_eq!(restart_stage(StageId::StoryboardArtist, character), StageId::CharacterArtist);
        assert_eq!(restart_stage(StageId::Scriptwriter, character), StageId::CharacterArtist);
        assert_eq!(restart_stage(StageId::VideoMerger, shot), StageId::StoryboardArtist);
        assert_eq!(restart_stage(StageId::VideoGenerator, shot), StageId::VideoGenerator);
        assert_eq!(restart_stage(StageId::VideoMerger, None), StageId::VideoMerger);
    }

    #[test]
    fn test_restart_stage_invalidates_the_pinned_slot() {
        for target in [StageId::StoryboardArtist, StageId::VideoGenerator, StageId::VideoMerger] {
            let start = restart_stage(target, Some((ArtifactKind::Character, 1)));
            assert!(start
                .invalidated_slots()
                .contains(&(ArtifactKind::Character, AssetSlot::Image)));
        }
        let start = restart_stage(StageId::VideoMerger, Some((ArtifactKind::Shot, 1)));
        assert!(start
            .invalidated_slots()
            .contains(&(ArtifactKind::Shot, AssetSlot::Image)));
    }

    #[test]
    fn test_resolve_plan_pinned_past_its_stages_restarts_them() {
        assert_eq!(
            resolve_plan(StageId::VideoMerger, Some((ArtifactKind::Character, 4))),
            vec![StageId::CharacterArtist]
        );
    }
}
