//! The stage executor interface and the context handed to each stage.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

use super::{PreserveSet, Routing, StageId, TargetIds};
use crate::cancellation::CancellationToken;
use crate::errors::{ReelflowError, Result};
use crate::events::{EventNotifier, RunEvent};
use crate::planner::{InvalidationPlanner, MergeReport};
use crate::store::{
    Artifact, ArtifactDraft, ArtifactId, ArtifactKind, AssetSlot, LogRole, Repository, RunId,
    RunMode, Scope, ScopeKey,
};
use crate::transport::RetryingCaller;

/// A unit of pipeline work.
///
/// Concrete stages are collaborators supplied by the embedding application.
/// Only the feedback classifier returns a routing decision.
#[async_trait]
pub trait StageExecutor: Send + Sync + Debug {
    /// Returns the stage this executor implements.
    fn id(&self) -> StageId;

    /// Runs the stage.
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<Option<Routing>>;
}

/// Everything a stage may read or write while it runs.
#[derive(Clone)]
pub struct StageContext {
    run_id: RunId,
    key: ScopeKey,
    stage: StageId,
    mode: RunMode,
    feedback: Option<String>,
    notes: Option<String>,
    target_ids: TargetIds,
    preserve: Option<PreserveSet>,
    default_feedback_stage: StageId,
    batch_concurrency: usize,
    repo: Arc<dyn Repository>,
    planner: Arc<InvalidationPlanner>,
    events: EventNotifier,
    retry: RetryingCaller,
    token: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a context for `stage` of run `run_id`.
    #[must_use]
    pub fn new(
        run_id: RunId,
        key: ScopeKey,
        stage: StageId,
        repo: Arc<dyn Repository>,
        planner: Arc<InvalidationPlanner>,
        events: EventNotifier,
    ) -> Self {
        Self {
            run_id,
            key,
            stage,
            mode: RunMode::Full,
            feedback: None,
            notes: None,
            target_ids: TargetIds::default(),
            preserve: None,
            default_feedback_stage: StageId::Scriptwriter,
            batch_concurrency: 4,
            repo,
            planner,
            events,
            retry: RetryingCaller::default(),
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the invalidation mode of the current plan.
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the user feedback being acted on.
    #[must_use]
    pub fn with_feedback(mut self, feedback: Option<String>) -> Self {
        self.feedback = feedback;
        self
    }

    /// Sets the free-form request notes.
    #[must_use]
    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    /// Restricts production to `target_ids`.
    #[must_use]
    pub fn with_target_ids(mut self, target_ids: TargetIds) -> Self {
        self.target_ids = target_ids;
        self
    }

    /// Sets the preserve set of an incremental plan.
    #[must_use]
    pub fn with_preserve(mut self, preserve: Option<PreserveSet>) -> Self {
        self.preserve = preserve;
        self
    }

    /// Sets the stage feedback falls back to.
    #[must_use]
    pub fn with_default_feedback_stage(mut self, stage: StageId) -> Self {
        self.default_feedback_stage = stage;
        self
    }

    /// Sets the number of artifacts produced concurrently.
    #[must_use]
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry discipline for outbound calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryingCaller) -> Self {
        self.retry = retry;
        self
    }

    /// Shares the run's cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Returns the run id.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Returns the scope key the run owns.
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// Returns the stage being run.
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Returns the invalidation mode of the current plan.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Returns the feedback being acted on.
    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref()
    }

    /// Returns the request notes.
    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// Returns the targeted artifacts.
    pub fn target_ids(&self) -> &TargetIds {
        &self.target_ids
    }

    /// Returns the preserve set, in incremental mode.
    pub fn preserve(&self) -> Option<&PreserveSet> {
        self.preserve.as_ref()
    }

    /// Returns the stage feedback falls back to.
    pub fn default_feedback_stage(&self) -> StageId {
        self.default_feedback_stage
    }

    /// Returns the batch concurrency.
    pub fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }

    /// Returns the repository.
    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Returns the retry discipline.
    pub fn retry(&self) -> &RetryingCaller {
        &self.retry
    }

    /// Returns true once the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sends an event for the run's scope.
    pub async fn notify(&self, event: RunEvent) {
        self.events.notify(self.key.scope_id, event).await;
    }

    /// Records stage narration in the run log and forwards it to subscribers.
    pub async fn say(&self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.repo
            .append_log(self.run_id, self.stage.as_str(), LogRole::Assistant, &content)
            .await?;
        self.notify(RunEvent::StageMessage {
            run_id: self.run_id,
            stage: self.stage,
            content,
        })
        .await;
        Ok(())
    }

    /// Returns the scope record.
    pub async fn scope(&self) -> Result<Scope> {
        self.repo.get_scope(self.key.scope_id).await
    }

    /// Returns the artifacts of `kind` still waiting for `slot`, in ordinal order.
    ///
    /// Runs pinned to one artifact only ever see that artifact; otherwise the
    /// target-id filter applies.
    pub async fn pending_artifacts(
        &self,
        kind: ArtifactKind,
        slot: AssetSlot,
    ) -> Result<Vec<Artifact>> {
        let artifacts = self.repo.list_artifacts(self.key.scope_id, kind).await?;
        Ok(artifacts
            .into_iter()
            .filter(|a| a.asset(slot).is_none())
            .filter(|a| match self.key.pinned() {
                Some(pinned) => pinned == (a.kind, a.id),
                None => self.target_ids.admits(a),
            })
            .collect())
    }

    /// Persists structural stage output, honouring the preserve set.
    pub async fn publish_artifacts(&self, drafts: &[ArtifactDraft]) -> Result<MergeReport> {
        self.planner
            .merge_stage_output(&self.key, drafts, self.preserve.as_ref())
            .await
    }

    /// Stores a produced asset on one artifact.
    pub async fn store_asset(&self, id: ArtifactId, slot: AssetSlot, url: String) -> Result<Artifact> {
        let mut artifact = self
            .repo
            .get_artifact(id)
            .await?
            .ok_or_else(|| ReelflowError::NotFound(format!("artifact {id}")))?;
        artifact.set_asset(slot, Some(url.clone()));
        self.repo.save_artifact(&artifact).await?;
        self.notify(RunEvent::ArtifactUpdated {
            kind: artifact.kind,
            id,
            slot: Some(slot),
            url: Some(url),
        })
        .await;
        Ok(artifact)
    }

    /// Stores the scope's aggregate asset.
    pub async fn store_aggregate(&self, url: String) -> Result<Scope> {
        let mut scope = self.scope().await?;
        scope.aggregate_asset_url = Some(url);
        self.repo.save_scope(&scope).await?;
        self.notify(RunEvent::ScopeUpdated {
            scope_id: scope.id,
            status: scope.status,
            aggregate_asset_url: scope.aggregate_asset_url.clone(),
        })
        .await;
        Ok(scope)
    }
}

impl Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("key", &self.key)
            .field("stage", &self.stage)
            .field("mode", &self.mode)
            .field("target_ids", &self.target_ids)
            .field("preserve", &self.preserve)
            .finish_non_exhaustive()
    }
}

/// The executors for every stage, resolved once at startup.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    executors: Vec<Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    /// Starts a registry builder.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::default()
    }

    /// Returns the executor for `stage`.
    #[must_use]
    pub fn get(&self, stage: StageId) -> &Arc<dyn StageExecutor> {
        &self.executors[stage.index()]
    }
}

/// Collects executors and checks every stage is covered exactly once.
#[derive(Debug, Default)]
pub struct StageRegistryBuilder {
    executors: Vec<Arc<dyn StageExecutor>>,
}

impl StageRegistryBuilder {
    /// Adds an executor.
    #[must_use]
    pub fn register(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Builds the registry, ordered by [`StageId::ALL`].
    pub fn build(self) -> Result<StageRegistry> {
        let mut slots: Vec<Option<Arc<dyn StageExecutor>>> = vec![None; StageId::ALL.len()];
        for executor in self.executors {
            let stage = executor.id();
            if slots[stage.index()].replace(executor).is_some() {
                return Err(ReelflowError::Config(format!(
                    "more than one executor registered for stage '{stage}'"
                )));
            }
        }

        let executors = StageId::ALL
            .into_iter()
            .zip(slots)
            .map(|(stage, slot)| {
                slot.ok_or_else(|| {
                    ReelflowError::Config(format!("no executor registered for stage '{stage}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StageRegistry { executors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{complete_registry, ScriptedStage};

    #[test]
    fn test_registry_resolves_every_stage() {
        let registry = complete_registry(Vec::new()).unwrap();
        for stage in StageId::ALL {
            assert_eq!(registry.get(stage).id(), stage);
        }
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = StageRegistry::builder()
            .register(Arc::new(ScriptedStage::new(StageId::Director)))
            .register(Arc::new(ScriptedStage::new(StageId::Director)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one executor"));
    }

    #[test]
    fn test_registry_rejects_missing_stage() {
        let err = StageRegistry::builder()
            .register(Arc::new(ScriptedStage::new(StageId::Director)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no executor registered for stage 'onboarding'"));
    }
}
