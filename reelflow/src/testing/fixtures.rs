//! Seed data and wiring shortcuts.

use std::sync::Arc;
use std::time::Duration;

use super::ScriptedStage;
use crate::errors::{ReelflowError, Result};
use crate::events::EventNotifier;
use crate::planner::InvalidationPlanner;
use crate::stages::{StageContext, StageExecutor, StageId, StageRegistry};
use crate::store::{
    Artifact, ArtifactDraft, ArtifactKind, InMemoryRepository, NoOpAssetPurger, Repository, RunId,
    RunState, Scope, ScopeId, ScopeKey,
};

/// Saves an empty scope titled after its id.
///
/// # Panics
///
/// Panics if the repository rejects the write.
pub async fn seed_scope(repo: &InMemoryRepository, scope_id: ScopeId) -> Scope {
    let scope = Scope::new(scope_id, format!("Project {scope_id}"));
    repo.save_scope(&scope).await.unwrap();
    scope
}

/// Inserts `count` artifacts of `kind` with ordinals `1..=count`.
///
/// # Panics
///
/// Panics if the repository rejects a write.
pub async fn seed_artifacts(
    repo: &InMemoryRepository,
    scope_id: ScopeId,
    kind: ArtifactKind,
    count: u32,
) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    for ordinal in 1..=count {
        let draft = ArtifactDraft::new(kind, ordinal, format!("{kind} {ordinal}"))
            .with_description(format!("{kind} number {ordinal}"));
        artifacts.push(repo.insert_artifact(scope_id, &draft).await.unwrap());
    }
    artifacts
}

/// Builds a stage context over `repo` with no asset purging and no events.
#[must_use]
pub fn stage_context(repo: Arc<dyn Repository>, key: ScopeKey, stage: StageId) -> StageContext {
    let planner = Arc::new(InvalidationPlanner::new(
        repo.clone(),
        Arc::new(NoOpAssetPurger),
        EventNotifier::noop(),
    ));
    StageContext::new(
        RunId::new(),
        key,
        stage,
        repo,
        planner,
        EventNotifier::noop(),
    )
}

/// Builds a registry from `executors`, filling every other stage with a
/// [`ScriptedStage`].
pub fn complete_registry(executors: Vec<Arc<dyn StageExecutor>>) -> Result<StageRegistry> {
    let covered: Vec<StageId> = executors.iter().map(|e| e.id()).collect();
    let mut builder = StageRegistry::builder();
    for executor in executors {
        builder = builder.register(executor);
    }
    for stage in StageId::ALL {
        if !covered.contains(&stage) {
            builder = builder.register(Arc::new(ScriptedStage::new(stage)));
        }
    }
    builder.build()
}

/// Polls until run `run_id` is terminal.
pub async fn wait_for_terminal(
    repo: &dyn Repository,
    run_id: RunId,
    timeout: Duration,
) -> Result<RunState> {
    let poll = async {
        loop {
            let run = repo.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| ReelflowError::Timeout(format!("run {run_id} still active after {timeout:?}")))?
}

/// Polls until `condition` holds for run `run_id`.
pub async fn wait_for_run(
    repo: &dyn Repository,
    run_id: RunId,
    timeout: Duration,
    condition: impl Fn(&RunState) -> bool,
) -> Result<RunState> {
    let poll = async {
        loop {
            let run = repo.get_run(run_id).await?;
            if condition(&run) {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| ReelflowError::Timeout(format!("run {run_id} never reached the expected state")))?
}
