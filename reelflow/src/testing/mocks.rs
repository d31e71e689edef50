//! Scripted collaborators for driving runs without external services.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::TransportError;
use crate::stages::{AssetGenerator, AssetRequest, Routing, StageContext, StageExecutor, StageId, TargetIds};
use crate::store::{ArtifactDraft, ArtifactId, AssetSlot, RunMode};

/// What a [`ScriptedStage`] saw on one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCall {
    /// The invalidation mode of the plan.
    pub mode: RunMode,
    /// Feedback handed to the stage.
    pub feedback: Option<String>,
    /// The targeted artifacts.
    pub target_ids: TargetIds,
}

/// A stage executor that plays back a fixed script and records its calls.
///
/// Structural stages publish their drafts, asset stages fill every pending
/// slot with a URL under `/static/`, the merger stores an aggregate, and the
/// review stage pops queued routings.
#[derive(Debug)]
pub struct ScriptedStage {
    id: StageId,
    drafts: Vec<ArtifactDraft>,
    routings: Mutex<VecDeque<Routing>>,
    failure: Option<String>,
    delay: Option<Duration>,
    aggregate_url: Option<String>,
    calls: Mutex<Vec<StageCall>>,
}

impl ScriptedStage {
    /// Creates a stage that succeeds without output.
    #[must_use]
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            drafts: Vec::new(),
            routings: Mutex::new(VecDeque::new()),
            failure: None,
            delay: None,
            aggregate_url: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Publishes `drafts` on every call.
    #[must_use]
    pub fn with_drafts(mut self, drafts: Vec<ArtifactDraft>) -> Self {
        self.drafts = drafts;
        self
    }

    /// Queues a routing to return; calls past the queue return `None`.
    #[must_use]
    pub fn with_routing(self, routing: Routing) -> Self {
        self.routings.lock().push_back(routing);
        self
    }

    /// Fails every call with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Sleeps before doing anything.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the aggregate URL stored by the merger.
    #[must_use]
    pub fn with_aggregate_url(mut self, url: impl Into<String>) -> Self {
        self.aggregate_url = Some(url.into());
        self
    }

    /// Returns how many times the stage ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StageExecutor for ScriptedStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<Option<Routing>> {
        self.calls.lock().push(StageCall {
            mode: ctx.mode(),
            feedback: ctx.feedback().map(str::to_string),
            target_ids: ctx.target_ids().clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }

        if !self.drafts.is_empty() {
            ctx.publish_artifacts(&self.drafts).await?;
        }
        if let Some((kind, slot)) = self.id.produces() {
            let extension = match slot {
                AssetSlot::Image => "png",
                AssetSlot::Video => "mp4",
            };
            for artifact in ctx.pending_artifacts(kind, slot).await? {
                let url = format!("/static/{kind}-{}-{slot}.{extension}", artifact.id);
                ctx.store_asset(artifact.id, slot, url).await?;
            }
        }
        if self.id == StageId::VideoMerger {
            let url = self
                .aggregate_url
                .clone()
                .unwrap_or_else(|| format!("/static/final-{}.mp4", ctx.key().scope_id));
            ctx.store_aggregate(url).await?;
        }

        Ok(self.routings.lock().pop_front())
    }
}

/// A generator whose selected artifacts fail with a retryable status.
#[derive(Debug, Default)]
pub struct FlakyGenerator {
    /// Remaining failures per artifact; `usize::MAX` never recovers.
    failures: Mutex<HashMap<ArtifactId, usize>>,
    calls: AtomicUsize,
}

impl FlakyGenerator {
    /// Creates a generator that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails `id` the next `times` calls.
    #[must_use]
    pub fn failing_for(self, id: ArtifactId, times: usize) -> Self {
        self.failures.lock().insert(id, times);
        self
    }

    /// Fails `id` on every call.
    #[must_use]
    pub fn always_failing(self, id: ArtifactId) -> Self {
        self.failing_for(id, usize::MAX)
    }

    /// Returns the total number of generate calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetGenerator for FlakyGenerator {
    async fn generate(&self, request: &AssetRequest) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&request.artifact_id) {
                if *remaining > 0 {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    return Err(TransportError::status(503, "generator overloaded"));
                }
            }
        }
        Ok(format!(
            "/static/{}-{}-{}.bin",
            request.kind, request.artifact_id, request.slot
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Artifact, ArtifactKind};

    fn request(id: ArtifactId) -> AssetRequest {
        let artifact = Artifact {
            id,
            scope_id: 1,
            kind: ArtifactKind::Shot,
            ordinal: 1,
            label: "shot".into(),
            description: String::new(),
            image_url: None,
            video_url: None,
        };
        AssetRequest::for_artifact(&artifact, AssetSlot::Image)
    }

    #[tokio::test]
    async fn test_flaky_generator_recovers() {
        let generator = FlakyGenerator::new().failing_for(2, 1);

        assert!(generator.generate(&request(2)).await.is_err());
        assert!(generator.generate(&request(2)).await.is_ok());
        assert!(generator.generate(&request(1)).await.is_ok());
        assert_eq!(generator.call_count(), 3);
    }

    #[tokio::test]
    async fn test_always_failing_never_recovers() {
        let generator = FlakyGenerator::new().always_failing(7);
        for _ in 0..5 {
            let err = generator.generate(&request(7)).await.unwrap_err();
            assert_eq!(err, TransportError::status(503, "generator overloaded"));
        }
    }
}
