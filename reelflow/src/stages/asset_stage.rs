//! Ready-made executors for the asset-producing stages.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{produce_assets, Routing, StageContext, StageExecutor, StageId};
use crate::errors::{ReelflowError, Result, TransportError};
use crate::store::{Artifact, ArtifactId, ArtifactKind, AssetSlot};

/// Everything a generator needs to produce one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    /// The artifact being produced.
    pub artifact_id: ArtifactId,
    /// Its kind.
    pub kind: ArtifactKind,
    /// The slot to fill.
    pub slot: AssetSlot,
    /// Production order.
    pub ordinal: u32,
    /// Short name.
    pub label: String,
    /// Prompt material.
    pub description: String,
    /// The still a video is animated from.
    pub source_url: Option<String>,
}

impl AssetRequest {
    /// Builds the request for `slot` of `artifact`.
    #[must_use]
    pub fn for_artifact(artifact: &Artifact, slot: AssetSlot) -> Self {
        let source_url = match slot {
            AssetSlot::Video => artifact.image_url.clone(),
            AssetSlot::Image => None,
        };
        Self {
            artifact_id: artifact.id,
            kind: artifact.kind,
            slot,
            ordinal: artifact.ordinal,
            label: artifact.label.clone(),
            description: artifact.description.clone(),
            source_url,
        }
    }
}

/// External image/video generation service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetGenerator: Send + Sync {
    /// Produces the asset and returns its URL.
    async fn generate(&self, request: &AssetRequest) -> std::result::Result<String, TransportError>;
}

/// External service concatenating shot clips into the aggregate video.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Composer: Send + Sync {
    /// Merges `clips`, in order, and returns the aggregate URL.
    async fn compose(&self, clips: &[String]) -> std::result::Result<String, TransportError>;
}

/// Fills one asset slot for every pending artifact of a kind.
pub struct AssetStage {
    stage: StageId,
    kind: ArtifactKind,
    slot: AssetSlot,
    generator: Arc<dyn AssetGenerator>,
}

impl AssetStage {
    /// Creates the executor for `stage`, which must produce an asset.
    pub fn new(stage: StageId, generator: Arc<dyn AssetGenerator>) -> Result<Self> {
        let (kind, slot) = stage.produces().ok_or_else(|| {
            ReelflowError::Config(format!("stage '{stage}' does not produce artifact assets"))
        })?;
        Ok(Self {
            stage,
            kind,
            slot,
            generator,
        })
    }
}

impl std::fmt::Debug for AssetStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetStage")
            .field("stage", &self.stage)
            .field("kind", &self.kind)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageExecutor for AssetStage {
    fn id(&self) -> StageId {
        self.stage
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<Option<Routing>> {
        let pending = ctx.pending_artifacts(self.kind, self.slot).await?;
        if pending.is_empty() {
            ctx.say(format!("Every {} already has its {}.", self.kind, self.slot))
                .await?;
            return Ok(None);
        }

        let slot = self.slot;
        let generator = &self.generator;
        let report = produce_assets(ctx, pending, slot, |artifact| async move {
            generator
                .generate(&AssetRequest::for_artifact(&artifact, slot))
                .await
        })
        .await;

        let mut summary = format!(
            "Produced {} of {} {} {}s.",
            report.succeeded.len(),
            report.total(),
            self.kind,
            self.slot
        );
        if !report.failures.is_empty() {
            let failed: Vec<String> = report
                .failures
                .iter()
                .map(|f| format!("#{}", f.artifact_id))
                .collect();
            summary.push_str(&format!(" Failed: {}.", failed.join(", ")));
        }
        ctx.say(summary).await?;
        Ok(None)
    }
}

/// Merges every shot video into the scope's aggregate asset.
pub struct MergeStage {
    composer: Arc<dyn Composer>,
}

impl MergeStage {
    /// Creates the merger.
    #[must_use]
    pub fn new(composer: Arc<dyn Composer>) -> Self {
        Self { composer }
    }
}

impl std::fmt::Debug for MergeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl StageExecutor for MergeStage {
    fn id(&self) -> StageId {
        StageId::VideoMerger
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<Option<Routing>> {
        let shots = ctx
            .repo()
            .list_artifacts(ctx.key().scope_id, ArtifactKind::Shot)
            .await?;
        let clips: Vec<String> = shots.iter().filter_map(|s| s.video_url.clone()).collect();
        if clips.is_empty() {
            ctx.say("No shot videos to merge yet.").await?;
            return Ok(None);
        }
        if clips.len() < shots.len() {
            warn!(
                run_id = %ctx.run_id(),
                missing = shots.len() - clips.len(),
                "Merging without every shot video"
            );
        }

        let clips = &clips;
        let url = ctx
            .retry()
            .call("video_merger", || self.composer.compose(clips))
            .await?;
        ctx.store_aggregate(url).await?;
        ctx.say(format!("Merged {} clips into the final video.", clips.len()))
            .await?;
        Ok(None)
    }
}
