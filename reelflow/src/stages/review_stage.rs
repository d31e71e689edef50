//! Ready-made feedback classifier.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{Routing, StageContext, StageExecutor, StageId};
use crate::errors::TransportError;
use crate::store::{Artifact, ArtifactKind};

const SYSTEM_PROMPT: &str = "You route feedback on a short video production. \
Answer with one JSON object: {\"target_stage\": one of scriptwriter, character_artist, \
storyboard_artist, video_generator, video_merger; \"mode\": \"full\" or \"incremental\"; \
\"feedback_type\": character, shot, video or general; \"target_ids\": {\"character_ids\": [ids], \
\"shot_ids\": [ids]}; \"preserve_ids\": {\"characters\": [ids], \"shots\": [ids]}; \"reason\": text}. \
Use incremental only when the feedback names specific characters or shots.";

/// External text model used for classification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Completes `user` under `system` instructions.
    async fn complete(&self, system: &str, user: &str) -> Result<String, TransportError>;
}

/// Classifies feedback into a [`Routing`].
pub struct ReviewStage {
    model: Arc<dyn TextModel>,
}

impl ReviewStage {
    /// Creates the classifier.
    #[must_use]
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }

    async fn feedback(&self, ctx: &StageContext) -> anyhow::Result<Option<String>> {
        if let Some(text) = ctx.feedback().filter(|text| !text.trim().is_empty()) {
            return Ok(Some(text.to_string()));
        }
        let latest = ctx.repo().latest_user_entry(ctx.run_id()).await?;
        Ok(latest
            .map(|entry| entry.content)
            .or_else(|| ctx.notes().map(str::to_string))
            .filter(|text| !text.trim().is_empty()))
    }

    async fn project_state(&self, ctx: &StageContext) -> anyhow::Result<Value> {
        let scope = ctx.scope().await?;
        let mut state = json!({
            "title": scope.title,
            "has_final_video": scope.aggregate_asset_url.is_some(),
        });
        for kind in ArtifactKind::ALL {
            let artifacts = ctx.repo().list_artifacts(scope.id, kind).await?;
            state[kind.plural()] = Value::Array(artifacts.iter().map(describe).collect());
        }
        Ok(state)
    }
}

fn describe(artifact: &Artifact) -> Value {
    json!({
        "id": artifact.id,
        "ordinal": artifact.ordinal,
        "label": artifact.label,
        "has_image": artifact.image_url.is_some(),
        "has_video": artifact.video_url.is_some(),
    })
}

impl std::fmt::Debug for ReviewStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl StageExecutor for ReviewStage {
    fn id(&self) -> StageId {
        StageId::Review
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<Option<Routing>> {
        let default_stage = ctx.default_feedback_stage();
        let Some(feedback) = self.feedback(ctx).await? else {
            return Ok(Some(Routing::full(default_stage, "No feedback provided")));
        };

        let prompt = json!({
            "feedback": feedback,
            "project": self.project_state(ctx).await?,
        })
        .to_string();
        let prompt = prompt.as_str();
        let answer = ctx
            .retry()
            .call("review", || self.model.complete(SYSTEM_PROMPT, prompt))
            .await?;
        debug!(run_id = %ctx.run_id(), answer_len = answer.len(), "Classifier answered");

        let routing = Routing::from_text(&answer, default_stage)?;
        ctx.say(format!(
            "Revising from {} ({} mode): {}",
            routing.target_stage, routing.mode, routing.reason
        ))
        .await?;
        Ok(Some(routing))
    }
}
