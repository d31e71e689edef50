//! Producing one asset slot across many artifacts.

use futures::stream::{self, StreamExt};
use std::future::Future;
use tracing::{info, warn};

use super::StageContext;
use crate::errors::{ReelflowError, TransportError};
use crate::store::{Artifact, ArtifactId, AssetSlot};

/// One artifact the batch could not produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// The artifact left without an asset.
    pub artifact_id: ArtifactId,
    /// What went wrong.
    pub error: String,
}

/// Outcome of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Artifacts that received an asset, in ordinal order.
    pub succeeded: Vec<ArtifactId>,
    /// Artifacts whose production failed.
    pub failures: Vec<BatchFailure>,
    /// Artifacts not attempted because the run was cancelled.
    pub skipped: usize,
}

impl BatchReport {
    /// Returns the number of artifacts the batch was given.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len() + self.skipped
    }
}

enum Outcome {
    Stored(ArtifactId),
    Failed(BatchFailure),
    Skipped,
}

/// Produces `slot` for each artifact and stores the result.
///
/// Artifacts start in the order given, at most `ctx.batch_concurrency()` at a
/// time. Every call goes through the run's retrying caller. A failing
/// artifact is recorded and never stops its siblings, so a batch in which
/// everything fails still returns normally.
pub async fn produce_assets<F, Fut>(
    ctx: &StageContext,
    artifacts: Vec<Artifact>,
    slot: AssetSlot,
    produce: F,
) -> BatchReport
where
    F: Fn(Artifact) -> Fut,
    Fut: Future<Output = Result<String, TransportError>>,
{
    let produce = &produce;
    let label = format!("{}:{}", ctx.stage(), slot);
    let label = label.as_str();

    let outcomes: Vec<Outcome> = stream::iter(artifacts)
        .map(|artifact| async move {
            if ctx.is_cancelled() {
                return Outcome::Skipped;
            }
            let id = artifact.id;
            let produced = ctx
                .retry()
                .call(label, || produce(artifact.clone()))
                .await
                .map_err(ReelflowError::from);
            let stored = match produced {
                Ok(url) => ctx.store_asset(id, slot, url).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(_) => Outcome::Stored(id),
                Err(e) => {
                    warn!(
                        run_id = %ctx.run_id(),
                        stage = %ctx.stage(),
                        artifact_id = id,
                        error = %e,
                        "Artifact production failed"
                    );
                    Outcome::Failed(BatchFailure {
                        artifact_id: id,
                        error: e.to_string(),
                    })
                }
            }
        })
        .buffered(ctx.batch_concurrency())
        .collect()
        .await;

    let mut report = BatchReport::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Stored(id) => report.succeeded.push(id),
            Outcome::Failed(failure) => report.failures.push(failure),
            Outcome::Skipped => report.skipped += 1,
        }
    }
    info!(
        run_id = %ctx.run_id(),
        stage = %ctx.stage(),
        %slot,
        succeeded = report.succeeded.len(),
        failed = report.failures.len(),
        skipped = report.skipped,
        "Batch finished"
    );
    report
}
