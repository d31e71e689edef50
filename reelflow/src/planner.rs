//! Downstream invalidation when a run (re)starts at a stage.
//!
//! Full mode wipes whole categories: structural restarts delete every
//! character and shot, asset restarts clear every asset slot produced at or
//! after the target stage. Incremental mode keeps an explicit preserve set
//! and replaces everything else. The aggregate asset is cleared by every
//! plan that touches shots.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::{ReelflowError, Result, UnknownStageError};
use crate::events::{EventNotifier, RunEvent};
use crate::stages::{PreserveSet, Routing, StageId};
use crate::store::{
    Artifact, ArtifactDraft, ArtifactId, ArtifactKind, AssetPurger, AssetSlot, Repository,
    RunMode, ScopeId, ScopeKey,
};

/// How a plan treats existing downstream artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Wipe the downstream categories.
    Full,
    /// Keep the preserve set, replace the rest.
    Incremental(PreserveSet),
}

impl Invalidation {
    /// Returns the run mode this invalidation corresponds to.
    #[must_use]
    pub fn mode(&self) -> RunMode {
        match self {
            Self::Full => RunMode::Full,
            Self::Incremental(_) => RunMode::Incremental,
        }
    }

    /// Returns the preserve set, in incremental mode.
    #[must_use]
    pub fn preserve(&self) -> Option<&PreserveSet> {
        match self {
            Self::Full => None,
            Self::Incremental(preserve) => Some(preserve),
        }
    }
}

/// What a plan removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
    /// Deleted artifact rows.
    pub deleted: Vec<(ArtifactKind, ArtifactId)>,
    /// Asset slots cleared on surviving rows.
    pub cleared_slots: usize,
    /// Files actually removed from disk.
    pub files_purged: usize,
    /// Whether the aggregate asset was cleared.
    pub aggregate_cleared: bool,
}

impl PlanReport {
    /// Returns true if the plan changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty() && self.cleared_slots == 0 && !self.aggregate_cleared
    }
}

/// What merging a structural stage's output changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Newly inserted artifacts.
    pub inserted: Vec<ArtifactId>,
    /// Preserved artifacts the output rewrote.
    pub updated: Vec<ArtifactId>,
    /// Drafts naming ids that are not preserved in this scope.
    pub ignored: Vec<ArtifactId>,
}

/// Computes and applies purge/preserve decisions.
#[derive(Clone)]
pub struct InvalidationPlanner {
    repo: Arc<dyn Repository>,
    purger: Arc<dyn AssetPurger>,
    events: EventNotifier,
}

impl InvalidationPlanner {
    /// Creates a planner.
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>, purger: Arc<dyn AssetPurger>, events: EventNotifier) -> Self {
        Self {
            repo,
            purger,
            events,
        }
    }

    /// Turns a routing decision into an invalidation.
    ///
    /// Incremental routing without a preserve set keeps everything it does
    /// not target; with neither preserve ids nor targets it becomes full.
    pub async fn resolve(&self, scope_id: ScopeId, routing: &Routing) -> Result<Invalidation> {
        if routing.mode == RunMode::Full {
            return Ok(Invalidation::Full);
        }
        if let Some(preserve) = routing.preserve.as_ref().filter(|p| !p.is_empty()) {
            return Ok(Invalidation::Incremental(preserve.clone()));
        }
        if routing.target_ids.is_empty() {
            info!(
                scope_id,
                target_stage = %routing.target_stage,
                "Incremental routing named nothing to keep or redo, falling back to full"
            );
            return Ok(Invalidation::Full);
        }
        let existing = self.all_artifacts(scope_id).await?;
        Ok(Invalidation::Incremental(PreserveSet::complement_of(
            &routing.target_ids,
            &existing,
        )))
    }

    /// Invalidates everything downstream of `target` for `key`.
    pub async fn plan(
        &self,
        key: &ScopeKey,
        target: StageId,
        invalidation: &Invalidation,
    ) -> Result<PlanReport> {
        if !target.is_sequenced() {
            return Err(UnknownStageError::new(target.as_str())
                .with_detail("not a re-plan target")
                .into());
        }
        if let Some((kind, id)) = key.pinned() {
            return self.plan_resource(key.scope_id, kind, id, target).await;
        }

        let report = match (invalidation, target.is_structural()) {
            (Invalidation::Full, true) => self.wipe_structure(key.scope_id, target).await?,
            (Invalidation::Full, false) => {
                self.clear_slots(key.scope_id, target, None).await?
            }
            (Invalidation::Incremental(preserve), true) => {
                self.replace_unpreserved(key.scope_id, preserve).await?
            }
            (Invalidation::Incremental(preserve), false) => {
                self.clear_slots(key.scope_id, target, Some(preserve)).await?
            }
        };
        info!(
            scope = %key,
            target_stage = %target,
            mode = %invalidation.mode(),
            deleted = report.deleted.len(),
            cleared_slots = report.cleared_slots,
            files_purged = report.files_purged,
            "Invalidated downstream artifacts"
        );
        Ok(report)
    }

    /// Invalidates one artifact's assets for a run pinned to it.
    async fn plan_resource(
        &self,
        scope_id: ScopeId,
        kind: ArtifactKind,
        id: ArtifactId,
        target: StageId,
    ) -> Result<PlanReport> {
        let mut report = PlanReport::default();
        let Some(mut artifact) = self.repo.get_artifact(id).await? else {
            return Err(ReelflowError::NotFound(format!("{kind} {id}")));
        };
        if artifact.scope_id != scope_id || artifact.kind != kind {
            return Err(ReelflowError::NotFound(format!(
                "{kind} {id} in scope {scope_id}"
            )));
        }

        let slots: Vec<AssetSlot> = target
            .invalidated_slots()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, slot)| slot)
            .collect();
        self.clear_artifact_slots(&mut artifact, &slots, &mut report)
            .await?;

        if kind == ArtifactKind::Shot {
            let cleared = self.clear_aggregate(scope_id, &mut report).await?;
            report.aggregate_cleared = cleared;
        }
        Ok(report)
    }

    /// Persists a structural stage's drafts.
    ///
    /// Drafts without an id are inserted. Drafts naming a preserved artifact
    /// rewrite it and purge its now-stale assets. Anything else is ignored.
    pub async fn merge_stage_output(
        &self,
        key: &ScopeKey,
        drafts: &[ArtifactDraft],
        preserve: Option<&PreserveSet>,
    ) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        for draft in drafts {
            let Some(id) = draft.id else {
                let artifact = self.repo.insert_artifact(key.scope_id, draft).await?;
                report.inserted.push(artifact.id);
                self.events
                    .notify(
                        key.scope_id,
                        RunEvent::ArtifactCreated {
                            kind: artifact.kind,
                            id: artifact.id,
                        },
                    )
                    .await;
                continue;
            };

            let preserved = preserve.is_some_and(|p| p.contains(draft.kind, id));
            let existing = if preserved {
                self.repo
                    .get_artifact(id)
                    .await?
                    .filter(|a| a.scope_id == key.scope_id && a.kind == draft.kind)
            } else {
                None
            };
            let Some(mut artifact) = existing else {
                debug!(scope = %key, id, kind = %draft.kind, "Ignoring draft for unknown artifact");
                report.ignored.push(id);
                continue;
            };

            let stale = artifact.asset_urls();
            self.purger.purge_all(&stale).await;
            artifact.image_url = None;
            artifact.video_url = None;
            artifact.ordinal = draft.ordinal;
            artifact.label.clone_from(&draft.label);
            artifact.description.clone_from(&draft.description);
            self.repo.save_artifact(&artifact).await?;
            report.updated.push(id);
            self.events
                .notify(
                    key.scope_id,
                    RunEvent::ArtifactUpdated {
                        kind: artifact.kind,
                        id,
                        slot: None,
                        url: None,
                    },
                )
                .await;
        }
        Ok(report)
    }

    async fn all_artifacts(&self, scope_id: ScopeId) -> Result<Vec<Artifact>> {
        let mut all = Vec::new();
        for kind in ArtifactKind::ALL {
            all.extend(self.repo.list_artifacts(scope_id, kind).await?);
        }
        Ok(all)
    }

    async fn wipe_structure(&self, scope_id: ScopeId, target: StageId) -> Result<PlanReport> {
        let mut report = PlanReport::default();
        // Shots reference characters, so they go first.
        for kind in [ArtifactKind::Shot, ArtifactKind::Character] {
            let ids: Vec<ArtifactId> = self
                .repo
                .list_artifacts(scope_id, kind)
                .await?
                .iter()
                .map(|a| a.id)
                .collect();
            self.delete(&ids, &mut report).await?;
        }
        let cleared = self.clear_aggregate(scope_id, &mut report).await?;
        report.aggregate_cleared = cleared;

        self.events
            .notify(
                scope_id,
                RunEvent::DataCleared {
                    cleared_types: vec![
                        ArtifactKind::Character.plural().to_string(),
                        ArtifactKind::Shot.plural().to_string(),
                    ],
                    start_stage: target,
                    mode: RunMode::Full,
                },
            )
            .await;
        Ok(report)
    }

    async fn replace_unpreserved(
        &self,
        scope_id: ScopeId,
        preserve: &PreserveSet,
    ) -> Result<PlanReport> {
        let mut report = PlanReport::default();
        for kind in [ArtifactKind::Shot, ArtifactKind::Character] {
            let doomed: Vec<ArtifactId> = self
                .repo
                .list_artifacts(scope_id, kind)
                .await?
                .iter()
                .filter(|a| !preserve.contains(kind, a.id))
                .map(|a| a.id)
                .collect();
            let deleted = self.delete(&doomed, &mut report).await?;
            for artifact in deleted {
                self.events
                    .notify(
                        scope_id,
                        RunEvent::ArtifactDeleted {
                            kind: artifact.kind,
                            id: artifact.id,
                        },
                    )
                    .await;
            }
        }
        let cleared = self.clear_aggregate(scope_id, &mut report).await?;
        report.aggregate_cleared = cleared;
        Ok(report)
    }

    async fn clear_slots(
        &self,
        scope_id: ScopeId,
        target: StageId,
        preserve: Option<&PreserveSet>,
    ) -> Result<PlanReport> {
        let mut report = PlanReport::default();
        let slots = target.invalidated_slots();
        let kinds: BTreeSet<ArtifactKind> = slots.iter().map(|(kind, _)| *kind).collect();

        for kind in kinds {
            let kind_slots: Vec<AssetSlot> = slots
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, slot)| *slot)
                .collect();
            for mut artifact in self.repo.list_artifacts(scope_id, kind).await? {
                if preserve.is_some_and(|p| p.contains(kind, artifact.id)) {
                    continue;
                }
                self.clear_artifact_slots(&mut artifact, &kind_slots, &mut report)
                    .await?;
            }
        }
        let cleared = self.clear_aggregate(scope_id, &mut report).await?;
        report.aggregate_cleared = cleared;
        Ok(report)
    }

    /// Empties `slots` on one artifact and purges the files.
    async fn clear_artifact_slots(
        &self,
        artifact: &mut Artifact,
        slots: &[AssetSlot],
        report: &mut PlanReport,
    ) -> Result<()> {
        let mut cleared = 0;
        for &slot in slots {
            let Some(url) = artifact.take_asset(slot) else {
                continue;
            };
            if self.purger.purge(&url).await {
                report.files_purged += 1;
            }
            cleared += 1;
        }
        if cleared > 0 {
            self.repo.save_artifact(artifact).await?;
            self.events
                .notify(
                    artifact.scope_id,
                    RunEvent::ArtifactUpdated {
                        kind: artifact.kind,
                        id: artifact.id,
                        slot: None,
                        url: None,
                    },
                )
                .await;
        }
        report.cleared_slots += cleared;
        Ok(())
    }

    async fn clear_aggregate(&self, scope_id: ScopeId, report: &mut PlanReport) -> Result<bool> {
        let mut scope = self.repo.get_scope(scope_id).await?;
        let Some(url) = scope.aggregate_asset_url.take() else {
            return Ok(false);
        };
        if self.purger.purge(&url).await {
            report.files_purged += 1;
        }
        self.repo.save_scope(&scope).await?;
        self.events
            .notify(
                scope_id,
                RunEvent::ScopeUpdated {
                    scope_id,
                    status: scope.status,
                    aggregate_asset_url: None,
                },
            )
            .await;
        Ok(true)
    }

    async fn delete(&self, ids: &[ArtifactId], report: &mut PlanReport) -> Result<Vec<Artifact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let deleted = self.repo.delete_artifacts(ids).await?;
        for artifact in &deleted {
            report.files_purged += self.purger.purge_all(&artifact.asset_urls()).await;
            report.deleted.push((artifact.kind, artifact.id));
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for InvalidationPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationPlanner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::stages::TargetIds;
    use crate::store::{InMemoryRepository, LocalAssetStore, Scope};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        events: Arc<CollectingEventSink>,
        planner: InvalidationPlanner,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let repo = Arc::new(InMemoryRepository::new());
            let events = Arc::new(CollectingEventSink::new());
            let planner = InvalidationPlanner::new(
                repo.clone(),
                Arc::new(LocalAssetStore::new(dir.path(), "/static/")),
                EventNotifier::new(events.clone(), Duration::from_secs(1)),
            );
            Self {
                repo,
                events,
                planner,
                dir,
            }
        }

        /// Writes a file under the static root and returns its URL.
        fn asset(&self, name: &str) -> String {
            std::fs::write(self.dir.path().join(name), b"x").unwrap();
            format!("/static/{name}")
        }

        fn exists(&self, url: &str) -> bool {
            self.dir
                .path()
                .join(url.trim_start_matches("/static/"))
                .exists()
        }

        async fn seed(&self) -> (Vec<Artifact>, Vec<Artifact>) {
            let mut scope = Scope::new(1, "pilot");
            scope.aggregate_asset_url = Some(self.asset("final.mp4"));
            self.repo.save_scope(&scope).await.unwrap();

            let mut characters = Vec::new();
            for i in 1..=2u32 {
                let mut c = self
                    .repo
                    .insert_artifact(1, &ArtifactDraft::new(ArtifactKind::Character, i, format!("c{i}")))
                    .await
                    .unwrap();
                c.image_url = Some(self.asset(&format!("c{i}.png")));
                self.repo.save_artifact(&c).await.unwrap();
                characters.push(c);
            }
            let mut shots = Vec::new();
            for i in 1..=3u32 {
                let mut s = self
                    .repo
                    .insert_artifact(1, &ArtifactDraft::new(ArtifactKind::Shot, i, format!("s{i}")))
                    .await
                    .unwrap();
                s.image_url = Some(self.asset(&format!("s{i}.png")));
                s.video_url = Some(self.asset(&format!("s{i}.mp4")));
                self.repo.save_artifact(&s).await.unwrap();
                shots.push(s);
            }
            (characters, shots)
        }

        async fn artifacts(&self, kind: ArtifactKind) -> Vec<Artifact> {
            self.repo.list_artifacts(1, kind).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_full_structural_wipes_everything() {
        let fx = Fixture::new();
        fx.seed().await;

        let report = fx
            .planner
            .plan(&ScopeKey::scope(1), StageId::Scriptwriter, &Invalidation::Full)
            .await
            .unwrap();

        assert_eq!(report.deleted.len(), 5);
        assert!(report.aggregate_cleared);
        assert_eq!(report.files_purged, 2 + 6 + 1);
        assert!(fx.artifacts(ArtifactKind::Shot).await.is_empty());
        assert!(fx.artifacts(ArtifactKind::Character).await.is_empty());
        assert!(fx.repo.get_scope(1).await.unwrap().aggregate_asset_url.is_none());
        assert!(!fx.exists("/static/final.mp4"));
        assert_eq!(fx.events.events_of_type("data_cleared").len(), 1);
    }

    #[tokio::test]
    async fn test_full_asset_stage_keeps_rows() {
        let fx = Fixture::new();
        let (characters, _) = fx.seed().await;

        let report = fx
            .planner
            .plan(&ScopeKey::scope(1), StageId::StoryboardArtist, &Invalidation::Full)
            .await
            .unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(report.cleared_slots, 6);
        let shots = fx.artifacts(ArtifactKind::Shot).await;
        assert_eq!(shots.len(), 3);
        assert!(shots.iter().all(|s| s.image_url.is_none() && s.video_url.is_none()));
        assert_eq!(fx.artifacts(ArtifactKind::Character).await, characters);
        assert!(fx.events.events_of_type("data_cleared").is_empty());
    }

    #[tokio::test]
    async fn test_full_video_generator_clears_only_videos() {
        let fx = Fixture::new();
        fx.seed().await;

        fx.planner
            .plan(&ScopeKey::scope(1), StageId::VideoGenerator, &Invalidation::Full)
            .await
            .unwrap();

        let shots = fx.artifacts(ArtifactKind::Shot).await;
        assert!(shots.iter().all(|s| s.image_url.is_some() && s.video_url.is_none()));
    }

    #[tokio::test]
    async fn test_full_video_merger_clears_only_aggregate() {
        let fx = Fixture::new();
        fx.seed().await;

        let report = fx
            .planner
            .plan(&ScopeKey::scope(1), StageId::VideoMerger, &Invalidation::Full)
            .await
            .unwrap();

        assert_eq!(report.cleared_slots, 0);
        assert!(report.aggregate_cleared);
        assert!(fx
            .artifacts(ArtifactKind::Shot)
            .await
            .iter()
            .all(|s| s.video_url.is_some()));
    }

    #[tokio::test]
    async fn test_review_is_not_a_target() {
        let fx = Fixture::new();
        fx.seed().await;
        let err = fx
            .planner
            .plan(&ScopeKey::scope(1), StageId::Review, &Invalidation::Full)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("review"));
        assert_eq!(fx.repo.artifact_count(), 5);
    }

    #[tokio::test]
    async fn test_incremental_structural_keeps_preserve_set_and_is_idempotent() {
        let fx = Fixture::new();
        let (characters, shots) = fx.seed().await;
        let preserve = PreserveSet::new()
            .with(ArtifactKind::Shot, shots[1].id)
            .with(ArtifactKind::Character, characters[0].id);
        let invalidation = Invalidation::Incremental(preserve);

        let report = fx
            .planner
            .plan(&ScopeKey::scope(1), StageId::Scriptwriter, &invalidation)
            .await
            .unwrap();

        assert_eq!(fx.artifacts(ArtifactKind::Shot).await, vec![shots[1].clone()]);
        assert_eq!(fx.artifacts(ArtifactKind::Character).await, vec![characters[0].clone()]);
        assert_eq!(report.deleted.len(), 3);
        assert!(!fx.exists(shots[0].image_url.as_deref().unwrap()));
        assert!(fx.exists(shots[1].image_url.as_deref().unwrap()));
        assert_eq!(fx.events.events_of_type("artifact_deleted").len(), 3);

        let again = fx
            .planner
            .plan(&ScopeKey::scope(1), StageId::Scriptwriter, &invalidation)
            .await
            .unwrap();
        assert!(again.deleted.is_empty());
        assert_eq!(fx.repo.artifact_count(), 2);
    }

    #[tokio::test]
    async fn test_incremental_asset_stage_purges_unpreserved_slots() {
        let fx = Fixture::new();
        let (_, shots) = fx.seed().await;
        let invalidation =
            Invalidation::Incremental(PreserveSet::new().with(ArtifactKind::Shot, shots[0].id));

        fx.planner
            .plan(&ScopeKey::scope(1), StageId::VideoGenerator, &invalidation)
            .await
            .unwrap();

        let after = fx.artifacts(ArtifactKind::Shot).await;
        assert_eq!(after[0], shots[0]);
        assert!(after[1].video_url.is_none() && after[1].image_url.is_some());
        assert!(after[2].video_url.is_none());
    }

    #[tokio::test]
    async fn test_pinned_shot_clears_its_slots_and_aggregate() {
        let fx = Fixture::new();
        let (characters, shots) = fx.seed().await;
        let key = ScopeKey::resource(1, ArtifactKind::Shot, shots[2].id);

        let report = fx
            .planner
            .plan(&key, StageId::StoryboardArtist, &Invalidation::Full)
            .await
            .unwrap();

        assert_eq!(report.cleared_slots, 2);
        assert!(report.aggregate_cleared);
        let after = fx.artifacts(ArtifactKind::Shot).await;
        assert_eq!(after[0], shots[0]);
        assert!(after[2].image_url.is_none() && after[2].video_url.is_none());
        assert_eq!(fx.artifacts(ArtifactKind::Character).await, characters);
    }

    #[tokio::test]
    async fn test_pinned_character_keeps_aggregate() {
        let fx = Fixture::new();
        let (characters, _) = fx.seed().await;
        let key = ScopeKey::resource(1, ArtifactKind::Character, characters[1].id);

        let report = fx
            .planner
            .plan(&key, StageId::CharacterArtist, &Invalidation::Full)
            .await
            .unwrap();

        assert_eq!(report.cleared_slots, 1);
        assert!(!report.aggregate_cleared);
    }

    #[tokio::test]
    async fn test_resolve_downgrades_and_complements() {
        let fx = Fixture::new();
        let (_, shots) = fx.seed().await;

        let bare = Routing {
            mode: RunMode::Incremental,
            ..Routing::full(StageId::StoryboardArtist, "")
        };
        assert_eq!(fx.planner.resolve(1, &bare).await.unwrap(), Invalidation::Full);

        let targeted = bare
            .clone()
            .with_targets(TargetIds::single(ArtifactKind::Shot, shots[0].id));
        let Invalidation::Incremental(preserve) = fx.planner.resolve(1, &targeted).await.unwrap()
        else {
            panic!("expected incremental");
        };
        assert!(!preserve.contains(ArtifactKind::Shot, shots[0].id));
        assert!(preserve.contains(ArtifactKind::Shot, shots[1].id));
        assert_eq!(preserve.character_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_stage_output() {
        let fx = Fixture::new();
        let (_, shots) = fx.seed().await;
        let preserve = PreserveSet::new().with(ArtifactKind::Shot, shots[0].id);

        let drafts = vec![
            ArtifactDraft::new(ArtifactKind::Shot, 4, "new shot"),
            ArtifactDraft::new(ArtifactKind::Shot, 1, "rewritten")
                .for_existing(shots[0].id)
                .with_description("closer framing"),
            ArtifactDraft::new(ArtifactKind::Shot, 2, "stale").for_existing(shots[1].id),
            ArtifactDraft::new(ArtifactKind::Shot, 9, "ghost").for_existing(999),
        ];
        let report = fx
            .planner
            .merge_stage_output(&ScopeKey::scope(1), &drafts, Some(&preserve))
            .await
            .unwrap();

        assert_eq!(report.inserted.len(), 1);
        assert_eq!(report.updated, vec![shots[0].id]);
        assert_eq!(report.ignored, vec![shots[1].id, 999]);

        let rewritten = fx.repo.get_artifact(shots[0].id).await.unwrap().unwrap();
        assert_eq!(rewritten.label, "rewritten");
        assert!(rewritten.image_url.is_none());
        assert!(!fx.exists(shots[0].image_url.as_deref().unwrap()));
        assert_eq!(fx.repo.get_artifact(shots[1].id).await.unwrap().unwrap(), shots[1]);
    }
}
