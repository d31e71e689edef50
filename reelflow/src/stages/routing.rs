//! Feedback routing: where a re-plan restarts and what it may keep.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

use super::StageId;
use crate::errors::RepairError;
use crate::repair::extract_json_object;
use crate::store::{Artifact, ArtifactId, ArtifactKind, RunMode};

/// Artifacts a re-plan should regenerate. Empty sets mean "all".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetIds {
    /// Targeted characters.
    #[serde(default)]
    pub character_ids: BTreeSet<ArtifactId>,
    /// Targeted shots.
    #[serde(default)]
    pub shot_ids: BTreeSet<ArtifactId>,
}

impl TargetIds {
    /// Returns the targeted ids of `kind`.
    #[must_use]
    pub fn ids(&self, kind: ArtifactKind) -> &BTreeSet<ArtifactId> {
        match kind {
            ArtifactKind::Character => &self.character_ids,
            ArtifactKind::Shot => &self.shot_ids,
        }
    }

    /// Returns true if no artifact is targeted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.character_ids.is_empty() && self.shot_ids.is_empty()
    }

    /// Returns true if `artifact` passes the filter for its kind.
    #[must_use]
    pub fn admits(&self, artifact: &Artifact) -> bool {
        let ids = self.ids(artifact.kind);
        ids.is_empty() || ids.contains(&artifact.id)
    }

    /// Targets a single artifact.
    #[must_use]
    pub fn single(kind: ArtifactKind, id: ArtifactId) -> Self {
        let mut targets = Self::default();
        match kind {
            ArtifactKind::Character => targets.character_ids.insert(id),
            ArtifactKind::Shot => targets.shot_ids.insert(id),
        };
        targets
    }
}

/// Artifacts an incremental re-plan must leave untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreserveSet {
    /// Preserved characters.
    #[serde(default)]
    pub character_ids: BTreeSet<ArtifactId>,
    /// Preserved shots.
    #[serde(default)]
    pub shot_ids: BTreeSet<ArtifactId>,
}

impl PreserveSet {
    /// Creates an empty preserve set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with(mut self, kind: ArtifactKind, id: ArtifactId) -> Self {
        match kind {
            ArtifactKind::Character => self.character_ids.insert(id),
            ArtifactKind::Shot => self.shot_ids.insert(id),
        };
        self
    }

    /// Returns true if the artifact is preserved.
    #[must_use]
    pub fn contains(&self, kind: ArtifactKind, id: ArtifactId) -> bool {
        match kind {
            ArtifactKind::Character => self.character_ids.contains(&id),
            ArtifactKind::Shot => self.shot_ids.contains(&id),
        }
    }

    /// Returns true if nothing is preserved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.character_ids.is_empty() && self.shot_ids.is_empty()
    }

    /// Preserves every artifact in `existing` that `targets` does not name.
    ///
    /// Kinds without targets are preserved entirely.
    #[must_use]
    pub fn complement_of(targets: &TargetIds, existing: &[Artifact]) -> Self {
        existing
            .iter()
            .filter(|a| !targets.ids(a.kind).contains(&a.id))
            .fold(Self::new(), |set, a| set.with(a.kind, a.id))
    }
}

/// The classifier's decision for one piece of feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    /// Stage the run restarts at.
    pub target_stage: StageId,
    /// Invalidation mode.
    #[serde(default)]
    pub mode: RunMode,
    /// Artifacts to regenerate.
    #[serde(default)]
    pub target_ids: TargetIds,
    /// Explicit preserve set for incremental mode.
    #[serde(default)]
    pub preserve: Option<PreserveSet>,
    /// Human-readable justification.
    #[serde(default)]
    pub reason: String,
    /// The classifier's feedback category (`character`, `shot`, `video`, ...).
    #[serde(default)]
    pub feedback_type: Option<String>,
}

impl Routing {
    /// A full re-plan from `target_stage`.
    #[must_use]
    pub fn full(target_stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            target_stage,
            mode: RunMode::Full,
            target_ids: TargetIds::default(),
            preserve: None,
            reason: reason.into(),
            feedback_type: None,
        }
    }

    /// Switches to incremental mode with an explicit preserve set.
    #[must_use]
    pub fn incremental(mut self, preserve: PreserveSet) -> Self {
        self.mode = RunMode::Incremental;
        self.preserve = Some(preserve);
        self
    }

    /// Sets the targeted artifacts.
    #[must_use]
    pub fn with_targets(mut self, target_ids: TargetIds) -> Self {
        self.target_ids = target_ids;
        self
    }

    /// Maps a feedback category to the stage that regenerates it.
    #[must_use]
    pub fn fallback_stage(feedback_type: Option<&str>, default_stage: StageId) -> StageId {
        match feedback_type {
            Some("character") => StageId::CharacterArtist,
            Some("shot") => StageId::StoryboardArtist,
            Some("video") => StageId::VideoGenerator,
            _ => default_stage,
        }
    }

    /// Parses classifier output, repairing malformed JSON first.
    pub fn from_text(text: &str, default_stage: StageId) -> Result<Self, RepairError> {
        let object = extract_json_object(text)?;
        Ok(Self::from_object(&object, default_stage))
    }

    /// Reads a routing decision from a JSON object.
    ///
    /// Accepts both the nested `{analysis, routing, target_ids}` layout and a
    /// flat one. A missing, unknown or non-restartable target falls back by
    /// feedback type.
    #[must_use]
    pub fn from_object(object: &Map<String, Value>, default_stage: StageId) -> Self {
        let routing = object
            .get("routing")
            .and_then(Value::as_object)
            .unwrap_or(object);
        let analysis = object.get("analysis").and_then(Value::as_object);

        let feedback_type = analysis
            .and_then(|a| non_empty_str(a.get("feedback_type")))
            .or_else(|| non_empty_str(object.get("feedback_type")));

        let requested = non_empty_str(routing.get("target_stage"))
            .or_else(|| non_empty_str(routing.get("start_agent")));
        let parsed = requested
            .as_deref()
            .and_then(|name| name.parse::<StageId>().ok())
            .filter(StageId::is_restart_target);

        let mut reason = non_empty_str(routing.get("reason")).unwrap_or_default();
        let target_stage = parsed.unwrap_or_else(|| {
            debug!(requested = ?requested, "Routing target not allowed, using fallback");
            if reason.is_empty() {
                reason = "No valid routing target was recognised; using the default route".into();
            }
            Self::fallback_stage(feedback_type.as_deref(), default_stage)
        });

        let mode = non_empty_str(routing.get("mode"))
            .and_then(|m| m.parse().ok())
            .unwrap_or_default();

        let target_ids = object
            .get("target_ids")
            .or_else(|| routing.get("target_ids"))
            .and_then(Value::as_object)
            .map(|t| TargetIds {
                character_ids: id_set(t.get("character_ids").or_else(|| t.get("characters"))),
                shot_ids: id_set(t.get("shot_ids").or_else(|| t.get("shots"))),
            })
            .unwrap_or_default();

        let preserve = object
            .get("preserve_ids")
            .or_else(|| routing.get("preserve_ids"))
            .and_then(Value::as_object)
            .map(|p| PreserveSet {
                character_ids: id_set(p.get("characters").or_else(|| p.get("character_ids"))),
                shot_ids: id_set(p.get("shots").or_else(|| p.get("shot_ids"))),
            });

        Self {
            target_stage,
            mode,
            target_ids,
            preserve,
            reason,
            feedback_type,
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn id_set(value: Option<&Value>) -> BTreeSet<ArtifactId> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)))
                .collect()
        })
        .unwrap_or_default()
}
