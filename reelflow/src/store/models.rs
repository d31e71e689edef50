//! Persisted records: runs, stage log entries, scopes and artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::stages::StageId;

/// Identifier of a top-level scope (a project).
pub type ScopeId = u64;

/// Identifier of an artifact row.
pub type ArtifactId = u64;

/// Identifier of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a new time-ordered run id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The kind of a generated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A character sheet with a reference image.
    Character,
    /// A storyboard shot with a first-frame image and a video clip.
    Shot,
}

impl ArtifactKind {
    /// All artifact kinds, in dependency order.
    pub const ALL: [Self; 2] = [Self::Character, Self::Shot];

    /// Returns the plural label used in notifications.
    #[must_use]
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Character => "characters",
            Self::Shot => "shots",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Character => write!(f, "character"),
            Self::Shot => write!(f, "shot"),
        }
    }
}

/// A generated asset slot on an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetSlot {
    /// A still image.
    Image,
    /// A video clip.
    Video,
}

impl fmt::Display for AssetSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// The mutual-exclusion unit of a run: a whole scope or one artifact in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    /// The owning scope.
    pub scope_id: ScopeId,
    /// The sub-resource kind, when the run is pinned to one artifact.
    pub resource_type: Option<ArtifactKind>,
    /// The sub-resource id, when the run is pinned to one artifact.
    pub resource_id: Option<ArtifactId>,
}

impl ScopeKey {
    /// A key covering the whole scope.
    #[must_use]
    pub fn scope(scope_id: ScopeId) -> Self {
        Self {
            scope_id,
            resource_type: None,
            resource_id: None,
        }
    }

    /// A key pinned to a single artifact.
    #[must_use]
    pub fn resource(scope_id: ScopeId, kind: ArtifactKind, id: ArtifactId) -> Self {
        Self {
            scope_id,
            resource_type: Some(kind),
            resource_id: Some(id),
        }
    }

    /// Returns the pinned artifact, if any.
    #[must_use]
    pub fn pinned(&self) -> Option<(ArtifactKind, ArtifactId)> {
        self.resource_type.zip(self.resource_id)
    }

    /// Returns true if both keys may touch the same artifacts.
    ///
    /// A scope-wide key overlaps every key of the same scope; two pinned keys
    /// overlap only when they name the same artifact.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.scope_id != other.scope_id {
            return false;
        }
        match (self.pinned(), other.pinned()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pinned() {
            Some((kind, id)) => write!(f, "scope {} {} #{}", self.scope_id, kind, id),
            None => write!(f, "scope {}", self.scope_id),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Admitted, not yet picked up.
    #[default]
    Queued,
    /// A stage is executing or a checkpoint is pending.
    Running,
    /// All planned stages completed.
    Succeeded,
    /// An error ended the run.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Returns true while the run still owns its scope.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Returns true once the status can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a re-plan treats existing downstream artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Wipe the whole downstream category.
    #[default]
    Full,
    /// Keep an explicit preserve-set, replace the rest.
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("unknown run mode '{other}'")),
        }
    }
}

/// A persisted pipeline execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Run id.
    pub id: RunId,
    /// Owning scope.
    pub scope_id: ScopeId,
    /// Pinned sub-resource kind.
    pub resource_type: Option<ArtifactKind>,
    /// Pinned sub-resource id.
    pub resource_id: Option<ArtifactId>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// The stage currently executing.
    pub current_stage: Option<StageId>,
    /// Fraction of the current plan completed, in `[0, 1]`.
    pub progress: f64,
    /// The invalidation mode of the latest (re-)plan.
    pub mode: RunMode,
    /// Failure text for failed or swept runs.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Creates a queued run for `key`.
    #[must_use]
    pub fn queued(key: &ScopeKey) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            scope_id: key.scope_id,
            resource_type: key.resource_type,
            resource_id: key.resource_id,
            status: RunStatus::Queued,
            current_stage: None,
            progress: 0.0,
            mode: RunMode::Full,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the scope key this run owns.
    #[must_use]
    pub fn key(&self) -> ScopeKey {
        ScopeKey {
            scope_id: self.scope_id,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
        }
    }
}

/// Author of a stage log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRole {
    /// Orchestrator bookkeeping.
    System,
    /// Human feedback.
    User,
    /// Stage output narration.
    Assistant,
}

/// An append-only, time-ordered log line attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLogEntry {
    /// Monotonic entry id.
    pub id: u64,
    /// Owning run.
    pub run_id: RunId,
    /// Stage (or `orchestrator` / `user`) that wrote the entry.
    pub stage_name: String,
    /// Author role.
    pub role: LogRole,
    /// Entry text.
    pub content: String,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// Top-level status of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStatus {
    /// Not yet fully produced.
    #[default]
    Draft,
    /// The last planned stage completed.
    Ready,
}

/// A scope record (a project) carrying the aggregate asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Scope id.
    pub id: ScopeId,
    /// Display title.
    pub title: String,
    /// Production status.
    pub status: ScopeStatus,
    /// The aggregate asset (final merged video).
    pub aggregate_asset_url: Option<String>,
}

impl Scope {
    /// Creates a draft scope.
    #[must_use]
    pub fn new(id: ScopeId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            status: ScopeStatus::Draft,
            aggregate_asset_url: None,
        }
    }
}

/// A persisted pipeline output unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact id.
    pub id: ArtifactId,
    /// Owning scope.
    pub scope_id: ScopeId,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Production order within the kind.
    pub ordinal: u32,
    /// Short name (character name, shot title).
    pub label: String,
    /// Generation prompt material.
    pub description: String,
    /// Generated still image.
    pub image_url: Option<String>,
    /// Generated video clip.
    pub video_url: Option<String>,
}

impl Artifact {
    /// Returns the asset stored in `slot`.
    #[must_use]
    pub fn asset(&self, slot: AssetSlot) -> Option<&str> {
        match slot {
            AssetSlot::Image => self.image_url.as_deref(),
            AssetSlot::Video => self.video_url.as_deref(),
        }
    }

    /// Stores `url` in `slot`.
    pub fn set_asset(&mut self, slot: AssetSlot, url: Option<String>) {
        match slot {
            AssetSlot::Image => self.image_url = url,
            AssetSlot::Video => self.video_url = url,
        }
    }

    /// Clears `slot`, returning the previous URL.
    pub fn take_asset(&mut self, slot: AssetSlot) -> Option<String> {
        match slot {
            AssetSlot::Image => self.image_url.take(),
            AssetSlot::Video => self.video_url.take(),
        }
    }

    /// Returns every populated asset URL.
    #[must_use]
    pub fn asset_urls(&self) -> Vec<String> {
        self.image_url
            .iter()
            .chain(self.video_url.iter())
            .cloned()
            .collect()
    }
}

/// Stage output describing an artifact to insert or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    /// Existing artifact to update; `None` inserts a new row.
    #[serde(default)]
    pub id: Option<ArtifactId>,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Production order.
    #[serde(default)]
    pub ordinal: u32,
    /// Short name.
    pub label: String,
    /// Generation prompt material.
    #[serde(default)]
    pub description: String,
}

impl ArtifactDraft {
    /// Creates a draft for a new artifact.
    #[must_use]
    pub fn new(kind: ArtifactKind, ordinal: u32, label: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            ordinal,
            label: label.into(),
            description: String::new(),
        }
    }

    /// Targets an existing artifact.
    #[must_use]
    pub fn for_existing(mut self, id: ArtifactId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_activity() {
        assert!(RunStatus::Queued.is_active());
        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(RunStatus::Queued.to_string(), "queued");
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("incremental".parse::<RunMode>(), Ok(RunMode::Incremental));
        assert_eq!(" full ".parse::<RunMode>(), Ok(RunMode::Full));
        assert!("partial".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_scope_key_overlap() {
        let whole = ScopeKey::scope(1);
        let shot = ScopeKey::resource(1, ArtifactKind::Shot, 10);
        let other_shot = ScopeKey::resource(1, ArtifactKind::Shot, 11);
        let other_scope = ScopeKey::scope(2);

        assert!(whole.overlaps(&shot));
        assert!(shot.overlaps(&whole));
        assert!(shot.overlaps(&shot));
        assert!(!shot.overlaps(&other_shot));
        assert!(!whole.overlaps(&other_scope));
    }

    #[test]
    fn test_scope_key_display() {
        assert_eq!(ScopeKey::scope(3).to_string(), "scope 3");
        assert_eq!(
            ScopeKey::resource(3, ArtifactKind::Character, 9).to_string(),
            "scope 3 character #9"
        );
    }

    #[test]
    fn test_artifact_asset_slots() {
        let mut artifact = Artifact {
            id: 1,
            scope_id: 1,
            kind: ArtifactKind::Shot,
            ordinal: 1,
            label: "opening".into(),
            description: String::new(),
            image_url: Some("/static/a.png".into()),
            video_url: None,
        };
        assert_eq!(artifact.asset(AssetSlot::Image), Some("/static/a.png"));
        artifact.set_asset(AssetSlot::Video, Some("/static/a.mp4".into()));
        assert_eq!(artifact.asset_urls().len(), 2);
        assert_eq!(artifact.take_asset(AssetSlot::Image).as_deref(), Some("/static/a.png"));
        assert!(artifact.asset(AssetSlot::Image).is_none());
    }

    #[test]
    fn test_run_id_roundtrip_string() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
