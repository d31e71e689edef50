//! The notification vocabulary of a run.

use serde::{Deserialize, Serialize};

use crate::stages::{Phase, StageId};
use crate::store::{ArtifactId, ArtifactKind, AssetSlot, RunId, RunMode, ScopeId, ScopeStatus};

/// A notification sent to a scope's subscribers.
///
/// Serializes as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run task picked up the run.
    RunStarted {
        /// Run id.
        run_id: RunId,
        /// Owning scope.
        scope_id: ScopeId,
    },
    /// A stage is about to execute.
    RunProgress {
        /// Run id.
        run_id: RunId,
        /// The stage starting.
        current_stage: StageId,
        /// Its UI phase.
        phase: Phase,
        /// Plan progress in `[0, 1]`.
        progress: f64,
    },
    /// Control passes from one stage to the next.
    AgentHandoff {
        /// The stage handing off.
        from_stage: StageId,
        /// The stage taking over.
        to_stage: StageId,
    },
    /// The run paused at a checkpoint.
    RunAwaitingConfirm {
        /// Run id.
        run_id: RunId,
        /// The stage that just finished.
        stage: StageId,
        /// The rendered checkpoint prompt.
        message: String,
        /// What finished.
        completed: String,
        /// What runs next.
        next_step: String,
        /// The confirmation question.
        question: String,
    },
    /// A checkpoint was confirmed.
    RunConfirmed {
        /// Run id.
        run_id: RunId,
        /// The stage whose checkpoint was confirmed.
        stage: StageId,
    },
    /// Every planned stage completed.
    RunCompleted {
        /// Run id.
        run_id: RunId,
    },
    /// The run failed.
    RunFailed {
        /// Run id.
        run_id: RunId,
        /// Truncated failure text.
        error: String,
    },
    /// The run was cancelled.
    RunCancelled {
        /// Run id.
        run_id: RunId,
        /// Why.
        reason: String,
    },
    /// A stage narrated progress.
    StageMessage {
        /// Run id.
        run_id: RunId,
        /// The speaking stage.
        stage: StageId,
        /// The message.
        content: String,
    },
    /// Whole artifact categories were wiped by a full re-plan.
    DataCleared {
        /// Cleared categories (`characters`, `shots`).
        cleared_types: Vec<String>,
        /// The stage the run restarts at.
        start_stage: StageId,
        /// The invalidation mode.
        mode: RunMode,
    },
    /// An artifact row was created.
    ArtifactCreated {
        /// Artifact kind.
        kind: ArtifactKind,
        /// Artifact id.
        id: ArtifactId,
    },
    /// An artifact changed (content or asset slot).
    ArtifactUpdated {
        /// Artifact kind.
        kind: ArtifactKind,
        /// Artifact id.
        id: ArtifactId,
        /// The slot that changed, if any.
        slot: Option<AssetSlot>,
        /// The slot's new value.
        url: Option<String>,
    },
    /// An artifact row was deleted.
    ArtifactDeleted {
        /// Artifact kind.
        kind: ArtifactKind,
        /// Artifact id.
        id: ArtifactId,
    },
    /// The scope record changed.
    ScopeUpdated {
        /// Scope id.
        scope_id: ScopeId,
        /// Production status.
        status: ScopeStatus,
        /// The aggregate asset.
        aggregate_asset_url: Option<String>,
    },
}

impl RunEvent {
    /// Returns the wire name of the event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunProgress { .. } => "run_progress",
            Self::AgentHandoff { .. } => "agent_handoff",
            Self::RunAwaitingConfirm { .. } => "run_awaiting_confirm",
            Self::RunConfirmed { .. } => "run_confirmed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::StageMessage { .. } => "stage_message",
            Self::DataCleared { .. } => "data_cleared",
            Self::ArtifactCreated { .. } => "artifact_created",
            Self::ArtifactUpdated { .. } => "artifact_updated",
            Self::ArtifactDeleted { .. } => "artifact_deleted",
            Self::ScopeUpdated { .. } => "scope_updated",
        }
    }

    /// Returns true for events that end a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let event = RunEvent::DataCleared {
            cleared_types: vec!["characters".into(), "shots".into()],
            start_stage: StageId::Scriptwriter,
            mode: RunMode::Full,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "data_cleared",
                "data": {
                    "cleared_types": ["characters", "shots"],
                    "start_stage": "scriptwriter",
                    "mode": "full"
                }
            })
        );
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let events = [
            RunEvent::RunCompleted { run_id: RunId::new() },
            RunEvent::ArtifactDeleted { kind: ArtifactKind::Shot, id: 3 },
            RunEvent::AgentHandoff {
                from_stage: StageId::Review,
                to_stage: StageId::Scriptwriter,
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], json!(event.event_type()));
        }
    }
}
