//! The fixed, ordered stage list and its static metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::UnknownStageError;
use crate::store::{ArtifactKind, AssetSlot};

/// Identifier of a pipeline stage.
///
/// The variants are declared in production order. `Review` classifies
/// feedback and is invoked directly, never sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Project setup.
    Onboarding,
    /// Creative direction.
    Director,
    /// Script, characters and shot list.
    Scriptwriter,
    /// Character reference images.
    CharacterArtist,
    /// Shot first-frame images.
    StoryboardArtist,
    /// Shot video clips.
    VideoGenerator,
    /// The aggregate video.
    VideoMerger,
    /// Feedback classification.
    Review,
}

/// UI phase a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Planning and writing.
    Ideate,
    /// Still images.
    Visualize,
    /// Video clips.
    Animate,
    /// Final assembly.
    Deploy,
}

/// Copy shown at the checkpoint that follows a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionCopy {
    /// What just finished.
    pub completed: &'static str,
    /// What runs next.
    pub next_step: &'static str,
    /// The confirmation prompt.
    pub question: &'static str,
}

impl CompletionCopy {
    /// Renders the full checkpoint message.
    #[must_use]
    pub fn message(&self) -> String {
        format!("{}\n{}\n{}", self.completed, self.next_step, self.question)
    }
}

impl StageId {
    /// Every stage, in production order.
    pub const ALL: [Self; 8] = [
        Self::Onboarding,
        Self::Director,
        Self::Scriptwriter,
        Self::CharacterArtist,
        Self::StoryboardArtist,
        Self::VideoGenerator,
        Self::VideoMerger,
        Self::Review,
    ];

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Onboarding => "onboarding",
            Self::Director => "director",
            Self::Scriptwriter => "scriptwriter",
            Self::CharacterArtist => "character_artist",
            Self::StoryboardArtist => "storyboard_artist",
            Self::VideoGenerator => "video_generator",
            Self::VideoMerger => "video_merger",
            Self::Review => "review",
        }
    }

    /// Returns the position in [`StageId::ALL`].
    #[must_use]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Returns true for stages that create artifact rows.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Onboarding | Self::Director | Self::Scriptwriter)
    }

    /// Returns true if the stage takes part in normal sequencing.
    #[must_use]
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, Self::Review)
    }

    /// Returns true if feedback may re-route a run to this stage.
    #[must_use]
    pub fn is_restart_target(&self) -> bool {
        (Self::Scriptwriter.index()..=Self::VideoMerger.index()).contains(&self.index())
    }

    /// Returns the artifact slot this stage fills, if it produces per-artifact assets.
    #[must_use]
    pub fn produces(&self) -> Option<(ArtifactKind, AssetSlot)> {
        match self {
            Self::CharacterArtist => Some((ArtifactKind::Character, AssetSlot::Image)),
            Self::StoryboardArtist => Some((ArtifactKind::Shot, AssetSlot::Image)),
            Self::VideoGenerator => Some((ArtifactKind::Shot, AssetSlot::Video)),
            _ => None,
        }
    }

    /// Returns every artifact slot produced at or after this stage.
    ///
    /// These are the slots that go stale when a run restarts here.
    #[must_use]
    pub fn invalidated_slots(&self) -> Vec<(ArtifactKind, AssetSlot)> {
        Self::ALL[self.index()..]
            .iter()
            .filter_map(StageId::produces)
            .collect()
    }

    /// Returns the UI phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Onboarding | Self::Director | Self::Scriptwriter | Self::Review => Phase::Ideate,
            Self::CharacterArtist | Self::StoryboardArtist => Phase::Visualize,
            Self::VideoGenerator => Phase::Animate,
            Self::VideoMerger => Phase::Deploy,
        }
    }

    /// Returns the checkpoint copy for this stage.
    #[must_use]
    pub fn completion(&self) -> CompletionCopy {
        match self {
            Self::Onboarding => CompletionCopy {
                completed: "Project setup is complete.",
                next_step: "Next, the director will plan the overall creative direction.",
                question: "Do the project settings look right?",
            },
            Self::Director => CompletionCopy {
                completed: "The creative direction is planned.",
                next_step: "Next, the scriptwriter will write the script, design the characters and lay out the shots.",
                question: "Does the creative direction match what you had in mind?",
            },
            Self::Scriptwriter => CompletionCopy {
                completed: "The script is written.",
                next_step: "Next, reference images will be generated for each character.",
                question: "Are you happy with the script and characters? Tell me what to change if not.",
            },
            Self::CharacterArtist => CompletionCopy {
                completed: "Character images are generated.",
                next_step: "Next, a first-frame image will be generated for each shot.",
                question: "Do the characters look the way you imagined? Tell me which one to redo if not.",
            },
            Self::StoryboardArtist => CompletionCopy {
                completed: "Storyboard first frames are generated.",
                next_step: "Next, a video clip will be generated for each shot.",
                question: "Are the storyboard frames right? Tell me which shots to adjust.",
            },
            Self::VideoGenerator => CompletionCopy {
                completed: "Shot videos are generated.",
                next_step: "Next, all clips will be merged into the final video.",
                question: "How do the clips look? Should any shots be regenerated?",
            },
            Self::VideoMerger => CompletionCopy {
                completed: "The final video is merged.",
                next_step: "Your video is ready to download or share.",
                question: "Are you happy with the final video?",
            },
            Self::Review => CompletionCopy {
                completed: "Feedback is analysed.",
                next_step: "Continuing with the next step.",
                question: "Continue?",
            },
        }
    }

    /// Returns the remaining plan starting at `self`.
    ///
    /// Runs pinned to one artifact only visit the stages producing that
    /// artifact's assets.
    #[must_use]
    pub fn plan_from(&self, pinned: Option<ArtifactKind>) -> Vec<StageId> {
        Self::ALL[self.index()..]
            .iter()
            .copied()
            .filter(StageId::is_sequenced)
            .filter(|stage| match pinned {
                Some(kind) => stage.produces().is_some_and(|(k, _)| k == kind),
                None => true,
            })
            .collect()
    }

    /// Returns the first stage a run pinned to `kind` starts at.
    #[must_use]
    pub fn first_producing(kind: ArtifactKind) -> StageId {
        match kind {
            ArtifactKind::Character => Self::CharacterArtist,
            ArtifactKind::Shot => Self::StoryboardArtist,
        }
    }

    /// Parses a stage name and checks it may start a run pinned to `pinned`.
    pub fn resolve_start(name: &str, pinned: Option<ArtifactKind>) -> Result<StageId, UnknownStageError> {
        let stage: StageId = name.parse()?;
        if let Some(kind) = pinned {
            if stage.produces().map(|(k, _)| k) != Some(kind) {
                return Err(UnknownStageError::new(name)
                    .with_detail(format!("does not produce {} assets", kind)));
            }
        }
        Ok(stage)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = UnknownStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == name)
            .ok_or_else(|| UnknownStageError::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_roundtrip_all() {
        for stage in StageId::ALL {
            assert_eq!(stage.as_str().parse::<StageId>().unwrap(), stage);
        }
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let err = "storyboard".parse::<StageId>().unwrap_err();
        assert_eq!(err.name, "storyboard");
    }

    #[test]
    fn test_plan_excludes_review() {
        assert_eq!(
            StageId::Scriptwriter.plan_from(None),
            vec![
                StageId::Scriptwriter,
                StageId::CharacterArtist,
                StageId::StoryboardArtist,
                StageId::VideoGenerator,
                StageId::VideoMerger,
            ]
        );
        assert!(StageId::Review.plan_from(None).is_empty());
    }

    #[test]
    fn test_pinned_plan_visits_producing_stages() {
        assert_eq!(
            StageId::StoryboardArtist.plan_from(Some(ArtifactKind::Shot)),
            vec![StageId::StoryboardArtist, StageId::VideoGenerator]
        );
        assert_eq!(
            StageId::CharacterArtist.plan_from(Some(ArtifactKind::Character)),
            vec![StageId::CharacterArtist]
        );
    }

    #[test]
    fn test_invalidated_slots_follow_order() {
        assert_eq!(
            StageId::CharacterArtist.invalidated_slots(),
            vec![
                (ArtifactKind::Character, AssetSlot::Image),
                (ArtifactKind::Shot, AssetSlot::Image),
                (ArtifactKind::Shot, AssetSlot::Video),
            ]
        );
        assert_eq!(
            StageId::VideoGenerator.invalidated_slots(),
            vec![(ArtifactKind::Shot, AssetSlot::Video)]
        );
        assert!(StageId::VideoMerger.invalidated_slots().is_empty());
    }

    #[test]
    fn test_restart_targets() {
        let targets: Vec<_> = StageId::ALL
            .into_iter()
            .filter(StageId::is_restart_target)
            .collect();
        assert_eq!(
            targets,
            vec![
                StageId::Scriptwriter,
                StageId::CharacterArtist,
                StageId::StoryboardArtist,
                StageId::VideoGenerator,
                StageId::VideoMerger,
            ]
        );
    }

    #[test]
    fn test_resolve_start_for_pinned_run() {
        assert_eq!(
            StageId::resolve_start("video_generator", Some(ArtifactKind::Shot)).unwrap(),
            StageId::VideoGenerator
        );
        let err = StageId::resolve_start("scriptwriter", Some(ArtifactKind::Shot)).unwrap_err();
        assert!(err.detail.is_some());
    }

    #[test]
    fn test_phases() {
        assert_eq!(StageId::Director.phase(), Phase::Ideate);
        assert_eq!(StageId::StoryboardArtist.phase(), Phase::Visualize);
        assert_eq!(StageId::VideoMerger.phase(), Phase::Deploy);
    }
}
