//! The bounded state machine behind stage sequencing and re-planning.

use crate::errors::{ReelflowError, Result};
use crate::stages::StageId;

/// Cursor over the current plan plus the remaining re-plan budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplanState {
    plan: Vec<StageId>,
    cursor: usize,
    replans_remaining: usize,
    max_replans: usize,
    /// The stage whose completion leads into the next one.
    prev_handoff: Option<StageId>,
}

impl ReplanState {
    /// Starts at the beginning of `plan`.
    #[must_use]
    pub fn new(plan: Vec<StageId>, max_replans: usize) -> Self {
        Self {
            plan,
            cursor: 0,
            replans_remaining: max_replans,
            max_replans,
            prev_handoff: None,
        }
    }

    /// Starts a plan entered from another stage (a run started at review).
    #[must_use]
    pub fn continuing_from(mut self, stage: StageId) -> Self {
        self.prev_handoff = Some(stage);
        self
    }

    /// Returns the stage under the cursor, or `None` once the plan is done.
    #[must_use]
    pub fn current(&self) -> Option<StageId> {
        self.plan.get(self.cursor).copied()
    }

    /// Returns the stage to name as the handoff source, if any.
    #[must_use]
    pub fn handoff_from(&self) -> Option<StageId> {
        self.prev_handoff
    }

    /// Returns `cursor / len(plan)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.plan.is_empty() {
            return 1.0;
        }
        self.cursor as f64 / self.plan.len() as f64
    }

    /// Returns true if the cursor sits on the last stage of the plan.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.cursor + 1 == self.plan.len()
    }

    /// Returns the stage after the cursor.
    #[must_use]
    pub fn next(&self) -> Option<StageId> {
        self.plan.get(self.cursor + 1).copied()
    }

    /// Moves past the current stage.
    pub fn advance(&mut self) {
        self.prev_handoff = self.current();
        self.cursor += 1;
    }

    /// Replaces the plan after feedback and rewinds the cursor.
    ///
    /// Fails once the re-plan budget is spent.
    pub fn replan(&mut self, plan: Vec<StageId>) -> Result<()> {
        if self.replans_remaining == 0 {
            return Err(ReelflowError::TooManyRevisions {
                limit: self.max_replans,
            });
        }
        self.replans_remaining -= 1;
        self.plan = plan;
        self.cursor = 0;
        self.prev_handoff = Some(StageId::Review);
        Ok(())
    }

    /// Returns the current plan.
    #[must_use]
    pub fn plan(&self) -> &[StageId] {
        &self.plan
    }

    /// Returns how many re-plans are still allowed.
    #[must_use]
    pub fn replans_remaining(&self) -> usize {
        self.replans_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn full_plan() -> Vec<StageId> {
        StageId::Onboarding.plan_from(None)
    }

    #[test]
    fn test_walks_plan_with_non_decreasing_progress() {
        let mut state = ReplanState::new(full_plan(), 2);
        let mut seen = Vec::new();
        let mut last_progress = 0.0;

        while let Some(stage) = state.current() {
            assert!(state.progress() >= last_progress);
            last_progress = state.progress();
            seen.push(stage);
            state.advance();
        }

        assert_eq!(seen, full_plan());
        assert_eq!(state.handoff_from(), Some(StageId::VideoMerger));
        assert!((state.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_first_stage_has_no_handoff() {
        let state = ReplanState::new(full_plan(), 2);
        assert_eq!(state.handoff_from(), None);
        assert_eq!(state.progress(), 0.0);
        assert_eq!(state.next(), Some(StageId::Director));
    }

    #[test]
    fn test_replan_resets_cursor_and_hands_off_from_review() {
        let mut state = ReplanState::new(full_plan(), 2);
        state.advance();
        state.advance();
        state.advance();

        state.replan(StageId::StoryboardArtist.plan_from(None)).unwrap();

        assert_eq!(state.current(), Some(StageId::StoryboardArtist));
        assert_eq!(state.handoff_from(), Some(StageId::Review));
        assert_eq!(state.progress(), 0.0);
        assert_eq!(state.replans_remaining(), 1);
    }

    #[test]
    fn test_replan_budget_is_enforced() {
        let mut state = ReplanState::new(full_plan(), 1);
        state.replan(StageId::Scriptwriter.plan_from(None)).unwrap();

        let err = state.replan(StageId::Scriptwriter.plan_from(None)).unwrap_err();
        assert!(matches!(err, ReelflowError::TooManyRevisions { limit: 1 }));
    }

    #[test]
    fn test_is_last() {
        let mut state = ReplanState::new(vec![StageId::VideoGenerator, StageId::VideoMerger], 0);
        assert!(!state.is_last());
        state.advance();
        assert!(state.is_last());
    }
}
