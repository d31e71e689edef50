//! Testing utilities for reelflow runs.
//!
//! This module provides:
//! - Scripted stage executors and a flaky asset generator
//! - Seed data and wiring shortcuts
//! - Assertions over run records and collected events

mod assertions;
pub mod fixtures;
mod mocks;

pub use assertions::{
    assert_events_in_order, assert_no_event, assert_run_failed_with, assert_run_status,
};
pub use fixtures::{
    complete_registry, seed_artifacts, seed_scope, stage_context, wait_for_run, wait_for_terminal,
};
pub use mocks::{FlakyGenerator, ScriptedStage, StageCall};
