//! Assertions over run records and collected events.

use crate::events::CollectingEventSink;
use crate::store::{RunState, RunStatus};

/// Asserts that the run ended with `expected`.
pub fn assert_run_status(run: &RunState, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run {} to be {}, got {} (error: {:?})",
        run.id, expected, run.status, run.error
    );
}

/// Asserts that the run failed with an error containing `fragment`.
pub fn assert_run_failed_with(run: &RunState, fragment: &str) {
    assert_run_status(run, RunStatus::Failed);
    let error = run.error.as_deref().unwrap_or_default();
    assert!(
        error.contains(fragment),
        "Expected error containing '{fragment}', got '{error}'"
    );
}

/// Asserts that `expected` event types were sent in this relative order.
///
/// Other events may appear in between.
pub fn assert_events_in_order(sink: &CollectingEventSink, expected: &[&str]) {
    let sent = sink.event_types();
    let mut remaining = expected.iter().peekable();
    for event_type in &sent {
        if remaining.peek().is_some_and(|next| *next == event_type) {
            remaining.next();
        }
    }
    let missing: Vec<_> = remaining.collect();
    assert!(
        missing.is_empty(),
        "Events {missing:?} missing or out of order in {sent:?}"
    );
}

/// Asserts that no event of `event_type` was sent.
pub fn assert_no_event(sink: &CollectingEventSink, event_type: &str) {
    let found = sink.events_of_type(event_type);
    assert!(
        found.is_empty(),
        "Expected no '{event_type}' events, got {found:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSink, RunEvent};
    use crate::store::RunId;

    #[tokio::test]
    async fn test_events_in_order_allows_gaps() {
        let sink = CollectingEventSink::new();
        let run_id = RunId::new();
        sink.send(1, &RunEvent::RunStarted { run_id, scope_id: 1 }).await;
        sink.send(1, &RunEvent::ArtifactCreated { kind: crate::store::ArtifactKind::Shot, id: 1 }).await;
        sink.send(1, &RunEvent::RunCompleted { run_id }).await;

        assert_events_in_order(&sink, &["run_started", "run_completed"]);
        assert_no_event(&sink, "run_failed");
    }

    #[tokio::test]
    #[should_panic(expected = "out of order")]
    async fn test_events_in_order_rejects_swaps() {
        let sink = CollectingEventSink::new();
        let run_id = RunId::new();
        sink.send(1, &RunEvent::RunCompleted { run_id }).await;
        sink.send(1, &RunEvent::RunStarted { run_id, scope_id: 1 }).await;

        assert_events_in_order(&sink, &["run_started", "run_completed"]);
    }
}
