//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, Level};

use super::RunEvent;
use crate::store::ScopeId;

/// Trait for sinks that deliver run events to a scope's subscribers.
///
/// Delivery is best-effort. Implementations must not fail; errors are
/// logged and suppressed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Sends `event` to the subscribers of `scope_id`.
    async fn send(&self, scope_id: ScopeId, event: &RunEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn send(&self, _scope_id: ScopeId, _event: &RunEvent) {
        // Intentionally empty - discards all events
    }
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    /// The log level to use.
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn send(&self, scope_id: ScopeId, event: &RunEvent) {
        let event_type = event.event_type();
        if self.level == Level::DEBUG {
            debug!(scope_id, event_type, event_data = ?event, "Event: {}", event_type);
        } else {
            info!(scope_id, event_type, event_data = ?event, "Event: {}", event_type);
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(ScopeId, RunEvent)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(ScopeId, RunEvent)> {
        self.events.read().clone()
    }

    /// Returns the type names of the collected events, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .read()
            .iter()
            .map(|(_, e)| e.event_type())
            .collect()
    }

    /// Returns the events of one type.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|(_, e)| e.event_type() == event_type)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn send(&self, scope_id: ScopeId, event: &RunEvent) {
        self.events.write().push((scope_id, event.clone()));
    }
}

/// Fans events out to in-process subscribers (websocket handlers and the like).
///
/// Slow subscribers lag and lose events rather than slowing the run.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<(ScopeId, RunEvent)>,
}

impl BroadcastEventSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to every scope's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<(ScopeId, RunEvent)> {
        self.sender.subscribe()
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn send(&self, scope_id: ScopeId, event: &RunEvent) {
        if self.sender.send((scope_id, event.clone())).is_err() {
            debug!(scope_id, event_type = event.event_type(), "No subscribers for event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RunId;

    fn completed() -> RunEvent {
        RunEvent::RunCompleted { run_id: RunId::new() }
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.send(1, &completed()).await;
        // Should not panic
    }

    #[tokio::test]
    async fn test_logging_sink() {
        LoggingEventSink::default().send(1, &completed()).await;
        LoggingEventSink::debug().send(1, &completed()).await;
        // Should not panic
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.send(1, &completed()).await;
        sink.send(2, &RunEvent::RunCancelled {
            run_id: RunId::new(),
            reason: "user".into(),
        })
        .await;

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.event_types(), vec!["run_completed", "run_cancelled"]);
        assert_eq!(sink.events()[1].0, 2);
        assert_eq!(sink.events_of_type("run_cancelled").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_sink_fans_out() {
        let sink = BroadcastEventSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 2);

        let event = completed();
        sink.send(7, &event).await;

        assert_eq!(first.recv().await.unwrap(), (7, event.clone()));
        assert_eq!(second.recv().await.unwrap(), (7, event));
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastEventSink::default();
        sink.send(1, &completed()).await;
        // Should not panic
    }
}
