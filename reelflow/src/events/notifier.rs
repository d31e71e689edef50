//! Bounded, best-effort event delivery.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{EventSink, NoOpEventSink, RunEvent};
use crate::store::ScopeId;

/// Wraps a sink so that a slow delivery never stalls the caller.
#[derive(Clone)]
pub struct EventNotifier {
    sink: Arc<dyn EventSink>,
    timeout: Duration,
}

impl EventNotifier {
    /// Creates a notifier giving each delivery at most `timeout`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    /// Creates a notifier that discards everything.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoOpEventSink), Duration::from_secs(1))
    }

    /// Delivers `event`, giving up after the configured timeout.
    pub async fn notify(&self, scope_id: ScopeId, event: RunEvent) {
        let delivery = self.sink.send(scope_id, &event);
        if tokio::time::timeout(self.timeout, delivery).await.is_err() {
            warn!(
                scope_id,
                event_type = event.event_type(),
                timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                "Event delivery timed out, dropping event"
            );
        }
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
