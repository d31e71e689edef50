//! Run notifications and the sinks that deliver them.
//!
//! Delivery is fire-and-forget: sinks never report failure and the
//! [`EventNotifier`] bounds how long the orchestrator waits on one.

mod event;
mod notifier;
mod sink;

pub use event::RunEvent;
pub use notifier::EventNotifier;
pub use sink::{BroadcastEventSink, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
