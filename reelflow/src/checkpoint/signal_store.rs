//! Shared-store primitives behind checkpoint signaling.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::errors::Result;

/// A stream yielding one item per received broadcast.
pub type SignalStream = BoxStream<'static, ()>;

/// Key/value flags with TTL plus publish/subscribe topics.
///
/// Implementations backed by a networked store make checkpoints work across
/// process instances.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Sets `key`, replacing any previous value, expiring after `ttl`.
    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Atomically removes `key`, returning true if it was set and unexpired.
    async fn take_flag(&self, key: &str) -> Result<bool>;

    /// Removes `key` if present.
    async fn clear_flag(&self, key: &str) -> Result<()>;

    /// Publishes a wake-up on `topic`. Delivery is best-effort.
    async fn publish(&self, topic: &str) -> Result<()>;

    /// Subscribes to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<SignalStream>;

    /// Drops any resources held for `topic`.
    async fn release_topic(&self, topic: &str) -> Result<()>;
}

/// Process-local signal store.
#[derive(Debug)]
pub struct InMemorySignalStore {
    flags: DashMap<String, Instant>,
    topics: DashMap<String, broadcast::Sender<()>>,
    topic_capacity: usize,
}

impl Default for InMemorySignalStore {
    fn default() -> Self {
        Self {
            flags: DashMap::new(),
            topics: DashMap::new(),
            topic_capacity: 16,
        }
    }
}

impl InMemorySignalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is set and unexpired, without consuming it.
    #[must_use]
    pub fn has_flag(&self, key: &str) -> bool {
        self.flags
            .get(key)
            .is_some_and(|expires| *expires > Instant::now())
    }

    /// Returns the number of live flags.
    #[must_use]
    pub fn flag_count(&self) -> usize {
        let now = Instant::now();
        self.flags.iter().filter(|e| *e.value() > now).count()
    }

    /// Returns the number of open topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<()> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.topic_capacity).0)
            .clone()
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        self.flags.retain(|_, expires| *expires > now);
        self.flags.insert(key.to_string(), now + ttl);
        Ok(())
    }

    async fn take_flag(&self, key: &str) -> Result<bool> {
        Ok(self
            .flags
            .remove(key)
            .is_some_and(|(_, expires)| expires > Instant::now()))
    }

    async fn clear_flag(&self, key: &str) -> Result<()> {
        self.flags.remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str) -> Result<()> {
        // Topics exist only while subscribed; a send error means every
        // subscriber is gone.
        if let Some(sender) = self.topics.get(topic) {
            let _ = sender.send(());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<SignalStream> {
        let receiver = self.sender(topic).subscribe();
        let signals = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), receiver)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(signals.boxed())
    }

    async fn release_topic(&self, topic: &str) -> Result<()> {
        self.topics.remove(topic);
        Ok(())
    }
}
