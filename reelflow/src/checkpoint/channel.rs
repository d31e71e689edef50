//! Pausing and resuming a run at a checkpoint.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::SignalStore;
use crate::errors::Result;
use crate::store::RunId;

/// Returns the durable flag key of a run's checkpoint.
#[must_use]
pub fn confirm_flag_key(prefix: &str, run_id: RunId) -> String {
    format!("{prefix}:confirm:{run_id}")
}

/// Returns the broadcast topic of a run's checkpoint.
#[must_use]
pub fn confirm_channel_key(prefix: &str, run_id: RunId) -> String {
    format!("{prefix}:confirm_channel:{run_id}")
}

/// Rendezvous between a waiting run and whoever confirms its checkpoint.
#[derive(Clone)]
pub struct CheckpointChannel {
    store: Arc<dyn SignalStore>,
    prefix: String,
    flag_ttl: Duration,
    poll_interval: Duration,
}

impl CheckpointChannel {
    /// Creates a channel over `store` with a one-hour flag TTL and a
    /// one-second fallback poll.
    #[must_use]
    pub fn new(store: Arc<dyn SignalStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            flag_ttl: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Sets how long an unconsumed signal stays valid.
    #[must_use]
    pub fn with_flag_ttl(mut self, ttl: Duration) -> Self {
        self.flag_ttl = ttl;
        self
    }

    /// Sets the fallback poll interval used when a broadcast is lost.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Confirms the checkpoint of `run_id`.
    ///
    /// Signaling twice before a wait still leaves a single flag.
    pub async fn signal(&self, run_id: RunId) -> Result<()> {
        self.store
            .set_flag(&confirm_flag_key(&self.prefix, run_id), self.flag_ttl)
            .await?;
        if let Err(e) = self
            .store
            .publish(&confirm_channel_key(&self.prefix, run_id))
            .await
        {
            warn!(run_id = %run_id, error = %e, "Checkpoint broadcast failed, waiters will poll");
        }
        debug!(run_id = %run_id, "Checkpoint signaled");
        Ok(())
    }

    /// Waits up to `timeout` for the checkpoint of `run_id` to be confirmed.
    ///
    /// Returns `Ok(false)` on timeout. A pending signal is consumed and
    /// returns `Ok(true)` immediately, even with a zero timeout.
    pub async fn await_signal(&self, run_id: RunId, timeout: Duration) -> Result<bool> {
        let flag = confirm_flag_key(&self.prefix, run_id);
        if self.store.take_flag(&flag).await? {
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }

        let deadline = Instant::now() + timeout;
        let mut wakeups = self
            .store
            .subscribe(&confirm_channel_key(&self.prefix, run_id))
            .await?;

        // A signal may have landed between the first check and subscribing.
        if self.store.take_flag(&flag).await? {
            return Ok(true);
        }

        let mut poll = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                () = &mut expired => {
                    debug!(run_id = %run_id, "Checkpoint wait timed out");
                    return Ok(false);
                }
                wakeup = wakeups.next() => {
                    if wakeup.is_none() {
                        // Topic closed; keep polling until the deadline.
                        wakeups = stream::pending().boxed();
                    }
                }
                _ = poll.tick() => {}
            }
            if self.store.take_flag(&flag).await? {
                return Ok(true);
            }
        }
    }

    /// Discards any stale signal left from a previous checkpoint.
    pub async fn clear(&self, run_id: RunId) -> Result<()> {
        self.store
            .clear_flag(&confirm_flag_key(&self.prefix, run_id))
            .await
    }

    /// Reclaims both checkpoint keys of a finished run.
    pub async fn release(&self, run_id: RunId) -> Result<()> {
        self.clear(run_id).await?;
        self.store
            .release_topic(&confirm_channel_key(&self.prefix, run_id))
            .await
    }
}

impl std::fmt::Debug for CheckpointChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointChannel")
            .field("prefix", &self.prefix)
            .field("flag_ttl", &self.flag_ttl)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
