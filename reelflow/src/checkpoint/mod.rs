//! Cross-process checkpoint rendezvous.
//!
//! A checkpoint pairs a durable, TTL-bounded flag (consumed destructively by
//! the first waiter that sees it) with a best-effort broadcast topic that
//! wakes waiters without polling. The [`SignalStore`] trait is the seam to
//! the shared store; [`InMemorySignalStore`] serves a single process and
//! tests.

mod channel;
mod signal_store;

pub use channel::{confirm_channel_key, confirm_flag_key, CheckpointChannel};
pub use signal_store::{InMemorySignalStore, SignalStore, SignalStream};
