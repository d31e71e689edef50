//! Process-local ownership of in-flight run tasks, one per scope key.
//!
//! Registering a task for a key that already has a live task cancels the
//! old one: a newer request supersedes rather than queues. Cancellation is
//! cooperative; the cancelled task persists its own terminal state.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cancellation::CancellationToken;
use crate::store::ScopeKey;

/// Reason attached to tasks preempted by a newer registration.
pub const SUPERSEDED: &str = "Superseded by a newer request";

/// Identifies one registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A spawned run task and the token that cancels it.
#[derive(Debug)]
pub struct ScopeTask {
    id: TaskId,
    token: Arc<CancellationToken>,
    handle: JoinHandle<()>,
}

impl ScopeTask {
    /// Wraps a spawned task.
    #[must_use]
    pub fn new(id: TaskId, token: Arc<CancellationToken>, handle: JoinHandle<()>) -> Self {
        Self { id, token, handle }
    }

    /// Returns the task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns true while the task has not finished.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Tracks at most one live task per scope key.
#[derive(Debug, Default)]
pub struct ScopeTaskRegistry {
    tasks: DashMap<ScopeKey, ScopeTask>,
}

impl ScopeTaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` for `key`, cancelling any live task it replaces.
    ///
    /// Returns true if a live task was preempted.
    pub fn register(&self, key: ScopeKey, task: ScopeTask) -> bool {
        let new_id = task.id;
        let previous = self.tasks.insert(key, task);
        match previous {
            Some(old) if old.is_live() => {
                info!(scope = %key, old_task = old.id.0, new_task = new_id.0, "Preempting running task");
                old.token.cancel(SUPERSEDED);
                true
            }
            _ => false,
        }
    }

    /// Requests cooperative cancellation of the task for `key`.
    ///
    /// Returns false if no live task is registered.
    pub fn cancel(&self, key: &ScopeKey, reason: &str) -> bool {
        match self.tasks.get(key) {
            Some(task) if task.is_live() => {
                debug!(scope = %key, task = task.id.0, reason, "Cancelling task");
                task.token.cancel(reason);
                true
            }
            _ => false,
        }
    }

    /// Forgets the task for `key` without cancelling it.
    pub fn remove(&self, key: &ScopeKey) {
        self.tasks.remove(key);
    }

    /// Forgets the task for `key` only if it is still `id`.
    ///
    /// Finishing tasks call this so that they never evict a successor.
    pub fn release(&self, key: &ScopeKey, id: TaskId) -> bool {
        self.tasks.remove_if(key, |_, task| task.id == id).is_some()
    }

    /// Returns true if a live task is registered for `key`.
    #[must_use]
    pub fn is_running(&self, key: &ScopeKey) -> bool {
        self.tasks.get(key).is_some_and(|task| task.is_live())
    }

    /// Returns the id of the task registered for `key`.
    #[must_use]
    pub fn current(&self, key: &ScopeKey) -> Option<TaskId> {
        self.tasks.get(key).map(|task| task.id)
    }

    /// Returns the number of live tasks.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.tasks.iter().filter(|e| e.value().is_live()).count()
    }
}
