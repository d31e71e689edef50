//! The application context shared by the service and every run task.

use dashmap::DashMap;
use std::sync::Arc;

use crate::checkpoint::{CheckpointChannel, InMemorySignalStore, SignalStore};
use crate::config::ReelflowConfig;
use crate::errors::Result;
use crate::events::{EventNotifier, EventSink, NoOpEventSink};
use crate::planner::InvalidationPlanner;
use crate::registry::ScopeTaskRegistry;
use crate::stages::{StageId, StageRegistry};
use crate::store::{AssetPurger, InMemoryRepository, LocalAssetStore, Repository, RunId};
use crate::transport::RetryingCaller;

/// Everything a run needs, constructed once at startup.
pub struct AppContext {
    pub(crate) config: ReelflowConfig,
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) checkpoints: CheckpointChannel,
    pub(crate) tasks: ScopeTaskRegistry,
    pub(crate) events: EventNotifier,
    pub(crate) planner: Arc<InvalidationPlanner>,
    pub(crate) stages: StageRegistry,
    pub(crate) retry: RetryingCaller,
    /// Runs parked at a checkpoint, with the stage they finished.
    pub(crate) awaiting: DashMap<RunId, StageId>,
}

impl AppContext {
    /// Starts building a context around the stage executors.
    #[must_use]
    pub fn builder(stages: StageRegistry) -> AppContextBuilder {
        AppContextBuilder::new(stages)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ReelflowConfig {
        &self.config
    }

    /// Returns the repository.
    #[must_use]
    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Returns the checkpoint channel.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointChannel {
        &self.checkpoints
    }

    /// Returns the task registry.
    #[must_use]
    pub fn tasks(&self) -> &ScopeTaskRegistry {
        &self.tasks
    }

    /// Returns the invalidation planner.
    #[must_use]
    pub fn planner(&self) -> &Arc<InvalidationPlanner> {
        &self.planner
    }

    /// Returns the stage a run is parked after, if it is awaiting confirmation.
    #[must_use]
    pub fn awaiting_stage(&self, run_id: RunId) -> Option<StageId> {
        self.awaiting.get(&run_id).map(|entry| *entry.value())
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("checkpoints", &self.checkpoints)
            .field("live_tasks", &self.tasks.live_count())
            .field("awaiting", &self.awaiting.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`AppContext`]. Unset collaborators get in-process defaults.
pub struct AppContextBuilder {
    stages: StageRegistry,
    config: ReelflowConfig,
    repo: Option<Arc<dyn Repository>>,
    signals: Option<Arc<dyn SignalStore>>,
    sink: Option<Arc<dyn EventSink>>,
    purger: Option<Arc<dyn AssetPurger>>,
}

impl AppContextBuilder {
    fn new(stages: StageRegistry) -> Self {
        Self {
            stages,
            config: ReelflowConfig::default(),
            repo: None,
            signals: None,
            sink: None,
            purger: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReelflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the repository.
    #[must_use]
    pub fn with_repository(mut self, repo: Arc<dyn Repository>) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Sets the store behind checkpoint signaling.
    #[must_use]
    pub fn with_signal_store(mut self, signals: Arc<dyn SignalStore>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the asset purger.
    #[must_use]
    pub fn with_asset_purger(mut self, purger: Arc<dyn AssetPurger>) -> Self {
        self.purger = Some(purger);
        self
    }

    /// Validates the configuration and wires the context.
    pub fn build(self) -> Result<Arc<AppContext>> {
        let config = self.config;
        config.validate()?;

        let repo = self
            .repo
            .unwrap_or_else(|| Arc::new(InMemoryRepository::new()));
        let signals = self
            .signals
            .unwrap_or_else(|| Arc::new(InMemorySignalStore::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let purger = self.purger.unwrap_or_else(|| {
            Arc::new(LocalAssetStore::new(
                &config.assets.static_root,
                config.assets.url_prefix.clone(),
            ))
        });

        let events = EventNotifier::new(sink, config.orchestrator.event_timeout());
        let checkpoints = CheckpointChannel::new(signals, config.checkpoint.key_prefix.clone())
            .with_flag_ttl(config.checkpoint.flag_ttl())
            .with_poll_interval(config.checkpoint.poll_interval());
        let planner = Arc::new(InvalidationPlanner::new(
            repo.clone(),
            purger,
            events.clone(),
        ));
        let retry = RetryingCaller::new(config.retry.clone());

        Ok(Arc::new(AppContext {
            config,
            repo,
            checkpoints,
            tasks: ScopeTaskRegistry::new(),
            events,
            planner,
            stages: self.stages,
            retry,
            awaiting: DashMap::new(),
        }))
    }
}

impl std::fmt::Debug for AppContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContextBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
