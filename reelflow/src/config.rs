//! Configuration for the orchestrator and its collaborators.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{ReelflowError, Result};
use crate::stages::StageId;
use crate::transport::RetryConfig;

/// Checkpoint signaling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// How long a run waits for confirmation after a stage.
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    /// How long an unconsumed confirmation stays valid.
    #[serde(default = "default_flag_ttl_secs")]
    pub flag_ttl_secs: u64,
    /// Fallback poll interval for lost broadcasts.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Prefix of every checkpoint key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_confirm_timeout_secs() -> u64 {
    1800
}

fn default_flag_ttl_secs() -> u64 {
    3600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_key_prefix() -> String {
    "reelflow".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: default_confirm_timeout_secs(),
            flag_ttl_secs: default_flag_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl CheckpointConfig {
    /// Returns the confirmation timeout.
    #[must_use]
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    /// Returns the flag TTL.
    #[must_use]
    pub fn flag_ttl(&self) -> Duration {
        Duration::from_secs(self.flag_ttl_secs)
    }

    /// Returns the fallback poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Run-loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Feedback-driven re-plans allowed per run.
    #[serde(default = "default_max_replans")]
    pub max_replans: usize,
    /// Maximum length of the error text stored on failed runs.
    #[serde(default = "default_error_message_limit")]
    pub error_message_limit: usize,
    /// Per-event delivery timeout.
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    /// Concurrent artifacts per batch.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Stage used when feedback cannot be classified.
    #[serde(default = "default_feedback_stage")]
    pub default_feedback_stage: StageId,
}

fn default_max_replans() -> usize {
    8
}

fn default_error_message_limit() -> usize {
    500
}

fn default_event_timeout_ms() -> u64 {
    2000
}

fn default_batch_concurrency() -> usize {
    4
}

fn default_feedback_stage() -> StageId {
    StageId::Scriptwriter
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            error_message_limit: default_error_message_limit(),
            event_timeout_ms: default_event_timeout_ms(),
            batch_concurrency: default_batch_concurrency(),
            default_feedback_stage: default_feedback_stage(),
        }
    }
}

impl OrchestratorConfig {
    /// Returns the event delivery timeout.
    #[must_use]
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }
}

/// Local asset storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Directory serving generated files.
    #[serde(default = "default_static_root")]
    pub static_root: String,
    /// URL prefix mapped onto `static_root`.
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
}

fn default_static_root() -> String {
    "static".to_string()
}

fn default_url_prefix() -> String {
    "/static/".to_string()
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            static_root: default_static_root(),
            url_prefix: default_url_prefix(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReelflowConfig {
    /// Outbound retry discipline.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Checkpoint signaling.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Run loop.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Asset files.
    #[serde(default)]
    pub assets: AssetConfig,
}

impl ReelflowConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays `REELFLOW_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlays variables resolved through `lookup` on the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let c = &mut config;

        overlay(&lookup, "REELFLOW_MAX_RETRIES", &mut c.retry.max_retries)?;
        overlay(&lookup, "REELFLOW_BASE_DELAY_MS", &mut c.retry.base_delay_ms)?;
        overlay(&lookup, "REELFLOW_MAX_DELAY_MS", &mut c.retry.max_delay_ms)?;
        overlay(&lookup, "REELFLOW_CONFIRM_TIMEOUT_SECS", &mut c.checkpoint.confirm_timeout_secs)?;
        overlay(&lookup, "REELFLOW_FLAG_TTL_SECS", &mut c.checkpoint.flag_ttl_secs)?;
        overlay(&lookup, "REELFLOW_POLL_INTERVAL_MS", &mut c.checkpoint.poll_interval_ms)?;
        overlay(&lookup, "REELFLOW_KEY_PREFIX", &mut c.checkpoint.key_prefix)?;
        overlay(&lookup, "REELFLOW_MAX_REPLANS", &mut c.orchestrator.max_replans)?;
        overlay(&lookup, "REELFLOW_ERROR_MESSAGE_LIMIT", &mut c.orchestrator.error_message_limit)?;
        overlay(&lookup, "REELFLOW_EVENT_TIMEOUT_MS", &mut c.orchestrator.event_timeout_ms)?;
        overlay(&lookup, "REELFLOW_BATCH_CONCURRENCY", &mut c.orchestrator.batch_concurrency)?;
        overlay(&lookup, "REELFLOW_DEFAULT_FEEDBACK_STAGE", &mut c.orchestrator.default_feedback_stage)?;
        overlay(&lookup, "REELFLOW_STATIC_ROOT", &mut c.assets.static_root)?;
        overlay(&lookup, "REELFLOW_URL_PREFIX", &mut c.assets.url_prefix)?;

        if let Some(codes) = lookup("REELFLOW_RETRY_STATUS_CODES") {
            c.retry.retry_status_codes = codes
                .split(',')
                .map(|code| {
                    code.trim().parse::<u16>().map_err(|_| {
                        ReelflowError::Config(format!(
                            "REELFLOW_RETRY_STATUS_CODES: invalid status code '{code}'"
                        ))
                    })
                })
                .collect::<Result<_>>()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ReelflowError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.checkpoint.poll_interval_ms == 0 {
            return Err(ReelflowError::Config(
                "checkpoint.poll_interval_ms must be positive".into(),
            ));
        }
        if self.checkpoint.key_prefix.is_empty() {
            return Err(ReelflowError::Config("checkpoint.key_prefix must not be empty".into()));
        }
        if self.orchestrator.batch_concurrency == 0 {
            return Err(ReelflowError::Config(
                "orchestrator.batch_concurrency must be positive".into(),
            ));
        }
        if !self.orchestrator.default_feedback_stage.is_restart_target() {
            return Err(ReelflowError::Config(format!(
                "orchestrator.default_feedback_stage '{}' is not a restart target",
                self.orchestrator.default_feedback_stage
            )));
        }
        if !self.assets.url_prefix.ends_with('/') {
            return Err(ReelflowError::Config("assets.url_prefix must end with '/'".into()));
        }
        Ok(())
    }

    /// Sets the retry section.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the confirmation timeout.
    #[must_use]
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.checkpoint.confirm_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the fallback poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.checkpoint.poll_interval_ms =
            u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Sets the re-plan limit.
    #[must_use]
    pub fn with_max_replans(mut self, max_replans: usize) -> Self {
        self.orchestrator.max_replans = max_replans;
        self
    }

    /// Sets the stage used for unclassifiable feedback.
    #[must_use]
    pub fn with_default_feedback_stage(mut self, stage: StageId) -> Self {
        self.orchestrator.default_feedback_stage = stage;
        self
    }

    /// Sets the batch concurrency.
    #[must_use]
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.orchestrator.batch_concurrency = concurrency;
        self
    }

    /// Sets the asset root.
    #[must_use]
    pub fn with_static_root(mut self, root: impl Into<String>) -> Self {
        self.assets.static_root = root.into();
        self
    }
}

fn overlay<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| ReelflowError::Config(format!("{name}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ReelflowConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.checkpoint.confirm_timeout(), Duration::from_secs(1800));
        assert_eq!(config.checkpoint.key_prefix, "reelflow");
        assert_eq!(config.orchestrator.max_replans, 8);
        assert_eq!(config.orchestrator.default_feedback_stage, StageId::Scriptwriter);
        assert_eq!(config.assets.url_prefix, "/static/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = ReelflowConfig::from_json_str(
            r#"{"checkpoint": {"confirm_timeout_secs": 60}, "orchestrator": {"default_feedback_stage": "storyboard_artist"}}"#,
        )
        .unwrap();
        assert_eq!(config.checkpoint.confirm_timeout_secs, 60);
        assert_eq!(config.checkpoint.flag_ttl_secs, 3600);
        assert_eq!(config.orchestrator.default_feedback_stage, StageId::StoryboardArtist);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_from_json_rejects_review_default() {
        let err = ReelflowConfig::from_json_str(
            r#"{"orchestrator": {"default_feedback_stage": "review"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a restart target"));
    }

    #[test]
    fn test_from_lookup_overlays() {
        let vars: HashMap<&str, &str> = [
            ("REELFLOW_MAX_REPLANS", "2"),
            ("REELFLOW_DEFAULT_FEEDBACK_STAGE", "video_generator"),
            ("REELFLOW_RETRY_STATUS_CODES", "429, 503"),
        ]
        .into_iter()
        .collect();

        let config =
            ReelflowConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();

        assert_eq!(config.orchestrator.max_replans, 2);
        assert_eq!(config.orchestrator.default_feedback_stage, StageId::VideoGenerator);
        assert_eq!(config.retry.retry_status_codes, vec![429, 503]);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_from_lookup_reports_bad_value() {
        let err = ReelflowConfig::from_lookup(|name| {
            (name == "REELFLOW_BATCH_CONCURRENCY").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("REELFLOW_BATCH_CONCURRENCY"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = ReelflowConfig::default().with_retry(
            RetryConfig::new().with_base_delay_ms(9000).with_max_delay_ms(100),
        );
        assert!(config.validate().is_err());
    }
}
