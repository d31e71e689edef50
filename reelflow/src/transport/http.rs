//! JSON-over-HTTP calls to generation services.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::retry::{RetryConfig, RetryingCaller};
use crate::errors::TransportError;

const BODY_EXCERPT_LIMIT: usize = 300;

/// Posts JSON requests with classified failures and shared retries.
#[derive(Debug, Clone)]
pub struct HttpCaller {
    client: Client,
    retry: RetryingCaller,
    bearer_token: Option<String>,
}

impl HttpCaller {
    /// Creates a caller with a per-request `timeout`.
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self {
            client,
            retry: RetryingCaller::new(retry),
            bearer_token: None,
        })
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Posts `body` to `url` and decodes the JSON response.
    ///
    /// Retryable status codes and transport failures are retried; other
    /// statuses fail immediately with the response body excerpt.
    pub async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, TransportError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.retry
            .call(url, || async {
                let mut request = self.client.post(url).json(body);
                if let Some(token) = &self.bearer_token {
                    request = request.bearer_auth(token);
                }
                let response = request.send().await?;
                let status = response.status();
                debug!(url, status = status.as_u16(), "Generation service responded");
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    let excerpt: String = text.chars().take(BODY_EXCERPT_LIMIT).collect();
                    return Err(TransportError::status(status.as_u16(), excerpt));
                }
                response.json::<R>().await.map_err(TransportError::from)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_network_error_after_retries() {
        let retry = RetryConfig::new()
            .with_max_retries(1)
            .with_base_delay_ms(1);
        let caller = HttpCaller::new(Duration::from_secs(2), retry).unwrap();

        // Port 9 (discard) is closed on test hosts, so the connect is refused.
        let result: Result<serde_json::Value, TransportError> = caller
            .post_json("http://127.0.0.1:9/generate", &serde_json::json!({"prompt": "x"}))
            .await;

        match result {
            Err(TransportError::Network(_) | TransportError::Timeout) => {}
            other => panic!("expected a transport failure, got {other:?}"),
        }
    }
}
