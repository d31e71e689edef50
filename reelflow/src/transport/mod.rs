//! Outbound-call plumbing: the shared retry discipline and the HTTP client.

#[cfg(feature = "http")]
mod http;
mod retry;

#[cfg(feature = "http")]
pub use http::HttpCaller;
pub use retry::{should_retry, RetryConfig, RetryDecision, RetryState, Retryable, RetryingCaller};
