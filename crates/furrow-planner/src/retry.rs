//! Retry policy and the call-until-well-formed loop used by information gathering.
//!
//! Every wait (stagger and backoff) and every model call is raced against the
//! run's cancellation token, so a loop that would otherwise retry forever stops
//! at its next await point once the token fires.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use furrow_providers::{CompletionRequest, LLMProvider};

use crate::error_handling::{classify_error, truncate_for_logging, ErrorType};
use crate::errors::Cancelled;
use crate::response_parser::{self, ParsedResponse};

/// How long to wait before retry number `attempt` (1-based)
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDelay {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed; `None` retries until success or cancellation
    pub max_attempts: Option<u32>,
    pub delay: RetryDelay,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// Unbounded attempts with a constant wait
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay: RetryDelay::Fixed(delay),
        }
    }

    /// Unbounded attempts with a doubling wait capped at `max`
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: None,
            delay: RetryDelay::Exponential { base, max },
        }
    }

    /// Unbounded attempts without waiting, for tests
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.delay {
            RetryDelay::Fixed(d) => *d,
            RetryDelay::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(*max)
            }
        }
    }

    /// Whether another attempt may follow attempt number `attempt`
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Sleep for `duration` unless `cancel` fires first
pub async fn cancellable_sleep(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), Cancelled> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Await `future` unless `cancel` fires first
pub async fn until_cancelled<F: Future>(
    future: F,
    cancel: &CancellationToken,
) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        output = future => Ok(output),
    }
}

/// Why a query produced no response
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("{label}: giving up after {attempts} attempts: {last_error}")]
    Exhausted {
        label: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{label}: non-recoverable backend error: {source}")]
    NonRecoverable {
        label: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A well-formed response: the raw text and its sections
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub raw: String,
    pub parsed: ParsedResponse,
}

/// Call the model and parse its answer, retrying malformed responses and
/// recoverable backend errors according to `policy`.
pub async fn query_until_well_formed(
    provider: &dyn LLMProvider,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
) -> Result<QueryResponse, QueryError> {
    debug!("Upstream {}: {}", label, truncate_for_logging(&request.text(), 2000));

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let outcome = until_cancelled(provider.complete(request.clone()), cancel).await?;

        let failure = match outcome {
            Ok(response) => {
                debug!("Downstream {}: {}", label, truncate_for_logging(&response.content, 2000));
                match response_parser::parse(&response.content) {
                    Ok(parsed) => {
                        if parsed.is_empty() {
                            warn!("Empty response in {}", label);
                        }
                        if attempt > 1 {
                            debug!("{} succeeded after {} attempts", label, attempt);
                        }
                        return Ok(QueryResponse {
                            raw: response.content,
                            parsed,
                        });
                    }
                    Err(e) => {
                        error!("Response of {} is not in the correct format: {}, retrying...", label, e);
                        e.to_string()
                    }
                }
            }
            Err(e) => match classify_error(&e) {
                ErrorType::Recoverable(kind) => {
                    warn!("Recoverable error ({:?}) in {}: {}", kind, label, e);
                    e.to_string()
                }
                ErrorType::NonRecoverable => {
                    error!("Non-recoverable error in {}: {}", label, e);
                    return Err(QueryError::NonRecoverable {
                        label: label.to_string(),
                        source: e,
                    });
                }
            },
        };

        if !policy.allows_retry(attempt) {
            error!("{} failed after {} attempts. Giving up.", label, attempt);
            return Err(QueryError::Exhausted {
                label: label.to_string(),
                attempts: attempt,
                last_error: failure,
            });
        }

        cancellable_sleep(policy.delay_for(attempt), cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use furrow_providers::{Message, MessageRole, MockProvider, MockResponse};

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::new(MessageRole::User, "describe".to_string())],
            max_tokens: None,
            temperature: None,
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_allows_retry() {
        assert!(RetryPolicy::default().allows_retry(1_000));
        let bounded = RetryPolicy::immediate().with_max_attempts(2);
        assert!(bounded.allows_retry(1));
        assert!(!bounded.allows_retry(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_malformed_then_success_waits_twice() {
        let provider = MockProvider::new().with_responses(vec![
            MockResponse::text("{ broken"),
            MockResponse::text("```unclosed"),
            MockResponse::text("Description:\nA quiet farm"),
        ]);
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let response = query_until_well_formed(
            &provider,
            &request(),
            &RetryPolicy::default(),
            &cancel,
            "scene",
        )
        .await
        .unwrap();

        assert_eq!(response.parsed.text("description").unwrap(), "A quiet farm");
        assert_eq!(provider.request_count(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_recoverable_backend_error_is_retried() {
        let provider = MockProvider::new().with_responses(vec![
            MockResponse::error("HTTP 503 Service Unavailable"),
            MockResponse::text("Number:\n2"),
        ]);
        let response = query_until_well_formed(
            &provider,
            &request(),
            &RetryPolicy::immediate(),
            &CancellationToken::new(),
            "slot 1",
        )
        .await
        .unwrap();
        assert_eq!(response.parsed.text("number").unwrap(), "2");
    }

    #[tokio::test]
    async fn test_non_recoverable_error_ends_query() {
        let provider = MockProvider::new()
            .with_response(MockResponse::error("401 Unauthorized: invalid api key"))
            .with_default_response(MockResponse::text("Description:\nunreachable"));
        let err = query_until_well_formed(
            &provider,
            &request(),
            &RetryPolicy::immediate(),
            &CancellationToken::new(),
            "scene",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueryError::NonRecoverable { .. }));
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn test_bounded_policy_gives_up() {
        let provider = MockProvider::new().with_default_response(MockResponse::text("{ nope"));
        let err = query_until_well_formed(
            &provider,
            &request(),
            &RetryPolicy::immediate().with_max_attempts(3),
            &CancellationToken::new(),
            "frame 1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueryError::Exhausted { attempts: 3, .. }));
        assert_eq!(provider.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let provider = MockProvider::new().with_default_response(MockResponse::text("{ nope"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = query_until_well_formed(
            &provider,
            &request(),
            &RetryPolicy::default(),
            &cancel,
            "frame 1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled(_)));
        // Calls at t=0, 2, 4; cancelled while waiting for t=6
        assert_eq!(provider.request_count(), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_pending_call() {
        let provider = MockProvider::new().with_response(MockResponse::pending());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = query_until_well_formed(
            &provider,
            &request(),
            &RetryPolicy::default(),
            &cancel,
            "scene",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled(_)));
        assert_eq!(provider.in_flight(), 0);
    }
}
