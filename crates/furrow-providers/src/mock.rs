//! Mock model provider for testing
//!
//! Responses come from a FIFO queue, or from a responder closure that sees the
//! request. Every request is recorded, and the number of calls currently
//! awaiting a response is tracked so tests can observe concurrency and
//! cancellation.
//!
//! # Example
//!
//! ```rust,ignore
//! use furrow_providers::mock::{MockProvider, MockResponse};
//!
//! let provider = MockProvider::new()
//!     .with_response(MockResponse::text("not parseable {"))
//!     .with_response(MockResponse::text("Description: a farm"));
//! ```

use crate::{CompletionRequest, CompletionResponse, LLMProvider, Usage};
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Arc<dyn Fn(&CompletionRequest) -> MockResponse + Send + Sync>;

#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Error(String),
    /// Never resolves; the caller has to drop the future
    Pending,
}

/// A mock response that can be configured for testing
#[derive(Debug, Clone)]
pub struct MockResponse {
    reply: MockReply,
    delay: Option<Duration>,
    pub usage: Usage,
}

impl MockResponse {
    /// Create a plain text response
    pub fn text(content: &str) -> Self {
        Self {
            reply: MockReply::Text(content.to_string()),
            delay: None,
            usage: Usage {
                prompt_tokens: 100,
                completion_tokens: content.len() as u32 / 4,
                total_tokens: 100 + content.len() as u32 / 4,
            },
        }
    }

    /// Create a backend failure with the given message
    pub fn error(message: &str) -> Self {
        Self {
            reply: MockReply::Error(message.to_string()),
            delay: None,
            usage: Usage::default(),
        }
    }

    /// Create a response that never arrives
    pub fn pending() -> Self {
        Self {
            reply: MockReply::Pending,
            delay: None,
            usage: Usage::default(),
        }
    }

    /// Builder: wait this long before replying
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Decrements the in-flight counter however the call ends, including when the
/// future is dropped mid-await.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A mock model provider for testing
///
/// Cloning shares the queue, the recorded requests and the counters.
#[derive(Clone)]
pub struct MockProvider {
    name: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    /// Queue of responses to return (FIFO)
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// Consulted before the queue when set
    responder: Option<Responder>,
    /// All requests received (for verification)
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    /// Default response when queue is empty
    default_response: Option<MockResponse>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl MockProvider {
    /// Create a new mock provider with default settings
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            model: "mock-model".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            responses: Arc::new(Mutex::new(Vec::new())),
            responder: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            default_response: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the provider name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the model name
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Add a response to the queue
    pub fn with_response(self, response: MockResponse) -> Self {
        self.responses.lock().unwrap().push(response);
        self
    }

    /// Add multiple responses to the queue
    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        self.responses.lock().unwrap().extend(responses);
        self
    }

    /// Set a default response when queue is empty
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = Some(response);
        self
    }

    /// Answer every request with a closure over the request itself
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> MockResponse + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Get all requests that were made to this provider
    pub fn get_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Get the number of requests made
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Number of calls that have been issued and not yet resolved or dropped
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously outstanding calls seen so far
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Number of calls that returned (successfully or with an error)
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Clear recorded requests
    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    fn next_response(&self, request: &CompletionRequest) -> MockResponse {
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            self.default_response
                .clone()
                .unwrap_or_else(|| MockResponse::text("Mock response (no responses configured)"))
        } else {
            responses.remove(0)
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LLMProvider for MockProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let response = self.next_response(&request);
        self.requests.lock().unwrap().push(request);

        let _guard = InFlightGuard::enter(&self.in_flight, &self.peak_in_flight);

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match response.reply {
            MockReply::Text(content) => Ok(CompletionResponse {
                content,
                usage: response.usage,
                model: self.model.clone(),
            }),
            MockReply::Error(message) => Err(anyhow::anyhow!(message)),
            MockReply::Pending => std::future::pending().await,
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }
}
