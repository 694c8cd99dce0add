//! [`AnalysisDriver`] – OpenAI-compatible LLM interface for investigations.
//!
//! Investigation handlers (see [`crate::investigator`]) need a model to
//! reason over evidence and propose a diagnosis. This module talks to an
//! OpenAI-compatible `/v1/chat/completions` endpoint – either a local
//! [Ollama](https://ollama.com) instance or any other compatible server –
//! selected at construction time via [`AnalysisBackend`].
//!
//! # Cost control
//!
//! [`AnalysisDriver`] includes built-in safeguards against runaway API spend:
//!
//! * **Token counter** – every call to [`AnalysisDriver::complete`] estimates
//!   the tokens consumed (prompt + reply) via a simple word-count heuristic
//!   and accumulates the total, exposed via [`AnalysisDriver::total_tokens`].
//! * **Rate limiter** – a [`governor`]-backed token-bucket rate limiter
//!   enforces at most [`AnalysisDriver::DEFAULT_RPM`] requests per minute.
//!   When the bucket is empty, [`AnalysisDriver::complete`] returns
//!   [`LlmError::RateLimitExceeded`] immediately rather than blocking.
//! * **Budget circuit breaker** – once the cumulative token count exceeds
//!   [`AnalysisDriver::DEFAULT_TOKEN_BUDGET`] (or the custom value supplied
//!   to [`AnalysisDriver::with_budget`]) the driver trips and every
//!   subsequent call returns [`LlmError::BudgetExceeded`] until the owner
//!   resets the counter with [`AnalysisDriver::reset_token_counter`].
//!
//! # Example
//!
//! ```rust,no_run
//! use synapse_runtime::llm_driver::{AnalysisDriver, AnalysisBackend, ChatMessage, Role};
//!
//! let driver = AnalysisDriver::new(AnalysisBackend::Ollama, "http://localhost:11434", "llama3");
//!
//! let messages = vec![
//!     ChatMessage { role: Role::System, content: "You diagnose system faults.".into() },
//!     ChatMessage { role: Role::User, content: "Explain this stack trace.".into() },
//! ];
//!
//! // Requires a running model server – skipped in unit tests.
//! // let reply = driver.complete(&messages).unwrap();
//! ```

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Backend selection
// ─────────────────────────────────────────────────────────────────────────────

/// Compile-time registry of supported analysis backends, selected from
/// configuration rather than resolved by searching candidate module paths
/// at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisBackend {
    /// A locally-running Ollama instance.
    #[default]
    Ollama,
    /// Any other server exposing an OpenAI-compatible chat-completions API.
    OpenAiCompatible,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from analysis driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    /// The per-minute request rate limit has been reached.
    ///
    /// The caller should back off and retry after a short delay.
    #[error("LLM rate limit exceeded: too many requests per minute")]
    RateLimitExceeded,
    /// The cumulative token budget has been exhausted.
    ///
    /// Call [`AnalysisDriver::reset_token_counter`] or increase the budget
    /// via [`AnalysisDriver::with_budget`] before issuing further requests.
    #[error("LLM token budget exceeded: {used} tokens used, budget is {budget}")]
    BudgetExceeded {
        /// Tokens consumed so far in this session.
        used: u64,
        /// Configured token budget.
        budget: u64,
    },
    /// The configured endpoint uses an insecure `http://` scheme for a
    /// non-localhost host.  External model endpoints must use `https://`.
    #[error("Insecure endpoint: '{0}' uses http:// for a non-localhost host; use https://")]
    InsecureEndpoint(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate-limiter type alias
// ─────────────────────────────────────────────────────────────────────────────

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

// ─────────────────────────────────────────────────────────────────────────────
// AnalysisDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once and reuse across investigation handlers.
///
/// # Cost control
///
/// See the [module-level documentation](self) for details on the built-in
/// token counter, rate limiter, and budget circuit breaker.
pub struct AnalysisDriver {
    backend: AnalysisBackend,
    base_url: String,
    model: String,
    client: reqwest::Client,
    /// Cumulative token counter (prompt + completion tokens, estimated).
    total_tokens: Arc<AtomicU64>,
    /// Maximum tokens allowed before the circuit breaker trips.
    token_budget: u64,
    /// Token-bucket rate limiter (requests per minute).
    rate_limiter: Arc<DirectRateLimiter>,
    /// Bearer token sent to [`AnalysisBackend::OpenAiCompatible`] endpoints.
    /// Ollama ignores it, so it is harmless to leave unset for that backend.
    api_key: Option<String>,
}

impl AnalysisDriver {
    /// Default maximum requests per minute.
    pub const DEFAULT_RPM: u32 = 20;

    /// Default token budget before the circuit breaker trips (≈ 100 k tokens).
    pub const DEFAULT_TOKEN_BUDGET: u64 = 100_000;

    /// Create a new driver for `backend`, pointing at `base_url` (e.g.
    /// `"http://localhost:11434"`) and using `model` (e.g. `"llama3"`).
    ///
    /// The driver is initialised with [`DEFAULT_RPM`][Self::DEFAULT_RPM] and
    /// [`DEFAULT_TOKEN_BUDGET`][Self::DEFAULT_TOKEN_BUDGET].  Use
    /// [`with_budget`][Self::with_budget] or [`with_rpm`][Self::with_rpm] to
    /// customise the limits.
    pub fn new(backend: AnalysisBackend, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_limits(backend, base_url, model, Self::DEFAULT_RPM, Self::DEFAULT_TOKEN_BUDGET)
    }

    /// Create a driver with a custom token budget (all other defaults apply).
    pub fn with_budget(
        backend: AnalysisBackend,
        base_url: impl Into<String>,
        model: impl Into<String>,
        token_budget: u64,
    ) -> Self {
        Self::with_limits(backend, base_url, model, Self::DEFAULT_RPM, token_budget)
    }

    /// Create a driver with a custom requests-per-minute rate limit (all
    /// other defaults apply).
    pub fn with_rpm(
        backend: AnalysisBackend,
        base_url: impl Into<String>,
        model: impl Into<String>,
        rpm: u32,
    ) -> Self {
        Self::with_limits(backend, base_url, model, rpm, Self::DEFAULT_TOKEN_BUDGET)
    }

    /// Create a driver with fully custom rate limits.
    ///
    /// # Arguments
    ///
    /// * `rpm` – maximum requests per minute.  A value of `0` is silently
    ///   clamped to `1` because the underlying [`governor`] rate limiter
    ///   requires a non-zero quota.
    /// * `token_budget` – maximum cumulative tokens before the circuit
    ///   breaker trips.
    pub fn with_limits(
        backend: AnalysisBackend,
        base_url: impl Into<String>,
        model: impl Into<String>,
        rpm: u32,
        token_budget: u64,
    ) -> Self {
        // Guard: governor panics on quota of zero – clamp to at least 1 RPM.
        let rpm = rpm.max(1);
        let quota = Quota::per_minute(NonZeroU32::new(rpm).expect("rpm is >= 1 after max(1) clamp above"));
        let rate_limiter = Arc::new(RateLimiter::direct(quota));
        // Enforce a TLS 1.2 minimum for all HTTPS connections made by this
        // driver.  The application-level `is_secure_url` guard already rejects
        // plaintext HTTP to non-localhost hosts; the TLS version floor adds a
        // second layer of defence against protocol-downgrade attacks.
        let client = reqwest::ClientBuilder::new()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .expect("failed to build reqwest client with TLS 1.2 minimum");
        Self {
            backend,
            base_url: base_url.into(),
            model: model.into(),
            client,
            total_tokens: Arc::new(AtomicU64::new(0)),
            token_budget,
            rate_limiter,
            api_key: None,
        }
    }

    /// Attach a bearer token sent as `Authorization: Bearer <key>` on every
    /// request, for [`AnalysisBackend::OpenAiCompatible`] endpoints that
    /// require one.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// The configured backend.
    pub fn backend(&self) -> AnalysisBackend {
        self.backend
    }

    /// Return the cumulative number of tokens consumed since construction (or
    /// the last call to [`reset_token_counter`][Self::reset_token_counter]).
    ///
    /// The count is an estimate based on a simple word-count heuristic
    /// (tokens ≈ words × 1.3).
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    /// Reset the cumulative token counter and un-trip the budget circuit
    /// breaker, allowing further requests.
    pub fn reset_token_counter(&self) {
        self.total_tokens.store(0, Ordering::Relaxed);
    }

    /// Return the configured token budget.
    pub fn token_budget(&self) -> u64 {
        self.token_budget
    }

    /// Send `messages` to the model and return the assistant's reply text
    /// along with the estimated token count consumed by this call.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::RateLimitExceeded`] when the per-minute request
    /// quota is exhausted, [`LlmError::BudgetExceeded`] when the cumulative
    /// token budget has been exhausted, [`LlmError::Http`] if the request
    /// fails, or [`LlmError::BadResponse`] if the response shape is
    /// unexpected.
    #[instrument(
        name = "llm_driver.complete",
        skip(self, messages),
        fields(
            model = %self.model,
            backend = ?self.backend,
            tokens_used_before = %self.total_tokens.load(Ordering::Relaxed),
            prompt_tokens = tracing::field::Empty,
            reply_tokens = tracing::field::Empty,
            tokens_used_after = tracing::field::Empty,
            inference_latency_ms = tracing::field::Empty,
        )
    )]
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<(String, u64), LlmError> {
        // ── TLS enforcement ────────────────────────────────────────────────
        if !Self::is_secure_url(&self.base_url) {
            return Err(LlmError::InsecureEndpoint(self.base_url.clone()));
        }

        // ── Budget circuit breaker ─────────────────────────────────────────
        let used = self.total_tokens.load(Ordering::Relaxed);
        if used >= self.token_budget {
            return Err(LlmError::BudgetExceeded { used, budget: self.token_budget });
        }

        // ── Rate limiter ───────────────────────────────────────────────────
        if self.rate_limiter.check().is_err() {
            return Err(LlmError::RateLimitExceeded);
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest { model: &self.model, messages, stream: false };

        let inference_start = Instant::now();
        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response: ChatResponse = request.send().await?.error_for_status()?.json().await?;
        let inference_latency_ms = inference_start.elapsed().as_millis() as u64;

        let reply = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))?;

        // ── Token accounting ───────────────────────────────────────────────
        let prompt_tokens: u64 = messages.iter().map(|m| Self::estimate_tokens(&m.content)).sum();
        let reply_tokens = Self::estimate_tokens(&reply);
        let call_tokens = prompt_tokens + reply_tokens;
        let new_total = self.total_tokens.fetch_add(call_tokens, Ordering::Relaxed) + call_tokens;

        let span = tracing::Span::current();
        span.record("prompt_tokens", prompt_tokens);
        span.record("reply_tokens", reply_tokens);
        span.record("tokens_used_after", new_total);
        span.record("inference_latency_ms", inference_latency_ms);
        debug!(
            model = %self.model,
            prompt_tokens,
            reply_tokens,
            tokens_used_after = new_total,
            inference_latency_ms,
            "analysis inference complete"
        );
        if new_total > self.token_budget {
            warn!(tokens_used = new_total, budget = self.token_budget, "token budget exceeded; further requests will be rejected");
        } else if new_total == self.token_budget {
            warn!(tokens_used = new_total, budget = self.token_budget, "token budget reached; next request will be rejected");
        }

        Ok((reply, call_tokens))
    }

    /// Return `true` when `url` is safe to connect to without further TLS
    /// enforcement.
    ///
    /// A URL is considered safe when it:
    /// * uses the `https://` scheme, **or**
    /// * uses `http://` but targets only a loopback address (`localhost`,
    ///   `127.0.0.1`, or `::1`), where TLS is unnecessary.
    ///
    /// All other `http://` URLs are rejected to ensure external model
    /// endpoints always use TLS.
    pub(crate) fn is_secure_url(url: &str) -> bool {
        if url.starts_with("https://") {
            return true;
        }
        if let Some(without_scheme) = url.strip_prefix("http://") {
            let host_port = without_scheme.split('/').next().unwrap_or("");
            let host = if host_port.starts_with('[') {
                match host_port.find(']') {
                    Some(close) => &host_port[1..close],
                    None => return false,
                }
            } else if let Some(idx) = host_port.rfind(':') {
                &host_port[..idx]
            } else {
                host_port
            };
            return matches!(host, "localhost" | "127.0.0.1" | "::1");
        }
        false
    }

    /// Estimate the number of tokens in `text` using a word-count heuristic.
    ///
    /// The formula `ceil(words × 1.3)` approximates BPE tokenisation for
    /// English text, implemented with integer arithmetic as
    /// `(words * 13 + 9) / 10` to avoid floating-point conversion.
    fn estimate_tokens(text: &str) -> u64 {
        let words = text.split_whitespace().count() as u64;
        (words * 13).div_ceil(10)
    }
}
