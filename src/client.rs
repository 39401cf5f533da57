//! HTTP client module for delivering events to the shelter backend.
//!
//! One POST per payload, bounded by the configured timeout. The client never
//! retries on its own; it only classifies what happened so the dispatcher can
//! decide what to do with the payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::event::DeliveryPayload;

/// Longest response body kept in a `Rejected` outcome.
const MAX_BODY_CHARS: usize = 512;

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The backend accepted the payload (2xx)
    Success,

    /// The backend answered with a non-2xx status
    Rejected { status: StatusCode, body: String },

    /// No answer: connection refused, DNS failure, timeout
    Unreachable(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Whether retrying the same payload is pointless.
    ///
    /// Client errors are permanent, except request timeout and rate limiting.
    pub fn is_permanent(&self) -> bool {
        match self {
            Outcome::Rejected { status, .. } => {
                status.is_client_error()
                    && *status != StatusCode::REQUEST_TIMEOUT
                    && *status != StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "delivered"),
            Outcome::Rejected { status, body } if body.is_empty() => {
                write!(f, "rejected ({})", status)
            }
            Outcome::Rejected { status, body } => write!(f, "rejected ({}): {}", status, body),
            Outcome::Unreachable(cause) => write!(f, "unreachable: {}", cause),
        }
    }
}

/// Errors that can occur while setting up the client.
#[derive(Debug)]
pub enum ClientError {
    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

/// Transport used by the dispatcher to hand payloads to the backend.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Attempt delivery of one payload, exactly once.
    async fn deliver(&self, payload: &DeliveryPayload) -> Outcome;
}

#[async_trait]
impl<T: Deliver + ?Sized> Deliver for std::sync::Arc<T> {
    async fn deliver(&self, payload: &DeliveryPayload) -> Outcome {
        (**self).deliver(payload).await
    }
}

/// Statistics about delivery attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Payloads accepted by the backend
    pub delivered: u64,

    /// Payloads answered with a non-2xx status
    pub rejected: u64,

    /// Attempts that got no answer
    pub unreachable: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    delivered: AtomicU64,
    rejected: AtomicU64,
    unreachable: AtomicU64,
}

/// HTTP client for the shelter backend.
///
/// The underlying `reqwest::Client` is reused across attempts so idle
/// connections are pooled.
#[derive(Debug)]
pub struct DeliveryClient {
    client: Client,
    endpoint_url: String,
    timeout: Duration,
    stats: AtomicStats,
}

impl DeliveryClient {
    /// Create a client for the endpoint and timeout in `config`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(config.endpoint_url.clone(), config.request_timeout)
    }

    /// Create a client with custom settings.
    pub fn with_settings(
        endpoint_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint_url: endpoint_url.into(),
            timeout,
            stats: AtomicStats::default(),
        })
    }

    async fn post(&self, payload: &DeliveryPayload) -> Outcome {
        let response = match self
            .client
            .post(&self.endpoint_url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Outcome::Unreachable(describe_transport_error(&e)),
        };

        let status = response.status();
        if status.is_success() {
            return Outcome::Success;
        }

        let body = response
            .text()
            .await
            .map(|text| truncate(text.trim(), MAX_BODY_CHARS))
            .unwrap_or_default();

        Outcome::Rejected { status, body }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            unreachable: self.stats.unreachable.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Deliver for DeliveryClient {
    async fn deliver(&self, payload: &DeliveryPayload) -> Outcome {
        debug!(
            sensor_id = %payload.sensor_id,
            status = %payload.status,
            url = %self.endpoint_url,
            "Posting event"
        );

        let outcome = self.post(payload).await;

        let counter = match &outcome {
            Outcome::Success => &self.stats.delivered,
            Outcome::Rejected { .. } => &self.stats.rejected,
            Outcome::Unreachable(_) => &self.stats.unreachable,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        outcome
    }
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
