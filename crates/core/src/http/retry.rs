use crate::http::{HttpRequest, HttpResponse, Transport, TransportError};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// HTTP statuses worth retrying against the same endpoint.
pub const RETRYABLE_STATUSES: [u16; 8] = [408, 409, 425, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `k` (0-indexed): `backoff_base * 2^k`.
    pub fn backoff(&self, k: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.checked_pow(k).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl RequestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::Transport(TransportError::Timeout(_))
            | RequestError::Transport(TransportError::Connect(_)) => true,
            RequestError::Transport(TransportError::Other(_)) => false,
            RequestError::Status { status, .. } => RETRYABLE_STATUSES.contains(&status.as_u16()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Transport(TransportError::Timeout(_)))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestError::Status { status, .. } => Some(*status),
            RequestError::Transport(_) => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("request failed after {attempts} attempt(s): {last}")]
pub struct RequestFailed {
    pub attempts: u32,
    pub last: RequestError,
}

/// Sends requests through a [`Transport`], retrying transient failures with
/// exponential backoff. Non-retryable statuses come back on the first attempt.
#[derive(Clone)]
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn from_reqwest() -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(crate::http::ReqwestTransport::new()?)))
    }

    pub async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        payload: serde_json::Value,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Result<HttpResponse, RequestFailed> {
        let req = HttpRequest::post(url, payload, timeout).headers(headers);
        self.execute(&req, policy).await
    }

    pub async fn get(
        &self,
        url: &str,
        headers: HeaderMap,
        query: &[(&str, String)],
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Result<HttpResponse, RequestFailed> {
        let req = HttpRequest::get(url, timeout)
            .headers(headers)
            .query(query.iter().map(|(k, v)| (*k, v.clone())));
        self.execute(&req, policy).await
    }

    pub async fn execute(
        &self,
        req: &HttpRequest,
        policy: RetryPolicy,
    ) -> Result<HttpResponse, RequestFailed> {
        let max_attempts = policy.max_attempts();
        let mut attempt: u32 = 0;
        loop {
            let err = match self.transport.send(req).await {
                Ok(res) if res.status.is_success() => return Ok(res),
                Ok(res) => RequestError::Status {
                    status: res.status,
                    body: res.body,
                },
                Err(err) => RequestError::Transport(err),
            };
            attempt += 1;

            if !err.is_retryable() {
                return Err(RequestFailed {
                    attempts: attempt,
                    last: err,
                });
            }
            if attempt >= max_attempts {
                tracing::warn!(
                    attempts = attempt,
                    method = %req.method,
                    url = %req.url,
                    error = %err,
                    "request retries exhausted"
                );
                return Err(RequestFailed {
                    attempts: attempt,
                    last: err,
                });
            }

            let backoff = policy.backoff(attempt - 1);
            tracing::warn!(
                attempt,
                ?backoff,
                method = %req.method,
                url = %req.url,
                error = %err,
                "transient request failure; retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
