use crate::http::{RequestError, RequestFailed, TransportError};
use reqwest::StatusCode;

const MAX_BODY_CHARS: usize = 500;

/// Why one model candidate failed to produce a report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("transient network error on {model}: {detail}")]
    TransientNetwork { model: String, detail: String },

    #[error("model {model} unavailable: {detail}")]
    ModelUnavailable { model: String, detail: String },

    #[error("upstream rejected request for {model}{}: {body}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    UpstreamRejected {
        model: String,
        status: Option<u16>,
        body: String,
    },

    #[error("model {model} returned no usable candidate: {detail}")]
    EmptyResponse { model: String, detail: String },
}

impl GenerationError {
    pub fn from_request_failure(model: &str, failed: RequestFailed) -> Self {
        let model = model.to_string();
        let attempts = failed.attempts;
        let retryable = failed.last.is_retryable();
        match failed.last {
            RequestError::Status { status, body } if is_model_not_found(status, &body) => {
                GenerationError::ModelUnavailable {
                    model,
                    detail: format!("HTTP {status}: {}", truncate_chars(&body, MAX_BODY_CHARS)),
                }
            }
            RequestError::Status { status, body } if retryable => {
                GenerationError::TransientNetwork {
                    model,
                    detail: format!(
                        "HTTP {status} after {attempts} attempt(s): {}",
                        truncate_chars(&body, MAX_BODY_CHARS)
                    ),
                }
            }
            RequestError::Status { status, body } => GenerationError::UpstreamRejected {
                model,
                status: Some(status.as_u16()),
                body: truncate_chars(&body, MAX_BODY_CHARS),
            },
            RequestError::Transport(TransportError::Other(detail)) => {
                GenerationError::UpstreamRejected {
                    model,
                    status: None,
                    body: detail,
                }
            }
            RequestError::Transport(err) => GenerationError::TransientNetwork {
                model,
                detail: format!("{err} after {attempts} attempt(s)"),
            },
        }
    }

    /// Whether the generator should move on to the next candidate.
    pub fn is_fallback(&self) -> bool {
        !matches!(self, GenerationError::UpstreamRejected { .. })
    }
}

fn is_model_not_found(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    status == StatusCode::BAD_REQUEST
        && (body.contains("not supported for generateContent") || body.contains("is not found"))
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
