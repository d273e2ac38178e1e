use crate::market::types::{Candle, Timeframe};
use serde::Serialize;

pub mod directory;
pub mod error;
pub mod format;
pub mod gemini;
pub mod prompt;

/// Prefix of every user-facing message that replaces a report after a terminal failure.
pub const SERVICE_ERROR_PREFIX: &str = "Terjadi kesalahan pada layanan AI:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateOrigin {
    ConfiguredPreferred,
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelCandidate {
    pub id: String,
    pub origin: CandidateOrigin,
    pub supports_generation: bool,
}

impl ModelCandidate {
    pub fn preferred(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: CandidateOrigin::ConfiguredPreferred,
            supports_generation: true,
        }
    }

    pub fn discovered(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: CandidateOrigin::Discovered,
            supports_generation: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            max_output_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub funding_rate: String,
    pub long_short_ratio: String,
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Success(String),
    Failure {
        reason: String,
        attempted: Vec<ModelCandidate>,
    },
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Success(_))
    }

    /// Report text, or the prefixed service-error message on failure.
    pub fn render(&self) -> String {
        match self {
            GenerationOutcome::Success(text) => text.clone(),
            GenerationOutcome::Failure { reason, .. } => {
                format!("{SERVICE_ERROR_PREFIX} {reason}")
            }
        }
    }
}
