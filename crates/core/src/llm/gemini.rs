use crate::config::Settings;
use crate::http::{ResilientClient, RetryPolicy};
use crate::llm::directory::ModelDirectory;
use crate::llm::error::GenerationError;
use crate::llm::{format, prompt};
use crate::llm::{GenerationOutcome, GenerationRequest, ModelCandidate, SamplingParams};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::Duration;

const API_KEY_HEADER: &str = "x-goog-api-key";
const DEFAULT_PREFERRED_MODELS: [&str; 3] = ["gemini-2.5-flash", "gemini-2.0-flash", "gemini-1.5-flash"];
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_BACKOFF_MS: u64 = 500;
const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DISCOVERY_RETRIES: u32 = 1;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub preferred_models: Vec<String>,
    pub sampling: SamplingParams,
    pub generation_timeout: Duration,
    pub generation_retry: RetryPolicy,
    pub discovery_enabled: bool,
    pub discovery_timeout: Duration,
    pub discovery_retry: RetryPolicy,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            preferred_models: DEFAULT_PREFERRED_MODELS.iter().map(|s| s.to_string()).collect(),
            sampling: SamplingParams::default(),
            generation_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            generation_retry: RetryPolicy::new(
                DEFAULT_MAX_RETRIES,
                Duration::from_millis(DEFAULT_BACKOFF_MS),
            ),
            discovery_enabled: true,
            discovery_timeout: Duration::from_secs(DEFAULT_DISCOVERY_TIMEOUT_SECS),
            discovery_retry: RetryPolicy::new(
                DEFAULT_DISCOVERY_RETRIES,
                Duration::from_millis(DEFAULT_BACKOFF_MS),
            ),
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_gemini_api_key()?;
        let mut config = Self::new(api_key, settings.gemini_base_url.clone());

        if let Ok(s) = std::env::var("GEMINI_PREFERRED_MODELS") {
            let models: Vec<String> = s
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            anyhow::ensure!(!models.is_empty(), "GEMINI_PREFERRED_MODELS must list at least one model");
            config.preferred_models = models;
        }
        if let Some(v) = env_parsed::<f32>("GEMINI_TEMPERATURE") {
            config.sampling.temperature = v;
        }
        if let Some(v) = env_parsed::<u32>("GEMINI_MAX_OUTPUT_TOKENS") {
            config.sampling.max_output_tokens = v;
        }
        if let Some(v) = env_parsed::<u64>("GEMINI_TIMEOUT_SECS") {
            config.generation_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parsed::<u32>("GEMINI_MAX_RETRIES") {
            config.generation_retry.max_retries = v;
        }
        if let Some(v) = env_parsed::<u64>("GEMINI_BACKOFF_MS") {
            config.generation_retry.backoff_base = Duration::from_millis(v);
            config.discovery_retry.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = env_parsed::<bool>("GEMINI_DISCOVERY") {
            config.discovery_enabled = v;
        }

        Ok(config)
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

pub(crate) fn api_key_headers(api_key: &str) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        API_KEY_HEADER,
        HeaderValue::from_str(api_key).context("API key is not a valid header value")?,
    );
    Ok(headers)
}

/// Turns market inputs into report text, walking the ranked model list until
/// one candidate answers.
#[derive(Clone)]
pub struct ReportGenerator {
    client: ResilientClient,
    directory: ModelDirectory,
    config: GeminiConfig,
}

impl ReportGenerator {
    pub fn new(client: ResilientClient, config: GeminiConfig) -> Self {
        Self {
            directory: ModelDirectory::new(client.clone(), &config),
            client,
            config,
        }
    }

    pub fn from_settings(client: ResilientClient, settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self::new(client, GeminiConfig::from_settings(settings)?))
    }

    pub fn default_sampling(&self) -> SamplingParams {
        self.config.sampling
    }

    pub async fn generate(&self, request: &GenerationRequest) -> GenerationOutcome {
        let candidates = self.directory.list_candidates().await.candidates;
        if candidates.is_empty() {
            return GenerationOutcome::Failure {
                reason: "no model candidates configured".to_string(),
                attempted: Vec::new(),
            };
        }

        let prompt = prompt::build_prompt(request);
        let total = candidates.len();
        let mut attempted: Vec<ModelCandidate> = Vec::with_capacity(total);
        let mut last_error: Option<GenerationError> = None;

        for candidate in candidates {
            attempted.push(candidate.clone());
            match self.call_model(&candidate.id, &prompt, request.sampling).await {
                Ok(text) => {
                    tracing::info!(
                        model = %candidate.id,
                        symbol = %request.symbol,
                        timeframe = %request.timeframe,
                        attempts = attempted.len(),
                        chars = text.chars().count(),
                        "report generated"
                    );
                    return GenerationOutcome::Success(format::normalize_currency(&text));
                }
                Err(err) if err.is_fallback() => {
                    tracing::warn!(
                        model = %candidate.id,
                        error = %err,
                        "model candidate failed; trying next"
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    tracing::error!(
                        model = %candidate.id,
                        error = %err,
                        "upstream rejected generation; aborting"
                    );
                    return GenerationOutcome::Failure {
                        reason: err.to_string(),
                        attempted,
                    };
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        GenerationOutcome::Failure {
            reason: format!("all {total} model candidate(s) failed; last error: {last}"),
            attempted,
        }
    }

    async fn call_model(
        &self,
        model: &str,
        prompt: &str,
        sampling: SamplingParams,
    ) -> Result<String, GenerationError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );
        let headers =
            api_key_headers(&self.config.api_key).map_err(|err| GenerationError::UpstreamRejected {
                model: model.to_string(),
                status: None,
                body: err.to_string(),
            })?;
        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": sampling.temperature,
                "maxOutputTokens": sampling.max_output_tokens,
                "candidateCount": 1,
            },
        });

        let res = self
            .client
            .post(
                &url,
                headers,
                body,
                self.config.generation_timeout,
                self.config.generation_retry,
            )
            .await
            .map_err(|failed| GenerationError::from_request_failure(model, failed))?;

        let parsed = res
            .json::<GenerateContentResponse>()
            .map_err(|err| GenerationError::EmptyResponse {
                model: model.to_string(),
                detail: format!("{err:#}"),
            })?;
        response_text(&parsed).ok_or_else(|| GenerationError::EmptyResponse {
            model: model.to_string(),
            detail: parsed.empty_reason(),
        })
    }
}

/// Trimmed concatenation of the first candidate's text parts, if non-empty.
fn response_text(res: &GenerateContentResponse) -> Option<String> {
    let candidate = res.candidates.first()?;
    let mut out = String::new();
    for part in &candidate.content.as_ref()?.parts {
        if let Some(text) = &part.text {
            out.push_str(text);
        }
    }
    let trimmed = out.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

impl GenerateContentResponse {
    fn empty_reason(&self) -> String {
        if let Some(reason) = self.prompt_feedback.as_ref().and_then(|f| f.block_reason.as_deref()) {
            return format!("prompt blocked ({reason})");
        }
        match self.candidates.first() {
            None => "response contained zero candidates".to_string(),
            Some(c) => match c.finish_reason.as_deref() {
                Some(reason) => format!("candidate had no text (finishReason={reason})"),
                None => "candidate had no text".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{ok, status, timeout, ScriptedTransport};
    use crate::llm::CandidateOrigin;
    use crate::market::types::{Candle, Timeframe};
    use serde_json::json;
    use std::sync::Arc;

    const BASE: &str = "http://gemini.test/v1beta";

    fn config(preferred: &[&str], discovery: bool) -> GeminiConfig {
        let mut config = GeminiConfig::new("k", BASE);
        config.preferred_models = preferred.iter().map(|s| s.to_string()).collect();
        config.discovery_enabled = discovery;
        config.discovery_retry = RetryPolicy::none();
        config.generation_retry = RetryPolicy::none();
        config
    }

    fn generator(transport: &Arc<ScriptedTransport>, config: GeminiConfig) -> ReportGenerator {
        ReportGenerator::new(ResilientClient::new(transport.clone()), config)
    }

    fn request() -> GenerationRequest {
        let candles = (0..3)
            .map(|i| Candle {
                time: 1_700_000_000_000 + i * 3_600_000,
                open: 100.0,
                high: 110.0,
                low: 95.0,
                close: 105.0,
                volume: 1234.5,
            })
            .collect();
        GenerationRequest {
            symbol: "BTC".to_string(),
            timeframe: Timeframe::OneDay,
            candles,
            funding_rate: "0.0100%".to_string(),
            long_short_ratio: "1.80 (Long: 64.3%, Short: 35.7%)".to_string(),
            sampling: SamplingParams::default(),
        }
    }

    fn text_reply(text: &str) -> crate::http::testing::Reply {
        ok(json!({"candidates": [{"content": {"parts": [{"text": text}]}}]}))
    }

    fn model_url(model: &str) -> String {
        format!("{BASE}/models/{model}:generateContent")
    }

    #[tokio::test]
    async fn first_candidate_success_stops_iteration() {
        let transport = ScriptedTransport::new(vec![ok(json!({
            "candidates": [{"content": {"parts": [{"text": "  Entry: $ 65,000"}, {"text": "\nok  "}]}}]
        }))]);
        let outcome = generator(&transport, config(&["m1", "m2"], false))
            .generate(&request())
            .await;

        assert_eq!(outcome, GenerationOutcome::Success("Entry: `$65,000`\nok".to_string()));
        assert_eq!(transport.urls(), vec![model_url("m1")]);
    }

    #[tokio::test]
    async fn sends_generation_config_and_prompt() {
        let transport = ScriptedTransport::new(vec![text_reply("report")]);
        generator(&transport, config(&["m1"], false))
            .generate(&request())
            .await;

        let req = &transport.requests()[0];
        assert_eq!(req.method, reqwest::Method::POST);
        assert_eq!(req.headers.get("x-goog-api-key").unwrap(), "k");
        let body = req.body.as_ref().unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("BTC/USDT"));
        assert_eq!(body["generationConfig"]["candidateCount"], 1);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert!((body["generationConfig"]["temperature"].as_f64().unwrap() - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn not_found_moves_to_next_candidate() {
        let transport = ScriptedTransport::new(vec![status(404, "model not found"), text_reply("second")]);
        let outcome = generator(&transport, config(&["m1", "m2", "m3"], false))
            .generate(&request())
            .await;

        assert_eq!(outcome, GenerationOutcome::Success("second".to_string()));
        assert_eq!(transport.urls(), vec![model_url("m1"), model_url("m2")]);
    }

    #[tokio::test]
    async fn timeout_and_empty_response_move_to_next_candidate() {
        let transport = ScriptedTransport::new(vec![
            timeout(),
            ok(json!({"candidates": []})),
            text_reply("third"),
        ]);
        let outcome = generator(&transport, config(&["m1", "m2", "m3"], false))
            .generate(&request())
            .await;

        assert_eq!(outcome, GenerationOutcome::Success("third".to_string()));
        assert_eq!(transport.urls().len(), 3);
    }

    #[tokio::test]
    async fn connection_reset_moves_to_next_candidate() {
        let transport = ScriptedTransport::new(vec![
            Err(crate::http::TransportError::Connect(
                "connection closed before message completed".to_string(),
            )),
            text_reply("second"),
        ]);
        let outcome = generator(&transport, config(&["m1", "m2"], false))
            .generate(&request())
            .await;

        assert_eq!(outcome, GenerationOutcome::Success("second".to_string()));
        assert_eq!(transport.urls(), vec![model_url("m1"), model_url("m2")]);
    }

    #[tokio::test]
    async fn rejected_request_aborts_without_trying_next() {
        let transport = ScriptedTransport::new(vec![
            status(400, "{\"error\": {\"message\": \"API key not valid\"}}"),
            text_reply("never"),
        ]);
        let outcome = generator(&transport, config(&["m1", "m2"], false))
            .generate(&request())
            .await;

        match outcome {
            GenerationOutcome::Failure { reason, attempted } => {
                assert!(reason.contains("HTTP 400"), "{reason}");
                assert!(reason.contains("API key not valid"));
                assert_eq!(attempted.len(), 1);
                assert_eq!(attempted[0].id, "m1");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(transport.urls(), vec![model_url("m1")]);
    }

    #[tokio::test]
    async fn all_not_found_lists_every_attempt() {
        let transport = ScriptedTransport::new(vec![
            status(404, "m1 missing"),
            status(404, "m2 missing"),
            status(404, "m3 missing"),
        ]);
        let outcome = generator(&transport, config(&["m1", "m2", "m3"], false))
            .generate(&request())
            .await;

        match outcome {
            GenerationOutcome::Failure { reason, attempted } => {
                let ids: Vec<&str> = attempted.iter().map(|c| c.id.as_str()).collect();
                assert_eq!(ids, vec!["m1", "m2", "m3"]);
                assert!(reason.contains("m3 missing"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_outage_uses_preferred_only() {
        let transport = ScriptedTransport::new(vec![
            status(500, "directory down"),
            status(404, "p1 missing"),
            text_reply("from p2"),
        ]);
        let outcome = generator(&transport, config(&["p1", "p2"], true))
            .generate(&request())
            .await;

        assert_eq!(outcome, GenerationOutcome::Success("from p2".to_string()));
        let urls = transport.urls();
        assert_eq!(urls[0], format!("{BASE}/models"));
        assert_eq!(&urls[1..], &[model_url("p1"), model_url("p2")]);
    }

    #[tokio::test]
    async fn discovered_models_follow_preferred() {
        let transport = ScriptedTransport::new(vec![
            ok(json!({"models": [
                {"name": "models/g-1.0", "supportedGenerationMethods": ["generateContent"]},
                {"name": "models/g-2.0", "supportedGenerationMethods": ["generateContent"]}
            ]})),
            status(404, "p1 missing"),
            status(404, "g-2.0 missing"),
            text_reply("from g-1.0"),
        ]);
        let outcome = generator(&transport, config(&["p1"], true))
            .generate(&request())
            .await;

        assert_eq!(outcome, GenerationOutcome::Success("from g-1.0".to_string()));
        assert_eq!(
            &transport.urls()[1..],
            &[model_url("p1"), model_url("g-2.0"), model_url("g-1.0")]
        );
    }

    #[test]
    fn blocked_prompt_reports_reason() {
        let res: GenerateContentResponse = serde_json::from_value(json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        }))
        .unwrap();
        assert!(response_text(&res).is_none());
        assert_eq!(res.empty_reason(), "prompt blocked (SAFETY)");
    }

    #[test]
    fn whitespace_only_text_is_empty() {
        let res: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "  \n"}]}, "finishReason": "MAX_TOKENS"}]
        }))
        .unwrap();
        assert!(response_text(&res).is_none());
        assert_eq!(res.empty_reason(), "candidate had no text (finishReason=MAX_TOKENS)");
    }

    #[test]
    fn preferred_candidates_are_tagged() {
        let c = ModelCandidate::preferred("m1");
        assert_eq!(c.origin, CandidateOrigin::ConfiguredPreferred);
        assert!(c.supports_generation);
    }
}
