use crate::http::{ResilientClient, RetryPolicy};
use crate::llm::gemini::{api_key_headers, GeminiConfig};
use crate::llm::ModelCandidate;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Duration;

const GENERATE_CONTENT: &str = "generateContent";
const DISCOVERY_PAGE_SIZE: &str = "1000";

#[derive(Debug, Clone, thiserror::Error)]
#[error("model directory unavailable: {detail}")]
pub struct DirectoryUnavailable {
    pub detail: String,
}

/// Ranked candidates plus the discovery failure, if the list was degraded to
/// the preferred models only.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub candidates: Vec<ModelCandidate>,
    pub warning: Option<DirectoryUnavailable>,
}

#[derive(Clone)]
pub struct ModelDirectory {
    client: ResilientClient,
    base_url: String,
    api_key: String,
    preferred: Vec<String>,
    enabled: bool,
    timeout: Duration,
    policy: RetryPolicy,
}

impl ModelDirectory {
    pub fn new(client: ResilientClient, config: &GeminiConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            preferred: config.preferred_models.clone(),
            enabled: config.discovery_enabled,
            timeout: config.discovery_timeout,
            policy: config.discovery_retry,
        }
    }

    /// Lists generation-capable models from the provider, identifiers normalized.
    pub async fn discover(&self) -> Result<Vec<ModelCandidate>, DirectoryUnavailable> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let headers = api_key_headers(&self.api_key).map_err(|err| DirectoryUnavailable {
            detail: err.to_string(),
        })?;

        let res = self
            .client
            .get(
                &url,
                headers,
                &[("pageSize", DISCOVERY_PAGE_SIZE.to_string())],
                self.timeout,
                self.policy,
            )
            .await
            .map_err(|err| DirectoryUnavailable {
                detail: err.to_string(),
            })?;

        let listing = res
            .json::<ListModelsResponse>()
            .map_err(|err| DirectoryUnavailable {
                detail: format!("{err:#}"),
            })?;

        let mut seen = HashSet::new();
        let discovered = listing
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|s| s == GENERATE_CONTENT))
            .map(|m| normalize_model_id(&m.name).to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .map(ModelCandidate::discovered)
            .collect();
        Ok(discovered)
    }

    /// Preferred models first, then discovered extras. Never fails: a broken
    /// directory degrades to the preferred list.
    pub async fn list_candidates(&self) -> DirectoryListing {
        if !self.enabled {
            return DirectoryListing {
                candidates: rank_candidates(&self.preferred, Vec::new()),
                warning: None,
            };
        }

        match self.discover().await {
            Ok(discovered) => {
                let candidates = rank_candidates(&self.preferred, discovered);
                tracing::debug!(
                    candidates = candidates.len(),
                    preferred = self.preferred.len(),
                    "model directory resolved"
                );
                DirectoryListing {
                    candidates,
                    warning: None,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "model discovery failed; using preferred models only");
                DirectoryListing {
                    candidates: rank_candidates(&self.preferred, Vec::new()),
                    warning: Some(err),
                }
            }
        }
    }
}

/// `"models/gemini-2.0-flash"` -> `"gemini-2.0-flash"`.
pub fn normalize_model_id(name: &str) -> &str {
    let name = name.trim();
    name.rsplit('/').next().unwrap_or(name)
}

/// Leading integer of the first dash-separated token that starts with a digit.
pub fn major_version(id: &str) -> Option<u32> {
    id.split('-').find_map(|part| {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok()
    })
}

pub fn rank_candidates(preferred: &[String], discovered: Vec<ModelCandidate>) -> Vec<ModelCandidate> {
    let mut out: Vec<ModelCandidate> = Vec::with_capacity(preferred.len() + discovered.len());
    for id in preferred {
        if !out.iter().any(|c| &c.id == id) {
            out.push(ModelCandidate::preferred(id.clone()));
        }
    }

    let mut extras: Vec<ModelCandidate> = discovered
        .into_iter()
        .filter(|c| !preferred.contains(&c.id))
        .collect();
    extras.sort_by(|a, b| {
        (Reverse(major_version(&a.id)), &a.id).cmp(&(Reverse(major_version(&b.id)), &b.id))
    });
    extras.dedup_by(|a, b| a.id == b.id);

    out.extend(extras);
    out
}

#[derive(Debug, Deserialize)]
struct ListModelsResponse {
    #[serde(default, alias = "data")]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}
