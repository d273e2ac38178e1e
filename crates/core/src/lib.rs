pub mod delivery;
pub mod http;
pub mod llm;
pub mod market;
pub mod service;

pub mod config {
    use crate::delivery::chunker::MIN_SEGMENT_LIMIT;
    use crate::delivery::DEFAULT_SAFE_LIMIT;
    use anyhow::Context;

    const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
    const DEFAULT_COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";
    const DEFAULT_BINANCE_SPOT_API_URL: &str = "https://api.binance.com";
    const DEFAULT_BINANCE_FUTURES_API_URL: &str = "https://fapi.binance.com";

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub gemini_api_key: Option<String>,
        pub gemini_base_url: String,
        pub coingecko_api_url: String,
        pub binance_spot_api_url: String,
        pub binance_futures_api_url: String,
        pub delivery_safe_limit: usize,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let delivery_safe_limit =
                parse_safe_limit(std::env::var("DELIVERY_SAFE_LIMIT").ok().as_deref())?;

            Ok(Self {
                gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
                gemini_base_url: env_or("GEMINI_BASE_URL", DEFAULT_GEMINI_BASE_URL),
                coingecko_api_url: env_or("COINGECKO_API_URL", DEFAULT_COINGECKO_API_URL),
                binance_spot_api_url: env_or("BINANCE_SPOT_API_URL", DEFAULT_BINANCE_SPOT_API_URL),
                binance_futures_api_url: env_or(
                    "BINANCE_FUTURES_API_URL",
                    DEFAULT_BINANCE_FUTURES_API_URL,
                ),
                delivery_safe_limit,
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            })
        }

        pub fn require_gemini_api_key(&self) -> anyhow::Result<&str> {
            self.gemini_api_key
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .context("GEMINI_API_KEY is required")
        }
    }

    fn parse_safe_limit(raw: Option<&str>) -> anyhow::Result<usize> {
        let limit = match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s
                .parse::<usize>()
                .with_context(|| format!("DELIVERY_SAFE_LIMIT must be an integer (got {s})"))?,
            None => DEFAULT_SAFE_LIMIT,
        };
        anyhow::ensure!(
            limit >= MIN_SEGMENT_LIMIT,
            "DELIVERY_SAFE_LIMIT must be at least {MIN_SEGMENT_LIMIT} (got {limit})"
        );
        Ok(limit)
    }

    fn env_or(key: &str, default: &str) -> String {
        std::env::var(key)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

}
