use crate::http::RetryPolicy;
use crate::market::types::{MarketSnapshot, Timeframe};
use anyhow::Result;
use serde_json::Value;
use std::time::Duration;

pub mod binance;
pub mod coingecko;
pub mod types;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRIES: u32 = 1;
const DEFAULT_BACKOFF_MS: u64 = 500;

pub(crate) fn market_timeout() -> Duration {
    let secs = std::env::var("MARKET_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

pub(crate) fn market_retry() -> RetryPolicy {
    RetryPolicy::new(DEFAULT_RETRIES, Duration::from_millis(DEFAULT_BACKOFF_MS))
}

#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Candles are required; the sentiment summaries degrade to a placeholder.
    async fn snapshot(&self, symbol: &str, timeframe: Timeframe) -> Result<MarketSnapshot>;
}

/// Reads a number that providers send either as a JSON number or a decimal string.
pub(crate) fn parse_num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
