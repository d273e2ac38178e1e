use crate::config::Settings;
use crate::http::{ResilientClient, RetryPolicy};
use crate::market::types::CoinProfile;
use crate::market::{market_retry, market_timeout, parse_num};
use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const NO_DESCRIPTION: &str = "Tidak ada deskripsi.";
const DESCRIPTION_SENTENCES: usize = 2;

#[derive(Clone)]
pub struct CoinGeckoClient {
    client: ResilientClient,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl CoinGeckoClient {
    pub fn new(
        client: ResilientClient,
        base_url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
            retry,
        }
    }

    pub fn from_settings(client: ResilientClient, settings: &Settings) -> Self {
        Self::new(
            client,
            settings.coingecko_api_url.clone(),
            market_timeout(),
            market_retry(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Most relevant CoinGecko id for a ticker symbol.
    pub async fn search_id(&self, symbol: &str) -> Result<Option<String>> {
        let res = self
            .client
            .get(
                &self.url("/search"),
                HeaderMap::new(),
                &[("query", symbol.trim().to_string())],
                self.timeout,
                self.retry,
            )
            .await
            .with_context(|| format!("coingecko search failed for {symbol}"))?;
        let body: SearchResponse = res.json()?;
        Ok(body.coins.into_iter().next().map(|c| c.id))
    }

    pub async fn coin_profile(&self, symbol: &str) -> Result<Option<CoinProfile>> {
        let Some(id) = self.search_id(symbol).await? else {
            tracing::info!(symbol, "symbol not listed on coingecko");
            return Ok(None);
        };

        let query = [
            ("localization", "false".to_string()),
            ("tickers", "true".to_string()),
            ("market_data", "true".to_string()),
            ("community_data", "false".to_string()),
            ("developer_data", "false".to_string()),
            ("sparkline", "false".to_string()),
        ];
        let res = self
            .client
            .get(
                &self.url(&format!("/coins/{id}")),
                HeaderMap::new(),
                &query,
                self.timeout,
                self.retry,
            )
            .await
            .with_context(|| format!("coingecko profile fetch failed for {id}"))?;
        let detail: CoinDetail = res.json()?;
        Ok(Some(profile_from_detail(id, detail)))
    }
}

fn profile_from_detail(id: String, detail: CoinDetail) -> CoinProfile {
    let usd = |v: &Option<Value>| {
        v.as_ref()
            .and_then(|m| m.get("usd"))
            .and_then(parse_num)
            .unwrap_or(0.0)
    };
    let market = detail.market_data.unwrap_or_default();

    CoinProfile {
        name: detail.name.unwrap_or_else(|| "N/A".to_string()),
        description: short_description(detail.description.as_ref().and_then(|d| d.en.as_deref())),
        market_cap_usd: usd(&market.market_cap),
        total_volume_usd: usd(&market.total_volume),
        total_supply: market.total_supply.as_ref().and_then(parse_num),
        current_price_usd: usd(&market.current_price),
        binance_symbol: binance_spot_symbol(&detail.tickers),
        image_url: detail.image.and_then(|i| i.small),
        id,
    }
}

/// Base asset of the first fresh Binance spot market quoted in USDT.
pub fn binance_spot_symbol(tickers: &[Ticker]) -> Option<String> {
    tickers
        .iter()
        .find(|t| {
            let market = t.market.as_ref().and_then(|m| m.name.as_deref()).unwrap_or("");
            market.contains("Binance")
                && !market.contains("Futures")
                && t.target.as_deref() == Some("USDT")
                && !t.is_stale.unwrap_or(true)
        })
        .and_then(|t| t.base.as_deref())
        .map(|base| base.strip_suffix("PERP").unwrap_or(base).to_string())
}

/// First two sentences, always ending with a period.
pub fn short_description(text: Option<&str>) -> String {
    let text = match text.map(str::trim) {
        Some(t) if !t.is_empty() => t,
        _ => return NO_DESCRIPTION.to_string(),
    };

    let mut short = text
        .split(". ")
        .take(DESCRIPTION_SENTENCES)
        .collect::<Vec<_>>()
        .join(". ");
    if !short.ends_with('.') {
        short.push('.');
    }
    short
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    coins: Vec<SearchCoin>,
}

#[derive(Debug, Deserialize)]
struct SearchCoin {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CoinDetail {
    name: Option<String>,
    description: Option<Localized>,
    image: Option<Images>,
    market_data: Option<MarketData>,
    #[serde(default)]
    tickers: Vec<Ticker>,
}

#[derive(Debug, Deserialize)]
struct Localized {
    en: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Images {
    small: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MarketData {
    market_cap: Option<Value>,
    total_volume: Option<Value>,
    total_supply: Option<Value>,
    current_price: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ticker {
    pub base: Option<String>,
    pub target: Option<String>,
    pub market: Option<TickerMarket>,
    pub is_stale: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerMarket {
    pub name: Option<String>,
}
