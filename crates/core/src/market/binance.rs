use crate::config::Settings;
use crate::http::{ResilientClient, RetryPolicy};
use crate::market::types::{Candle, MarketSnapshot, Timeframe, UNAVAILABLE};
use crate::market::{market_retry, market_timeout, parse_num, MarketDataProvider};
use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const KLINE_LIMIT: u32 = 100;
const LONG_SHORT_PERIOD: &str = "5m";

#[derive(Clone)]
pub struct BinanceClient {
    client: ResilientClient,
    spot_url: String,
    futures_url: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl BinanceClient {
    pub fn new(
        client: ResilientClient,
        spot_url: impl Into<String>,
        futures_url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            spot_url: spot_url.into(),
            futures_url: futures_url.into(),
            timeout,
            retry,
        }
    }

    pub fn from_settings(client: ResilientClient, settings: &Settings) -> Self {
        Self::new(
            client,
            settings.binance_spot_api_url.clone(),
            settings.binance_futures_api_url.clone(),
            market_timeout(),
            market_retry(),
        )
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let res = self
            .client
            .get(url, HeaderMap::new(), query, self.timeout, self.retry)
            .await?;
        res.json::<Value>()
    }

    pub async fn klines(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
        let url = format!("{}/api/v3/klines", self.spot_url.trim_end_matches('/'));
        let query = [
            ("symbol", pair(symbol)),
            ("interval", timeframe.kline_interval().to_string()),
            ("limit", KLINE_LIMIT.to_string()),
        ];
        let body = self
            .get_json(&url, &query)
            .await
            .with_context(|| format!("failed to fetch klines for {}", pair(symbol)))?;

        let rows = body
            .as_array()
            .with_context(|| format!("klines response is not an array: {body}"))?;
        rows.iter()
            .map(parse_kline)
            .collect::<Result<Vec<_>>>()
    }

    pub async fn funding_rate(&self, symbol: &str) -> Result<String> {
        let url = format!("{}/fapi/v1/premiumIndex", self.futures_url.trim_end_matches('/'));
        let body: PremiumIndex = serde_json::from_value(
            self.get_json(&url, &[("symbol", pair(symbol))]).await?,
        )
        .context("unexpected premiumIndex shape")?;

        let rate = parse_num(&body.last_funding_rate).context("lastFundingRate is not a number")?;
        Ok(format!("{:.4}%", rate * 100.0))
    }

    pub async fn long_short_ratio(&self, symbol: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/futures/data/globalLongShortAccountRatio",
            self.futures_url.trim_end_matches('/')
        );
        let query = [
            ("symbol", pair(symbol)),
            ("period", LONG_SHORT_PERIOD.to_string()),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<LongShortRow> = serde_json::from_value(self.get_json(&url, &query).await?)
            .context("unexpected long/short ratio shape")?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let ratio = parse_num(&row.long_short_ratio).context("longShortRatio is not a number")?;
        let long = parse_num(&row.long_account).context("longAccount is not a number")?;
        let short = parse_num(&row.short_account).context("shortAccount is not a number")?;
        Ok(Some(format!(
            "{ratio:.2} (Long: {:.1}%, Short: {:.1}%)",
            long * 100.0,
            short * 100.0
        )))
    }
}

#[async_trait::async_trait]
impl MarketDataProvider for BinanceClient {
    fn provider_name(&self) -> &'static str {
        "binance"
    }

    async fn snapshot(&self, symbol: &str, timeframe: Timeframe) -> Result<MarketSnapshot> {
        let (candles, funding, ratio) = tokio::join!(
            self.klines(symbol, timeframe),
            self.funding_rate(symbol),
            self.long_short_ratio(symbol),
        );

        let candles = candles?;
        anyhow::ensure!(!candles.is_empty(), "no candles returned for {}", pair(symbol));

        let funding_rate = funding.unwrap_or_else(|err| {
            tracing::warn!(symbol, error = %err, "funding rate unavailable");
            UNAVAILABLE.to_string()
        });
        let long_short_ratio = match ratio {
            Ok(Some(s)) => s,
            Ok(None) => UNAVAILABLE.to_string(),
            Err(err) => {
                tracing::warn!(symbol, error = %err, "long/short ratio unavailable");
                UNAVAILABLE.to_string()
            }
        };

        Ok(MarketSnapshot {
            symbol: symbol.to_uppercase(),
            timeframe,
            candles,
            funding_rate,
            long_short_ratio,
        })
    }
}

/// Binance quotes everything analysed here against USDT.
pub fn pair(symbol: &str) -> String {
    format!("{}USDT", symbol.trim().to_uppercase())
}

fn parse_kline(row: &Value) -> Result<Candle> {
    let cols = row
        .as_array()
        .filter(|c| c.len() >= 6)
        .with_context(|| format!("malformed kline row: {row}"))?;
    let num = |i: usize| {
        parse_num(&cols[i]).with_context(|| format!("kline column {i} is not a number: {row}"))
    };

    Ok(Candle {
        time: cols[0]
            .as_i64()
            .with_context(|| format!("kline open time is not an integer: {row}"))?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    last_funding_rate: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LongShortRow {
    long_short_ratio: Value,
    long_account: Value,
    short_account: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{ok, status, ScriptedTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn client(transport: &Arc<ScriptedTransport>) -> BinanceClient {
        BinanceClient::new(
            ResilientClient::new(transport.clone()),
            "https://spot.test",
            "https://futures.test/",
            Duration::from_secs(10),
            RetryPolicy::none(),
        )
    }

    fn query_of(transport: &ScriptedTransport, i: usize) -> Vec<(String, String)> {
        transport.requests()[i].query.clone()
    }

    #[tokio::test]
    async fn parses_klines_and_maps_interval() {
        let transport = ScriptedTransport::new(vec![ok(json!([
            [1700000000000i64, "100.5", "110", "99", "105.25", "1234.5", 1700014399999i64],
            [1700014400000i64, "105.25", "107", "101", "102", "900", 1700028799999i64]
        ]))]);

        let candles = client(&transport)
            .klines("btc", Timeframe::OneDay)
            .await
            .unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 1700000000000);
        assert_eq!(candles[0].close, 105.25);
        assert_eq!(candles[1].volume, 900.0);
        assert_eq!(transport.urls(), vec!["https://spot.test/api/v3/klines"]);
        assert_eq!(
            query_of(&transport, 0),
            vec![
                ("symbol".to_string(), "BTCUSDT".to_string()),
                ("interval".to_string(), "4h".to_string()),
                ("limit".to_string(), "100".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn rejects_malformed_kline_rows() {
        let transport = ScriptedTransport::new(vec![ok(json!([[1, "x", "2", "3", "4", "5"]]))]);
        assert!(client(&transport).klines("BTC", Timeframe::OneHour).await.is_err());
    }

    #[tokio::test]
    async fn formats_funding_rate_as_percent() {
        let transport =
            ScriptedTransport::new(vec![ok(json!({"symbol": "BTCUSDT", "lastFundingRate": "0.00012340"}))]);
        let rate = client(&transport).funding_rate("BTC").await.unwrap();
        assert_eq!(rate, "0.0123%");
        assert_eq!(transport.urls(), vec!["https://futures.test/fapi/v1/premiumIndex"]);
    }

    #[tokio::test]
    async fn formats_long_short_ratio() {
        let transport = ScriptedTransport::new(vec![ok(json!([{
            "symbol": "BTCUSDT",
            "longShortRatio": "1.8512",
            "longAccount": "0.6493",
            "shortAccount": "0.3507",
            "timestamp": 1700000000000i64
        }]))]);
        let ratio = client(&transport).long_short_ratio("BTC").await.unwrap();
        assert_eq!(ratio.as_deref(), Some("1.85 (Long: 64.9%, Short: 35.1%)"));
        assert_eq!(
            query_of(&transport, 0)[1],
            ("period".to_string(), "5m".to_string())
        );
    }

    #[tokio::test]
    async fn snapshot_degrades_sentiment_but_requires_candles() {
        // Replies are consumed in request order: klines, premiumIndex, ratio.
        let transport = ScriptedTransport::new(vec![
            ok(json!([[1700000000000i64, "1", "2", "0.5", "1.5", "10"]])),
            status(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#),
            ok(json!([])),
        ]);
        let snapshot = client(&transport)
            .snapshot("pepe", Timeframe::OneWeek)
            .await
            .unwrap();

        assert_eq!(snapshot.symbol, "PEPE");
        assert_eq!(snapshot.candles.len(), 1);
        assert_eq!(snapshot.funding_rate, UNAVAILABLE);
        assert_eq!(snapshot.long_short_ratio, UNAVAILABLE);
    }

    #[tokio::test]
    async fn snapshot_fails_without_candles() {
        let transport = ScriptedTransport::new(vec![
            ok(json!([])),
            ok(json!({"lastFundingRate": "0.0001"})),
            ok(json!([])),
        ]);
        let err = client(&transport)
            .snapshot("BTC", Timeframe::OneHour)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no candles"));
    }
}
