use crate::config::Settings;
use crate::delivery::{self, DeliverySegment, LimitTooSmall};
use crate::http::ResilientClient;
use crate::llm::gemini::ReportGenerator;
use crate::llm::{GenerationOutcome, GenerationRequest};
use crate::market::binance::BinanceClient;
use crate::market::coingecko::CoinGeckoClient;
use crate::market::types::{CoinProfile, Timeframe};
use crate::market::MarketDataProvider;
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub profile: Option<CoinProfile>,
    pub outcome: GenerationOutcome,
}

impl AnalysisReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn render(&self) -> String {
        self.outcome.render()
    }

    pub fn segments(&self, limit: usize) -> Result<Vec<DeliverySegment>, LimitTooSmall> {
        delivery::split(&self.render(), limit)
    }
}

/// Resolves a token, gathers its market data and asks the generator for a report.
#[derive(Clone)]
pub struct ReportService {
    coingecko: CoinGeckoClient,
    market: Arc<dyn MarketDataProvider>,
    generator: ReportGenerator,
}

impl ReportService {
    pub fn new(
        coingecko: CoinGeckoClient,
        market: Arc<dyn MarketDataProvider>,
        generator: ReportGenerator,
    ) -> Self {
        Self {
            coingecko,
            market,
            generator,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let client = ResilientClient::from_reqwest()?;
        let generator = ReportGenerator::from_settings(client.clone(), settings)
            .context("failed to configure report generator")?;
        Ok(Self::new(
            CoinGeckoClient::from_settings(client.clone(), settings),
            Arc::new(BinanceClient::from_settings(client, settings)),
            generator,
        ))
    }

    pub async fn analyze(&self, token: &str, timeframe: Timeframe) -> Result<AnalysisReport> {
        let token = token.trim();
        anyhow::ensure!(!token.is_empty(), "token symbol is empty");

        let profile = match self.coingecko.coin_profile(token).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(token, error = %err, "coin profile lookup failed; continuing without it");
                None
            }
        };

        let symbol = profile
            .as_ref()
            .and_then(|p| p.binance_symbol.clone())
            .unwrap_or_else(|| token.to_uppercase());

        let snapshot = self
            .market
            .snapshot(&symbol, timeframe)
            .await
            .with_context(|| {
                format!(
                    "failed to fetch market data for {symbol} from {}",
                    self.market.provider_name()
                )
            })?;

        tracing::info!(
            symbol = %symbol,
            timeframe = %timeframe,
            candles = snapshot.candles.len(),
            "market snapshot ready"
        );

        let request = GenerationRequest {
            symbol: snapshot.symbol,
            timeframe,
            candles: snapshot.candles,
            funding_rate: snapshot.funding_rate,
            long_short_ratio: snapshot.long_short_ratio,
            sampling: self.generator.default_sampling(),
        };
        let outcome = self.generator.generate(&request).await;

        Ok(AnalysisReport {
            symbol: request.symbol,
            timeframe,
            profile,
            outcome,
        })
    }
}
