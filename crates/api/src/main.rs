use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sinyal_core::market::types::{CoinProfile, Timeframe};
use sinyal_core::service::{AnalysisReport, ReportService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = sinyal_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let service = match ReportService::from_settings(&settings) {
        Ok(service) => Some(Arc::new(service)),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %format!("{e:#}"), "report service unavailable; starting API in degraded mode");
            None
        }
    };

    let state = AppState {
        service,
        safe_limit: settings.delivery_safe_limit,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/reports/:symbol/:timeframe", get(get_report))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    service: Option<Arc<ReportService>>,
    safe_limit: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    #[serde(default)]
    chunked: bool,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ApiReport {
    symbol: String,
    timeframe: Timeframe,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<CoinProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    segments: Option<Vec<String>>,
}

async fn get_report(
    State(state): State<AppState>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<ApiReport>, StatusCode> {
    let Some(service) = &state.service else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let timeframe: Timeframe = timeframe.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    let report = service.analyze(&symbol, timeframe).await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        tracing::error!(%symbol, %timeframe, error = %format!("{e:#}"), "report request failed");
        StatusCode::BAD_GATEWAY
    })?;

    if !report.is_success() {
        tracing::warn!(symbol = %report.symbol, %timeframe, "report generation failed");
    }

    to_api_report(report, &query, state.safe_limit).map(Json)
}

fn to_api_report(
    report: AnalysisReport,
    query: &ReportQuery,
    default_limit: usize,
) -> Result<ApiReport, StatusCode> {
    let (text, segments) = if query.chunked {
        let limit = query.limit.unwrap_or(default_limit);
        let segments = report
            .segments(limit)
            .map_err(|_| StatusCode::BAD_REQUEST)?
            .into_iter()
            .map(|s| s.text)
            .collect();
        (None, Some(segments))
    } else {
        (Some(report.render()), None)
    };

    Ok(ApiReport {
        ok: report.is_success(),
        symbol: report.symbol,
        timeframe: report.timeframe,
        profile: report.profile,
        text,
        segments,
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &sinyal_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
