use anyhow::Context;
use clap::Parser;
use sinyal_core::market::types::Timeframe;
use sinyal_core::service::ReportService;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sinyal_worker")]
struct Args {
    /// Token ticker, e.g. BTC.
    #[arg(long)]
    symbol: String,

    /// Analysis horizon: 1h, 24h or 7d.
    #[arg(long, default_value = "24h")]
    timeframe: Timeframe,

    /// Maximum characters per printed segment. Defaults to DELIVERY_SAFE_LIMIT.
    #[arg(long)]
    limit: Option<usize>,

    /// Print the report as one block instead of delivery segments.
    #[arg(long)]
    whole: bool,
}

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

    let args = Args::parse();

    let result = run(&settings, &args).await;
    if let Err(err) = &result {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(symbol = %args.symbol, timeframe = %args.timeframe, error = %format!("{err:#}"), "report run failed");
    }
    result
}

async fn run(settings: &sinyal_core::config::Settings, args: &Args) -> anyhow::Result<()> {
    let service = ReportService::from_settings(settings)?;
    let report = service.analyze(&args.symbol, args.timeframe).await?;

    if let Some(profile) = &report.profile {
        tracing::info!(
            id = %profile.id,
            name = %profile.name,
            price_usd = profile.current_price_usd,
            "coin profile"
        );
    }

    if args.whole {
        println!("{}", report.render());
    } else {
        let limit = args.limit.unwrap_or(settings.delivery_safe_limit);
        let segments = report.segments(limit).context("invalid --limit")?;
        let total = segments.len();
        for segment in segments {
            tracing::debug!(index = segment.index, total, chars = segment.char_len(), "segment");
            println!("{}", segment.text);
        }
    }

    anyhow::ensure!(report.is_success(), "report generation failed for {}", report.symbol);
    Ok(())
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
