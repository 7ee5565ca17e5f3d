use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use trendbot::broker::{Broker, HttpBroker, MarketScenario, PaperBroker, SyntheticMarket};
use trendbot::config::{AppConfig, BrokerKind};
use trendbot::{EngineEvent, TradingEngine};

// Starting price for the paper market (gold-like)
const PAPER_START_PRICE: f64 = 2300.0;

#[derive(Parser, Debug)]
#[command(name = "trendbot")]
#[command(version, about = "SMA crossover trend follower with ATR risk sizing", long_about = None)]
struct Cli {
    /// Config file layered over config/default.toml (overrides TRENDBOT_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker to trade through, overriding the config
    #[arg(short, long, value_enum)]
    broker: Option<BrokerKind>,

    /// Print engine events as JSON lines on stdout
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(Path::new("config"), cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(kind) = cli.broker {
        config.broker.kind = kind;
    }
    config.logging.json_events |= cli.json_events;

    setup_logging(&config);

    tracing::info!("🚀 TrendBot starting");
    tracing::info!("📊 Configuration:");
    tracing::info!(
        "  Symbol: {} ({}, {} mode)",
        config.feed.symbol,
        config.feed.timeframe,
        if config.feed.tick_mode { "tick" } else { "bar" }
    );
    tracing::info!(
        "  SMA {}/{}  ATR {}  policy {:?}",
        config.strategy.fast_period,
        config.strategy.slow_period,
        config.strategy.atr_period,
        config.strategy.crossover_policy
    );
    tracing::info!(
        "  Risk {:.1}%  stop {}xATR  TP {}x  max positions {}",
        config.risk.risk_fraction * 100.0,
        config.risk.stop_atr_multiple,
        config.risk.take_profit_multiple,
        config.risk.max_positions
    );

    let broker = create_broker(&config)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let event_task = tokio::spawn(log_events(rx, config.logging.json_events));

    let mut engine = TradingEngine::new(config, broker)?.with_events(tx);
    engine.start().await;

    engine
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        })
        .await;

    if let Err(e) = engine.stop().await {
        // Not fatal: the poll task only reads market data
        tracing::warn!("Shutdown incomplete: {}", e);
    }

    // Dropping the engine closes the event channel
    drop(engine);
    let _ = event_task.await;

    tracing::info!("👋 Goodbye");
    Ok(())
}

fn setup_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn create_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.broker.kind {
        BrokerKind::Paper => {
            tracing::info!(
                seed = config.broker.paper_seed,
                balance = config.broker.paper_balance,
                "Using paper broker"
            );
            let market = SyntheticMarket::new(
                config.broker.paper_seed,
                MarketScenario::Volatile,
                PAPER_START_PRICE,
            );
            let broker = PaperBroker::new(config.feed.symbol.clone(), config.broker.paper_balance)
                .with_market(market);
            Ok(Arc::new(broker))
        }
        BrokerKind::Http => {
            tracing::info!(url = %config.broker.base_url, "Using HTTP bridge broker");
            let broker =
                HttpBroker::new(&config.broker).context("failed to create HTTP broker")?;
            Ok(Arc::new(broker))
        }
    }
}

/// Mirror engine events to the log, as JSON lines when enabled
async fn log_events(mut rx: mpsc::UnboundedReceiver<EngineEvent>, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
            continue;
        }

        match &event {
            EngineEvent::Filled {
                side,
                volume,
                price,
                positions,
                ..
            } => tracing::info!(
                "✅ {} {:.2} @ {:.2} (open positions: {})",
                side,
                volume,
                price,
                positions
            ),
            EngineEvent::OrderFailed { reason, .. } => {
                tracing::warn!("❌ Order failed: {}", reason)
            }
            EngineEvent::ClosedAll { found, closed, .. } => {
                tracing::info!("🔒 Closed {}/{} positions", closed, found)
            }
            other => tracing::debug!(event = ?other, "Engine event"),
        }
    }
}
