//! Standalone Binance liquidation recorder.
//!
//! Runs only the Binance adapter: subscribe to the force-order stream and
//! append qualifying events to the journal. A hub process (or anything else
//! that can tail a CSV) consumes the file independently.
//!
//! Usage:  cargo run --bin binance_recorder

use liqhub::config::Config;
use liqhub::feeds::BinanceAdapter;
use liqhub::journal::Journal;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::load_or_default();
    config.validate()?;

    info!("Binance liquidation recorder");
    info!("  Journal:   {}", config.binance.journal_path);
    info!("  Threshold: {} USDT", config.binance.threshold_usdt);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let journal = Arc::new(Journal::new(&config.binance.journal_path));
    let adapter = BinanceAdapter::new(config.binance, journal);
    let stats = adapter.stats();
    adapter.start(shutdown_tx.subscribe());

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(());
    info!("Recorder stopped. Totals: {}", stats.summary());
    Ok(())
}
