//! Standalone OKX liquidation recorder.
//!
//! Runs only the OKX adapter: subscribe to the SWAP liquidation-orders
//! channel, resolve contract sizes through the ratio cache, and append
//! qualifying events to the journal.
//!
//! Usage:  cargo run --bin okx_recorder

use liqhub::config::Config;
use liqhub::feeds::convert::{ContractConverter, ConversionCache};
use liqhub::feeds::OkxAdapter;
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

    let cache = ConversionCache::load(&config.okx.cache_path);
    info!("OKX liquidation recorder");
    info!("  Journal:     {}", config.okx.journal_path);
    info!("  Ratio cache: {} ({} entries)", config.okx.cache_path, cache.len());
    info!("  Threshold:   {} USDT", config.okx.threshold_usdt);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let converter = Arc::new(ContractConverter::new(config.okx.rest_url.clone(), cache));
    let journal = Arc::new(Journal::new(&config.okx.journal_path));
    let adapter = OkxAdapter::new(config.okx, journal, converter.clone());
    let stats = adapter.stats();
    adapter.start(shutdown_tx.subscribe());

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(());
    info!(
        "Recorder stopped. Totals: {} | {}",
        stats.summary(),
        converter.stats().summary()
    );
    Ok(())
}
