use liqhub::api::http::ApiState;
use liqhub::api::{http, ws};
use liqhub::config::Config;
use liqhub::fanout::FanoutBroker;
use liqhub::feeds::convert::{ContractConverter, ConversionCache};
use liqhub::feeds::{BinanceAdapter, OkxAdapter};
use liqhub::journal::{Journal, JournalTailer};
use liqhub::store::EventStore;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

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

    info!("================================================");
    info!("  LIQHUB — Liquidation monitor v0.1.0");
    info!("  Binance + OKX ingest, rolling stats, fan-out");
    info!("================================================");

    let config = Config::load_or_default();
    config.validate()?;

    info!("--- Configuration ---");
    info!("  BA journal:   {}", config.binance.journal_path);
    info!("  OKX journal:  {}", config.okx.journal_path);
    info!("  Ratio cache:  {}", config.okx.cache_path);
    info!("  Threshold:    {} USDT", config.binance.threshold_usdt);
    info!("  Retention:    {}h", config.store.retention_hours);
    info!("  HTTP port:    {}", config.server.http_port);
    info!("  WS port:      {}", config.server.ws_port);

    // Shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // === Core state ===
    let broker = Arc::new(FanoutBroker::new());
    let store = Arc::new(EventStore::new(
        chrono::Duration::hours(config.store.retention_hours),
        broker.clone(),
    ));

    // === Exchange adapters (write side) ===
    let ba_journal = Arc::new(Journal::new(&config.binance.journal_path));
    let binance = BinanceAdapter::new(config.binance.clone(), ba_journal);
    binance.start(shutdown_tx.subscribe());
    info!("Binance adapter started");

    let cache = ConversionCache::load(&config.okx.cache_path);
    info!("Contract ratio cache: {} entries", cache.len());
    let converter = Arc::new(ContractConverter::new(config.okx.rest_url.clone(), cache));
    let okx_journal = Arc::new(Journal::new(&config.okx.journal_path));
    let okx = OkxAdapter::new(config.okx.clone(), okx_journal, converter);
    okx.start(shutdown_tx.subscribe());
    info!("OKX adapter started");

    // === Journal tailers (read side) ===
    // The first poll replays each journal from the top, which doubles as
    // the bootstrap of the rolling window after a hub restart.
    let poll_interval = Duration::from_millis(config.store.poll_interval_ms);
    JournalTailer::new(&config.binance.journal_path, store.clone(), poll_interval)
        .start(shutdown_tx.subscribe());
    JournalTailer::new(&config.okx.journal_path, store.clone(), poll_interval)
        .start(shutdown_tx.subscribe());
    info!("Journal tailers started");

    // === Periodic pruner ===
    {
        let store = store.clone();
        let prune_interval = Duration::from_secs(config.store.prune_interval_secs);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(prune_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => store.prune().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    // === Servers ===
    let api_state = ApiState {
        store: store.clone(),
        latest_list_size: config.server.latest_list_size,
        sse_interval: Duration::from_secs(config.server.sse_interval_secs),
    };
    let mut http_server = tokio::spawn(http::serve(
        api_state,
        config.server.http_port,
        shutdown_tx.subscribe(),
    ));
    let mut ws_server = tokio::spawn(ws::serve(
        broker,
        config.server.ws_port,
        shutdown_tx.subscribe(),
    ));

    info!("=== LIQHUB running ===");
    info!("Press Ctrl+C to shutdown.");

    // A server that returns early did so because of an error (bind failure
    // or fatal accept loop error); propagate it for a nonzero exit.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Cleaning up...");
        }
        result = &mut http_server => {
            let _ = shutdown_tx.send(());
            result??;
            anyhow::bail!("HTTP server exited unexpectedly");
        }
        result = &mut ws_server => {
            let _ = shutdown_tx.send(());
            result??;
            anyhow::bail!("WS server exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = http_server.await {
        error!("HTTP server join error: {e}");
    }
    if let Err(e) = ws_server.await {
        error!("WS server join error: {e}");
    }

    info!("LIQHUB shutdown complete. {} events resident.", store.len().await);
    Ok(())
}
