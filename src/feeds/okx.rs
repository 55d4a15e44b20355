use crate::config::OkxConfig;
use crate::feeds::convert::ContractConverter;
use crate::feeds::AdapterStats;
use crate::journal::Journal;
use crate::models::event::{from_epoch_ms, Direction, Exchange, LiquidationEvent};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const RECV_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Ingests the OKX SWAP liquidation-orders channel.
///
/// OKX expects an application-layer textual `ping` at most every 30 seconds
/// and answers with a textual `pong`; the transport-level keepalive stays
/// off. Each push carries a list of details per instrument; they are
/// processed sequentially so cache writes and journal appends for the same
/// contract never race with themselves.
pub struct OkxAdapter {
    config: OkxConfig,
    journal: Arc<Journal>,
    converter: Arc<ContractConverter>,
    stats: Arc<AdapterStats>,
}

impl OkxAdapter {
    pub fn new(config: OkxConfig, journal: Arc<Journal>, converter: Arc<ContractConverter>) -> Self {
        Self {
            config,
            journal,
            converter,
            stats: Arc::new(AdapterStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<AdapterStats> {
        self.stats.clone()
    }

    /// Start the reconnecting receive loop plus its heartbeat task.
    pub fn start(&self, mut shutdown: broadcast::Receiver<()>) {
        let config = self.config.clone();
        let journal = self.journal.clone();
        let converter = self.converter.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut reconnects: u64 = 0;

            loop {
                info!("Connecting to OKX public WS: {}", config.ws_url);

                let conn = tokio::select! {
                    result = connect_async(&config.ws_url) => result,
                    _ = shutdown.recv() => {
                        info!("OKX adapter shutdown");
                        return;
                    }
                };

                match conn {
                    Ok((ws_stream, _)) => {
                        info!("OKX WS connected (reconnect count: {reconnects})");
                        reconnects = 0;

                        let (mut write, mut read) = ws_stream.split();

                        let subscribe = serde_json::json!({
                            "op": "subscribe",
                            "args": [{
                                "channel": "liquidation-orders",
                                "instType": "SWAP"
                            }]
                        });
                        if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
                            error!("OKX subscribe send failed: {e}");
                        } else {
                            info!("Sent OKX liquidation-orders subscription");

                            // The heartbeat task takes sole ownership of the
                            // write half; the receive loop only reads.
                            let heartbeat = tokio::spawn(async move {
                                let mut timer = tokio::time::interval(HEARTBEAT_INTERVAL);
                                timer.set_missed_tick_behavior(
                                    tokio::time::MissedTickBehavior::Delay,
                                );
                                // An interval's first tick is immediate
                                timer.tick().await;
                                loop {
                                    timer.tick().await;
                                    if write.send(Message::Text("ping".to_string())).await.is_err()
                                    {
                                        debug!("OKX heartbeat send failed");
                                        return;
                                    }
                                    debug!("Sent OKX heartbeat ping");
                                }
                            });

                            loop {
                                let msg = tokio::select! {
                                    msg = tokio::time::timeout(RECV_IDLE_TIMEOUT, read.next()) => msg,
                                    _ = shutdown.recv() => {
                                        heartbeat.abort();
                                        info!("OKX adapter shutdown ({})", stats.summary());
                                        return;
                                    }
                                };

                                match msg {
                                    Err(_) => {
                                        warn!(
                                            "No OKX data for {}s, forcing reconnect",
                                            RECV_IDLE_TIMEOUT.as_secs()
                                        );
                                        break;
                                    }
                                    Ok(Some(Ok(Message::Text(text)))) => {
                                        if text == "pong" {
                                            debug!("Received OKX pong");
                                            continue;
                                        }
                                        Self::handle_frame(
                                            &text,
                                            config.threshold_usdt,
                                            &journal,
                                            &converter,
                                            &stats,
                                        )
                                        .await;
                                    }
                                    Ok(Some(Ok(_))) => {}
                                    Ok(Some(Err(e))) => {
                                        warn!("OKX WS error: {e}");
                                        break;
                                    }
                                    Ok(None) => {
                                        warn!("OKX WS stream ended");
                                        break;
                                    }
                                }
                            }

                            heartbeat.abort();
                        }
                    }
                    Err(e) => {
                        error!("OKX WS connection failed: {e}");
                    }
                }

                reconnects += 1;
                warn!("Reconnecting to OKX in {}s...", RECONNECT_DELAY.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.recv() => {
                        info!("OKX adapter shutdown ({})", stats.summary());
                        return;
                    }
                }
            }
        });
    }

    async fn handle_frame(
        text: &str,
        threshold: f64,
        journal: &Journal,
        converter: &ContractConverter,
        stats: &AdapterStats,
    ) {
        let push: OkxPush = match serde_json::from_str(text) {
            Ok(p) => p,
            Err(e) => {
                debug!("Unparseable OKX frame: {e}");
                return;
            }
        };

        // Subscription acks and channel errors carry an `event` field
        if let Some(event) = &push.event {
            match event.as_str() {
                "subscribe" => info!("OKX subscription confirmed: {:?}", push.arg),
                "error" => warn!("OKX channel error: {:?}", push.msg),
                other => debug!("OKX event frame: {other}"),
            }
            return;
        }

        for item in &push.data {
            for detail in &item.details {
                Self::handle_detail(&item.inst_id, detail, threshold, journal, converter, stats)
                    .await;
            }
        }
    }

    async fn handle_detail(
        inst_id: &str,
        detail: &OkxDetail,
        threshold: f64,
        journal: &Journal,
        converter: &ContractConverter,
        stats: &AdapterStats,
    ) {
        let Some(timestamp) = detail.ts.parse::<i64>().ok().and_then(from_epoch_ms) else {
            warn!("Bad OKX timestamp {:?} for {inst_id}", detail.ts);
            return;
        };

        let Some(direction) = map_direction(&detail.side, &detail.pos_side) else {
            warn!(
                "Unknown OKX direction combo side={} posSide={} inst={inst_id}",
                detail.side, detail.pos_side
            );
            return;
        };

        let bk_px = detail.bk_px.trim();
        if bk_px.is_empty() {
            warn!("Missing bankruptcy price for {inst_id}, skipping");
            return;
        }
        let Ok(price) = bk_px.parse::<f64>() else {
            warn!("Invalid bankruptcy price {bk_px:?} for {inst_id}");
            return;
        };
        if !(price > 0.0 && price.is_finite()) {
            warn!("Non-positive bankruptcy price {price} for {inst_id}");
            return;
        }

        stats.incr_received();

        let coins = match converter.to_coin(inst_id, &detail.sz, bk_px).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Contract conversion failed for {inst_id}: {e}");
                return;
            }
        };

        // Whole-USDT precision is plenty for notionals; matches the
        // historical journal rows.
        let amount = (coins * price).round();
        let symbol = inst_id.split('-').next().unwrap_or(inst_id).to_uppercase();

        if amount >= threshold {
            let event = LiquidationEvent {
                timestamp,
                symbol,
                exchange: Exchange::Okx,
                price,
                direction,
                amount,
            };
            match journal.append(&event).await {
                Ok(()) => {
                    stats.incr_written();
                    info!(
                        "Journaled: {} {} {:?} price={} amount={} | {} | {}",
                        event.datetime_string(),
                        event.symbol,
                        event.direction,
                        event.price,
                        event.amount,
                        stats.summary(),
                        converter.stats().summary(),
                    );
                }
                Err(e) => {
                    error!("Journal append failed: {e}");
                }
            }
        } else {
            let filtered = stats.incr_filtered();
            if filtered % 50 == 0 {
                debug!("Filtered {filtered} sub-threshold OKX orders");
            }
        }
    }
}

/// Strict direction policy: only the two self-consistent side/posSide
/// combinations are accepted.
fn map_direction(side: &str, pos_side: &str) -> Option<Direction> {
    match (side, pos_side) {
        ("sell", "long") => Some(Direction::LongLiquidated),
        ("buy", "short") => Some(Direction::ShortLiquidated),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct OkxPush {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    arg: Option<serde_json::Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Vec<OkxLiquidation>,
}

#[derive(Debug, Deserialize)]
struct OkxLiquidation {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(default)]
    details: Vec<OkxDetail>,
}

#[derive(Debug, Deserialize)]
struct OkxDetail {
    ts: String,
    side: String,
    #[serde(rename = "posSide")]
    pos_side: String,
    #[serde(rename = "bkPx", default)]
    bk_px: String,
    sz: String,
}
