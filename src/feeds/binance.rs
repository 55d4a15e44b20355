use crate::config::BinanceConfig;
use crate::feeds::AdapterStats;
use crate::journal::Journal;
use crate::models::event::{from_epoch_ms, normalize_symbol, Direction, Exchange, LiquidationEvent};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const RECV_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Ingests the Binance futures force-order stream.
///
/// Every liquidation push is normalized into a [`LiquidationEvent`] and, if
/// it clears the notional threshold, appended to the journal. The hub never
/// hears from this adapter directly; it picks the rows up through the
/// journal tailer.
pub struct BinanceAdapter {
    config: BinanceConfig,
    journal: Arc<Journal>,
    stats: Arc<AdapterStats>,
}

impl BinanceAdapter {
    pub fn new(config: BinanceConfig, journal: Arc<Journal>) -> Self {
        Self {
            config,
            journal,
            stats: Arc::new(AdapterStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<AdapterStats> {
        self.stats.clone()
    }

    /// Start the reconnecting receive loop. Runs until shutdown.
    pub fn start(&self, mut shutdown: broadcast::Receiver<()>) {
        let config = self.config.clone();
        let journal = self.journal.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut reconnects: u64 = 0;

            loop {
                info!("Connecting to Binance force-order stream: {}", config.ws_url);

                let conn = tokio::select! {
                    result = connect_async(&config.ws_url) => result,
                    _ = shutdown.recv() => {
                        info!("Binance adapter shutdown");
                        return;
                    }
                };

                match conn {
                    Ok((ws_stream, _)) => {
                        info!("Binance WS connected (reconnect count: {reconnects})");
                        reconnects = 0;

                        let (mut write, mut read) = ws_stream.split();
                        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
                        ping_timer
                            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        // Oldest ping still waiting for its pong
                        let mut awaiting_pong: Option<tokio::time::Instant> = None;
                        // The idle deadline must outlive select iterations:
                        // ping ticks fire far more often than the timeout,
                        // so a per-iteration timeout would never elapse.
                        let mut last_recv = tokio::time::Instant::now();

                        loop {
                            let pong_deadline = async move {
                                match awaiting_pong {
                                    Some(sent) => tokio::time::sleep_until(sent + PONG_TIMEOUT).await,
                                    None => std::future::pending().await,
                                }
                            };

                            tokio::select! {
                                msg = read.next() => {
                                    last_recv = tokio::time::Instant::now();
                                    match msg {
                                        Some(Ok(Message::Text(text))) => {
                                            Self::handle_payload(
                                                &text,
                                                config.threshold_usdt,
                                                &journal,
                                                &stats,
                                            )
                                            .await;
                                        }
                                        Some(Ok(Message::Ping(data))) => {
                                            let _ = write.send(Message::Pong(data)).await;
                                        }
                                        Some(Ok(Message::Pong(_))) => {
                                            awaiting_pong = None;
                                        }
                                        Some(Ok(_)) => {}
                                        Some(Err(e)) => {
                                            warn!("Binance WS error: {e}");
                                            break;
                                        }
                                        None => {
                                            warn!("Binance WS stream ended");
                                            break;
                                        }
                                    }
                                }
                                _ = tokio::time::sleep_until(last_recv + RECV_IDLE_TIMEOUT) => {
                                    warn!(
                                        "No Binance data for {}s, forcing reconnect",
                                        RECV_IDLE_TIMEOUT.as_secs()
                                    );
                                    break;
                                }
                                _ = ping_timer.tick() => {
                                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                                        warn!("Binance ping send failed");
                                        break;
                                    }
                                    if awaiting_pong.is_none() {
                                        awaiting_pong = Some(tokio::time::Instant::now());
                                    }
                                }
                                _ = pong_deadline => {
                                    warn!(
                                        "Binance pong overdue ({}s), forcing reconnect",
                                        PONG_TIMEOUT.as_secs()
                                    );
                                    break;
                                }
                                _ = shutdown.recv() => {
                                    info!("Binance adapter shutdown ({})", stats.summary());
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Binance WS connection failed: {e}");
                    }
                }

                reconnects += 1;
                warn!("Reconnecting to Binance in {}s...", RECONNECT_DELAY.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.recv() => {
                        info!("Binance adapter shutdown ({})", stats.summary());
                        return;
                    }
                }
            }
        });
    }

    /// A frame on `!forceOrder@arr` is usually an array of events but can be
    /// a bare object; both shapes run through the same pipeline.
    async fn handle_payload(
        text: &str,
        threshold: f64,
        journal: &Journal,
        stats: &AdapterStats,
    ) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("Unparseable Binance frame: {e}");
                return;
            }
        };

        let items = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };

        for item in items {
            let envelope: ForceOrderEvent = match serde_json::from_value(item) {
                Ok(ev) => ev,
                Err(_) => continue,
            };
            if envelope.event_type != "forceOrder" {
                continue;
            }

            stats.incr_received();
            let Some(event) = normalize(&envelope) else {
                warn!("Dropping malformed force order: {:?}", envelope.order);
                continue;
            };

            if event.amount >= threshold {
                match journal.append(&event).await {
                    Ok(()) => {
                        stats.incr_written();
                        info!(
                            "Journaled: {} {} {:?} price={:.2} amount={:.2} | {}",
                            event.datetime_string(),
                            event.symbol,
                            event.direction,
                            event.price,
                            event.amount,
                            stats.summary(),
                        );
                    }
                    Err(e) => {
                        error!("Journal append failed: {e}");
                    }
                }
            } else {
                let filtered = stats.incr_filtered();
                if filtered % 100 == 0 {
                    debug!(
                        "Filtered {filtered} sub-threshold orders (latest: {} {:.2})",
                        event.symbol, event.amount
                    );
                }
            }
        }
    }
}

/// Normalize one force-order push into a [`LiquidationEvent`].
///
/// `side=SELL` means a long position was force-sold; `side=BUY` the dual.
/// Quantity falls back `q` → `l` and price `ap` → `p`, matching the two
/// shapes Binance has shipped over time. Returns `None` for events that
/// cannot yield a valid positive price.
fn normalize(envelope: &ForceOrderEvent) -> Option<LiquidationEvent> {
    let timestamp = from_epoch_ms(envelope.event_time)?;
    let order = &envelope.order;

    let quantity: f64 = order
        .quantity
        .as_deref()
        .or(order.last_filled.as_deref())?
        .parse()
        .ok()?;
    let price: f64 = order
        .avg_price
        .as_deref()
        .or(order.price.as_deref())?
        .parse()
        .ok()?;
    if !(price > 0.0 && price.is_finite()) {
        return None;
    }

    let direction = if order.side == "BUY" {
        Direction::ShortLiquidated
    } else {
        Direction::LongLiquidated
    };

    Some(LiquidationEvent {
        timestamp,
        symbol: normalize_symbol(&order.symbol),
        exchange: Exchange::Binance,
        price,
        direction,
        amount: quantity * price,
    })
}

#[derive(Debug, Deserialize)]
struct ForceOrderEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "o")]
    order: ForceOrder,
}

#[derive(Debug, Deserialize)]
struct ForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    quantity: Option<String>,
    #[serde(rename = "l")]
    last_filled: Option<String>,
    #[serde(rename = "ap")]
    avg_price: Option<String>,
    #[serde(rename = "p")]
    price: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::row;

    const SELL_PAYLOAD: &str = r#"{"e":"forceOrder","E":1700000000000,"o":{"s":"BTCUSDT","S":"SELL","q":"0.5","ap":"40000"}}"#;

    fn parse(payload: &str) -> ForceOrderEvent {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_normalize_sell_is_long_liquidated() {
        let event = normalize(&parse(SELL_PAYLOAD)).unwrap();
        assert_eq!(event.symbol, "BTC");
        assert_eq!(event.exchange, Exchange::Binance);
        assert_eq!(event.direction, Direction::LongLiquidated);
        assert_eq!(event.price, 40000.0);
        assert_eq!(event.amount, 20000.0);
        assert_eq!(event.datetime_string(), "2023-11-15 06:13:20");
    }

    #[test]
    fn test_normalize_buy_is_short_liquidated() {
        let payload = r#"{"e":"forceOrder","E":1700000000000,"o":{"s":"ETHUSDC","S":"BUY","q":"2","ap":"2000"}}"#;
        let event = normalize(&parse(payload)).unwrap();
        assert_eq!(event.symbol, "ETH");
        assert_eq!(event.direction, Direction::ShortLiquidated);
        assert_eq!(event.amount, 4000.0);
    }

    #[test]
    fn test_normalize_field_fallbacks() {
        let payload = r#"{"e":"forceOrder","E":1700000000000,"o":{"s":"BTCUSDT","S":"SELL","l":"0.1","p":"30000"}}"#;
        let event = normalize(&parse(payload)).unwrap();
        assert_eq!(event.amount, 3000.0);
    }

    #[test]
    fn test_normalize_rejects_missing_price() {
        let payload = r#"{"e":"forceOrder","E":1700000000000,"o":{"s":"BTCUSDT","S":"SELL","q":"0.5"}}"#;
        assert!(normalize(&parse(payload)).is_none());

        let payload = r#"{"e":"forceOrder","E":1700000000000,"o":{"s":"BTCUSDT","S":"SELL","q":"0.5","ap":"0"}}"#;
        assert!(normalize(&parse(payload)).is_none());
    }

    #[tokio::test]
    async fn test_payload_above_threshold_is_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        let journal = Journal::new(&path);
        let stats = AdapterStats::new();

        BinanceAdapter::handle_payload(SELL_PAYLOAD, 10.0, &journal, &stats).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let event = row::decode(lines[1]).unwrap();
        assert_eq!(event.symbol, "BTC");
        assert_eq!(event.amount, 20000.0);
        assert_eq!(stats.written(), 1);
    }

    #[tokio::test]
    async fn test_payload_below_threshold_is_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        let journal = Journal::new(&path);
        let stats = AdapterStats::new();

        // 0.0001 × 40000 = 4 USDT, under the default threshold of 10
        let payload = r#"{"e":"forceOrder","E":1700000000000,"o":{"s":"BTCUSDT","S":"SELL","q":"0.0001","ap":"40000"}}"#;
        BinanceAdapter::handle_payload(payload, 10.0, &journal, &stats).await;

        assert!(!path.exists());
        assert_eq!(stats.filtered(), 1);
        assert_eq!(stats.written(), 0);
    }

    #[tokio::test]
    async fn test_array_payload_dispatches_each_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        let journal = Journal::new(&path);
        let stats = AdapterStats::new();

        let payload = format!("[{SELL_PAYLOAD},{SELL_PAYLOAD}]");
        BinanceAdapter::handle_payload(&payload, 10.0, &journal, &stats).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert_eq!(stats.received(), 2);
        assert_eq!(stats.written(), 2);
    }

    #[tokio::test]
    async fn test_non_force_order_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("journal.csv"));
        let stats = AdapterStats::new();

        let payload = r#"{"e":"aggTrade","E":1700000000000,"o":{"s":"BTCUSDT","S":"SELL","q":"1","ap":"40000"}}"#;
        BinanceAdapter::handle_payload(payload, 10.0, &journal, &stats).await;
        assert_eq!(stats.received(), 0);
    }
}
