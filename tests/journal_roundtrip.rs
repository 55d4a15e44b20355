//! End-to-end journal round-trip: events written through the recorder path
//! come back into a freshly-booted hub via the tailer, bounded by the
//! retention horizon, with fan-out and stream cursors behaving on top.

use liqhub::fanout::FanoutBroker;
use liqhub::journal::{Journal, JournalTailer};
use liqhub::models::event::{hub_now, Direction, Exchange, LiquidationEvent};
use liqhub::store::EventStore;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use std::sync::Arc;
use std::time::Duration;

fn event(
    ts: DateTime<FixedOffset>,
    symbol: &str,
    exchange: Exchange,
    direction: Direction,
    amount: f64,
) -> LiquidationEvent {
    LiquidationEvent {
        timestamp: ts,
        symbol: symbol.to_string(),
        exchange,
        price: 25000.0,
        direction,
        amount,
    }
}

/// Truncate to journal (second) resolution so round-tripped timestamps
/// compare equal.
fn seconds(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    ts - ChronoDuration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
}

#[tokio::test]
async fn journal_round_trip_respects_retention() {
    let dir = tempfile::tempdir().unwrap();
    let ba_path = dir.path().join("liquidation_ba.csv");
    let okx_path = dir.path().join("liquidation_okx.csv");
    let now = seconds(hub_now());

    // Recorder side: one stale Binance event beyond the 48h horizon, then
    // in-window events on both journals.
    let ba_journal = Journal::new(&ba_path);
    ba_journal
        .append(&event(
            now - ChronoDuration::hours(49),
            "BTC",
            Exchange::Binance,
            Direction::LongLiquidated,
            5000.0,
        ))
        .await
        .unwrap();
    ba_journal
        .append(&event(
            now - ChronoDuration::hours(1),
            "BTC",
            Exchange::Binance,
            Direction::LongLiquidated,
            20000.0,
        ))
        .await
        .unwrap();
    ba_journal
        .append(&event(
            now,
            "ETH",
            Exchange::Binance,
            Direction::ShortLiquidated,
            750.5,
        ))
        .await
        .unwrap();

    let okx_journal = Journal::new(&okx_path);
    okx_journal
        .append(&event(
            now - ChronoDuration::minutes(30),
            "SOL",
            Exchange::Okx,
            Direction::LongLiquidated,
            1050.0,
        ))
        .await
        .unwrap();

    // Hub side: fresh store, tailers replay both journals from the top.
    let broker = Arc::new(FanoutBroker::new());
    let store = Arc::new(EventStore::new(ChronoDuration::hours(48), broker.clone()));

    let mut ba_tailer = JournalTailer::new(&ba_path, store.clone(), Duration::from_millis(10));
    let mut okx_tailer = JournalTailer::new(&okx_path, store.clone(), Duration::from_millis(10));
    ba_tailer.poll_once().await;
    okx_tailer.poll_once().await;
    store.prune().await;

    // The stale event is gone; everything in-window survived intact.
    assert_eq!(store.len().await, 3);
    let resident = store.list_latest(10).await;
    assert!(resident
        .iter()
        .all(|s| s.event.timestamp >= now - ChronoDuration::hours(48)));

    let btc = resident
        .iter()
        .find(|s| s.event.symbol == "BTC")
        .expect("BTC event survived");
    assert_eq!(btc.event.amount, 20000.0);
    assert_eq!(btc.event.exchange, Exchange::Binance);
    assert_eq!(btc.event.timestamp, now - ChronoDuration::hours(1));

    let sol = resident
        .iter()
        .find(|s| s.event.symbol == "SOL")
        .expect("SOL event survived");
    assert_eq!(sol.event.exchange, Exchange::Okx);
    assert_eq!(sol.event.direction, Direction::LongLiquidated);

    // Binance journal order is preserved through replay.
    let ba_seqs: Vec<u64> = resident
        .iter()
        .filter(|s| s.event.exchange == Exchange::Binance)
        .map(|s| s.seq)
        .collect();
    assert!(ba_seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn replayed_events_fan_out_to_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("liquidation_ba.csv");
    let now = seconds(hub_now());

    let journal = Journal::new(&path);
    for amount in [100.0, 200.0, 300.0] {
        journal
            .append(&event(now, "BTC", Exchange::Binance, Direction::LongLiquidated, amount))
            .await
            .unwrap();
    }
    journal
        .append(&event(now, "ETH", Exchange::Binance, Direction::LongLiquidated, 400.0))
        .await
        .unwrap();

    let broker = Arc::new(FanoutBroker::new());
    let store = Arc::new(EventStore::new(ChronoDuration::hours(48), broker.clone()));
    let (_id, mut rx) = broker.subscribe(&["BTC".to_string()], 16);

    let mut tailer = JournalTailer::new(&path, store.clone(), Duration::from_millis(10));
    tailer.poll_once().await;

    // Exactly the BTC events, in append order, each exactly once.
    for expected in [100.0, 200.0, 300.0] {
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.event.symbol, "BTC");
        assert_eq!(delivered.event.amount, expected);
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn stream_cursor_survives_same_second_events() {
    let broker = Arc::new(FanoutBroker::new());
    let store = Arc::new(EventStore::new(ChronoDuration::hours(48), broker));
    let now = seconds(hub_now());

    // Two events in the same second, delivered across two "ticks"
    store
        .append(event(now, "BTC", Exchange::Binance, Direction::LongLiquidated, 1.0))
        .await;
    let first_batch = store.events_after(0).await;
    assert_eq!(first_batch.len(), 1);
    let cursor = first_batch.last().unwrap().seq;

    store
        .append(event(now, "BTC", Exchange::Binance, Direction::LongLiquidated, 2.0))
        .await;
    let second_batch = store.events_after(cursor).await;
    assert_eq!(second_batch.len(), 1);
    assert_eq!(second_batch[0].event.amount, 2.0);
}
