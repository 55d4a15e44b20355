use crate::fanout::FanoutBroker;
use crate::models::event::{hub_now, Direction, Exchange, LiquidationEvent, StoredEvent};
use crate::models::filter::QueryFilter;
use chrono::{DateTime, Duration, FixedOffset};
use indexmap::IndexMap;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Aggregation windows, in minutes.
pub const AGG_WINDOWS_MINUTES: [i64; 5] = [3, 15, 60, 240, 1440];

/// Symbols kept per direction in each aggregate window.
const TOP_SYMBOLS: usize = 10;

/// Rolling in-memory window of liquidation events.
///
/// Events enter in journal order, stamped with a monotonic sequence number,
/// and age out past the retention horizon. One lock covers append, eviction
/// and every read; readers copy (or fully compute) under the lock so
/// snapshots are internally consistent. Broker notification happens after
/// the lock is released.
pub struct EventStore {
    retention: Duration,
    broker: Arc<FanoutBroker>,
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    events: VecDeque<StoredEvent>,
    next_seq: u64,
    last_seen: HashMap<Exchange, DateTime<FixedOffset>>,
}

/// Per-window totals for the `/data` aggregate view. The top maps preserve
/// descending-by-amount order (ties break by symbol).
#[derive(Debug, Clone, Serialize)]
pub struct WindowAggregates {
    pub top_long: IndexMap<String, f64>,
    pub top_short: IndexMap<String, f64>,
    pub binance_long: f64,
    pub binance_short: f64,
    pub okx_long: f64,
    pub okx_short: f64,
}

/// Per-symbol, per-window totals and volume-weighted average prices.
/// A VWAP is `None` whenever the direction saw no volume in the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolWindowStats {
    pub long_total: f64,
    pub short_total: f64,
    pub long_vwap: Option<f64>,
    pub short_vwap: Option<f64>,
}

impl EventStore {
    pub fn new(retention: Duration, broker: Arc<FanoutBroker>) -> Self {
        Self {
            retention,
            broker,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Append one event, evicting anything older than the retention horizon
    /// relative to the new event, then hand it to the fan-out broker.
    pub async fn append(&self, event: LiquidationEvent) -> u64 {
        let stored = {
            let mut inner = self.inner.write().await;
            inner.next_seq += 1;
            let stored = StoredEvent {
                seq: inner.next_seq,
                event,
            };
            inner.last_seen.insert(stored.event.exchange, stored.event.timestamp);
            inner.events.push_back(stored.clone());
            let threshold = stored.event.timestamp - self.retention;
            evict_older_than(&mut inner.events, threshold);
            stored
        };
        let seq = stored.seq;
        self.broker.notify(&stored);
        seq
    }

    /// Evict events older than the retention horizon relative to wall-clock
    /// now. Called periodically so quiet feeds still age out.
    pub async fn prune(&self) {
        let threshold = hub_now() - self.retention;
        let mut inner = self.inner.write().await;
        evict_older_than(&mut inner.events, threshold);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Highest sequence number handed out so far (0 before any append).
    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.next_seq
    }

    /// Last `limit` events in insertion order, oldest first.
    pub async fn list_latest(&self, limit: usize) -> Vec<StoredEvent> {
        let inner = self.inner.read().await;
        let skip = inner.events.len().saturating_sub(limit);
        inner.events.iter().skip(skip).cloned().collect()
    }

    /// Every event with a sequence number strictly after `seq`, in insertion
    /// order. This is the stream cursor: unlike second-resolution timestamps
    /// it cannot skip same-second neighbours.
    pub async fn events_after(&self, seq: u64) -> Vec<StoredEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|stored| stored.seq > seq)
            .cloned()
            .collect()
    }

    /// Filtered query, oldest first, truncated to the last `limit` matches.
    pub async fn query(&self, filter: &QueryFilter) -> Vec<StoredEvent> {
        let inner = self.inner.read().await;
        let mut items: Vec<StoredEvent> = inner
            .events
            .iter()
            .filter(|stored| filter.matches(&stored.event))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            if items.len() > limit {
                items.drain(..items.len() - limit);
            }
        }
        items
    }

    /// Timestamp of the most recent event per exchange.
    pub async fn last_seen(&self) -> HashMap<Exchange, DateTime<FixedOffset>> {
        self.inner.read().await.last_seen.clone()
    }

    /// Windowed totals: top symbols per direction plus per-exchange sums,
    /// all computed against one snapshot so the windows agree with each
    /// other.
    pub async fn aggregates(&self) -> BTreeMap<i64, WindowAggregates> {
        let now = hub_now();
        let inner = self.inner.read().await;
        let mut results = BTreeMap::new();

        for minutes in AGG_WINDOWS_MINUTES {
            let window_start = now - Duration::minutes(minutes);
            let mut longs: HashMap<String, f64> = HashMap::new();
            let mut shorts: HashMap<String, f64> = HashMap::new();
            let mut agg = WindowAggregates {
                top_long: IndexMap::new(),
                top_short: IndexMap::new(),
                binance_long: 0.0,
                binance_short: 0.0,
                okx_long: 0.0,
                okx_short: 0.0,
            };

            for stored in &inner.events {
                let e = &stored.event;
                if e.timestamp < window_start {
                    continue;
                }
                match e.direction {
                    Direction::LongLiquidated => {
                        *longs.entry(e.symbol.clone()).or_default() += e.amount;
                        match e.exchange {
                            Exchange::Binance => agg.binance_long += e.amount,
                            Exchange::Okx => agg.okx_long += e.amount,
                        }
                    }
                    Direction::ShortLiquidated => {
                        *shorts.entry(e.symbol.clone()).or_default() += e.amount;
                        match e.exchange {
                            Exchange::Binance => agg.binance_short += e.amount,
                            Exchange::Okx => agg.okx_short += e.amount,
                        }
                    }
                }
            }

            agg.top_long = top_symbols(longs);
            agg.top_short = top_symbols(shorts);
            results.insert(minutes, agg);
        }
        results
    }

    /// Per-symbol totals and VWAPs for every window, optionally restricted
    /// to a set of uppercase symbols.
    pub async fn symbol_stats(
        &self,
        symbols: Option<&HashSet<String>>,
    ) -> HashMap<String, BTreeMap<i64, SymbolWindowStats>> {
        let now = hub_now();
        let inner = self.inner.read().await;
        let mut results: HashMap<String, BTreeMap<i64, SymbolWindowStats>> = HashMap::new();

        for minutes in AGG_WINDOWS_MINUTES {
            let window_start = now - Duration::minutes(minutes);
            let mut per_symbol: HashMap<String, VwapAccumulator> = HashMap::new();

            for stored in &inner.events {
                let e = &stored.event;
                if e.timestamp < window_start {
                    continue;
                }
                let symbol = e.symbol.to_uppercase();
                if let Some(filter) = symbols {
                    if !filter.contains(&symbol) {
                        continue;
                    }
                }
                per_symbol.entry(symbol).or_default().add(e);
            }

            for (symbol, acc) in per_symbol {
                results
                    .entry(symbol)
                    .or_default()
                    .insert(minutes, acc.finish());
            }
        }
        results
    }
}

fn evict_older_than(events: &mut VecDeque<StoredEvent>, threshold: DateTime<FixedOffset>) {
    while let Some(head) = events.front() {
        if head.event.timestamp >= threshold {
            break;
        }
        events.pop_front();
    }
}

/// Rank symbol totals descending, breaking ties by symbol, and keep the top
/// entries in that order.
fn top_symbols(totals: HashMap<String, f64>) -> IndexMap<String, f64> {
    let mut ranked: Vec<(String, f64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.truncate(TOP_SYMBOLS);
    ranked.into_iter().collect()
}

#[derive(Default)]
struct VwapAccumulator {
    long_total: f64,
    short_total: f64,
    long_num: f64,
    short_num: f64,
}

impl VwapAccumulator {
    fn add(&mut self, e: &LiquidationEvent) {
        match e.direction {
            Direction::LongLiquidated => {
                self.long_total += e.amount;
                self.long_num += e.price * e.amount;
            }
            Direction::ShortLiquidated => {
                self.short_total += e.amount;
                self.short_num += e.price * e.amount;
            }
        }
    }

    fn finish(self) -> SymbolWindowStats {
        SymbolWindowStats {
            long_total: self.long_total,
            short_total: self.short_total,
            long_vwap: (self.long_total > 0.0).then(|| self.long_num / self.long_total),
            short_vwap: (self.short_total > 0.0).then(|| self.short_num / self.short_total),
        }
    }
}
