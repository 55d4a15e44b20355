use crate::models::event::StoredEvent;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

pub type SubscriberId = u64;

/// Per-symbol subscription registry for the push channel.
///
/// Subscribers declare their symbols once at connect time and receive every
/// matching event over a bounded channel. Delivery is best-effort and never
/// blocks the notifier: a subscriber whose buffer is full or whose receiver
/// is gone is dropped from every symbol it was registered under.
pub struct FanoutBroker {
    next_id: AtomicU64,
    by_symbol: DashMap<String, HashMap<SubscriberId, mpsc::Sender<StoredEvent>>>,
    registrations: DashMap<SubscriberId, Vec<String>>,
}

impl FanoutBroker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_symbol: DashMap::new(),
            registrations: DashMap::new(),
        }
    }

    /// Register a subscriber for a set of symbols. Returns its id and the
    /// receiving end of its delivery channel.
    pub fn subscribe(
        &self,
        symbols: &[String],
        buffer: usize,
    ) -> (SubscriberId, mpsc::Receiver<StoredEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let normalized: Vec<String> = symbols.iter().map(|s| s.trim().to_uppercase()).collect();
        for symbol in &normalized {
            self.by_symbol
                .entry(symbol.clone())
                .or_default()
                .insert(id, tx.clone());
        }
        self.registrations.insert(id, normalized);
        (id, rx)
    }

    /// Remove a subscriber from every symbol set it was registered under.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let Some((_, symbols)) = self.registrations.remove(&id) else {
            return;
        };
        for symbol in symbols {
            if let Some(mut entry) = self.by_symbol.get_mut(&symbol) {
                entry.remove(&id);
                let empty = entry.is_empty();
                drop(entry);
                if empty {
                    self.by_symbol.remove_if(&symbol, |_, subs| subs.is_empty());
                }
            }
        }
    }

    /// Deliver an event to every subscriber of its symbol.
    ///
    /// The subscriber set is snapshotted under the map lock; the sends happen
    /// outside it. `try_send` keeps delivery non-blocking — per subscriber the
    /// event arrives at most once, in append order.
    pub fn notify(&self, event: &StoredEvent) {
        let symbol = event.event.symbol.to_uppercase();
        let targets: Vec<(SubscriberId, mpsc::Sender<StoredEvent>)> = match self
            .by_symbol
            .get(&symbol)
        {
            Some(entry) => entry.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(event.clone()).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            debug!("Dropping subscriber {id} for {symbol} (closed or lagging)");
            self.unsubscribe(id);
        }
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.by_symbol
            .get(&symbol.to_uppercase())
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl Default for FanoutBroker {
    fn default() -> Self {
        Self::new()
    }
}
