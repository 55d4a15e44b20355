pub mod binance;
pub mod convert;
pub mod okx;

pub use binance::BinanceAdapter;
pub use okx::OkxAdapter;

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one adapter's ingest pipeline.
#[derive(Debug, Default)]
pub struct AdapterStats {
    received: AtomicU64,
    written: AtomicU64,
    filtered: AtomicU64,
}

impl AdapterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn incr_written(&self) -> u64 {
        self.written.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn incr_filtered(&self) -> u64 {
        self.filtered.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "received={} written={} filtered={}",
            self.received(),
            self.written(),
            self.filtered(),
        )
    }
}
