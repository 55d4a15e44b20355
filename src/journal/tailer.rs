use crate::journal::row;
use crate::store::EventStore;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Tails one journal file into the event store.
///
/// Each poll re-opens the file and skips rows already consumed, so the tailer
/// needs no shared state with the recorder that appends — the journal is the
/// only contract between them. A changed (inode, device) pair means the file
/// was rotated or recreated; the cursor resets and every row replays as new.
/// The first poll after boot doubles as the bootstrap replay.
pub struct JournalTailer {
    path: PathBuf,
    store: Arc<EventStore>,
    poll_interval: Duration,
    file_id: Option<(u64, u64)>,
    line_cursor: usize,
}

impl JournalTailer {
    pub fn new(path: impl AsRef<Path>, store: Arc<EventStore>, poll_interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            store,
            poll_interval,
            file_id: None,
            line_cursor: 0,
        }
    }

    /// Spawn the polling loop until shutdown.
    pub fn start(mut self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.poll_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.recv() => {
                        debug!("Tailer for {} shutting down", self.path.display());
                        return;
                    }
                }
            }
        })
    }

    /// Read and ingest any rows appended since the last poll.
    pub async fn poll_once(&mut self) {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            // Absent journal is not an error: the recorder may not have
            // produced its first event yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Tailer open failed for {}: {e}", self.path.display());
                return;
            }
        };

        let id = file_identity(&file);
        if self.file_id != Some(id) {
            if self.file_id.is_some() {
                warn!("Journal {} rotated, replaying from the top", self.path.display());
            }
            self.file_id = Some(id);
            self.line_cursor = 0;
        }

        let reader = BufReader::new(file);
        let mut next_cursor = self.line_cursor;
        for (idx, line) in reader.lines().enumerate() {
            if idx < self.line_cursor {
                continue;
            }
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Tailer read error in {}: {e}", self.path.display());
                    break;
                }
            };
            if !(idx == 0 && row::is_header(&line)) {
                match row::decode(&line) {
                    Ok(event) => {
                        self.store.append(event).await;
                    }
                    Err(e) => {
                        warn!("Skipping bad row {idx} in {}: {e}", self.path.display());
                    }
                }
            }
            next_cursor = idx + 1;
        }
        self.line_cursor = next_cursor;
    }
}

#[cfg(unix)]
fn file_identity(file: &File) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    file.metadata().map(|m| (m.ino(), m.dev())).unwrap_or((0, 0))
}

#[cfg(not(unix))]
fn file_identity(_file: &File) -> (u64, u64) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanoutBroker;
    use crate::journal::writer::Journal;
    use crate::models::event::{hub_now, Direction, Exchange, LiquidationEvent};

    fn test_store() -> Arc<EventStore> {
        Arc::new(EventStore::new(
            chrono::Duration::hours(48),
            Arc::new(FanoutBroker::new()),
        ))
    }

    fn event(symbol: &str) -> LiquidationEvent {
        LiquidationEvent {
            timestamp: hub_now(),
            symbol: symbol.to_string(),
            exchange: Exchange::Binance,
            price: 100.0,
            direction: Direction::LongLiquidated,
            amount: 1000.0,
        }
    }

    #[tokio::test]
    async fn test_replays_then_tails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        let journal = Journal::new(&path);
        journal.append(&event("BTC")).await.unwrap();
        journal.append(&event("ETH")).await.unwrap();

        let store = test_store();
        let mut tailer = JournalTailer::new(&path, store.clone(), Duration::from_millis(10));

        tailer.poll_once().await;
        assert_eq!(store.len().await, 2);

        // Nothing new: cursor holds, no duplicates
        tailer.poll_once().await;
        assert_eq!(store.len().await, 2);

        journal.append(&event("SOL")).await.unwrap();
        tailer.poll_once().await;
        let latest = store.list_latest(10).await;
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[2].event.symbol, "SOL");
    }

    #[tokio::test]
    async fn test_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store();
        let mut tailer = JournalTailer::new(
            dir.path().join("absent.csv"),
            store.clone(),
            Duration::from_millis(10),
        );
        tailer.poll_once().await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_bad_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        std::fs::write(
            &path,
            "时间,币对,交易所,价格,方向,金额\n\
             2024-01-02 03:04:05,BTC,BA,100,多头爆仓,1000\n\
             garbage line\n\
             2024-01-02 03:04:06,ETH,BA,100,多头爆仓,2000\n",
        )
        .unwrap();

        let store = test_store();
        let mut tailer = JournalTailer::new(&path, store.clone(), Duration::from_millis(10));
        tailer.poll_once().await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_headerless_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        std::fs::write(&path, "2024-01-02 03:04:05,BTC,BA,100,多头爆仓,1000\n").unwrap();

        let store = test_store();
        let mut tailer = JournalTailer::new(&path, store.clone(), Duration::from_millis(10));
        tailer.poll_once().await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_rotation_resets_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        let journal = Journal::new(&path);
        journal.append(&event("BTC")).await.unwrap();

        let store = test_store();
        let mut tailer = JournalTailer::new(&path, store.clone(), Duration::from_millis(10));
        tailer.poll_once().await;
        assert_eq!(store.len().await, 1);

        // Rotate: write a replacement beside the original, then move it into
        // place. The two files coexist, so the inode is guaranteed to change.
        let staged = dir.path().join("journal.csv.new");
        let journal = Journal::new(&staged);
        journal.append(&event("ETH")).await.unwrap();
        std::fs::rename(&staged, &path).unwrap();

        tailer.poll_once().await;
        let latest = store.list_latest(10).await;
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].event.symbol, "ETH");
    }
}
