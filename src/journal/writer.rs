use crate::journal::row;
use crate::models::event::LiquidationEvent;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Append-only journal for one exchange.
///
/// The file (with its header) is created lazily on first append, so a
/// recorder that never sees a qualifying event leaves no file behind. All
/// appends serialize on the internal mutex and flush before returning; a
/// line is either fully on disk or not written at all from the tailer's
/// point of view.
pub struct Journal {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Journal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line and flush.
    pub async fn append(&self, event: &LiquidationEvent) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        // The handle stays open across appends; reopen once on failure so a
        // rotated-away file does not wedge the recorder permanently.
        let file = guard.as_mut().expect("journal file just opened");
        let line = row::encode(event);
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            *guard = None;
            return Err(e);
        }
        Ok(())
    }

    fn open(&self) -> std::io::Result<File> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{}", row::HEADER)?;
            file.flush()?;
        }
        Ok(file)
    }
}
