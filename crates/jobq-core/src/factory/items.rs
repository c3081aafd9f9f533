// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Item rows for a job factory.
//!
//! Rows either come inline with the template or from a file. A file is read
//! by a spawned task that sends rows over a channel in chunks; the factory
//! polls the channel with `try_recv` and never waits on the read. Without a
//! tokio runtime the file is read synchronously when opened.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Rows sent per channel message.
const CHUNK_ROWS: usize = 256;

/// Reader progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Nothing requested yet.
    Idle,
    /// The read task is running and no rows have arrived.
    ReadPending,
    /// Some rows arrived; more may follow.
    Ready,
    /// Every row has been read.
    Exhausted,
    /// The read failed.
    Failed,
}

impl ReaderState {
    /// Lowercase name for reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderState::Idle => "idle",
            ReaderState::ReadPending => "read_pending",
            ReaderState::Ready => "ready",
            ReaderState::Exhausted => "exhausted",
            ReaderState::Failed => "failed",
        }
    }
}

/// Availability of one row.
#[derive(Debug, PartialEq, Eq)]
pub enum RowStatus<'a> {
    /// The row text.
    Available(&'a str),
    /// Not read yet; ask again later.
    Pending,
    /// Past the last row.
    End,
    /// The source failed before reaching this row.
    Failed(&'a str),
}

enum Chunk {
    Rows(Vec<String>),
    Done,
    Failed(String),
}

/// Rows of item data, possibly still streaming in.
pub struct ItemSource {
    rows: Vec<String>,
    state: ReaderState,
    rx: Option<mpsc::Receiver<Chunk>>,
    task: Option<JoinHandle<()>>,
    error: Option<String>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for ItemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemSource")
            .field("rows", &self.rows.len())
            .field("state", &self.state)
            .field("path", &self.path)
            .finish()
    }
}

fn keep_row(line: &str) -> Option<String> {
    let row = line.trim_end_matches('\r');
    (!row.trim().is_empty()).then(|| row.to_string())
}

impl ItemSource {
    /// A source with every row already known.
    pub fn inline(rows: Vec<String>) -> Self {
        Self {
            rows,
            state: ReaderState::Exhausted,
            rx: None,
            task: None,
            error: None,
            path: None,
        }
    }

    /// Start reading rows from `path`.
    ///
    /// Inside a tokio runtime the read happens on a spawned task; otherwise
    /// the file is read before this returns.
    pub fn open(path: &Path) -> Self {
        let path = path.to_path_buf();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::channel(16);
                let task = handle.spawn(read_rows(path.clone(), tx));
                Self {
                    rows: Vec::new(),
                    state: ReaderState::ReadPending,
                    rx: Some(rx),
                    task: Some(task),
                    error: None,
                    path: Some(path),
                }
            }
            Err(_) => match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let mut source = Self::inline(text.lines().filter_map(keep_row).collect());
                    source.path = Some(path);
                    source
                }
                Err(e) => Self {
                    rows: Vec::new(),
                    state: ReaderState::Failed,
                    rx: None,
                    task: None,
                    error: Some(format!("{}: {}", path.display(), e)),
                    path: Some(path),
                },
            },
        }
    }

    /// Drain whatever the read task has sent so far.
    pub fn poll(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(Chunk::Rows(rows)) => {
                    self.rows.extend(rows);
                    self.state = ReaderState::Ready;
                }
                Ok(Chunk::Done) => {
                    self.state = ReaderState::Exhausted;
                    break;
                }
                Ok(Chunk::Failed(e)) => {
                    self.state = ReaderState::Failed;
                    self.error = Some(e);
                    break;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    if self.state != ReaderState::Exhausted {
                        self.state = ReaderState::Failed;
                        self.error = Some("item reader stopped early".to_string());
                    }
                    break;
                }
            }
        }
        self.rx = None;
        self.task = None;
    }

    /// Look up row `index`, polling the reader first.
    pub fn row(&mut self, index: usize) -> RowStatus<'_> {
        self.poll();
        if index < self.rows.len() {
            return RowStatus::Available(&self.rows[index]);
        }
        match self.state {
            ReaderState::Exhausted => RowStatus::End,
            ReaderState::Failed => RowStatus::Failed(self.error.as_deref().unwrap_or("read failed")),
            ReaderState::Idle | ReaderState::ReadPending | ReaderState::Ready => RowStatus::Pending,
        }
    }

    /// Rows received so far.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows have been received.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Current reader state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Read error, if the reader failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Stop an in-flight read.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(path = ?self.path, rows = self.rows.len(), "Cancelled item reader");
        }
        self.rx = None;
        if matches!(self.state, ReaderState::ReadPending | ReaderState::Ready) {
            self.state = ReaderState::Failed;
            self.error = Some("cancelled".to_string());
        }
    }
}

impl Drop for ItemSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn read_rows(path: PathBuf, tx: mpsc::Sender<Chunk>) {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open item data");
            let _ = tx.send(Chunk::Failed(format!("{}: {}", path.display(), e))).await;
            return;
        }
    };
    let mut lines = BufReader::new(file).lines();
    let mut chunk = Vec::with_capacity(CHUNK_ROWS);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(row) = keep_row(&line) {
                    chunk.push(row);
                }
                if chunk.len() >= CHUNK_ROWS {
                    let rows = std::mem::replace(&mut chunk, Vec::with_capacity(CHUNK_ROWS));
                    if tx.send(Chunk::Rows(rows)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Chunk::Failed(format!("{}: {}", path.display(), e))).await;
                return;
            }
        }
    }
    if !chunk.is_empty() && tx.send(Chunk::Rows(chunk)).await.is_err() {
        return;
    }
    let _ = tx.send(Chunk::Done).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_inline_rows() {
        let mut items = ItemSource::inline(vec!["a".into(), "b".into()]);
        assert_eq!(items.row(1), RowStatus::Available("b"));
        assert_eq!(items.row(2), RowStatus::End);
        assert_eq!(items.state(), ReaderState::Exhausted);
    }

    #[test]
    fn test_sync_read_without_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items");
        std::fs::write(&path, "x 1\n\ny 2\r\n").unwrap();
        let mut items = ItemSource::open(&path);
        assert_eq!(items.len(), 2);
        assert_eq!(items.row(1), RowStatus::Available("y 2"));
        assert_eq!(items.row(2), RowStatus::End);

        let mut missing = ItemSource::open(&dir.path().join("nope"));
        assert_eq!(missing.state(), ReaderState::Failed);
        assert!(matches!(missing.row(0), RowStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_streamed_rows_arrive_without_blocking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items");
        let text: String = (0..600).map(|i| format!("row{}\n", i)).collect();
        std::fs::write(&path, text).unwrap();

        let mut items = ItemSource::open(&path);
        for _ in 0..200 {
            if items.state() == ReaderState::Exhausted {
                break;
            }
            items.poll();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(items.state(), ReaderState::Exhausted);
        assert_eq!(items.len(), 600);
        assert_eq!(items.row(599), RowStatus::Available("row599"));
        assert_eq!(items.row(600), RowStatus::End);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items");
        std::fs::write(&path, "a\n").unwrap();
        let mut items = ItemSource::open(&path);
        items.cancel();
        assert!(matches!(
            items.state(),
            ReaderState::Failed | ReaderState::Exhausted
        ));
        assert!(!matches!(items.row(5), RowStatus::Pending));
    }
}
