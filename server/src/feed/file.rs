//! NDJSON replay feed.
//!
//! Each line is `{"topic": ..., "partition": n, "value": <envelope or null>}`.
//! A line's offset is its zero-based line number. When reading from a file,
//! the committed offset is kept in `<file>.offset` and lines below it are
//! skipped on the next run.

use super::{Acker, EventSource, FeedMessage, OffsetTracker};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{info, warn};

/// Line offsets are global, so they are tracked under a single key.
const LINES: &str = "lines";

#[derive(Deserialize)]
struct Line {
    topic: String,
    #[serde(default)]
    partition: i32,
    #[serde(default)]
    value: Value,
}

type LineReader = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

pub struct NdjsonSource {
    lines: LineReader,
    line_no: i64,
    start: i64,
    tracker: Arc<OffsetTracker>,
    offset_file: Option<PathBuf>,
}

struct LineAcker(Arc<OffsetTracker>);

impl Acker for LineAcker {
    fn ack(&self, _topic: &str, _partition: i32, offset: i64) -> Result<()> {
        self.0.ack(LINES, 0, offset);
        Ok(())
    }
}

impl NdjsonSource {
    /// Open `path`, or stdin for `-`.
    pub async fn open(path: &str) -> Result<Self> {
        if path == "-" {
            let reader: Box<dyn AsyncBufRead + Send + Unpin> =
                Box::new(BufReader::new(tokio::io::stdin()));
            return Ok(Self::with_start(reader, 0, None));
        }

        let offset_file = PathBuf::from(format!("{path}.offset"));
        let start = match tokio::fs::read_to_string(&offset_file).await {
            Ok(text) => text.trim().parse::<i64>().map_err(|_| {
                SyncError::Feed(format!("corrupt offset file {}", offset_file.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if start > 0 {
            info!(path, start, "Resuming feed from committed offset");
        }

        let file = tokio::fs::File::open(path).await?;
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(BufReader::new(file));
        Ok(Self::with_start(reader, start, Some(offset_file)))
    }

    pub fn from_reader(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self::with_start(Box::new(reader), 0, None)
    }

    fn with_start(
        reader: Box<dyn AsyncBufRead + Send + Unpin>,
        start: i64,
        offset_file: Option<PathBuf>,
    ) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            start,
            tracker: Arc::new(OffsetTracker::new()),
            offset_file,
        }
    }

    /// Number of leading lines that are fully processed.
    pub fn committed(&self) -> i64 {
        self.tracker.committed(LINES, 0).unwrap_or(self.start)
    }
}

#[async_trait]
impl EventSource for NdjsonSource {
    async fn next(&mut self) -> Result<Option<FeedMessage>> {
        loop {
            let Some(text) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let offset = self.line_no;
            self.line_no += 1;
            if offset < self.start {
                continue;
            }
            self.tracker.observe(LINES, 0, offset);
            if text.trim().is_empty() {
                self.tracker.ack(LINES, 0, offset);
                continue;
            }

            let line: Line = match serde_json::from_str(&text) {
                Ok(line) => line,
                Err(e) => {
                    warn!(offset, error = %e, "Skipping malformed feed line");
                    self.tracker.ack(LINES, 0, offset);
                    continue;
                }
            };

            let payload = match line.value {
                Value::Null => None,
                value => Some(serde_json::to_vec(&value).map_err(|e| SyncError::Feed(e.to_string()))?),
            };
            return Ok(Some(FeedMessage::new(line.topic, line.partition, offset, payload)));
        }
    }

    fn acker(&self) -> Arc<dyn Acker> {
        Arc::new(LineAcker(self.tracker.clone()))
    }

    async fn close(&mut self) -> Result<()> {
        let committed = self.committed();
        if let Some(path) = &self.offset_file {
            tokio::fs::write(path, committed.to_string()).await?;
        }
        info!(committed, "Feed closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const FEED: &str = r#"{"topic": "mysql.sync.users", "value": {"op": "c"}}

not json
{"topic": "postgres.sync.users", "partition": 2, "value": null}
"#;

    #[tokio::test]
    async fn reads_messages_and_tombstones() {
        let mut source = NdjsonSource::from_reader(Cursor::new(FEED.as_bytes().to_vec()));

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.topic, "mysql.sync.users");
        assert_eq!(first.partition, 0);
        assert_eq!(first.offset, 0);
        assert_eq!(first.payload.as_deref(), Some(br#"{"op":"c"}"#.as_slice()));

        let tombstone = source.next().await.unwrap().unwrap();
        assert_eq!(tombstone.offset, 3);
        assert_eq!(tombstone.partition, 2);
        assert!(tombstone.payload.is_none());

        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commits_contiguous_lines() {
        let mut source = NdjsonSource::from_reader(Cursor::new(FEED.as_bytes().to_vec()));
        let acker = source.acker();

        let first = source.next().await.unwrap().unwrap();
        let last = source.next().await.unwrap().unwrap();

        // Blank and malformed lines are acked by the reader itself
        acker.ack(&last.topic, last.partition, last.offset).unwrap();
        assert_eq!(source.committed(), 0);

        acker.ack(&first.topic, first.partition, first.offset).unwrap();
        assert_eq!(source.committed(), 4);
    }

    #[tokio::test]
    async fn resumes_from_offset_file() {
        let dir = std::env::temp_dir().join(format!("rowsync-feed-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("feed.ndjson");
        tokio::fs::write(&path, FEED).await.unwrap();
        let path = path.to_string_lossy().to_string();

        let mut source = NdjsonSource::open(&path).await.unwrap();
        let acker = source.acker();
        let first = source.next().await.unwrap().unwrap();
        acker.ack(&first.topic, first.partition, first.offset).unwrap();
        source.close().await.unwrap();

        let mut resumed = NdjsonSource::open(&path).await.unwrap();
        let next = resumed.next().await.unwrap().unwrap();
        assert_eq!(next.offset, 3);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
