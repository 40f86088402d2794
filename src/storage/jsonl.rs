// =============================================================================
// JSON Lines History Store
// =============================================================================
//
// One flat JSON object per line, column names matching the published sheet
// layout (timestamp_utc, exchange, ..., signal_flag, signal_reason, side_hint,
// run_id).  Lines are only ever appended.
//
// `read_tail` reads backwards from the end of the file in growing chunks, so a
// run costs the size of its window rather than the size of the whole log.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{HistoryStore, HistoryWindow};
use crate::types::EnrichedRow;

/// First backwards read from the end of the file; doubled on every refill.
const TAIL_CHUNK_BYTES: u64 = 64 * 1024;

/// Append-only history file.
#[derive(Debug, Clone)]
pub struct JsonlHistoryStore {
    path: PathBuf,
}

impl JsonlHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored line that parses as JSON, oldest first.
    ///
    /// A missing file is an empty history.
    pub async fn read_all_values(&self) -> Result<Vec<Value>> {
        let lines = self.read_lines().await?;
        Ok(parse_lines(&lines))
    }

    async fn read_lines(&self) -> Result<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read history from {}", self.path.display())
                })
            }
        };

        Ok(split_lines(content.as_bytes(), false))
    }

    /// The last `limit` non-empty lines, oldest first.
    async fn read_last_lines(&self, limit: usize, first_chunk: u64) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open history at {}", self.path.display())
                })
            }
        };
        let len = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", self.path.display()))?
            .len();

        let mut pos = len;
        let mut chunk = first_chunk.max(1);
        let mut buf: Vec<u8> = Vec::new();
        let mut lines = Vec::new();
        while pos > 0 {
            let step = chunk.min(pos);
            pos -= step;
            let mut block = vec![0_u8; step as usize];
            file.seek(SeekFrom::Start(pos))
                .await
                .with_context(|| format!("failed to seek in {}", self.path.display()))?;
            file.read_exact(&mut block)
                .await
                .with_context(|| format!("failed to read history from {}", self.path.display()))?;
            block.extend_from_slice(&buf);
            buf = block;

            // Until the start of the file is reached, the first line may be cut.
            lines = split_lines(&buf, pos > 0);
            if lines.len() >= limit {
                break;
            }
            chunk = chunk.saturating_mul(2);
        }

        let start = lines.len().saturating_sub(limit);
        Ok(lines.split_off(start))
    }
}

/// Non-empty lines of `buf`.  With `partial_head` everything up to the first
/// newline is left out.
fn split_lines(buf: &[u8], partial_head: bool) -> Vec<String> {
    let body = if partial_head {
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => &buf[i + 1..],
            None => &[][..],
        }
    } else {
        buf
    };

    String::from_utf8_lossy(body)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_lines(lines: &[String]) -> Vec<Value> {
    let mut values = Vec::with_capacity(lines.len());
    let mut unparseable = 0_usize;
    for line in lines {
        match serde_json::from_str::<Value>(line) {
            Ok(v) => values.push(v),
            Err(_) => unparseable += 1,
        }
    }
    if unparseable > 0 {
        debug!(unparseable, "skipped history lines that are not valid JSON");
    }
    values
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn read_tail(&self, limit: usize) -> Result<HistoryWindow> {
        let tail = self.read_last_lines(limit, TAIL_CHUNK_BYTES).await?;

        // A line that is not JSON counts as dropped like any other bad row.
        let values = parse_lines(&tail);
        let not_json = tail.len() - values.len();

        let window = HistoryWindow::from_values(values);
        debug!(
            path = %self.path.display(),
            rows = window.len(),
            dropped = window.dropped() + not_json,
            "history tail loaded"
        );
        Ok(window)
    }

    async fn append(&self, rows: &[EnrichedRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut buf = String::new();
        for row in rows {
            let line = serde_json::to_string(row).context("failed to serialise enriched row")?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open history at {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush().await.context("failed to flush history file")?;

        info!(path = %self.path.display(), rows = rows.len(), "history rows appended");
        Ok(())
    }
}
