//! Dead-letter persistence for items that failed or timed out.
//!
//! Every queue gets an append-only `<queue_name>.errors` file; each line is
//! `<ISO8601 timestamp>\t<JSON array of items>`.

use crate::error::WorkerError;
use crate::item::QueueItem;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One line of a dead-letter file.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub timestamp: DateTime<Utc>,
    pub items: Vec<QueueItem>,
}

impl DeadLetterRecord {
    fn to_line(&self) -> Result<String, WorkerError> {
        Ok(format!(
            "{}\t{}\n",
            self.timestamp.to_rfc3339(),
            serde_json::to_string(&self.items)?
        ))
    }

    /// Parses a line previously written by `DeadLetterLog::append`.
    pub fn parse_line(line: &str) -> Result<Self, WorkerError> {
        let (timestamp, items) = line
            .trim_end_matches('\n')
            .split_once('\t')
            .ok_or_else(|| WorkerError::from("dead-letter line has no tab separator"))?;

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| WorkerError::from(format!("bad dead-letter timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            timestamp,
            items: serde_json::from_str(items)?,
        })
    }
}

/// Appends failed batches to the dead-letter file of a single queue.
#[derive(Debug, Clone)]
pub struct DeadLetterLog {
    path: PathBuf,
}

impl DeadLetterLog {
    pub fn new(queue_error_dir: &Path, queue_name: &str) -> Self {
        Self {
            path: queue_error_dir.join(format!("{}.errors", queue_name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record holding `items` in their original order.
    ///
    /// The directory and file are created on first use; existing records are never rewritten.
    pub async fn append(&self, items: &[QueueItem]) -> Result<(), WorkerError> {
        let record = DeadLetterRecord {
            timestamp: Utc::now(),
            items: items.to_vec(),
        };
        let line = record.to_line()?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Reads every record back, oldest first. A missing file yields no records.
    pub async fn read_all(&self) -> Result<Vec<DeadLetterRecord>, WorkerError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(DeadLetterRecord::parse_line)
            .collect()
    }
}
