use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::shell::error::ShellError;

/// One captured output line, stored as a single JSON object per text line:
/// `{"timestamp":"2026-02-16T03:00:01.123Z","line":"Server starting"}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFilter {
    All,
    /// Last n decoded records, in order.
    LastN(usize),
    /// Records no older than this many seconds, against one `now` sample.
    SinceSeconds(u64),
}

#[derive(Debug, Clone)]
pub struct LogView {
    pub total_records: usize,
    pub returned_records: usize,
    /// The selected records' `line` fields joined with `\n`.
    pub content: String,
}

/// Append-only per-run log files under one directory.
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create a fresh empty log file named after `at` (second resolution).
    /// Same-second collisions get a `-N` suffix; the returned path is unique.
    pub fn create(&self, at: DateTime<Utc>) -> Result<PathBuf, ShellError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            ShellError::Internal(anyhow::anyhow!(
                "create log dir {}: {e}",
                self.dir.display()
            ))
        })?;
        let stamp = at.format("%Y-%m-%d_%H-%M-%S").to_string();
        for n in 0u32..1000 {
            let name = if n == 0 {
                format!("{stamp}.log")
            } else {
                format!("{stamp}-{n}.log")
            };
            let path = self.dir.join(name);
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    let abs = std::path::absolute(&path).unwrap_or(path);
                    return Ok(abs);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(ShellError::Internal(anyhow::anyhow!(
                        "create log file {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Err(ShellError::Internal(anyhow::anyhow!(
            "no free log file name for {stamp}"
        )))
    }

    /// Open an append handle for one run's log. A run has exactly one
    /// appender (owned by its pump), which keeps appends serialized per path.
    pub async fn appender(&self, path: &Path) -> Result<LogAppender, ShellError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                ShellError::Internal(anyhow::anyhow!("open log {}: {e}", path.display()))
            })?;
        Ok(LogAppender { file })
    }

    /// Scan the whole file, decode records, apply the filter. Malformed lines
    /// (including a partially-written tail) are skipped and not counted.
    pub async fn read(&self, path: &Path, filter: LogFilter) -> Result<LogView, ShellError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShellError::NotFound(format!(
                    "log file not found: {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&bytes);

        let mut records: Vec<LogRecord> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<LogRecord>(line) {
                records.push(record);
            }
        }

        let total_records = records.len();
        let selected: Vec<&LogRecord> = match filter {
            LogFilter::All => records.iter().collect(),
            LogFilter::LastN(n) => {
                let skip = total_records.saturating_sub(n);
                records.iter().skip(skip).collect()
            }
            LogFilter::SinceSeconds(s) => {
                let cutoff = Utc::now() - chrono::Duration::seconds(s as i64);
                records.iter().filter(|r| r.timestamp >= cutoff).collect()
            }
        };
        let content = selected
            .iter()
            .map(|r| r.line.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(LogView {
            total_records,
            returned_records: selected.len(),
            content,
        })
    }
}

/// Append handle for a single run's log file.
pub struct LogAppender {
    file: tokio::fs::File,
}

impl LogAppender {
    /// Write one record and flush, so concurrent readers observe it at line
    /// granularity.
    pub async fn append(&mut self, line: &str, at: DateTime<Utc>) -> std::io::Result<()> {
        let record = LogRecord {
            timestamp: at,
            line: line.to_string(),
        };
        let mut buf = serde_json::to_string(&record).map_err(std::io::Error::other)?;
        buf.push('\n');
        self.file.write_all(buf.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}
