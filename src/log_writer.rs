//! Console log file
//!
//! Appends every robot console line to `ds-YYYYmmdd-HHMMSS.log` in the
//! configured directory, one file per daemon run.

use crate::error::Result;
use crate::types::LogEntry;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub fn log_file_name(started: &DateTime<Local>) -> String {
    format!("ds-{}.log", started.format("%Y%m%d-%H%M%S"))
}

/// `[  12.345] WARN  text` style line
pub fn format_entry(entry: &LogEntry) -> String {
    let level = if entry.is_error {
        "ERROR"
    } else if entry.is_warning {
        "WARN"
    } else {
        "INFO"
    };
    format!("[{:>9.3}] {:<5} {}", entry.timestamp, level, entry.message)
}

pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogWriter {
    pub async fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(log_file_name(&Local::now()));
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        info!("Writing robot console to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_entry(&mut self, entry: &LogEntry) -> Result<()> {
        // Multi-line errors keep their layout; only the first line carries the prefix
        let mut line = format_entry(entry);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    async fn append(&mut self, entry: &LogEntry) -> Result<()> {
        self.write_entry(entry).await?;
        self.flush().await
    }

    /// Drain console entries into the file until shutdown
    pub async fn run(mut self, mut console: broadcast::Receiver<LogEntry>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                received = console.recv() => match received {
                    Ok(entry) => {
                        if let Err(e) = self.append(&entry).await {
                            warn!("Failed to write {}: {}", self.path.display(), e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Log writer fell behind, {} entries not written", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let _ = self.flush().await;
        debug!("Log writer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(message: &str, is_error: bool, is_warning: bool) -> LogEntry {
        LogEntry {
            timestamp: 1.5,
            message: message.to_string(),
            is_error,
            is_warning,
            sequence: 0,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dsd-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_file_name_format() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(log_file_name(&started), "ds-20240309-140507.log");
    }

    #[test]
    fn test_entry_levels() {
        assert!(format_entry(&entry("boom", true, false)).contains("ERROR boom"));
        assert!(format_entry(&entry("careful", false, true)).contains("WARN  careful"));
        assert_eq!(format_entry(&entry("hi", false, false)), "[    1.500] INFO  hi");
    }

    #[tokio::test]
    async fn test_writes_entries_to_file() {
        let dir = temp_dir("write");
        let mut writer = LogWriter::create(&dir).await.unwrap();
        writer.write_entry(&entry("first", false, false)).await.unwrap();
        writer.write_entry(&entry("second", true, false)).await.unwrap();

        // Buffered until flushed
        assert_eq!(fs::read_to_string(writer.path()).await.unwrap(), "");
        writer.flush().await.unwrap();

        let contents = fs::read_to_string(writer.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("second"));
        let _ = fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn test_create_makes_missing_directories() {
        let dir = temp_dir("nested").join("a").join("b");
        let writer = LogWriter::create(&dir).await.unwrap();
        assert!(writer.path().starts_with(&dir));
        assert!(fs::metadata(writer.path()).await.unwrap().is_file());
        let _ = fs::remove_dir_all(temp_dir("nested")).await;
    }

    #[tokio::test]
    async fn test_run_drains_broadcast() {
        let dir = temp_dir("run");
        let writer = LogWriter::create(&dir).await.unwrap();
        let path = writer.path().to_path_buf();

        let (tx, rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(writer.run(rx, stop_rx));

        tx.send(entry("from robot", false, false)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(fs::read_to_string(&path).await.unwrap().contains("from robot"));
        let _ = fs::remove_dir_all(dir).await;
    }
}
