//! Persisted BLE-code / activation-code store.
//!
//! A newline-separated, append-only file mapping `(ble_code, address,
//! activation_code)`. No schema beyond a 3-column CSV; this module does not
//! interpret the columns beyond splitting and joining them.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEntry {
    pub ble_code: String,
    pub address: String,
    pub activation_code: String,
}

/// Receives a captured activation code the moment it's available, rather
/// than requiring the caller to poll (SPEC_FULL.md §4.3 supplement, grounded
/// on `original_source/ifit/interceptor/_discovery.py`).
#[async_trait::async_trait]
pub trait CodeSink: Send + Sync {
    async fn record(&self, entry: CodeEntry) -> Result<()>;
}

pub struct CodeStore {
    path: PathBuf,
}

impl CodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, entry: &CodeEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = format!("{},{},{}\n", entry.ble_code, entry.address, entry.activation_code);
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<CodeEntry>> {
        load_all(&self.path).await
    }
}

#[async_trait::async_trait]
impl CodeSink for CodeStore {
    async fn record(&self, entry: CodeEntry) -> Result<()> {
        self.append(&entry).await
    }
}

async fn load_all(path: &Path) -> Result<Vec<CodeEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if let Some(entry) = parse_line(&line) {
            out.push(entry);
        }
    }
    Ok(out)
}

fn parse_line(line: &str) -> Option<CodeEntry> {
    let mut parts = line.splitn(3, ',');
    let ble_code = parts.next()?.to_string();
    let address = parts.next()?.to_string();
    let activation_code = parts.next()?.to_string();
    Some(CodeEntry {
        ble_code,
        address,
        activation_code,
    })
}

/// In-memory recorder used by tests in place of a real on-disk store.
#[derive(Default)]
pub struct MemorySink {
    pub recorded: tokio::sync::Mutex<Vec<CodeEntry>>,
}

#[async_trait::async_trait]
impl CodeSink for MemorySink {
    async fn record(&self, entry: CodeEntry) -> Result<()> {
        self.recorded.lock().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_column_csv() {
        let entry = parse_line("AB12,00:11:22:33:44:55,0701625C00E43A16").unwrap();
        assert_eq!(entry.ble_code, "AB12");
        assert_eq!(entry.address, "00:11:22:33:44:55");
        assert_eq!(entry.activation_code, "0701625C00E43A16");
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_line("AB12,00:11:22:33:44:55").is_none());
    }

    #[tokio::test]
    async fn memory_sink_records_entries() {
        let sink = MemorySink::default();
        sink.record(CodeEntry {
            ble_code: "AB12".into(),
            address: "addr".into(),
            activation_code: "code".into(),
        })
        .await
        .unwrap();
        assert_eq!(sink.recorded.lock().await.len(), 1);
    }
}
