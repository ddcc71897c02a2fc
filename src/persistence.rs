// =============================================================================
// Persistence — durable key-value store and append-only trade log
// =============================================================================
//
// The key-value store generalizes the atomic tmp+rename pattern into a
// reusable JSON document, keyed by name. It holds `trading_disabled`,
// kill-switch metadata, and last-reconciled positions — anything the process
// needs to remember across a restart that isn't full trading configuration.
//
// The trade log is append-only and indexed by `link_id`: every order
// submission, fill, and close appends one JSON line, never rewritten.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub struct PersistentStore {
    path: PathBuf,
    data: RwLock<HashMap<String, Value>>,
}

impl PersistentStore {
    pub fn new(path: PathBuf) -> Self {
        let data = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self { path, data: RwLock::new(data) }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data.read().get(key).cloned().and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get::<bool>(key)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_value(value).context("failed to serialise persisted value")?;
        self.data.write().insert(key.to_string(), json);
        self.flush()
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, &value)
    }

    fn flush(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.data.read())
            .context("failed to serialise persistent store")?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp store to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp store to {}", self.path.display()))?;

        debug!(path = %self.path.display(), "persistent store flushed (atomic)");
        Ok(())
    }
}

/// Append-only JSON-lines trade log, indexed by `link_id` at read time.
pub struct TradeLog {
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct TradeLogEntry {
    pub link_id: String,
    pub event: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl TradeLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, entry: &TradeLogEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("failed to serialise trade log entry")?;
        let mut file = self.open_for_append()?;
        writeln!(file, "{line}").context("failed to append trade log line")?;
        Ok(())
    }

    fn open_for_append(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open trade log at {}", self.path.display()))
    }

    pub fn read_all(&self) -> Result<Vec<TradeLogEntry>> {
        self.read_all_from(&self.path)
    }

    fn read_all_from(&self, path: &Path) -> Result<Vec<TradeLogEntry>> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = i, error = %e, "skipping malformed trade log line"),
            }
        }
        Ok(entries)
    }

    pub fn entries_for_link_id(&self, link_id: &str) -> Result<Vec<TradeLogEntry>> {
        Ok(self.read_all()?.into_iter().filter(|e| e.link_id == link_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn store_roundtrips_through_disk() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        {
            let store = PersistentStore::new(path.clone());
            store.set_bool("trading_disabled", true).unwrap();
        }
        let reopened = PersistentStore::new(path);
        assert_eq!(reopened.get_bool("trading_disabled"), Some(true));
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let store = PersistentStore::new(PathBuf::from("/tmp/does-not-exist-persistence-test.json"));
        assert_eq!(store.get_bool("trading_disabled"), None);
    }

    #[test]
    fn trade_log_appends_and_filters_by_link_id() {
        let tmp = NamedTempFile::new().unwrap();
        let log = TradeLog::new(tmp.path().to_path_buf());

        log.append(&TradeLogEntry {
            link_id: "mean_rev_BTCUSDT_1_L".to_string(),
            event: "signal_generated".to_string(),
            timestamp: 1,
            fields: HashMap::new(),
        }).unwrap();
        log.append(&TradeLogEntry {
            link_id: "mean_rev_BTCUSDT_1_L".to_string(),
            event: "order_submitted".to_string(),
            timestamp: 2,
            fields: HashMap::new(),
        }).unwrap();
        log.append(&TradeLogEntry {
            link_id: "other".to_string(),
            event: "signal_generated".to_string(),
            timestamp: 3,
            fields: HashMap::new(),
        }).unwrap();

        let entries = log.entries_for_link_id("mean_rev_BTCUSDT_1_L").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "signal_generated");
        assert_eq!(entries[1].event, "order_submitted");
    }
}
