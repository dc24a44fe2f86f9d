//! Per-source synchronization cursor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use kbforge_shared::{KbError, Result};

use crate::layout::StoreLayout;

/// Durable record of the last synchronized timestamp per source.
#[async_trait]
pub trait SyncCursorStore: Send + Sync {
    async fn last_sync(&self, source: &str) -> Result<Option<String>>;

    async fn update_last_sync(&self, source: &str, timestamp: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorEntry {
    last_sync: String,
    updated_at: String,
}

/// Cursor store backed by `<root>/source_config.json`.
#[derive(Debug)]
pub struct JsonCursorStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at the conventional location under an output root.
    pub fn for_root(root: &Path) -> Self {
        Self::new(StoreLayout::new(root).cursor_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, CursorEntry>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                KbError::Store(format!("corrupt cursor file {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(KbError::io(&self.path, e)),
        }
    }

    fn save(&self, entries: &BTreeMap<String, CursorEntry>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| KbError::Store(format!("cursor serialization failed: {e}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KbError::io(parent, e))?;
        }

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("source_config.json");
        let temp = self.path.with_file_name(format!(".{file_name}.tmp"));

        std::fs::write(&temp, json).map_err(|e| KbError::io(&temp, e))?;
        std::fs::rename(&temp, &self.path).map_err(|e| KbError::io(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl SyncCursorStore for JsonCursorStore {
    async fn last_sync(&self, source: &str) -> Result<Option<String>> {
        let entries = self.load()?;
        Ok(entries.get(source).map(|e| e.last_sync.clone()))
    }

    async fn update_last_sync(&self, source: &str, timestamp: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.load()?;
        entries.insert(
            source.to_string(),
            CursorEntry {
                last_sync: timestamp.to_string(),
                updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        );
        self.save(&entries)?;

        info!(source, timestamp, "sync cursor updated");
        debug!(path = %self.path.display(), sources = entries.len(), "cursor file written");
        Ok(())
    }
}
