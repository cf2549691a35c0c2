//! Engine status snapshot, shared with the `status` command through a file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::watcher::WatcherSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub updated_at: DateTime<Utc>,
    pub watchers: Vec<WatcherSnapshot>,
    pub active_bans: usize,
    pub applied_rules: usize,
    /// Jobs queued or running when the snapshot was taken
    pub queue_pending: usize,
}

impl StatusSnapshot {
    /// Load the last snapshot; `None` if the engine never wrote one.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read status file: {:?}", path))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse status file: {:?}", path))?;
        Ok(Some(snapshot))
    }

    /// Write atomically (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create status directory: {:?}", dir))?;

        let content = serde_json::to_string_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to write status file: {:?}", path))?;
        Ok(())
    }

    pub fn watchers_in_error(&self) -> usize {
        self.watchers
            .iter()
            .filter(|w| w.status == crate::watcher::WatcherStatus::Error)
            .count()
    }
}
