//! Record persistence.
//!
//! [`Store`] is the seam the engine persists through. [`JsonStore`] keeps
//! everything in memory. When given a path it rewrites a JSON snapshot of
//! bans and unbans atomically after each change, and appends matches to a
//! JSON-lines log next to it.
//!
//! A mutation is committed to memory only after its write succeeded, so an
//! `Err` from any method means nothing changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::BanwatchError;
use crate::records::{BanRecord, MatchRecord, UnbanRecord};

pub type StoreResult<T> = Result<T, BanwatchError>;

/// Persistence collaborator. Ids passed to `create_*` are replaced.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_match(&self, record: MatchRecord) -> StoreResult<MatchRecord>;

    /// Matches for `source_id` strictly newer than `since`, newest first.
    async fn matches_since(&self, source_id: &str, since: DateTime<Utc>)
        -> StoreResult<Vec<MatchRecord>>;

    /// Drop matches older than `before`; returns how many were removed.
    async fn prune_matches(&self, before: DateTime<Utc>) -> StoreResult<usize>;

    async fn create_ban(&self, record: BanRecord) -> StoreResult<BanRecord>;

    async fn find_ban(&self, id: u64) -> StoreResult<Option<BanRecord>>;

    async fn find_active_bans(&self) -> StoreResult<Vec<BanRecord>>;

    async fn find_active_ban(&self, address: Ipv4Addr, source_id: &str)
        -> StoreResult<Option<BanRecord>>;

    /// Flip `active` to false. Returns false if the ban was already inactive.
    async fn deactivate_ban(&self, id: u64) -> StoreResult<bool>;

    async fn create_unban(&self, record: UnbanRecord) -> StoreResult<UnbanRecord>;

    /// Deactivate ban `unban.ban_id` and record `unban` in one write.
    /// `None` if the ban was already inactive.
    async fn close_ban(&self, unban: UnbanRecord) -> StoreResult<Option<UnbanRecord>>;

    async fn unbans(&self) -> StoreResult<Vec<UnbanRecord>>;
}

/// The rewritten part of the store. Matches live in their own log.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Snapshot {
    next_id: u64,
    bans: Vec<BanRecord>,
    unbans: Vec<UnbanRecord>,
}

#[derive(Debug, Default)]
struct State {
    records: Snapshot,
    matches: Vec<MatchRecord>,
}

impl State {
    fn next_id(&self) -> u64 {
        self.records.next_id + 1
    }
}

#[derive(Debug, Clone)]
struct Files {
    records: PathBuf,
    matches: PathBuf,
}

/// JSON-file backed store.
#[derive(Debug)]
pub struct JsonStore {
    files: Option<Files>,
    state: Mutex<State>,
}

/// Match log kept beside `path`: `records.json` gives `records.matches.jsonl`.
pub fn match_log_path(path: &Path) -> PathBuf {
    path.with_extension("matches.jsonl")
}

impl JsonStore {
    /// Store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            files: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Open (or create) the store at `path`, loading existing records.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let records = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                BanwatchError::persistence(format!("reading {}: {}", path.display(), e))
            })?;
            if content.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    BanwatchError::persistence(format!("parsing {}: {}", path.display(), e))
                })?
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BanwatchError::persistence(format!("creating {}: {}", parent.display(), e))
                })?;
            }
            Snapshot::default()
        };

        let matches_path = match_log_path(path);
        let matches = load_match_log(&matches_path)?;

        let mut state = State { records, matches };
        // Match ids are only recorded in the log
        if let Some(max) = state.matches.iter().map(|m| m.id).max() {
            state.records.next_id = state.records.next_id.max(max);
        }

        debug!(
            path = %path.display(),
            matches = state.matches.len(),
            bans = state.records.bans.len(),
            "Opened record store"
        );

        Ok(Self {
            files: Some(Files {
                records: path.to_path_buf(),
                matches: matches_path,
            }),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.files.as_ref().map(|f| f.records.as_path())
    }

    /// Apply `f` to a copy of the ban records, write it, then commit.
    async fn mutate<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> StoreResult<R> {
        let mut state = self.state.lock().await;
        let mut next = state.records.clone();
        let result = f(&mut next);
        if let Some(files) = &self.files {
            let json = serde_json::to_vec(&next).map_err(BanwatchError::persistence)?;
            let path = files.records.clone();
            blocking(move || write_atomic(&path, &json)).await?;
        }
        state.records = next;
        Ok(result)
    }
}

fn load_match_log(path: &Path) -> StoreResult<Vec<MatchRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        BanwatchError::persistence(format!("reading {}: {}", path.display(), e))
    })?;
    let mut matches = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MatchRecord>(line) {
            Ok(record) => matches.push(record),
            Err(e) => warn!(path = %path.display(), line = n + 1, "Skipping unreadable match record: {}", e),
        }
    }
    Ok(matches)
}

/// Run blocking file I/O off the async workers.
async fn blocking<F>(f: F) -> StoreResult<()>
where
    F: FnOnce() -> StoreResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BanwatchError::persistence(format!("writer task failed: {}", e)))?
}

fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| BanwatchError::persistence(format!("{}: {}", dir.display(), e)))?;
    tmp.write_all(data).map_err(BanwatchError::persistence)?;
    tmp.flush().map_err(BanwatchError::persistence)?;
    tmp.persist(path)
        .map_err(|e| BanwatchError::persistence(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

/// Append one line. A failed write is cut back so the log stays line-aligned.
fn append_line(path: &Path, line: &[u8]) -> StoreResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BanwatchError::persistence(format!("{}: {}", path.display(), e)))?;
    let len = file.metadata().map_err(BanwatchError::persistence)?.len();
    if let Err(e) = file.write_all(line) {
        let _ = file.set_len(len);
        return Err(BanwatchError::persistence(format!("{}: {}", path.display(), e)));
    }
    Ok(())
}

fn encode_lines(matches: &[MatchRecord]) -> StoreResult<Vec<u8>> {
    let mut out = Vec::new();
    for record in matches {
        serde_json::to_writer(&mut out, record).map_err(BanwatchError::persistence)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[async_trait]
impl Store for JsonStore {
    async fn create_match(&self, mut record: MatchRecord) -> StoreResult<MatchRecord> {
        let mut state = self.state.lock().await;
        record.id = state.next_id();
        if let Some(files) = &self.files {
            let mut line = serde_json::to_vec(&record).map_err(BanwatchError::persistence)?;
            line.push(b'\n');
            let path = files.matches.clone();
            blocking(move || append_line(&path, &line)).await?;
        }
        state.records.next_id = record.id;
        state.matches.push(record.clone());
        Ok(record)
    }

    async fn matches_since(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchRecord>> {
        let state = self.state.lock().await;
        let mut found: Vec<MatchRecord> = state
            .matches
            .iter()
            .filter(|m| m.source_id == source_id && m.timestamp > since)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn prune_matches(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let kept: Vec<MatchRecord> = state
            .matches
            .iter()
            .filter(|m| m.timestamp >= before)
            .cloned()
            .collect();
        let removed = state.matches.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        if let Some(files) = &self.files {
            let data = encode_lines(&kept)?;
            let path = files.matches.clone();
            blocking(move || write_atomic(&path, &data)).await?;
        }
        state.matches = kept;
        Ok(removed)
    }

    async fn create_ban(&self, mut record: BanRecord) -> StoreResult<BanRecord> {
        self.mutate(|s| {
            s.next_id += 1;
            record.id = s.next_id;
            s.bans.push(record.clone());
            record
        })
        .await
    }

    async fn find_ban(&self, id: u64) -> StoreResult<Option<BanRecord>> {
        let state = self.state.lock().await;
        Ok(state.records.bans.iter().find(|b| b.id == id).cloned())
    }

    async fn find_active_bans(&self) -> StoreResult<Vec<BanRecord>> {
        let state = self.state.lock().await;
        Ok(state.records.bans.iter().filter(|b| b.active).cloned().collect())
    }

    async fn find_active_ban(
        &self,
        address: Ipv4Addr,
        source_id: &str,
    ) -> StoreResult<Option<BanRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .bans
            .iter()
            .find(|b| b.active && b.address == address && b.source_id == source_id)
            .cloned())
    }

    async fn deactivate_ban(&self, id: u64) -> StoreResult<bool> {
        if self.find_ban(id).await?.map_or(true, |b| !b.active) {
            return Ok(false);
        }
        self.mutate(|s| match s.bans.iter_mut().find(|b| b.id == id && b.active) {
            Some(ban) => {
                ban.active = false;
                true
            }
            None => false,
        })
        .await
    }

    async fn create_unban(&self, mut record: UnbanRecord) -> StoreResult<UnbanRecord> {
        self.mutate(|s| {
            s.next_id += 1;
            record.id = s.next_id;
            s.unbans.push(record.clone());
            record
        })
        .await
    }

    async fn close_ban(&self, mut unban: UnbanRecord) -> StoreResult<Option<UnbanRecord>> {
        let id = unban.ban_id;
        if self.find_ban(id).await?.map_or(true, |b| !b.active) {
            return Ok(None);
        }
        self.mutate(|s| {
            let ban = s.bans.iter_mut().find(|b| b.id == id && b.active)?;
            ban.active = false;
            s.next_id += 1;
            unban.id = s.next_id;
            s.unbans.push(unban.clone());
            Some(unban)
        })
        .await
    }

    async fn unbans(&self) -> StoreResult<Vec<UnbanRecord>> {
        let state = self.state.lock().await;
        Ok(state.records.unbans.clone())
    }
}
