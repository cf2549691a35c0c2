//! Match window cache and the ban decision.
//!
//! Per (source, address) the cache keeps the timestamps of recent matches,
//! newest first. A timestamp at exactly `now - find_time` is outside the
//! window. Alongside the bounded list each entry counts every match since
//! its window was last empty, which is what ban notifications report.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::to_chrono;

type Key = (String, Ipv4Addr);

/// Outcome of recording one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Matches inside the window, including this one, capped at the threshold
    pub count: usize,
    /// Matches since the window was last empty, uncapped
    pub total: usize,
    pub ban: bool,
}

#[derive(Debug, Default)]
struct Entry {
    recent: VecDeque<DateTime<Utc>>,
    total: usize,
}

#[derive(Debug, Default)]
pub struct MatchWindowCache {
    entries: Mutex<HashMap<Key, Entry>>,
}

fn window_start(now: DateTime<Utc>, find_time: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(to_chrono(find_time))
}

impl MatchWindowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a match at `ts` and decide whether the threshold is reached.
    ///
    /// At most `max_matches` timestamps are kept per address; that is all
    /// the decision needs.
    pub fn record(
        &self,
        source_id: &str,
        address: Ipv4Addr,
        ts: DateTime<Utc>,
        find_time: Duration,
        max_matches: usize,
    ) -> Decision {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry((source_id.to_string(), address))
            .or_default();

        if let Some(start) = window_start(ts, find_time) {
            entry.recent.retain(|t| *t > start);
        }
        if entry.recent.is_empty() {
            entry.total = 0;
        }
        entry.recent.push_front(ts);
        entry.recent.truncate(max_matches.max(1));
        entry.total += 1;

        let count = entry.recent.len();
        Decision {
            count,
            total: entry.total,
            ban: count >= max_matches,
        }
    }

    /// Seed one address from persisted matches (newest first).
    pub fn seed(
        &self,
        source_id: &str,
        address: Ipv4Addr,
        timestamps: impl IntoIterator<Item = DateTime<Utc>>,
        max_matches: usize,
    ) {
        let mut recent: VecDeque<DateTime<Utc>> =
            timestamps.into_iter().take(max_matches.max(1)).collect();
        recent.make_contiguous().sort_by(|a, b| b.cmp(a));
        if recent.is_empty() {
            return;
        }
        let total = recent.len();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert((source_id.to_string(), address), Entry { recent, total });
    }

    /// Drop timestamps outside each source's window and empty entries.
    ///
    /// `window_for` returns `None` for sources that no longer exist; their
    /// entries are dropped entirely. Returns the number of entries removed.
    pub fn prune<F>(&self, now: DateTime<Utc>, window_for: F) -> usize
    where
        F: Fn(&str) -> Option<Duration>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(source_id, _), entry| {
            let Some(find_time) = window_for(source_id) else {
                return false;
            };
            if let Some(start) = window_start(now, find_time) {
                entry.recent.retain(|t| *t > start);
            }
            !entry.recent.is_empty()
        });
        before - entries.len()
    }

    pub fn count(&self, source_id: &str, address: Ipv4Addr) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&(source_id.to_string(), address))
            .map_or(0, |entry| entry.recent.len())
    }

    /// Number of tracked (source, address) pairs.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
