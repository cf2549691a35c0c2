//! Persisted record types: matches, bans and unbans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::clock::to_chrono;
use crate::validation::duration_serde;

/// A line that matched a source pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Assigned by the store; ignored on create
    #[serde(default)]
    pub id: u64,
    pub source_id: String,
    pub address: Ipv4Addr,
    pub line: String,
    pub pattern: String,
    pub timestamp: DateTime<Utc>,
    /// Address was on the source's ignore list (audit only)
    #[serde(default)]
    pub ignored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    #[serde(default)]
    pub id: u64,
    pub address: Ipv4Addr,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    /// Copied from the source when the ban was created
    #[serde(with = "duration_serde")]
    pub ban_time: Duration,
    pub active: bool,
}

impl BanRecord {
    pub fn new(address: Ipv4Addr, source_id: &str, timestamp: DateTime<Utc>, ban_time: Duration) -> Self {
        Self {
            id: 0,
            address,
            source_id: source_id.to_string(),
            timestamp,
            ban_time,
            active: true,
        }
    }

    /// `None` when the expiry does not fit in a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.checked_add_signed(to_chrono(self.ban_time))
    }

    /// True from `timestamp + ban_time` onwards.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at()
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// Why a ban ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnbanReason {
    Expired,
    SourceRemoved,
    Manual,
}

impl fmt::Display for UnbanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnbanReason::Expired => write!(f, "expired"),
            UnbanReason::SourceRemoved => write!(f, "source-removed"),
            UnbanReason::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbanRecord {
    #[serde(default)]
    pub id: u64,
    pub address: Ipv4Addr,
    pub source_id: String,
    pub ban_id: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: UnbanReason,
}

impl UnbanRecord {
    pub fn for_ban(ban: &BanRecord, timestamp: DateTime<Utc>, reason: UnbanReason) -> Self {
        Self {
            id: 0,
            address: ban.address,
            source_id: ban.source_id.clone(),
            ban_id: ban.id,
            timestamp,
            reason,
        }
    }
}
