//! Error types for banwatch.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BanwatchError {
    /// Rejected when a source is created or updated, never at match time.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient; the owning watcher retries after its backoff.
    #[error("Watcher stream error: {0}")]
    WatcherStream(String),

    /// The applied-rule set is left untouched when this is returned.
    #[error("Firewall command failed: `{command}`: {reason}")]
    FirewallCommand { command: String, reason: String },

    #[error("Queue handler '{label}' failed: {reason}")]
    QueueHandler { label: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl BanwatchError {
    pub fn invalid_pattern(pattern: &str, reason: impl ToString) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(reason: impl ToString) -> Self {
        Self::Persistence(reason.to_string())
    }
}
