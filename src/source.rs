//! Source definitions and their compiled form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::BanwatchError;
use crate::ignore::IgnoreList;
use crate::pattern::PatternMatcher;
use crate::validation::{duration_serde, validate_source_id};

/// Kind of stream a source reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Append-only file, tailed for new bytes
    #[default]
    File,
    /// Container log stream in follow mode
    Container,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::File => write!(f, "file"),
            SourceKind::Container => write!(f, "container"),
        }
    }
}

/// One watched source as declared by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    /// File path or container identifier
    pub locator: String,
    pub pattern: String,
    #[serde(default = "default_ban_time", with = "duration_serde")]
    pub ban_time: Duration,
    #[serde(default = "default_find_time", with = "duration_serde")]
    pub find_time: Duration,
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub paused: bool,
}

fn default_ban_time() -> Duration {
    Duration::from_secs(3_600)
}

fn default_find_time() -> Duration {
    Duration::from_secs(600)
}

fn default_max_matches() -> usize {
    5
}

impl SourceConfig {
    /// A file source with default timings.
    pub fn file(id: &str, path: &str, pattern: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            kind: SourceKind::File,
            locator: path.to_string(),
            pattern: pattern.to_string(),
            ban_time: default_ban_time(),
            find_time: default_find_time(),
            max_matches: default_max_matches(),
            ignore: Vec::new(),
            paused: false,
        }
    }

    /// Name shown to operators; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Check the fields that do not need compiling.
    pub fn validate(&self) -> Result<(), BanwatchError> {
        validate_source_id(&self.id).map_err(|e| BanwatchError::Config(e.to_string()))?;
        if self.locator.trim().is_empty() {
            return Err(BanwatchError::Config(format!(
                "source '{}': locator cannot be empty",
                self.id
            )));
        }
        if self.max_matches == 0 {
            return Err(BanwatchError::Config(format!(
                "source '{}': max_matches must be at least 1",
                self.id
            )));
        }
        if self.find_time.is_zero() {
            return Err(BanwatchError::Config(format!(
                "source '{}': find_time must be greater than zero",
                self.id
            )));
        }
        Ok(())
    }
}

/// A source with its pattern and ignore list compiled once.
///
/// Shared behind an `Arc` by the watcher and the pipeline; replaced
/// wholesale when the source is updated.
#[derive(Debug, Clone)]
pub struct CompiledSource {
    pub config: SourceConfig,
    pub matcher: PatternMatcher,
    pub ignore: IgnoreList,
}

impl CompiledSource {
    pub fn compile(config: SourceConfig) -> Result<Self, BanwatchError> {
        config.validate()?;
        let matcher = PatternMatcher::new(&config.pattern)?;
        let ignore = IgnoreList::parse(&config.ignore)
            .map_err(|e| BanwatchError::Config(format!("source '{}': {}", config.id, e)))?;
        Ok(Self {
            config,
            matcher,
            ignore,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}
