//! Source registry: source id to compiled source.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

use crate::error::BanwatchError;
use crate::source::{CompiledSource, SourceConfig};

/// A change to the configured sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Created(SourceConfig),
    Updated(SourceConfig),
    Removed(String),
}

impl SourceEvent {
    pub fn source_id(&self) -> &str {
        match self {
            SourceEvent::Created(c) | SourceEvent::Updated(c) => &c.id,
            SourceEvent::Removed(id) => id,
        }
    }
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<BTreeMap<String, Arc<CompiledSource>>>,
}

enum Compiled {
    Put(Arc<CompiledSource>),
    Remove(String),
}

impl SourceRegistry {
    pub fn new(sources: impl IntoIterator<Item = CompiledSource>) -> Self {
        let map = sources
            .into_iter()
            .map(|s| (s.id().to_string(), Arc::new(s)))
            .collect();
        Self {
            sources: RwLock::new(map),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<CompiledSource>> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn find_time(&self, id: &str) -> Option<Duration> {
        self.read().get(id).map(|s| s.config.find_time)
    }

    /// Every source, ordered by id.
    pub fn all(&self) -> Vec<Arc<CompiledSource>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<CompiledSource>>> {
        self.sources.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Events that turn the registry into `sources`.
    pub fn diff(&self, sources: &[SourceConfig]) -> Vec<SourceEvent> {
        let current = self.read();
        let mut events = Vec::new();
        for config in sources {
            match current.get(&config.id) {
                None => events.push(SourceEvent::Created(config.clone())),
                Some(existing) if existing.config != *config => {
                    events.push(SourceEvent::Updated(config.clone()))
                }
                Some(_) => {}
            }
        }
        for id in current.keys() {
            if !sources.iter().any(|c| &c.id == id) {
                events.push(SourceEvent::Removed(id.clone()));
            }
        }
        events
    }

    /// Apply `events` all or nothing.
    ///
    /// Everything is checked and compiled before the registry changes, so an
    /// invalid pattern leaves it as it was. Returns whether anything changed.
    pub fn apply(&self, events: Vec<SourceEvent>) -> Result<bool, BanwatchError> {
        let mut staged = Vec::with_capacity(events.len());
        {
            let current = self.read();
            for event in events {
                match event {
                    SourceEvent::Created(config) => {
                        if current.contains_key(&config.id) {
                            return Err(BanwatchError::Config(format!(
                                "source '{}' already exists",
                                config.id
                            )));
                        }
                        staged.push(Compiled::Put(Arc::new(CompiledSource::compile(config)?)));
                    }
                    SourceEvent::Updated(config) => {
                        if !current.contains_key(&config.id) {
                            return Err(BanwatchError::Config(format!(
                                "source '{}' does not exist",
                                config.id
                            )));
                        }
                        staged.push(Compiled::Put(Arc::new(CompiledSource::compile(config)?)));
                    }
                    SourceEvent::Removed(id) => {
                        if current.contains_key(&id) {
                            staged.push(Compiled::Remove(id));
                        }
                    }
                }
            }
        }

        if staged.is_empty() {
            return Ok(false);
        }
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        for change in staged {
            match change {
                Compiled::Put(source) => {
                    info!(source = %source.id(), "Source registered");
                    sources.insert(source.id().to_string(), source);
                }
                Compiled::Remove(id) => {
                    info!(source = %id, "Source removed");
                    sources.remove(&id);
                }
            }
        }
        Ok(true)
    }
}
