//! Owns the set of running watchers.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{Watcher, WatcherContext, WatcherSnapshot};
use crate::source::CompiledSource;

pub struct WatcherManager {
    ctx: WatcherContext,
    watchers: Mutex<Vec<Watcher>>,
}

impl WatcherManager {
    pub fn new(ctx: WatcherContext) -> Self {
        Self {
            ctx,
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Start one watcher per source. Already running watchers are kept.
    pub async fn start_all(&self, sources: &[Arc<CompiledSource>]) {
        let mut watchers = self.watchers.lock().await;
        for source in sources {
            if watchers.iter().any(|w| w.source_id() == source.id()) {
                continue;
            }
            watchers.push(Watcher::spawn(Arc::clone(source), self.ctx.clone()));
        }
        info!(count = watchers.len(), "Watchers started");
    }

    /// Stop every watcher and wait for each to finish.
    pub async fn stop_all(&self) {
        let mut watchers = self.watchers.lock().await;
        for watcher in watchers.iter_mut() {
            watcher.stop().await;
        }
        let count = watchers.len();
        watchers.clear();
        info!(count, "Watchers stopped");
    }

    /// Stop everything, then start a watcher per source in `sources`.
    pub async fn restart_all(&self, sources: &[Arc<CompiledSource>]) {
        self.stop_all().await;
        self.start_all(sources).await;
    }

    pub async fn statuses(&self) -> Vec<WatcherSnapshot> {
        let watchers = self.watchers.lock().await;
        watchers.iter().map(Watcher::snapshot).collect()
    }

    pub async fn len(&self) -> usize {
        self.watchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
