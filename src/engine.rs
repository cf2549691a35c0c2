//! The engine: owns every component and their lifecycle.
//!
//! Startup order matters. The firewall chain exists and matches the durable
//! ban set before any watcher produces a match:
//!
//! 1. acquire the firewall guard (setup)
//! 2. start the queue runner
//! 3. reconcile, then expire, both at Critical, and wait for them
//! 4. rebuild the match window cache from persisted matches
//! 5. start the watchers and the sweeper
//!
//! Shutdown runs the other way round and releases the guard last.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::Notifier;
use crate::bans::BanManager;
use crate::cache::MatchWindowCache;
use crate::clock::{to_chrono, Clock};
use crate::config::{EngineConfig, PathsConfig};
use crate::enforcer::{Enforcer, FirewallGuard};
use crate::error::BanwatchError;
use crate::pipeline::Pipeline;
use crate::queue::{JobQueue, Priority};
use crate::registry::{SourceEvent, SourceRegistry};
use crate::source::{CompiledSource, SourceConfig};
use crate::status::StatusSnapshot;
use crate::store::Store;
use crate::watcher::{StreamOpener, WatcherContext, WatcherManager};

/// Timings and paths the engine needs from the configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sweep_interval: Duration,
    pub retry_interval: Duration,
    pub match_retention: Duration,
    /// Where status snapshots go; `None` disables them
    pub status_path: Option<PathBuf>,
}

impl EngineSettings {
    pub fn from_config(engine: &EngineConfig, paths: &PathsConfig) -> Self {
        Self {
            sweep_interval: engine.sweep_interval,
            retry_interval: engine.retry_interval,
            match_retention: engine.match_retention,
            status_path: Some(paths.status.clone()),
        }
    }
}

/// External collaborators, injected so tests can substitute each one.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub enforcer: Arc<Enforcer>,
    pub notifier: Arc<dyn Notifier>,
    pub opener: Arc<dyn StreamOpener>,
    pub clock: Arc<dyn Clock>,
}

/// State shared with the sweeper task and queue jobs.
struct Shared {
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    enforcer: Arc<Enforcer>,
    queue: JobQueue,
    cache: Arc<MatchWindowCache>,
    bans: Arc<BanManager>,
    registry: Arc<SourceRegistry>,
    watchers: Arc<WatcherManager>,
}

pub struct Engine {
    shared: Arc<Shared>,
    guard: Option<FirewallGuard>,
    runner: Option<JoinHandle<()>>,
    sweeper: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        collaborators: Collaborators,
        sources: Vec<CompiledSource>,
    ) -> Self {
        let Collaborators {
            store,
            enforcer,
            notifier,
            opener,
            clock,
        } = collaborators;

        let queue = JobQueue::new();
        let cache = Arc::new(MatchWindowCache::new());
        let bans = Arc::new(BanManager::new(
            Arc::clone(&store),
            Arc::clone(&enforcer),
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ));
        let pipeline = Pipeline::new(queue.clone(), Arc::clone(&cache), Arc::clone(&bans), notifier);
        let watchers = Arc::new(WatcherManager::new(WatcherContext {
            opener,
            sink: Arc::new(pipeline),
            clock: Arc::clone(&clock),
            retry_interval: settings.retry_interval,
        }));

        Self {
            shared: Arc::new(Shared {
                settings,
                clock,
                store,
                enforcer,
                queue,
                cache,
                bans,
                registry: Arc::new(SourceRegistry::new(sources)),
                watchers,
            }),
            guard: None,
            runner: None,
            sweeper: None,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.shared.queue
    }

    pub fn bans(&self) -> &Arc<BanManager> {
        &self.shared.bans
    }

    pub fn cache(&self) -> &Arc<MatchWindowCache> {
        &self.shared.cache
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.shared.registry
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.shared.enforcer
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_some()
    }

    pub async fn start(&mut self) -> Result<(), BanwatchError> {
        if self.is_running() {
            return Ok(());
        }
        let shared = &self.shared;
        info!(
            backend = shared.enforcer.backend_name(),
            sources = shared.registry.len(),
            "Starting engine"
        );

        self.guard = Some(FirewallGuard::acquire(Arc::clone(&shared.enforcer)).await?);
        self.runner = Some(shared.queue.spawn_runner());

        let bans = Arc::clone(&shared.bans);
        shared.queue.enqueue(
            "startup-reconcile",
            bans,
            |bans| async move {
                bans.reconcile().await?;
                Ok(())
            },
            Priority::Critical,
        )?;
        Shared::enqueue_expiry(shared, "startup-expiry", Priority::Critical)?;
        shared.queue.wait_idle().await;

        let seeded = shared.rebuild_cache().await?;
        debug!(entries = seeded, "Match window cache rebuilt");

        shared.watchers.start_all(&shared.registry.all()).await;
        self.sweeper = Some(spawn_sweeper(Arc::clone(shared)));
        info!("Engine started");
        Ok(())
    }

    /// Stop producing, drain, tear the firewall down, write a final status.
    pub async fn shutdown(&mut self) -> Result<(), BanwatchError> {
        info!("Shutting down engine");
        if let Some((token, handle)) = self.sweeper.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Sweeper task ended abnormally: {}", e);
            }
        }

        self.shared.watchers.stop_all().await;
        self.shared.queue.wait_idle().await;
        self.shared.queue.close();
        if let Some(runner) = self.runner.take() {
            if let Err(e) = runner.await {
                warn!("Queue runner ended abnormally: {}", e);
            }
        }

        let released = match self.guard.take() {
            Some(guard) => guard.release().await,
            None => Ok(()),
        };
        self.shared.write_status().await;
        info!("Engine stopped");
        released
    }

    /// Enqueue one sweep and wait until the queue drains.
    pub async fn sweep_now(&self) -> Result<(), BanwatchError> {
        self.shared.schedule_sweep()?;
        self.shared.queue.wait_idle().await;
        Ok(())
    }

    /// Apply one source change and restart the watcher set.
    pub async fn apply_source_event(&self, event: SourceEvent) -> Result<(), BanwatchError> {
        let id = event.source_id().to_string();
        if self.shared.registry.apply(vec![event])? {
            info!(source = %id, "Source changed, restarting watchers");
            self.restart_watchers().await;
        }
        Ok(())
    }

    /// Bring the registry in line with `sources`. Returns the number of
    /// changes; watchers restart once if there were any.
    pub async fn reload(&self, sources: Vec<SourceConfig>) -> Result<usize, BanwatchError> {
        let events = self.shared.registry.diff(&sources);
        let changes = events.len();
        if self.shared.registry.apply(events)? {
            info!(changes, "Sources reloaded, restarting watchers");
            self.restart_watchers().await;
        } else {
            info!("Sources unchanged");
        }
        Ok(changes)
    }

    async fn restart_watchers(&self) {
        if self.is_running() {
            self.shared
                .watchers
                .restart_all(&self.shared.registry.all())
                .await;
        }
    }

    pub async fn status(&self) -> Result<StatusSnapshot, BanwatchError> {
        self.shared.snapshot().await
    }
}

impl Shared {
    fn enqueue_expiry(
        shared: &Arc<Self>,
        label: &'static str,
        priority: Priority,
    ) -> Result<(), BanwatchError> {
        shared.queue.enqueue(
            label,
            Arc::clone(shared),
            |shared| async move {
                let registry = Arc::clone(&shared.registry);
                shared.bans.expire_bans(|id| registry.contains(id)).await?;
                Ok(())
            },
            priority,
        )
    }

    /// Expiry then reconcile at Low; pruning and status at Background.
    fn schedule_sweep(self: &Arc<Self>) -> Result<(), BanwatchError> {
        self.queue.enqueue(
            "sweep-bans",
            Arc::clone(self),
            |shared| async move {
                let registry = Arc::clone(&shared.registry);
                shared.bans.expire_bans(|id| registry.contains(id)).await?;
                shared.bans.reconcile().await?;
                Ok(())
            },
            Priority::Low,
        )?;
        self.queue.enqueue(
            "sweep-prune",
            Arc::clone(self),
            |shared| async move { shared.prune().await },
            Priority::Background,
        )?;
        self.queue.enqueue(
            "sweep-status",
            Arc::clone(self),
            |shared| async move {
                shared.write_status().await;
                Ok(())
            },
            Priority::Background,
        )
    }

    async fn prune(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let registry = Arc::clone(&self.registry);
        let dropped = self.cache.prune(now, |id| registry.find_time(id));

        let cutoff = now
            .checked_sub_signed(to_chrono(self.settings.match_retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pruned = self.store.prune_matches(cutoff).await?;
        debug!(cache_entries = dropped, matches = pruned, "Pruned");
        Ok(())
    }

    /// Seed the cache with each source's matches inside its window.
    async fn rebuild_cache(&self) -> Result<usize, BanwatchError> {
        let now = self.clock.now();
        let mut seeded = 0;
        for source in self.registry.all() {
            let config = &source.config;
            let since = now
                .checked_sub_signed(to_chrono(config.find_time))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let mut by_address: HashMap<Ipv4Addr, Vec<DateTime<Utc>>> = HashMap::new();
            for record in self.store.matches_since(source.id(), since).await? {
                if record.ignored || source.ignore.is_ignored(record.address) {
                    continue;
                }
                by_address.entry(record.address).or_default().push(record.timestamp);
            }
            for (address, timestamps) in by_address {
                self.cache
                    .seed(source.id(), address, timestamps, config.max_matches);
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    async fn snapshot(&self) -> Result<StatusSnapshot, BanwatchError> {
        Ok(StatusSnapshot {
            updated_at: self.clock.now(),
            watchers: self.watchers.statuses().await,
            active_bans: self.store.find_active_bans().await?.len(),
            applied_rules: self.enforcer.applied().await.len(),
            queue_pending: self.queue.pending(),
        })
    }

    async fn write_status(&self) {
        let Some(path) = &self.settings.status_path else {
            return;
        };
        let snapshot = match self.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot build status snapshot: {}", e);
                return;
            }
        };
        if let Err(e) = snapshot.save(path) {
            warn!("Cannot write status snapshot: {:#}", e);
        }
    }
}

fn spawn_sweeper(shared: Arc<Shared>) -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let cancel = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.settings.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already swept
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = shared.schedule_sweep() {
                        error!("Sweep not scheduled: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("Sweeper stopped");
    });
    (token, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::NullNotifier;
    use crate::clock::ManualClock;
    use crate::enforcer::mock::{enforcer_with, RecordingExecutor};
    use crate::records::{BanRecord, MatchRecord};
    use crate::store::JsonStore;
    use crate::watcher::testing::ScriptedOpener;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const ADDR: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

    struct Fixture {
        engine: Engine,
        store: Arc<JsonStore>,
        executor: Arc<RecordingExecutor>,
        opener: Arc<ScriptedOpener>,
        clock: Arc<ManualClock>,
        _dir: TempDir,
        status_path: PathBuf,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn source(id: &str) -> SourceConfig {
        let mut config = SourceConfig::file(id, "/var/log/test.log", "^test.*<IP>.*300$");
        config.max_matches = 3;
        config.find_time = Duration::from_secs(600);
        config.ban_time = Duration::from_secs(3_600);
        config
    }

    fn fixture_with(store: JsonStore, sources: Vec<SourceConfig>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let status_path = dir.path().join("status.json");
        let store = Arc::new(store);
        let executor = Arc::new(RecordingExecutor::new());
        let opener = Arc::new(ScriptedOpener::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = Engine::new(
            EngineSettings {
                sweep_interval: Duration::from_secs(3_600),
                retry_interval: Duration::from_secs(3_600),
                match_retention: Duration::from_secs(7 * 86_400),
                status_path: Some(status_path.clone()),
            },
            Collaborators {
                store: store.clone(),
                enforcer: Arc::new(enforcer_with(Arc::clone(&executor))),
                notifier: Arc::new(NullNotifier),
                opener: opener.clone(),
                clock: clock.clone(),
            },
            sources
                .into_iter()
                .map(|s| CompiledSource::compile(s).unwrap())
                .collect(),
        );
        Fixture {
            engine,
            store,
            executor,
            opener,
            clock,
            _dir: dir,
            status_path,
        }
    }

    async fn wait_for_open_count(opener: &ScriptedOpener, n: usize) {
        for _ in 0..200 {
            if opener.open_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("opener reached {} opens, wanted {}", opener.open_count(), n);
    }

    async fn wait_for_bans(store: &JsonStore, n: usize) {
        for _ in 0..200 {
            if store.find_active_bans().await.unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} active bans", n);
    }

    #[tokio::test]
    async fn test_lines_to_ban_end_to_end() {
        let mut f = fixture_with(JsonStore::in_memory(), vec![source("test")]);
        let lines = f.opener.push_stream();
        f.engine.start().await.unwrap();
        wait_for_open_count(&f.opener, 1).await;

        lines
            .send(b"test 1.2.3.4 300\ntest 1.2.3.4 300\ntest 1.2.3.4 300\n".to_vec())
            .unwrap();
        wait_for_bans(&f.store, 1).await;
        f.engine.queue().wait_idle().await;

        assert_eq!(f.executor.count_containing("-I banwatch -s 1.2.3.4/32"), 1);
        assert!(f.engine.enforcer().is_applied(ADDR).await);

        f.engine.shutdown().await.unwrap();
        // Teardown reverted the rule and removed the chain
        assert_eq!(f.executor.count_containing("-D banwatch -s 1.2.3.4/32"), 1);
        assert_eq!(f.executor.count_containing("iptables -X banwatch"), 1);

        let status = StatusSnapshot::load(&f.status_path).unwrap().unwrap();
        assert_eq!(status.active_bans, 1);
        assert_eq!(status.applied_rules, 0);
    }

    #[tokio::test]
    async fn test_startup_restores_and_expires_bans() {
        let store = JsonStore::in_memory();
        store
            .create_ban(BanRecord::new(ADDR, "test", t0(), Duration::from_secs(3_600)))
            .await
            .unwrap();
        store
            .create_ban(BanRecord::new(
                Ipv4Addr::new(5, 6, 7, 8),
                "test",
                t0() - chrono::Duration::hours(2),
                Duration::from_secs(3_600),
            ))
            .await
            .unwrap();

        let mut f = fixture_with(store, vec![source("test")]);
        f.engine.start().await.unwrap();

        let active = f.store.find_active_bans().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, ADDR);
        assert!(f.engine.enforcer().is_applied(ADDR).await);
        assert!(!f.engine.enforcer().is_applied(Ipv4Addr::new(5, 6, 7, 8)).await);
        assert_eq!(f.store.unbans().await.unwrap().len(), 1);

        f.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_rebuilt_from_history() {
        let store = JsonStore::in_memory();
        for (secs, ignored) in [(-30, false), (-20, false), (-10, true), (-700, false)] {
            store
                .create_match(MatchRecord {
                    id: 0,
                    source_id: "test".to_string(),
                    address: ADDR,
                    line: "test 1.2.3.4 300".to_string(),
                    pattern: "^test.*<IP>.*300$".to_string(),
                    timestamp: t0() + chrono::Duration::seconds(secs),
                    ignored,
                })
                .await
                .unwrap();
        }

        let mut f = fixture_with(store, vec![source("test")]);
        f.engine.start().await.unwrap();
        // The ignored match and the one outside the window do not count
        assert_eq!(f.engine.cache().count("test", ADDR), 2);
        f.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_expires_and_prunes() {
        let mut f = fixture_with(JsonStore::in_memory(), vec![source("test")]);
        f.engine.start().await.unwrap();

        let compiled = f.engine.registry().get("test").unwrap();
        f.engine
            .bans()
            .request_ban(ADDR, &compiled, "test 1.2.3.4 300", 3)
            .await
            .unwrap();
        f.engine.cache().record("test", ADDR, t0(), Duration::from_secs(600), 3);

        f.clock.advance(Duration::from_secs(3_600));
        f.engine.sweep_now().await.unwrap();

        assert!(f.store.find_active_bans().await.unwrap().is_empty());
        assert!(!f.engine.enforcer().is_applied(ADDR).await);
        assert!(f.engine.cache().is_empty());
        assert!(StatusSnapshot::load(&f.status_path).unwrap().is_some());

        f.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_removes_source_and_restarts_watchers() {
        let mut f = fixture_with(JsonStore::in_memory(), vec![source("test"), source("other")]);
        f.engine.start().await.unwrap();
        wait_for_open_count(&f.opener, 2).await;

        let changes = f.engine.reload(vec![source("test")]).await.unwrap();
        assert_eq!(changes, 1);
        assert!(!f.engine.registry().contains("other"));
        // Restart reopens the remaining source
        wait_for_open_count(&f.opener, 3).await;

        assert_eq!(f.engine.reload(vec![source("test")]).await.unwrap(), 0);
        f.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ban_of_removed_source_ends_on_sweep() {
        let mut f = fixture_with(JsonStore::in_memory(), vec![source("test"), source("other")]);
        f.engine.start().await.unwrap();
        let other = f.engine.registry().get("other").unwrap();
        f.engine
            .bans()
            .request_ban(ADDR, &other, "x", 3)
            .await
            .unwrap();

        f.engine
            .apply_source_event(SourceEvent::Removed("other".to_string()))
            .await
            .unwrap();
        f.engine.sweep_now().await.unwrap();

        let unbans = f.store.unbans().await.unwrap();
        assert_eq!(unbans.len(), 1);
        assert_eq!(unbans[0].reason, crate::records::UnbanReason::SourceRemoved);
        f.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_source_event_is_rejected() {
        let f = fixture_with(JsonStore::in_memory(), vec![source("test")]);
        let mut broken = source("web");
        broken.pattern = "no placeholder here".to_string();
        let err = f
            .engine
            .apply_source_event(SourceEvent::Created(broken))
            .await
            .unwrap_err();
        assert!(matches!(err, BanwatchError::InvalidPattern { .. }));
        assert_eq!(f.engine.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_setup_does_not_start() {
        let mut f = fixture_with(JsonStore::in_memory(), vec![source("test")]);
        f.executor.fail_when("-I INPUT -j banwatch");
        assert!(f.engine.start().await.is_err());
        assert!(!f.engine.is_running());
    }
}
