//! Run command: the engine in the foreground.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::alerts::{AlertManager, Notifier, NullNotifier};
use crate::clock::SystemClock;
use crate::cmd_abstraction::{CommandExecutor, DryRunExecutor, RealCommandExecutor};
use crate::config::Config;
use crate::enforcer::{check_root, create_backend, Enforcer};
use crate::engine::{Collaborators, Engine, EngineSettings};
use crate::lock::LockGuard;
use crate::signal::{self, SignalEvent};
use crate::store::JsonStore;
use crate::watcher::SystemStreamOpener;

/// Run until SIGINT/SIGTERM; SIGHUP reloads the source list.
pub async fn run(dry_run: bool, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    if !dry_run {
        check_root()?;
    }
    let _lock = LockGuard::acquire(&config.paths.lock)?;

    let sources = config.compile_sources()?;
    if sources.is_empty() {
        warn!("No sources configured, nothing will be watched");
    }

    let executor: Arc<dyn CommandExecutor> = if dry_run {
        info!("Dry-run mode: firewall commands are logged, not executed");
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(RealCommandExecutor::new())
    };
    let enforcer = Arc::new(Enforcer::new(
        create_backend(&config.firewall)?,
        executor,
        config.firewall.command_timeout,
    ));

    let store = JsonStore::open(&config.paths.store)
        .with_context(|| format!("Failed to open record store {:?}", config.paths.store))?;
    let notifier: Arc<dyn Notifier> = if config.alerts.any_enabled() {
        Arc::new(AlertManager::new(config.alerts.clone())?)
    } else {
        Arc::new(NullNotifier)
    };

    let mut engine = Engine::new(
        EngineSettings::from_config(&config.engine, &config.paths),
        Collaborators {
            store: Arc::new(store),
            enforcer,
            notifier,
            opener: Arc::new(SystemStreamOpener::new(
                config.engine.poll_interval,
                &config.engine.container_runtime,
            )),
            clock: Arc::new(SystemClock),
        },
        sources,
    );

    let mut signals = signal::listen();
    engine.start().await.context("Engine failed to start")?;

    loop {
        match signals.recv().await {
            Some(SignalEvent::Reload) => reload(&engine, config_path).await,
            Some(SignalEvent::Shutdown) => break,
            None => {
                warn!("Signal listener unavailable, running until killed");
                std::future::pending::<()>().await;
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}

/// Reload sources from disk. A bad file keeps the current sources.
async fn reload(engine: &Engine, config_path: &Path) {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Reload rejected, keeping current sources: {:#}", e);
            return;
        }
    };
    match engine.reload(config.sources).await {
        Ok(0) => {}
        Ok(changes) => info!(changes, "Reload applied"),
        Err(e) => error!("Reload rejected, keeping current sources: {}", e),
    }
    info!("Only sources are reloaded; restart to apply other settings");
}
