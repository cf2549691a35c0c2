//! Unban command: offline maintenance on the record store.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::alerts::NullNotifier;
use crate::bans::BanManager;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::lock::LockGuard;
use crate::store::JsonStore;
use crate::validation::validate_ipv4;

/// Lift every active ban on `address`.
///
/// Holds the instance lock, so it refuses to run beside the engine; the
/// engine's chain does not exist while it is stopped.
pub async fn run(address: &str, config_path: &Path) -> Result<()> {
    let address = validate_ipv4(address)?;
    let config = Config::load(config_path)?;
    let _lock = LockGuard::acquire(&config.paths.lock)
        .context("Stop the running engine before unbanning offline")?;

    let store = JsonStore::open(&config.paths.store)
        .with_context(|| format!("Failed to open record store {:?}", config.paths.store))?;
    let manager = BanManager::offline(Arc::new(store), Arc::new(NullNotifier), Arc::new(SystemClock));
    let lifted = manager.lift_address(address).await?;

    println!();
    if lifted.is_empty() {
        println!("{} has no active ban", address);
    } else {
        for unban in &lifted {
            println!("[OK] Lifted ban #{} ({}) on {}", unban.ban_id, unban.source_id, address);
        }
    }
    println!();
    Ok(())
}
