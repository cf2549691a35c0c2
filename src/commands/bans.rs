//! Bans command: list active bans from the record store.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

use crate::config::Config;
use crate::store::{JsonStore, Store};
use crate::utils::format_remaining;

/// Run the bans command
pub async fn run(json: bool, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = JsonStore::open(&config.paths.store)
        .with_context(|| format!("Failed to open record store {:?}", config.paths.store))?;

    let mut bans = store.find_active_bans().await?;
    bans.sort_by_key(|b| b.timestamp);

    if json {
        println!("{}", serde_json::to_string_pretty(&bans)?);
        return Ok(());
    }

    println!();
    if bans.is_empty() {
        println!("No active bans.");
        println!();
        return Ok(());
    }

    let now = Utc::now();
    println!("{:<15} {:<20} {:<20} REMAINING", "ADDRESS", "SOURCE", "SINCE");
    for ban in &bans {
        println!(
            "{:<15} {:<20} {:<20} {}",
            ban.address.to_string(),
            ban.source_id,
            ban.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            format_remaining(ban.remaining(now))
        );
    }
    println!();
    println!("Total: {} active ban(s)", bans.len());
    println!();
    Ok(())
}
