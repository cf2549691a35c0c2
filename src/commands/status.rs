//! Status command implementation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::config::Config;
use crate::status::StatusSnapshot;
use crate::utils::{format_count, truncate};

/// Print the status file the running engine keeps up to date
pub fn run(json: bool, config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    let Some(snapshot) = StatusSnapshot::load(&config.paths.status)? else {
        println!();
        println!("banwatch: NO STATUS");
        println!();
        println!(
            "No status file at {}. Is the engine running?",
            config.paths.status.display()
        );
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!();
    println!(
        "Updated: {} ({})",
        snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        format_ago(snapshot.updated_at, Utc::now())
    );
    println!("Active bans: {}", snapshot.active_bans);
    println!("Applied rules: {}", snapshot.applied_rules);
    println!("Queue pending: {}", snapshot.queue_pending);
    println!();

    if snapshot.watchers.is_empty() {
        println!("No watchers.");
    } else {
        println!("{:<20} {:<10} {:<9} {:>8}  LAST ERROR", "SOURCE", "KIND", "STATUS", "LINES");
        for w in &snapshot.watchers {
            println!(
                "{:<20} {:<10} {:<9} {:>8}  {}",
                truncate(&w.source_id, 20),
                w.kind.to_string(),
                w.status.to_string(),
                format_count(w.processed_lines),
                w.last_error.as_deref().map(|e| truncate(e, 60)).unwrap_or_default()
            );
        }
    }

    let failing = snapshot.watchers_in_error();
    if failing > 0 {
        println!();
        println!("[WARN] {} watcher(s) in error, retrying", failing);
    }
    println!();
    Ok(())
}

fn format_ago(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = now.signed_duration_since(then).num_seconds();
    if seconds < 60 {
        "just now".to_string()
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86400)
    }
}
