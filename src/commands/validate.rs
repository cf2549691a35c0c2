//! Validate command implementation.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::validation::format_interval;

/// Load and validate the configuration, then list its sources.
pub fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    println!();
    println!("Configuration OK: {}", config_path.display());
    println!(
        "Firewall: {:?} (chain {}, timeout {})",
        config.firewall.backend,
        config.firewall.chain,
        format_interval(config.firewall.command_timeout)
    );
    println!();

    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!("Sources ({}):", config.sources.len());
    for source in &config.sources {
        let paused = if source.paused { " [paused]" } else { "" };
        println!(
            "  {} ({}) {} {}{}",
            source.id,
            source.display_name(),
            source.kind,
            source.locator,
            paused
        );
        println!(
            "      ban after {} matches in {}, for {}; {} ignore entr{}",
            source.max_matches,
            format_interval(source.find_time),
            format_interval(source.ban_time),
            source.ignore.len(),
            if source.ignore.len() == 1 { "y" } else { "ies" }
        );
    }
    println!();
    Ok(())
}
