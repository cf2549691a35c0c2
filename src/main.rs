//! banwatch - log-driven intrusion response for Linux hosts.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use banwatch::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity; RUST_LOG wins when set
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?
        }
        Err(_) => {
            tracing::subscriber::set_global_default(builder.with_max_level(log_level).finish())?
        }
    }

    match cli.command {
        Commands::Run { dry_run } => banwatch::commands::run::run(dry_run, &cli.config).await,
        Commands::Check {
            pattern,
            ignore,
            lines,
        } => banwatch::commands::check::run(&pattern, &ignore, &lines),
        Commands::Validate => banwatch::commands::validate::run(&cli.config),
        Commands::Status { json } => banwatch::commands::status::run(json, &cli.config),
        Commands::Bans { json } => banwatch::commands::bans::run(json, &cli.config).await,
        Commands::Unban { address } => banwatch::commands::unban::run(&address, &cli.config).await,
        Commands::SampleConfig => {
            banwatch::commands::sample_config::run();
            Ok(())
        }
        Commands::Version => {
            println!("banwatch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
