//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "banwatch")]
#[command(author, version, about = "Watch logs, count offenses, ban offenders in the firewall")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine in the foreground (SIGHUP reloads sources)
    Run {
        /// Log firewall commands instead of executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Test a pattern against log lines
    Check {
        /// Pattern containing the <IP> placeholder
        #[arg(long, short)]
        pattern: String,

        /// Ignore-list entry (address or CIDR), repeatable
        #[arg(long, short)]
        ignore: Vec<String>,

        /// Lines to test; read from stdin when none are given
        lines: Vec<String>,
    },

    /// Validate the configuration file
    Validate,

    /// Show the status last written by the running engine
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List active bans
    Bans {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Lift every active ban on an address (engine must be stopped)
    Unban {
        /// IPv4 address to unban
        address: String,
    },

    /// Print a commented default configuration
    SampleConfig,

    /// Show version
    Version,
}
