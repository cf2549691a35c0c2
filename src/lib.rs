//! # banwatch - log-driven intrusion response for Linux hosts
//!
//! banwatch tails log files and container output, extracts the client
//! address from lines matching operator-defined patterns, counts repeated
//! offenses per address inside a sliding window and bans offenders in the
//! host firewall until their ban expires.
//!
//! ## Features
//!
//! - **Pattern sources** - File tails and container log streams, one pattern per source
//! - **Sliding window** - `max_matches` within `find_time` triggers a ban for `ban_time`
//! - **Ignore lists** - Exact addresses and CIDR ranges that are recorded but never banned
//! - **Serialized side effects** - A single-runner priority queue orders every ban, unban and write
//! - **Idempotent enforcement** - iptables or nftables, reconciled against the durable ban set
//! - **Crash-safe cleanup** - The firewall chain is torn down even on abnormal exit paths
//! - **Alerting** - Gotify, email, and webhook notifications
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        banwatch                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, check, validate, status, bans, unban  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)  ·  Source registry (SIGHUP reload)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Watchers (file tail, container logs)                       │
//! │    └── PatternMatcher + IgnoreList ──▶ MatchEvent           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline ──▶ JobQueue (Critical > High > ... > Background) │
//! │    ├── MatchWindowCache (ban decision)                      │
//! │    ├── BanManager (create / expire / lift)                  │
//! │    └── Store (JSON snapshot)                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Enforcer (FirewallBackend trait) + FirewallGuard           │
//! │    ├── IptablesBackend (default)                            │
//! │    └── NftablesBackend                                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Alerts (gotify, smtp, webhook)                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use banwatch::alerts::NullNotifier;
//! use banwatch::clock::SystemClock;
//! use banwatch::cmd_abstraction::DryRunExecutor;
//! use banwatch::config::Config;
//! use banwatch::enforcer::{create_backend, Enforcer};
//! use banwatch::engine::{Collaborators, Engine, EngineSettings};
//! use banwatch::store::JsonStore;
//! use banwatch::watcher::SystemStreamOpener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/banwatch/config.yaml")?;
//!     let enforcer = Enforcer::new(
//!         create_backend(&config.firewall)?,
//!         Arc::new(DryRunExecutor::new()),
//!         config.firewall.command_timeout,
//!     );
//!
//!     let mut engine = Engine::new(
//!         EngineSettings::from_config(&config.engine, &config.paths),
//!         Collaborators {
//!             store: Arc::new(JsonStore::open(&config.paths.store)?),
//!             enforcer: Arc::new(enforcer),
//!             notifier: Arc::new(NullNotifier),
//!             opener: Arc::new(SystemStreamOpener::new(
//!                 config.engine.poll_interval,
//!                 &config.engine.container_runtime,
//!             )),
//!             clock: Arc::new(SystemClock),
//!         },
//!         config.compile_sources()?,
//!     );
//!
//!     engine.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Security
//!
//! - **Input Validation** - Patterns, addresses, CIDR ranges and firewall identifiers are validated before use
//! - **Injection Prevention** - Firewall commands are argv vectors, never shell strings; HTTP headers are sanitized
//! - **Credential Protection** - Support for environment variables, memory zeroed on drop
//! - **Atomic Operations** - Records, status and config are written atomically
//! - **HTTPS Only** - Alert URLs must use HTTPS
//!
//! ## Modules
//!
//! - [`alerts`] - Notifier seam and alert destinations (Gotify, Email, Webhook)
//! - [`bans`] - Ban lifecycle: create, expire, lift, reconcile
//! - [`cache`] - Match window cache and the ban decision
//! - [`cli`] - Command-line interface definitions
//! - [`clock`] - Wall clock abstraction
//! - [`cmd_abstraction`] - External command execution (real, dry-run, mock)
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`enforcer`] - Firewall backends, applied set and scoped teardown
//! - [`engine`] - Component ownership, startup, sweeps and shutdown
//! - [`error`] - Domain error taxonomy
//! - [`ignore`] - Ignore-list checks
//! - [`lock`] - File locking for single-instance operation
//! - [`pattern`] - Placeholder patterns and address extraction
//! - [`pipeline`] - Match events to queue jobs
//! - [`queue`] - Priority job queue with a single runner
//! - [`records`] - Match, ban and unban records
//! - [`registry`] - Source registry and change events
//! - [`signal`] - Shutdown and reload signals
//! - [`source`] - Source definitions and their compiled form
//! - [`status`] - Status snapshot file
//! - [`store`] - Record persistence
//! - [`utils`] - Common utility functions (formatting, truncation)
//! - [`validation`] - Address, interval and identifier validation
//! - [`watcher`] - Source watchers and stream implementations

pub mod alerts;
pub mod bans;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod ignore;
pub mod lock;
pub mod pattern;
pub mod pipeline;
pub mod queue;
pub mod records;
pub mod registry;
pub mod signal;
pub mod source;
pub mod status;
pub mod store;
pub mod utils;
pub mod validation;
pub mod watcher;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use engine::Engine;
pub use error::BanwatchError;
