//! Firewall enforcement (iptables, nftables).
//!
//! Backends only describe commands. [`Enforcer`] executes them, tracks the
//! set of addresses with an active deny rule and keeps deny/allow
//! idempotent. [`FirewallGuard`] ties chain setup and teardown to a scope.

mod iptables;
mod nftables;

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;

use crate::cmd_abstraction::{format_command, CommandExecutor};
use crate::config::{Backend, FirewallConfig};
use crate::error::BanwatchError;

/// One external command, rendered exactly as an operator would type it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Failure is expected in some states (e.g. chain already exists)
    pub tolerate_failure: bool,
}

impl RuleCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            tolerate_failure: false,
        }
    }

    pub fn tolerated(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }
}

impl fmt::Display for RuleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_command(&self.program, &self.args))
    }
}

/// Trait for firewall backends
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the chain, link it into the input path, flush stale rules
    fn setup(&self) -> Vec<RuleCommand>;

    fn deny(&self, address: Ipv4Addr) -> Vec<RuleCommand>;

    fn allow(&self, address: Ipv4Addr) -> Vec<RuleCommand>;

    /// Unlink and delete the chain. Per-address rules are reverted first by
    /// the enforcer.
    fn teardown(&self) -> Vec<RuleCommand>;
}

/// Detect available firewall backend
pub fn detect_backend() -> Result<Backend> {
    // Check nftables first (preferred)
    if Command::new("nft").arg("--version").output().is_ok() {
        return Ok(Backend::Nftables);
    }

    if Command::new("iptables").arg("--version").output().is_ok() {
        return Ok(Backend::Iptables);
    }

    anyhow::bail!("No firewall backend available (nft or iptables required)")
}

/// Create a firewall backend based on configuration
pub fn create_backend(config: &FirewallConfig) -> Result<Box<dyn FirewallBackend>> {
    let actual = match config.backend {
        Backend::Auto => detect_backend()?,
        other => other,
    };

    Ok(match actual {
        Backend::Nftables => Box::new(NftablesBackend::new(&config.table)),
        Backend::Iptables | Backend::Auto => Box::new(IptablesBackend::new(
            &config.chain,
            &config.link_chain,
            &config.reject_with,
        )),
    })
}

/// Check if running as root (effective UID == 0)
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() is a simple syscall that reads the effective user ID.
    // It has no preconditions, never fails, and doesn't modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, use --dry-run to log firewall commands without executing them."
        )
    }
    Ok(())
}

/// Result of converging the applied set onto the durable ban set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub denied: usize,
    pub allowed: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.denied == 0 && self.allowed == 0 && self.failed == 0
    }
}

/// Executes backend commands and owns the applied set.
pub struct Enforcer {
    backend: Box<dyn FirewallBackend>,
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
    /// Held across command execution, so deny/allow never interleave
    applied: Mutex<BTreeSet<Ipv4Addr>>,
}

impl fmt::Debug for Enforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enforcer")
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Enforcer {
    pub fn new(
        backend: Box<dyn FirewallBackend>,
        executor: Arc<dyn CommandExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            executor,
            timeout,
            applied: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn run(&self, cmd: &RuleCommand) -> Result<(), BanwatchError> {
        debug!(command = %cmd, "Executing firewall command");
        let failure = |reason: String| BanwatchError::FirewallCommand {
            command: cmd.to_string(),
            reason,
        };

        let output =
            match tokio::time::timeout(self.timeout, self.executor.execute(&cmd.program, &cmd.args))
                .await
            {
                Err(_) => return Err(failure(format!("timed out after {:?}", self.timeout))),
                Ok(Err(e)) => return Err(failure(e.to_string())),
                Ok(Ok(output)) => output,
            };

        if output.success {
            Ok(())
        } else {
            let stderr = output.stderr.trim();
            let reason = if stderr.is_empty() {
                match output.code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                }
            } else {
                stderr.to_string()
            };
            Err(failure(reason))
        }
    }

    /// Run commands in order; a tolerated failure is logged and skipped.
    async fn run_all(&self, cmds: &[RuleCommand]) -> Result<(), BanwatchError> {
        for cmd in cmds {
            match self.run(cmd).await {
                Ok(()) => {}
                Err(e) if cmd.tolerate_failure => debug!("Ignoring expected failure: {}", e),
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Create and link the chain, flushing anything left from a previous run.
    pub async fn init(&self) -> Result<(), BanwatchError> {
        let mut applied = self.applied.lock().await;
        self.run_all(&self.backend.setup()).await?;
        applied.clear();
        info!(backend = self.backend.name(), "Firewall chain ready");
        Ok(())
    }

    /// Insert a deny rule. Returns false if the address was already denied.
    ///
    /// The applied set only changes on confirmed success.
    pub async fn deny(&self, address: Ipv4Addr) -> Result<bool, BanwatchError> {
        let mut applied = self.applied.lock().await;
        if applied.contains(&address) {
            debug!(address = %address, "Deny rule already applied");
            return Ok(false);
        }
        self.run_all(&self.backend.deny(address)).await?;
        applied.insert(address);
        info!(address = %address, "Denied");
        Ok(true)
    }

    /// Remove a deny rule. Returns false if the address was not denied.
    pub async fn allow(&self, address: Ipv4Addr) -> Result<bool, BanwatchError> {
        let mut applied = self.applied.lock().await;
        if !applied.contains(&address) {
            debug!(address = %address, "No deny rule to remove");
            return Ok(false);
        }
        self.run_all(&self.backend.allow(address)).await?;
        applied.remove(&address);
        info!(address = %address, "Allowed");
        Ok(true)
    }

    /// Deny everything in `desired` that is missing and allow everything
    /// applied that is not desired.
    pub async fn reconcile(&self, desired: &BTreeSet<Ipv4Addr>) -> ReconcileReport {
        let current = self.applied().await;
        let mut report = ReconcileReport::default();

        for address in desired.difference(&current) {
            match self.deny(*address).await {
                Ok(true) => report.denied += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(address = %address, "Reconcile deny failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        for address in current.difference(desired) {
            match self.allow(*address).await {
                Ok(true) => report.allowed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(address = %address, "Reconcile allow failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        if !report.is_noop() {
            info!(
                denied = report.denied,
                allowed = report.allowed,
                failed = report.failed,
                "Reconciled firewall with active bans"
            );
        }
        report
    }

    /// Revert every applied rule, then unlink and delete the chain.
    ///
    /// Every step is attempted; the first hard failure is returned.
    pub async fn teardown(&self) -> Result<(), BanwatchError> {
        let mut applied = self.applied.lock().await;
        self.teardown_with(Some(&mut applied)).await
    }

    /// Teardown that never waits for the applied set. When another task
    /// holds it the per-address reverts are skipped; flushing the chain
    /// still removes those rules.
    async fn teardown_nowait(&self) -> Result<(), BanwatchError> {
        match self.applied.try_lock() {
            Ok(mut applied) => self.teardown_with(Some(&mut applied)).await,
            Err(_) => {
                warn!("Applied set busy, removing the chain without per-address reverts");
                self.teardown_with(None).await
            }
        }
    }

    async fn teardown_with(
        &self,
        applied: Option<&mut BTreeSet<Ipv4Addr>>,
    ) -> Result<(), BanwatchError> {
        let mut first_err = None;

        if let Some(applied) = applied {
            let addresses: Vec<Ipv4Addr> = applied.iter().copied().collect();
            for address in addresses {
                match self.run_all(&self.backend.allow(address)).await {
                    Ok(()) => {
                        applied.remove(&address);
                    }
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        for cmd in self.backend.teardown() {
            match self.run(&cmd).await {
                Ok(()) => {}
                Err(e) if cmd.tolerate_failure => debug!("Ignoring expected failure: {}", e),
                Err(e) => {
                    error!("{}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            None => {
                info!(backend = self.backend.name(), "Firewall chain removed");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Addresses with an active deny rule.
    pub async fn applied(&self) -> BTreeSet<Ipv4Addr> {
        self.applied.lock().await.clone()
    }

    pub async fn is_applied(&self, address: Ipv4Addr) -> bool {
        self.applied.lock().await.contains(&address)
    }
}

/// Upper bound for the teardown run from `Drop`.
const DROP_TEARDOWN_LIMIT: Duration = Duration::from_secs(120);

/// Scoped ownership of the firewall chain.
///
/// `acquire` sets the chain up and `release` tears it down. A guard dropped
/// without `release` tears down on a dedicated thread before the drop
/// returns. That thread never waits on the applied set, so a drop while
/// another task holds it cannot stall until the time limit.
pub struct FirewallGuard {
    enforcer: Arc<Enforcer>,
    released: bool,
}

impl FirewallGuard {
    pub async fn acquire(enforcer: Arc<Enforcer>) -> Result<Self, BanwatchError> {
        enforcer.init().await?;
        Ok(Self {
            enforcer,
            released: false,
        })
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    pub async fn release(mut self) -> Result<(), BanwatchError> {
        self.released = true;
        self.enforcer.teardown().await
    }
}

impl Drop for FirewallGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("Firewall guard dropped without release, tearing down");
        let enforcer = Arc::clone(&self.enforcer);
        let handle = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Cannot build runtime for teardown: {}", e);
                    return;
                }
            };
            match runtime.block_on(tokio::time::timeout(
                DROP_TEARDOWN_LIMIT,
                enforcer.teardown_nowait(),
            )) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Teardown after drop failed: {}", e),
                Err(_) => error!("Teardown after drop timed out"),
            }
        });
        if handle.join().is_err() {
            error!("Teardown thread panicked");
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::cmd_abstraction::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Executor that records every command and fails those containing any
    /// of the configured fragments.
    #[derive(Default)]
    pub struct RecordingExecutor {
        pub commands: StdMutex<Vec<String>>,
        pub fail_on: StdMutex<Vec<String>>,
    }

    impl RecordingExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_when(&self, fragment: &str) {
            self.fail_on.lock().unwrap().push(fragment.to_string());
        }

        pub fn clear_failures(&self) {
            self.fail_on.lock().unwrap().clear();
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        pub fn count_containing(&self, fragment: &str) -> usize {
            self.commands()
                .iter()
                .filter(|c| c.contains(fragment))
                .count()
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
            let line = format_command(cmd, args);
            self.commands.lock().unwrap().push(line.clone());
            let fails = self
                .fail_on
                .lock()
                .unwrap()
                .iter()
                .any(|f| line.contains(f.as_str()));
            if fails {
                Ok(CommandOutput {
                    stderr: "simulated failure".to_string(),
                    code: Some(1),
                    ..Default::default()
                })
            } else {
                Ok(CommandOutput::ok())
            }
        }
    }

    pub fn enforcer_with(executor: Arc<RecordingExecutor>) -> Enforcer {
        Enforcer::new(
            Box::new(IptablesBackend::default()),
            executor,
            Duration::from_secs(5),
        )
    }
}
