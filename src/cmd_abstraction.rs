//! Command execution abstraction for testability.
//!
//! Firewall commands go through [`CommandExecutor`] so that unit tests can
//! mock them and `run --dry-run` can log them instead of executing anything.

use anyhow::Result;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// A successful, silent command result.
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
            ..Default::default()
        }
    }
}

/// Trait for command execution, allowing dependency injection for testing.
///
/// The real implementation spawns the program; dropping the returned future
/// kills the child, so callers can bound execution with `tokio::time::timeout`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute `cmd` with `args` and collect its output.
    ///
    /// An `Err` means the program could not be run at all; a program that ran
    /// and exited non-zero is reported through [`CommandOutput::success`].
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Real implementation of CommandExecutor that runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for RealCommandExecutor {
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Executor that logs commands instead of running them.
///
/// Every command "succeeds". The command lines are kept so callers (and
/// integration tests) can inspect what would have been executed.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    history: Mutex<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command lines seen so far, in execution order.
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CommandExecutor for DryRunExecutor {
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let line = format_command(cmd, args);
        info!(command = %line, "dry-run: skipping firewall command");
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
        Ok(CommandOutput::ok())
    }
}

/// Render a command the way an operator would type it.
pub fn format_command(cmd: &str, args: &[String]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    }
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has issues with lifetimes in `&[&str]`, so the trait takes
/// `&[String]` instead.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
