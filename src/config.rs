//! Configuration management for banwatch.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::source::{CompiledSource, SourceConfig};
use crate::validation::duration_serde;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/banwatch/config.yaml";

/// Secure string type that zeroizes memory on drop
/// Used for sensitive data like tokens and passwords
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub firewall: FirewallConfig,
    pub engine: EngineConfig,
    pub paths: PathsConfig,
    pub alerts: AlertsConfig,
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        validate_identifier("firewall.chain", &self.firewall.chain)?;
        validate_identifier("firewall.link_chain", &self.firewall.link_chain)?;
        validate_identifier("firewall.table", &self.firewall.table)?;
        validate_identifier("firewall.reject_with", &self.firewall.reject_with)?;

        if self.firewall.command_timeout.is_zero() {
            anyhow::bail!("firewall.command_timeout must be greater than zero");
        }
        if self.engine.sweep_interval.is_zero() {
            anyhow::bail!("engine.sweep_interval must be greater than zero");
        }
        if self.engine.poll_interval.is_zero() {
            anyhow::bail!("engine.poll_interval must be greater than zero");
        }
        if self.engine.container_runtime.trim().is_empty() {
            anyhow::bail!("engine.container_runtime cannot be empty");
        }

        self.compile_sources()?;

        // Validate webhook URL uses HTTPS if enabled
        if self.alerts.webhook.enabled
            && !self.alerts.webhook.url.is_empty()
            && !self.alerts.webhook.url.starts_with("https://")
        {
            anyhow::bail!("Webhook URL must use HTTPS: {}", self.alerts.webhook.url);
        }

        // Validate Gotify URL uses HTTPS if enabled
        if self.alerts.gotify.enabled
            && !self.alerts.gotify.url.is_empty()
            && !self.alerts.gotify.url.starts_with("https://")
        {
            anyhow::bail!("Gotify URL must use HTTPS: {}", self.alerts.gotify.url);
        }

        Ok(())
    }

    /// Compile every source, rejecting duplicate ids.
    pub fn compile_sources(&self) -> Result<Vec<CompiledSource>> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                anyhow::bail!("Duplicate source id '{}'", source.id);
            }
            let c = CompiledSource::compile(source.clone())
                .with_context(|| format!("Invalid source '{}'", source.id))?;
            compiled.push(c);
        }
        Ok(compiled)
    }

    /// Generate default config with comments
    pub fn generate_default_yaml() -> String {
        include_str!("../templates/config.yaml").to_string()
    }
}

/// Chain, table and reject-type names end up as command arguments.
fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 28 {
        anyhow::bail!("{} must be 1-28 characters, got '{}'", field, value);
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_".contains(c))
    {
        anyhow::bail!(
            "Invalid {} '{}'. Use letters, digits, '-' or '_'",
            field,
            value
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Auto-detect backend (checks nftables first, then iptables)
    Auto,
    #[default]
    Iptables,
    Nftables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub backend: Backend,
    /// iptables chain holding the per-address rules
    pub chain: String,
    /// Built-in chain the jump is inserted into
    pub link_chain: String,
    pub reject_with: String,
    /// nftables table name
    pub table: String,
    #[serde(with = "duration_serde")]
    pub command_timeout: Duration,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Iptables,
            chain: "banwatch".to_string(),
            link_chain: "INPUT".to_string(),
            reject_with: "icmp-port-unreachable".to_string(),
            table: "banwatch".to_string(),
            command_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache pruning, ban expiry, reconcile and status cadence
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
    /// Fixed backoff before a failed watcher reopens its stream
    #[serde(with = "duration_serde")]
    pub retry_interval: Duration,
    /// How often tailed files are checked for new bytes
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
    /// Match records older than this are pruned
    #[serde(with = "duration_serde")]
    pub match_retention: Duration,
    pub container_runtime: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            match_retention: Duration::from_secs(7 * 86_400),
            container_runtime: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub store: PathBuf,
    pub status: PathBuf,
    pub lock: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from("/var/lib/banwatch/records.json"),
            status: PathBuf::from("/var/lib/banwatch/status.json"),
            lock: PathBuf::from("/var/run/banwatch.lock"),
        }
    }
}

/// Event kinds that can be delivered to alert channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEvent {
    Ban,
    Unban,
    Match,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub events: Vec<AlertEvent>,
    pub gotify: GotifyConfig,
    pub email: EmailConfig,
    pub webhook: WebhookConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            events: vec![AlertEvent::Ban, AlertEvent::Unban],
            gotify: GotifyConfig::default(),
            email: EmailConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl AlertsConfig {
    pub fn any_enabled(&self) -> bool {
        self.gotify.enabled || self.email.enabled || self.webhook.enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GotifyConfig {
    pub enabled: bool,
    pub url: String,
    /// Token can be set directly or via BANWATCH_GOTIFY_TOKEN env var
    pub token: SecureString,
    /// Environment variable name to read token from (optional)
    #[serde(default)]
    pub token_env: Option<String>,
}

impl GotifyConfig {
    /// Get the effective token, checking env vars before the config value
    pub fn get_token(&self) -> SecureString {
        if let Some(ref env_name) = self.token_env {
            if let Ok(val) = env::var(env_name) {
                return SecureString::new(val);
            }
        }
        if let Ok(val) = env::var("BANWATCH_GOTIFY_TOKEN") {
            return SecureString::new(val);
        }
        self.token.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    /// Password can be set directly or via BANWATCH_SMTP_PASSWORD env var
    pub smtp_password: SecureString,
    #[serde(default)]
    pub smtp_password_env: Option<String>,
    pub from: String,
    pub to: String,
}

impl EmailConfig {
    /// Get the effective password, checking env vars before the config value
    pub fn get_password(&self) -> SecureString {
        if let Some(ref env_name) = self.smtp_password_env {
            if let Ok(val) = env::var(env_name) {
                return SecureString::new(val);
            }
        }
        if let Ok(val) = env::var("BANWATCH_SMTP_PASSWORD") {
            return SecureString::new(val);
        }
        self.smtp_password.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    #[serde(deserialize_with = "deserialize_headers")]
    pub headers: HashMap<String, String>,
}

/// Deserialize and validate HTTP headers (reject injection attempts)
fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let headers: HashMap<String, String> = HashMap::deserialize(deserializer)?;

    for (key, value) in &headers {
        if key.contains('\r') || key.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains newline characters",
                key
            )));
        }
        if value.contains('\r') || value.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header value for '{}': contains newline characters",
                key
            )));
        }
        // RFC 7230 token characters (subset)
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_".contains(c))
        {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains invalid characters",
                key
            )));
        }
    }

    Ok(headers)
}
