//! Notifications (Gotify, email, webhook).
//!
//! The engine reports ban, unban and match events through [`Notifier`].
//! Delivery is fire-and-forget: [`notify_detached`] spawns it and a failure
//! is only logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use reqwest::Client;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::{AlertEvent, AlertsConfig};
use crate::records::UnbanReason;

/// Timeout for alert HTTP requests (30s for slow networks/SMTP)
const TIMEOUT_SECS: u64 = 30;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
}

impl AlertLevel {
    fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
        }
    }

    fn gotify_priority(&self) -> u8 {
        match self {
            AlertLevel::Info => 2,
            AlertLevel::Warning => 5,
        }
    }
}

/// Something the engine did that operators may want to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    BanCreated {
        address: Ipv4Addr,
        source_id: String,
        source_name: String,
        line: String,
        match_count: usize,
    },
    MatchCreated {
        address: Ipv4Addr,
        source_id: String,
        source_name: String,
        ignored: bool,
    },
    Unban {
        address: Ipv4Addr,
        source_id: String,
        reason: UnbanReason,
    },
}

impl NotifyEvent {
    pub fn kind(&self) -> AlertEvent {
        match self {
            NotifyEvent::BanCreated { .. } => AlertEvent::Ban,
            NotifyEvent::MatchCreated { .. } => AlertEvent::Match,
            NotifyEvent::Unban { .. } => AlertEvent::Unban,
        }
    }

    /// Level, title and body for human-facing channels.
    pub fn render(&self) -> (AlertLevel, String, String) {
        match self {
            NotifyEvent::BanCreated {
                address,
                source_name,
                line,
                match_count,
                ..
            } => (
                AlertLevel::Warning,
                "Ban created".to_string(),
                format!(
                    "{} was banned by {} after {} matches.\n\
                     Last line:\n{}",
                    address, source_name, match_count, line
                ),
            ),
            NotifyEvent::MatchCreated {
                address,
                source_name,
                ignored,
                ..
            } => (
                AlertLevel::Info,
                "Match recorded".to_string(),
                if *ignored {
                    format!("{} matched {} (ignored)", address, source_name)
                } else {
                    format!("{} matched {}", address, source_name)
                },
            ),
            NotifyEvent::Unban {
                address,
                source_id,
                reason,
            } => (
                AlertLevel::Info,
                "Ban lifted".to_string(),
                format!("{} is no longer banned by {} ({})", address, source_id, reason),
            ),
        }
    }
}

/// Notification collaborator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent) -> Result<()>;
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: NotifyEvent) -> Result<()> {
        Ok(())
    }
}

/// Deliver `event` on its own task; failures are logged and dropped.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, event: NotifyEvent) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        let kind = event.kind();
        if let Err(e) = notifier.notify(event).await {
            warn!(event = ?kind, "Notification failed: {:#}", e);
        }
    });
}

/// Alert manager
pub struct AlertManager {
    config: AlertsConfig,
    client: Client,
}

impl AlertManager {
    pub fn new(config: AlertsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for alerts")?;

        Ok(Self { config, client })
    }

    fn wants(&self, kind: AlertEvent) -> bool {
        self.config.events.contains(&kind)
    }

    /// Send an alert to all configured destinations
    pub async fn send(&self, level: AlertLevel, title: &str, message: &str) {
        let mut success_count = 0;
        let mut destinations = Vec::new();

        if self.config.gotify.enabled {
            destinations.push("Gotify");
            match self.send_gotify(level, title, message).await {
                Ok(()) => success_count += 1,
                Err(e) => warn!("Gotify alert failed: {:#}", e),
            }
        }

        if self.config.email.enabled {
            destinations.push("Email");
            match self.send_email(level, title, message).await {
                Ok(()) => success_count += 1,
                Err(e) => warn!("Email alert failed: {:#}", e),
            }
        }

        if self.config.webhook.enabled {
            destinations.push("Webhook");
            match self.send_webhook(level, title, message).await {
                Ok(()) => success_count += 1,
                Err(e) => warn!("Webhook alert failed: {:#}", e),
            }
        }

        if !destinations.is_empty() {
            debug!(
                "Alert sent to {}/{} destinations: {}",
                success_count,
                destinations.len(),
                destinations.join(", ")
            );
        }
    }

    async fn send_gotify(&self, level: AlertLevel, title: &str, message: &str) -> Result<()> {
        let url = format!("{}/message", self.config.gotify.url.trim_end_matches('/'));

        #[derive(Serialize)]
        struct GotifyMessage<'a> {
            title: &'a str,
            message: &'a str,
            priority: u8,
        }

        let payload = GotifyMessage {
            title,
            message,
            priority: level.gotify_priority(),
        };

        let token = self.config.gotify.get_token();

        let response = self
            .client
            .post(&url)
            .header("X-Gotify-Key", token.as_str())
            .json(&payload)
            .send()
            .await
            .context("Failed to send Gotify alert")?;

        if !response.status().is_success() {
            let status = response.status();
            // Don't log response body as it may contain sensitive info
            error!("Gotify alert failed with status: {}", status);
            anyhow::bail!("Gotify returned {}", status);
        }

        Ok(())
    }

    /// SMTP is blocking, so it runs on the blocking pool
    async fn send_email(&self, level: AlertLevel, title: &str, message: &str) -> Result<()> {
        let email_config = self.config.email.clone();
        let subject = format!("[banwatch {}] {}", level.as_str(), title);
        let body = format!(
            "banwatch alert\n\
             ==============\n\n\
             Level: {}\n\
             Title: {}\n\n\
             {}\n",
            level.as_str(),
            title,
            message
        );

        tokio::task::spawn_blocking(move || {
            let email = Message::builder()
                .from(
                    email_config
                        .from
                        .parse()
                        .context("Invalid 'from' email address")?,
                )
                .to(email_config
                    .to
                    .parse()
                    .context("Invalid 'to' email address")?)
                .subject(subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body)
                .context("Failed to build email")?;

            let password = email_config.get_password();
            let creds = Credentials::new(
                email_config.smtp_user.clone(),
                password.as_str().to_string(),
            );

            let mailer = SmtpTransport::relay(&email_config.smtp_host)
                .context("Failed to create SMTP transport")?
                .port(email_config.smtp_port)
                .credentials(creds)
                .build();

            mailer.send(&email).context("Failed to send email")?;

            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("Email task panicked")??;

        Ok(())
    }

    async fn send_webhook(&self, level: AlertLevel, title: &str, message: &str) -> Result<()> {
        #[derive(Serialize)]
        struct WebhookPayload<'a> {
            level: &'a str,
            title: &'a str,
            message: &'a str,
            timestamp: String,
            source: &'a str,
        }

        let payload = WebhookPayload {
            level: level.as_str(),
            title,
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
            source: "banwatch",
        };

        let mut request = self.client.post(&self.config.webhook.url).json(&payload);

        // Headers were validated during config deserialization
        for (key, value) in &self.config.webhook.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.context("Failed to send webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook returned {}", response.status());
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for AlertManager {
    async fn notify(&self, event: NotifyEvent) -> Result<()> {
        if !self.wants(event.kind()) {
            return Ok(());
        }
        let (level, title, message) = event.render();
        self.send(level, &title, &message).await;
        Ok(())
    }
}
