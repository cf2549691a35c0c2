//! Signal handling for the foreground engine.
//!
//! SIGINT and SIGTERM ask for a graceful shutdown, SIGHUP for a source
//! reload. Handlers are registered before [`listen`] returns, so a signal
//! raised right after cannot hit the default disposition.

use std::fmt;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalEvent::Shutdown => write!(f, "shutdown"),
            SignalEvent::Reload => write!(f, "reload"),
        }
    }
}

fn register(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            // May fail in containers or restricted environments
            warn!("Failed to register {} handler: {}", name, e);
            None
        }
    }
}

async fn recv(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Start listening. Must be called inside a Tokio runtime.
///
/// The receiver yields one event per delivered signal and closes if no
/// handler could be registered at all.
pub fn listen() -> mpsc::Receiver<SignalEvent> {
    let (tx, rx) = mpsc::channel(8);
    let mut sigint = register(SignalKind::interrupt(), "SIGINT");
    let mut sigterm = register(SignalKind::terminate(), "SIGTERM");
    let mut sighup = register(SignalKind::hangup(), "SIGHUP");

    if sigint.is_none() && sigterm.is_none() && sighup.is_none() {
        warn!("No signal handlers registered - graceful shutdown disabled");
        return rx;
    }

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = recv(&mut sigint) => {
                    info!("Received SIGINT, initiating graceful shutdown...");
                    SignalEvent::Shutdown
                }
                _ = recv(&mut sigterm) => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    SignalEvent::Shutdown
                }
                _ = recv(&mut sighup) => {
                    info!("Received SIGHUP, reloading sources...");
                    SignalEvent::Reload
                }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_event_display() {
        assert_eq!(SignalEvent::Shutdown.to_string(), "shutdown");
        assert_eq!(SignalEvent::Reload.to_string(), "reload");
    }

    #[tokio::test]
    async fn test_sighup_becomes_reload() {
        let mut events = listen();
        // SAFETY: signalling our own process; the handler is registered
        unsafe {
            libc::kill(libc::getpid(), libc::SIGHUP);
        }
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SignalEvent::Reload));
    }
}
