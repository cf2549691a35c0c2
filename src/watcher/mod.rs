//! Source watchers.
//!
//! A watcher owns one stream at a time, splits it into lines and hands every
//! matching line to a [`MatchSink`]. Any stream failure moves it to `Error`
//! and schedules a single retry after a fixed backoff; `stop()` cancels the
//! retry and drops the stream before returning.
//!
//! ```text
//! Init ──open ok──▶ Running ──stream error──▶ Error ──backoff──▶ (reopen)
//!   │                                           ▲
//!   ├──open failed──────────────────────────────┘
//!   └──paused──▶ Paused
//! any ──stop()──▶ Stopped
//! ```

mod container;
mod file;
mod manager;

pub use container::ContainerLogs;
pub use file::FileTail;
pub use manager::WatcherManager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::BanwatchError;
use crate::source::{CompiledSource, SourceConfig, SourceKind};

/// Longest partial line kept while waiting for its newline.
const MAX_PENDING_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    Init,
    Running,
    Paused,
    Stopped,
    Error,
}

impl fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatcherStatus::Init => "init",
            WatcherStatus::Running => "running",
            WatcherStatus::Paused => "paused",
            WatcherStatus::Stopped => "stopped",
            WatcherStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a watcher, as shown by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherSnapshot {
    pub source_id: String,
    pub name: String,
    pub kind: SourceKind,
    pub status: WatcherStatus,
    pub processed_lines: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct RuntimeState {
    status: WatcherStatus,
    processed_lines: u64,
    last_error: Option<String>,
}

/// A line that yielded an address.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub source: Arc<CompiledSource>,
    pub address: Ipv4Addr,
    pub line: String,
    pub timestamp: DateTime<Utc>,
    /// Address is on the source's ignore list
    pub ignored: bool,
}

/// Receives match events from watchers. Must not block.
pub trait MatchSink: Send + Sync {
    fn submit(&self, event: MatchEvent);
}

/// A readable source of log bytes.
#[async_trait]
pub trait LogStream: Send {
    /// Next chunk of bytes. End of stream is reported as an error.
    async fn next_chunk(&mut self) -> Result<Vec<u8>, BanwatchError>;
}

/// Opens streams for sources.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(&self, source: &SourceConfig) -> Result<Box<dyn LogStream>, BanwatchError>;
}

/// Opens files and container log streams on this host.
#[derive(Debug, Clone)]
pub struct SystemStreamOpener {
    poll_interval: Duration,
    container_runtime: String,
}

impl SystemStreamOpener {
    pub fn new(poll_interval: Duration, container_runtime: &str) -> Self {
        Self {
            poll_interval,
            container_runtime: container_runtime.to_string(),
        }
    }
}

#[async_trait]
impl StreamOpener for SystemStreamOpener {
    async fn open(&self, source: &SourceConfig) -> Result<Box<dyn LogStream>, BanwatchError> {
        match source.kind {
            SourceKind::File => {
                let tail = FileTail::open(&source.locator, self.poll_interval).await?;
                Ok(Box::new(tail))
            }
            SourceKind::Container => {
                let logs = ContainerLogs::spawn(&self.container_runtime, &source.locator)?;
                Ok(Box::new(logs))
            }
        }
    }
}

/// Splits byte chunks into lines, keeping an unterminated tail for later.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every completed line without its newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let raw = &self.pending[start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            lines.push(String::from_utf8_lossy(raw).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > MAX_PENDING_BYTES {
            warn!(
                bytes = self.pending.len(),
                "Discarding oversized partial line"
            );
            self.pending.clear();
        }
        lines
    }

    /// Bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Everything a watcher task needs.
#[derive(Clone)]
pub struct WatcherContext {
    pub opener: Arc<dyn StreamOpener>,
    pub sink: Arc<dyn MatchSink>,
    pub clock: Arc<dyn Clock>,
    pub retry_interval: Duration,
}

/// A running watcher for one source.
pub struct Watcher {
    source: Arc<CompiledSource>,
    state: Arc<Mutex<RuntimeState>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    pub fn spawn(source: Arc<CompiledSource>, ctx: WatcherContext) -> Self {
        let state = Arc::new(Mutex::new(RuntimeState {
            status: WatcherStatus::Init,
            processed_lines: 0,
            last_error: None,
        }));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&source),
            ctx,
            Arc::clone(&state),
            cancel.clone(),
        ));
        Self {
            source,
            state,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    /// Cancel any retry, drop the stream and wait for the task to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(source = %self.source.id(), "Watcher task ended abnormally: {}", e);
            }
        }
        set_status(&self.state, WatcherStatus::Stopped);
        debug!(source = %self.source.id(), "Watcher stopped");
    }

    pub fn snapshot(&self) -> WatcherSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        WatcherSnapshot {
            source_id: self.source.config.id.clone(),
            name: self.source.config.display_name().to_string(),
            kind: self.source.config.kind,
            status: state.status,
            processed_lines: state.processed_lines,
            last_error: state.last_error.clone(),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn set_status(state: &Mutex<RuntimeState>, status: WatcherStatus) {
    state.lock().unwrap_or_else(|e| e.into_inner()).status = status;
}

fn record_error(state: &Mutex<RuntimeState>, err: &BanwatchError) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    state.status = WatcherStatus::Error;
    state.last_error = Some(err.to_string());
}

async fn run(
    source: Arc<CompiledSource>,
    ctx: WatcherContext,
    state: Arc<Mutex<RuntimeState>>,
    cancel: CancellationToken,
) {
    let id = source.id().to_string();

    if source.config.paused {
        set_status(&state, WatcherStatus::Paused);
        info!(source = %id, "Source is paused");
        cancel.cancelled().await;
        return;
    }

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = ctx.opener.open(&source.config) => opened,
        };

        let failure = match opened {
            Ok(mut stream) => {
                set_status(&state, WatcherStatus::Running);
                info!(source = %id, locator = %source.config.locator, "Watching source");
                match pump(stream.as_mut(), &source, &ctx, &state, &cancel).await {
                    None => return,
                    Some(e) => e,
                }
            }
            Err(e) => e,
        };

        record_error(&state, &failure);
        warn!(
            source = %id,
            retry_in = ?ctx.retry_interval,
            "{}",
            failure
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(ctx.retry_interval) => {}
        }
    }
}

/// Read until cancelled (`None`) or the stream fails (`Some`).
async fn pump(
    stream: &mut dyn LogStream,
    source: &Arc<CompiledSource>,
    ctx: &WatcherContext,
    state: &Mutex<RuntimeState>,
    cancel: &CancellationToken,
) -> Option<BanwatchError> {
    let mut lines = LineBuffer::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return None,
            chunk = stream.next_chunk() => chunk,
        };
        match chunk {
            Ok(bytes) => {
                for line in lines.push(&bytes) {
                    handle_line(&line, source, ctx, state);
                }
            }
            Err(e) => return Some(e),
        }
    }
}

fn handle_line(
    line: &str,
    source: &Arc<CompiledSource>,
    ctx: &WatcherContext,
    state: &Mutex<RuntimeState>,
) {
    if line.trim().is_empty() {
        return;
    }
    state
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .processed_lines += 1;

    let Some(address) = source.matcher.extract(line) else {
        return;
    };
    let ignored = source.ignore.is_ignored(address);
    debug!(source = %source.id(), address = %address, ignored, "Line matched");

    ctx.sink.submit(MatchEvent {
        source: Arc::clone(source),
        address,
        line: line.to_string(),
        timestamp: ctx.clock.now(),
        ignored,
    });
}
