//! Container log stream (`<runtime> logs --follow --tail 0 <id>`).

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::LogStream;
use crate::error::BanwatchError;

/// Follows a container's stdout and stderr.
///
/// Lines from both pipes are forwarded whole, as raw bytes, so they never
/// interleave mid-line and invalid UTF-8 is left to the line decoder.
/// Dropping the stream kills the child.
pub struct ContainerLogs {
    description: String,
    child: Child,
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

/// Arguments for following new log output only.
pub fn logs_args(container: &str) -> Vec<String> {
    ["logs", "--follow", "--tail", "0", container]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn forward<R>(pipe: R, tx: mpsc::Sender<std::io::Result<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        loop {
            let mut line = Vec::new();
            let item = match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => Ok(line),
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    })
}

impl ContainerLogs {
    pub fn spawn(runtime: &str, container: &str) -> Result<Self, BanwatchError> {
        let args = logs_args(container);
        let description = format!("{} {}", runtime, args.join(" "));

        let mut child = Command::new(runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BanwatchError::WatcherStream(format!("cannot spawn `{}`: {}", description, e))
            })?;

        let (tx, rx) = mpsc::channel(256);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward(stderr, tx));
        }

        debug!(command = %description, "Following container logs");
        Ok(Self {
            description,
            child,
            rx,
            readers,
        })
    }
}

#[async_trait]
impl LogStream for ContainerLogs {
    async fn next_chunk(&mut self) -> Result<Vec<u8>, BanwatchError> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => return Ok(chunk),
            Some(Err(e)) => {
                return Err(BanwatchError::WatcherStream(format!(
                    "reading `{}`: {}",
                    self.description, e
                )))
            }
            None => {}
        }
        // Both pipes closed: the process is gone or about to be
        let status = self.child.wait().await.map_err(|e| {
            BanwatchError::WatcherStream(format!("`{}`: {}", self.description, e))
        })?;
        Err(BanwatchError::WatcherStream(format!(
            "`{}` exited with {}",
            self.description, status
        )))
    }
}

impl Drop for ContainerLogs {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
