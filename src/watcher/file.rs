//! Polling file tail.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::info;

use super::LogStream;
use crate::error::BanwatchError;

const READ_CHUNK: usize = 16 * 1024;

/// Follows an append-only file from its end.
///
/// Truncation restarts from offset 0; a new inode at the same path
/// (rotation) is reopened and read from the start.
#[derive(Debug)]
pub struct FileTail {
    path: PathBuf,
    file: File,
    inode: u64,
    pos: u64,
    poll_interval: Duration,
}

fn stream_err(path: &PathBuf, what: &str, e: std::io::Error) -> BanwatchError {
    BanwatchError::WatcherStream(format!("{} {}: {}", what, path.display(), e))
}

impl FileTail {
    pub async fn open(path: &str, poll_interval: Duration) -> Result<Self, BanwatchError> {
        let path = PathBuf::from(path);
        let mut file = File::open(&path)
            .await
            .map_err(|e| stream_err(&path, "cannot open", e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| stream_err(&path, "cannot stat", e))?;
        if !meta.is_file() {
            return Err(BanwatchError::WatcherStream(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let pos = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| stream_err(&path, "cannot seek", e))?;

        Ok(Self {
            path,
            file,
            inode: meta.ino(),
            pos,
            poll_interval,
        })
    }

    /// Current read offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    async fn reopen(&mut self) -> Result<(), BanwatchError> {
        let file = File::open(&self.path)
            .await
            .map_err(|e| stream_err(&self.path, "cannot reopen", e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| stream_err(&self.path, "cannot stat", e))?;
        self.file = file;
        self.inode = meta.ino();
        self.pos = 0;
        Ok(())
    }

    /// Read whatever is available past `pos`; empty when nothing new.
    async fn read_available(&mut self) -> Result<Vec<u8>, BanwatchError> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| stream_err(&self.path, "cannot stat", e))?;

        if meta.ino() != self.inode {
            info!(path = %self.path.display(), "File rotated, reopening");
            self.reopen().await?;
        } else if meta.len() < self.pos {
            info!(path = %self.path.display(), "File truncated, reading from start");
            self.pos = 0;
        }

        self.file
            .seek(SeekFrom::Start(self.pos))
            .await
            .map_err(|e| stream_err(&self.path, "cannot seek", e))?;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| stream_err(&self.path, "cannot read", e))?;
        buf.truncate(n);
        self.pos += n as u64;
        Ok(buf)
    }
}

#[async_trait]
impl LogStream for FileTail {
    async fn next_chunk(&mut self) -> Result<Vec<u8>, BanwatchError> {
        loop {
            let chunk = self.read_available().await?;
            if !chunk.is_empty() {
                return Ok(chunk);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
