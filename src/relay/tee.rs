//! Tee file for one relay direction

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only copy of a forwarded byte stream.
///
/// Each connection opens its own handle; concurrent sessions rely on
/// append mode to keep their writes whole.
#[derive(Debug)]
pub struct TeeFile {
    path: PathBuf,
    file: File,
}

impl TeeFile {
    /// Open `path` for appending, creating it if needed
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes` and push them to the OS
    pub async fn record(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await
    }
}
