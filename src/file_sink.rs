use anyhow::{Result, anyhow};
use log::debug;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// One output file of the torrent, opened on first write.
#[derive(Debug)]
pub struct FileSink {
    pub path: PathBuf,
    pub length: u64,
    pub downloadable: bool,

    // Range of pieces overlapping this file, inclusive.
    pub first_piece: usize,
    pub last_piece: usize,

    handle: Option<File>,
    bytes_written: u64,
}

impl FileSink {
    pub fn new(path: PathBuf, length: u64) -> Self {
        Self {
            path,
            length,
            downloadable: false,
            first_piece: 0,
            last_piece: 0,
            handle: None,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Seeks to `offset` and writes `data`. A file that is not downloadable
    /// is never created; the write is dropped.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.downloadable {
            return Ok(());
        }

        if self.handle.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.path)
                .await?;
            debug!("[FileSink] opened {}", self.path.display());
            self.handle = Some(file);
        }

        let Some(file) = self.handle.as_mut() else {
            return Err(anyhow!("{} is not open", self.path.display()));
        };

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.handle.take() {
            file.flush().await?;
            file.sync_all().await?;
            debug!("[FileSink] closed {}", self.path.display());
        }
        Ok(())
    }
}
