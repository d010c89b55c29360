use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Append-only destination for consumed lines.
#[async_trait]
pub trait LineSink: Send {
    /// Append `line` followed by a newline. Returns only once the bytes are durable,
    /// since the caller acknowledges the entry right after.
    async fn write_line(&mut self, line: &str) -> io::Result<()>;
}

/// A file opened in append mode. Every line is flushed and, with `fsync`, synced to disk.
///
/// A sink is owned by exactly one worker. Two processes appending to the same file get no
/// guarantee about how their lines interleave.
pub struct FileSink {
    writer: BufWriter<File>,
    fsync: bool,
}

impl FileSink {
    pub async fn open(path: impl AsRef<Path>, fsync: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            writer: BufWriter::new(file),
            fsync,
        })
    }
}

#[async_trait]
impl LineSink for FileSink {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        if self.fsync {
            self.writer.get_ref().sync_data().await?;
        }
        Ok(())
    }
}
