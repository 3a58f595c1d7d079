//! Generic file backend.
//!
//! The orchestrator never assumes a particular storage: prechecks, cleanup
//! and streamed copies all go through this trait. `LocalFile` implements it
//! for `file://` URLs and plain paths, and is also the fallback leg when one
//! side of a copy is local.

use crate::error::{errno, Result, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Basic metadata for one remote or local file.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

/// Open handle for sequential reading.
#[async_trait]
pub trait FileReader: Send {
    /// Read the next chunk, up to `len` bytes; empty means end of file.
    async fn read(&mut self, len: usize) -> Result<Bytes>;
    async fn close(&mut self) -> Result<()>;
}

/// Open handle for sequential writing.
#[async_trait]
pub trait FileWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Storage operations consumed by the copy orchestrator.
#[async_trait]
pub trait FileBackend: Send + Sync {
    async fn stat(&self, url: &str) -> Result<FileStat>;

    /// Whether `url` exists. Errors other than not-found propagate.
    async fn exists(&self, url: &str) -> Result<bool> {
        match self.stat(url).await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == errno::ENOENT => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn unlink(&self, url: &str) -> Result<()>;

    /// Create a directory and any missing ancestors.
    async fn mkdir_all(&self, url: &str) -> Result<()>;

    async fn open_read(&self, url: &str) -> Result<Box<dyn FileReader>>;

    async fn open_write(&self, url: &str) -> Result<Box<dyn FileWriter>>;

    /// Checksum of the whole file, rendered as lowercase hex (or the
    /// storage's native form for algorithms like adler32).
    async fn checksum(&self, url: &str, algorithm: &str) -> Result<String>;
}

/// Backend for `file://` URLs and plain paths.
pub struct LocalFile;

impl LocalFile {
    fn path_of(url: &str) -> PathBuf {
        let path = url.strip_prefix("file://").unwrap_or(url);
        Path::new(path).to_path_buf()
    }
}

struct LocalReader {
    file: Option<fs::File>,
}

#[async_trait]
impl FileReader for LocalReader {
    async fn read(&mut self, len: usize) -> Result<Bytes> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::invalid_argument("read on closed handle"))?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }
}

struct LocalWriter {
    file: Option<fs::File>,
}

#[async_trait]
impl FileWriter for LocalWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::invalid_argument("write on closed handle"))?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileBackend for LocalFile {
    async fn stat(&self, url: &str) -> Result<FileStat> {
        let path = Self::path_of(url);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(FileStat {
                size: meta.len(),
                is_dir: meta.is_dir(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransferError::NotFound(url.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlink(&self, url: &str) -> Result<()> {
        let path = Self::path_of(url);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransferError::NotFound(url.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mkdir_all(&self, url: &str) -> Result<()> {
        Ok(fs::create_dir_all(Self::path_of(url)).await?)
    }

    async fn open_read(&self, url: &str) -> Result<Box<dyn FileReader>> {
        let path = Self::path_of(url);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(url.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(LocalReader { file: Some(file) }))
    }

    async fn open_write(&self, url: &str) -> Result<Box<dyn FileWriter>> {
        let file = fs::File::create(Self::path_of(url)).await?;
        Ok(Box::new(LocalWriter { file: Some(file) }))
    }

    async fn checksum(&self, url: &str, algorithm: &str) -> Result<String> {
        let mut reader = self.open_read(url).await?;
        let algorithm = algorithm.to_ascii_lowercase();
        let mut md5 = Md5::new();
        let mut sha256 = Sha256::new();
        let mut crc32 = crc32fast::Hasher::new();
        match algorithm.as_str() {
            "md5" | "sha256" | "crc32" => {}
            other => {
                return Err(TransferError::protocol(
                    "checksum",
                    errno::ENOTSUP,
                    format!("unsupported checksum algorithm '{}'", other),
                ))
            }
        }
        loop {
            let chunk = reader.read(64 * 1024).await?;
            if chunk.is_empty() {
                break;
            }
            match algorithm.as_str() {
                "md5" => md5.update(&chunk),
                "sha256" => sha256.update(&chunk),
                _ => crc32.update(&chunk),
            }
        }
        reader.close().await?;
        Ok(match algorithm.as_str() {
            "md5" => hex::encode(md5.finalize()),
            "sha256" => hex::encode(sha256.finalize()),
            _ => format!("{:08x}", crc32.finalize()),
        })
    }
}
