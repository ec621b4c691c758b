//! Local ends of a transfer
//!
//! [`Source`] and [`Destination`] say where bytes come from or go to.
//! [`BlockReader`] cuts a source into DATA payloads of exactly one block
//! (netascii expansion included) and [`BlockWriter`] appends received
//! payloads to a destination.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TftpError};
use crate::lock::{FileLock, LockGuard, LockMode};
use crate::netascii;
use crate::packet::TransferMode;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where an upload reads from
pub enum Source {
    Path(PathBuf),
    Stdin,
    Reader(BoxedReader),
}

impl Source {
    /// `-` selects standard input, anything else is a path
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Source::Stdin
        } else {
            Source::Path(PathBuf::from(arg))
        }
    }

    pub(crate) async fn open(
        self,
        backend: Arc<dyn FileLock>,
        blocking: bool,
    ) -> Result<(BoxedReader, Option<LockGuard>, Option<u64>)> {
        match self {
            Source::Path(path) => {
                let name = path.display().to_string();
                let locked = open_read(&path, &name, backend, blocking).await?;
                Ok((Box::new(locked.file), Some(locked.guard), Some(locked.size)))
            }
            Source::Stdin => Ok((Box::new(tokio::io::stdin()), None, None)),
            Source::Reader(reader) => Ok((reader, None, None)),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Source::Stdin => f.write_str("Stdin"),
            Source::Reader(_) => f.write_str("Reader"),
        }
    }
}

/// Where a download writes to
pub enum Destination {
    Path(PathBuf),
    Stdout,
    Writer(BoxedWriter),
}

impl Destination {
    /// `-` selects standard output, anything else is a path
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Destination::Stdout
        } else {
            Destination::Path(PathBuf::from(arg))
        }
    }

    pub(crate) async fn open(
        self,
        backend: Arc<dyn FileLock>,
        blocking: bool,
    ) -> Result<(BoxedWriter, Option<LockGuard>)> {
        match self {
            Destination::Path(path) => {
                let name = path.display().to_string();
                let locked = open_write(&path, &name, backend, blocking, true).await?;
                Ok((Box::new(locked.file), Some(locked.guard)))
            }
            Destination::Stdout => Ok((Box::new(tokio::io::stdout()), None)),
            Destination::Writer(writer) => Ok((writer, None)),
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Destination::Stdout => f.write_str("Stdout"),
            Destination::Writer(_) => f.write_str("Writer"),
        }
    }
}

/// An open file together with the advisory lock held on it
#[derive(Debug)]
pub struct LockedFile {
    pub file: tokio::fs::File,
    pub guard: LockGuard,
    pub size: u64,
}

/// Open `path` for reading under a shared lock
pub async fn open_read(
    path: &Path,
    name: &str,
    backend: Arc<dyn FileLock>,
    blocking: bool,
) -> Result<LockedFile> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TftpError::from_io(e, name))?
        .into_std()
        .await;

    let guard = LockGuard::acquire(backend, &file, LockMode::Shared, blocking, name).await?;
    let size = file.metadata().map_err(|e| TftpError::from_io(e, name))?.len();

    Ok(LockedFile {
        file: tokio::fs::File::from_std(file),
        guard,
        size,
    })
}

/// Open `path` for writing under an exclusive lock.
///
/// The file is truncated only once the lock is held. With `overwrite`
/// unset an existing file is refused with [`TftpError::FileExists`].
pub async fn open_write(
    path: &Path,
    name: &str,
    backend: Arc<dyn FileLock>,
    blocking: bool,
    overwrite: bool,
) -> Result<LockedFile> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(false);
    } else {
        options.create_new(true);
    }

    let file = options
        .open(path)
        .await
        .map_err(|e| TftpError::from_io(e, name))?
        .into_std()
        .await;

    let guard = LockGuard::acquire(backend, &file, LockMode::Exclusive, blocking, name).await?;
    file.set_len(0).map_err(|e| TftpError::from_io(e, name))?;

    Ok(LockedFile {
        file: tokio::fs::File::from_std(file),
        guard,
        size: 0,
    })
}

/// Reads a source one DATA payload at a time
pub struct BlockReader {
    inner: BoxedReader,
    mode: TransferMode,
    block_size: usize,
    pending: BytesMut,
    scratch: Vec<u8>,
    eof: bool,
}

impl BlockReader {
    pub fn new(inner: BoxedReader, mode: TransferMode, block_size: usize) -> Self {
        Self {
            inner,
            mode,
            block_size,
            pending: BytesMut::new(),
            scratch: vec![0u8; block_size],
            eof: false,
        }
    }

    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
        self.scratch.resize(block_size, 0);
    }

    /// Next payload. It is exactly one block long unless the source is
    /// exhausted, in which case it is shorter (possibly empty).
    pub async fn next_block(&mut self) -> std::io::Result<Bytes> {
        while self.pending.len() < self.block_size && !self.eof {
            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            match self.mode {
                TransferMode::Octet => self.pending.extend_from_slice(&self.scratch[..n]),
                TransferMode::Netascii => netascii::encode(&self.scratch[..n], &mut self.pending),
            }
        }

        let take = self.pending.len().min(self.block_size);
        Ok(self.pending.split_to(take).freeze())
    }
}

/// Appends received payloads to a destination
pub struct BlockWriter {
    inner: BoxedWriter,
    mode: TransferMode,
    decoder: netascii::Decoder,
    scratch: BytesMut,
    name: String,
    written: u64,
    limit: Option<u64>,
}

impl BlockWriter {
    pub fn new(inner: BoxedWriter, mode: TransferMode, name: impl Into<String>) -> Self {
        Self {
            inner,
            mode,
            decoder: netascii::Decoder::new(),
            scratch: BytesMut::new(),
            name: name.into(),
            written: 0,
            limit: None,
        }
    }

    /// Refuse to grow the destination beyond `limit` bytes
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub async fn write_block(&mut self, payload: &[u8]) -> Result<()> {
        match self.mode {
            TransferMode::Octet => {
                self.check_limit(payload.len())?;
                self.inner
                    .write_all(payload)
                    .await
                    .map_err(|e| TftpError::from_io(e, &self.name))?;
                self.written += payload.len() as u64;
            }
            TransferMode::Netascii => {
                self.scratch.clear();
                self.decoder.decode(payload, &mut self.scratch);
                self.flush_scratch().await?;
            }
        }
        Ok(())
    }

    /// Flush buffered bytes to the destination
    pub async fn finish(&mut self) -> Result<()> {
        if self.mode == TransferMode::Netascii {
            self.scratch.clear();
            self.decoder.finish(&mut self.scratch);
            self.flush_scratch().await?;
        }
        self.inner
            .flush()
            .await
            .map_err(|e| TftpError::from_io(e, &self.name))
    }

    async fn flush_scratch(&mut self) -> Result<()> {
        let len = self.scratch.len();
        self.check_limit(len)?;
        self.inner
            .write_all(&self.scratch)
            .await
            .map_err(|e| TftpError::from_io(e, &self.name))?;
        self.written += len as u64;
        Ok(())
    }

    fn check_limit(&self, incoming: usize) -> Result<()> {
        match self.limit {
            Some(limit) if self.written + incoming as u64 > limit => Err(TftpError::DiskFull(
                format!("{} exceeds the {} byte limit", self.name, limit),
            )),
            _ => Ok(()),
        }
    }
}
