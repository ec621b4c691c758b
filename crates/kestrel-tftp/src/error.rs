//! Error types for TFTP transfers
//!
//! Every failure a transfer can end with is one variant of [`TftpError`].
//! [`TftpError::kind`] groups them the way callers react to them, and
//! [`TftpError::error_code`] picks the RFC 1350 code a server puts in the
//! ERROR packet it sends before tearing the session down.

use std::fmt;

use thiserror::Error;

use crate::packet::ErrorCode;

pub type Result<T> = std::result::Result<T, TftpError>;

/// How a wait for the peer ran out of retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Plain silence from the peer
    NoResponse,
    /// Only duplicate ACKs of an earlier block arrived: the peer never
    /// received the DATA block we are waiting on
    ExpectAck,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::NoResponse => f.write_str("no response"),
            TimeoutKind::ExpectAck => f.write_str("peer keeps acknowledging an earlier block"),
        }
    }
}

/// Failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected before any I/O, never retried
    Configuration,
    /// Malformed packet, unexpected opcode, block outside the window
    Protocol,
    /// Peer rejected or mangled the requested options
    Negotiation,
    /// The peer sent an ERROR packet
    Peer,
    /// Retry budget or duplicate budget exhausted
    Timeout,
    /// File open, lock or write failure
    Resource,
}

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Illegal TFTP operation: {0}")]
    IllegalOperation(String),

    #[error("Option negotiation failed: {0}")]
    FailedNegotiation(String),

    #[error("Peer error {code}: {message}")]
    Peer { code: ErrorCode, message: String },

    #[error("Timed out waiting on block {block} ({kind})")]
    Timeout { block: u16, kind: TimeoutKind },

    #[error("Maximum duplicate packets ({0}) reached")]
    DuplicateLimit(u32),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Access violation: {0}")]
    AccessViolation(String),

    #[error("File is locked: {0}")]
    FileLocked(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TftpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TftpError::InvalidOption(_) | TftpError::Config(_) => ErrorKind::Configuration,
            TftpError::MalformedPacket(_) | TftpError::IllegalOperation(_) => ErrorKind::Protocol,
            TftpError::FailedNegotiation(_) => ErrorKind::Negotiation,
            TftpError::Peer { .. } => ErrorKind::Peer,
            TftpError::Timeout { .. } | TftpError::DuplicateLimit(_) => ErrorKind::Timeout,
            TftpError::FileNotFound(_)
            | TftpError::AccessViolation(_)
            | TftpError::FileLocked(_)
            | TftpError::DiskFull(_)
            | TftpError::FileExists(_)
            | TftpError::Io(_)
            | TftpError::Other(_) => ErrorKind::Resource,
        }
    }

    /// Protocol error code reported to the peer for this failure
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TftpError::MalformedPacket(_) | TftpError::IllegalOperation(_) => {
                ErrorCode::IllegalTftpOp
            }
            TftpError::FailedNegotiation(_) | TftpError::InvalidOption(_) => {
                ErrorCode::FailedNegotiation
            }
            TftpError::Peer { code, .. } => *code,
            TftpError::FileNotFound(_) => ErrorCode::FileNotFound,
            TftpError::AccessViolation(_) | TftpError::FileLocked(_) => ErrorCode::AccessViolation,
            TftpError::DiskFull(_) => ErrorCode::DiskFull,
            TftpError::FileExists(_) => ErrorCode::FileAlreadyExists,
            TftpError::Io(e) => io_error_code(e),
            TftpError::Timeout { .. }
            | TftpError::DuplicateLimit(_)
            | TftpError::Config(_)
            | TftpError::Other(_) => ErrorCode::NotDefined,
        }
    }

    /// Translate an I/O failure on `path` into the matching protocol failure
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TftpError::FileNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => TftpError::AccessViolation(path.to_string()),
            std::io::ErrorKind::StorageFull => TftpError::DiskFull(path.to_string()),
            std::io::ErrorKind::AlreadyExists => TftpError::FileExists(path.to_string()),
            _ => TftpError::Io(err),
        }
    }
}

fn io_error_code(err: &std::io::Error) -> ErrorCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        std::io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        std::io::ErrorKind::StorageFull => ErrorCode::DiskFull,
        std::io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
        _ => ErrorCode::NotDefined,
    }
}
