//! Kestrel TFTP
//!
//! TFTP client and server: RFC 1350 with the blksize, timeout and tsize
//! options (RFC 2347, 2348, 2349).
//!
//! Every transfer, on either side, is a [`StateMachine`] that turns events
//! into actions, driven over one UDP socket by a [`TransferContext`].

pub mod audit;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod netascii;
pub mod options;
pub mod packet;
pub mod retransmit;
pub mod server;
pub mod socket;
pub mod state;
pub mod stream;

pub use client::{ClientConfig, TftpClient, TransferSettings};
pub use config::ServerConfig;
pub use context::{Outcome, TransferContext};
pub use error::{ErrorKind, Result, TftpError, TimeoutKind};
pub use lock::{FileLock, FlockLock, LockMode, NoLock};
pub use metrics::TransferMetrics;
pub use options::{OptionKind, OptionSet, ServerPolicy};
pub use packet::{ErrorCode, Packet, TransferMode};
pub use server::{ServerHandle, TftpServer, serve};
pub use state::StateMachine;
pub use stream::{Destination, Source};
