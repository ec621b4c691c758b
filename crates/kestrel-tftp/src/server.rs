//! Server: request dispatcher and per-session setup
//!
//! The dispatcher owns the listening socket. Each RRQ/WRQ gets a fresh
//! socket on an ephemeral port (the server's TID for that transfer) and its
//! own task; sessions share nothing but the filesystem.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::{Id, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::{ServerConfig, SocketConfig, WriteConfig};
use crate::context::{Endpoint, TransferContext};
use crate::error::{Result, TftpError};
use crate::lock::{FileLock, lock_backend};
use crate::options::{Negotiation, OptionKind, OptionSet, RequestKind, ServerPolicy, negotiate};
use crate::packet::{Packet, Request};
use crate::retransmit::{DEFAULT_RETRIES, DEFAULT_TIMEOUT, RetransmissionController};
use crate::socket;
use crate::state::{Direction, StateMachine};
use crate::stream::{BlockReader, BlockWriter, open_read, open_write};

/// Largest request datagram accepted on the listening port
const MAX_REQUEST_SIZE: usize = 1024;

/// Serve `root_dir` on `bind_addr` until the process exits
pub async fn serve(
    bind_addr: SocketAddr,
    root_dir: impl Into<PathBuf>,
    allowed_options: Vec<OptionKind>,
) -> Result<()> {
    TftpServer::new(root_dir)
        .with_allowed_options(allowed_options)
        .serve(bind_addr)
        .await
}

#[derive(Debug, Clone)]
pub struct TftpServer {
    root_dir: PathBuf,
    policy: ServerPolicy,
    timeout: Duration,
    retries: u32,
    write: WriteConfig,
    max_file_size: Option<u64>,
    lock: Arc<dyn FileLock>,
    lock_blocking: bool,
    socket: SocketConfig,
    audit: AuditLogger,
}

impl TftpServer {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            policy: ServerPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            write: WriteConfig::default(),
            max_file_size: None,
            lock: lock_backend(true),
            lock_blocking: false,
            socket: SocketConfig::default(),
            audit: AuditLogger::default(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            policy: config.option_policy(),
            timeout: config.timeout(),
            retries: config.retries,
            write: config.write.clone(),
            max_file_size: config.max_file_size(),
            lock: lock_backend(config.flock),
            lock_blocking: config.lock_blocking,
            socket: config.socket.clone(),
            audit: AuditLogger::new(config.logging.audit_enabled),
        }
    }

    pub fn with_allowed_options(mut self, allowed: Vec<OptionKind>) -> Self {
        self.policy.allowed = allowed;
        self
    }

    pub fn with_policy(mut self, policy: ServerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_write_config(mut self, write: WriteConfig) -> Self {
        self.write = write;
        self
    }

    pub fn with_max_file_size(mut self, limit: Option<u64>) -> Self {
        self.max_file_size = limit;
        self
    }

    pub fn with_lock_backend(mut self, lock: Arc<dyn FileLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_lock_blocking(mut self, blocking: bool) -> Self {
        self.lock_blocking = blocking;
        self
    }

    pub fn with_socket_config(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Bind the listening socket and start dispatching in the background
    pub async fn bind(self, bind_addr: SocketAddr) -> Result<ServerHandle> {
        let listener = socket::bind_udp(bind_addr, &self.socket)?;
        let local_addr = listener.local_addr()?;
        info!("TFTP server listening on {}", local_addr);
        self.audit.server_started(
            local_addr,
            &self.root_dir.display().to_string(),
            self.write.enabled,
        );

        let token = CancellationToken::new();
        let audit = self.audit;
        let dispatcher = Dispatcher {
            listener,
            server: Arc::new(self),
            sessions: JoinSet::new(),
            active: HashMap::new(),
        };
        let task = tokio::spawn(dispatcher.run(token.clone()));

        Ok(ServerHandle {
            local_addr,
            token,
            task,
            audit,
        })
    }

    /// Bind and dispatch until the handle's token is cancelled (never, here)
    pub async fn serve(self, bind_addr: SocketAddr) -> Result<()> {
        self.bind(bind_addr).await?.wait().await
    }

    async fn handle_request(
        self: Arc<Self>,
        listen_ip: IpAddr,
        client: SocketAddr,
        direction: Direction,
        request: Request,
    ) {
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "session",
            session = %session_id,
            client = %client,
            file = %request.filename
        );
        self.run_session(&session_id, listen_ip, client, direction, request)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        session_id: &str,
        listen_ip: IpAddr,
        client: SocketAddr,
        direction: Direction,
        request: Request,
    ) {
        let requested = OptionSet::from_request(&request.options);
        let filename = request.filename.as_str();

        match direction {
            Direction::Sending => {
                info!("Read request for {} ({})", filename, request.mode);
                self.audit
                    .read_request(session_id, client, filename, request.mode, &requested);
            }
            Direction::Receiving => {
                info!("Write request for {} ({})", filename, request.mode);
                self.audit
                    .write_request(session_id, client, filename, request.mode, &requested);
            }
        }

        let socket = match socket::bind_ephemeral(listen_ip, &self.socket) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to bind session socket: {}", e);
                return;
            }
        };

        let prepared = match direction {
            Direction::Sending => self.prepare_read(&request, &requested).await,
            Direction::Receiving => self.prepare_write(&request, &requested).await,
        };
        let (endpoint, guard, negotiation) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("Denied {}: {}", filename, err);
                self.audit.request_denied(
                    session_id,
                    client,
                    filename,
                    err.error_code().as_u16(),
                    &err.to_string(),
                );
                send_error_on_socket(&socket, client, &err).await;
                return;
            }
        };

        let machine = StateMachine::server(
            direction,
            negotiation,
            RetransmissionController::new(self.timeout, self.retries),
        );
        let outcome = TransferContext::server_session(socket, client, machine, endpoint)
            .with_lock(guard)
            .run()
            .await;

        match &outcome.result {
            Ok(()) => {
                info!(
                    "Transfer of {} complete: {} bytes in {} blocks",
                    filename, outcome.metrics.bytes_transferred, outcome.metrics.blocks
                );
                self.audit
                    .transfer_completed(session_id, client, filename, &outcome.metrics);
            }
            Err(e) => {
                error!("Transfer of {} with {} failed: {}", filename, client, e);
                self.audit.transfer_failed(
                    session_id,
                    client,
                    filename,
                    &e.to_string(),
                    outcome.metrics.bytes_transferred,
                );
            }
        }
    }

    async fn prepare_read(
        &self,
        request: &Request,
        requested: &OptionSet,
    ) -> Result<(Endpoint, Option<crate::lock::LockGuard>, Negotiation)> {
        let path = resolve_path(&self.root_dir, &request.filename)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if !meta.is_file() => {
                return Err(TftpError::AccessViolation(format!(
                    "{} is not a regular file",
                    request.filename
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(TftpError::from_io(e, &request.filename)),
        }

        let locked = open_read(
            &path,
            &request.filename,
            Arc::clone(&self.lock),
            self.lock_blocking,
        )
        .await?;

        if let Some(limit) = self.max_file_size
            && locked.size > limit
        {
            return Err(TftpError::DiskFull(format!(
                "{} is {} bytes, limit is {}",
                request.filename, locked.size, limit
            )));
        }

        let negotiation = negotiate(requested, &self.policy, RequestKind::Read, Some(locked.size));
        let reader = BlockReader::new(
            Box::new(locked.file),
            request.mode,
            negotiation.accepted.block_size(),
        );
        Ok((Endpoint::Reader(reader), Some(locked.guard), negotiation))
    }

    async fn prepare_write(
        &self,
        request: &Request,
        requested: &OptionSet,
    ) -> Result<(Endpoint, Option<crate::lock::LockGuard>, Negotiation)> {
        if !self.write.permits(&request.filename) {
            return Err(TftpError::AccessViolation(format!(
                "writes are not permitted for {}",
                request.filename
            )));
        }
        let path = resolve_path(&self.root_dir, &request.filename)?;

        if let (Some(limit), Some(size)) = (self.max_file_size, requested.transfer_size)
            && size > limit
        {
            return Err(TftpError::DiskFull(format!(
                "announced size {} exceeds limit {}",
                size, limit
            )));
        }

        let locked = open_write(
            &path,
            &request.filename,
            Arc::clone(&self.lock),
            self.lock_blocking,
            self.write.allow_overwrite,
        )
        .await?;

        let negotiation = negotiate(requested, &self.policy, RequestKind::Write, None);
        let writer = BlockWriter::new(Box::new(locked.file), request.mode, request.filename.clone())
            .with_limit(self.max_file_size);
        Ok((Endpoint::Writer(writer), Some(locked.guard), negotiation))
    }
}

struct Dispatcher {
    listener: UdpSocket,
    server: Arc<TftpServer>,
    sessions: JoinSet<()>,
    /// Client TID of every running session
    active: HashMap<Id, SocketAddr>,
}

impl Dispatcher {
    async fn run(mut self, token: CancellationToken) -> JoinSet<()> {
        let listen_ip = match self.listener.local_addr() {
            Ok(addr) => addr.ip(),
            Err(e) => {
                error!("Listening socket has no local address: {}", e);
                return self.sessions;
            }
        };
        let mut buf = vec![0u8; MAX_REQUEST_SIZE];

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(joined) = self.sessions.join_next_with_id(), if !self.sessions.is_empty() => {
                    let id = match joined {
                        Ok((id, ())) => id,
                        Err(e) => {
                            error!("Session task failed: {}", e);
                            e.id()
                        }
                    };
                    self.active.remove(&id);
                }
                received = self.listener.recv_from(&mut buf) => match received {
                    Ok((len, client)) => self.dispatch(&buf[..len], listen_ip, client),
                    Err(e) => error!("Error receiving TFTP packet: {}", e),
                },
            }
        }

        debug!("Dispatcher stopped with {} active sessions", self.sessions.len());
        self.sessions
    }

    fn dispatch(&mut self, data: &[u8], listen_ip: IpAddr, client: SocketAddr) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", client, e);
                self.server.audit.protocol_violation(client, &e.to_string());
                return;
            }
        };

        let (direction, request) = match packet {
            Packet::Rrq(request) => (Direction::Sending, request),
            Packet::Wrq(request) => (Direction::Receiving, request),
            other => {
                debug!("Dropping {} from {} on the listening port", other, client);
                return;
            }
        };

        if self.active.values().any(|addr| *addr == client) {
            debug!("Ignoring repeated request from {}", client);
            return;
        }

        let server = Arc::clone(&self.server);
        let handle = self
            .sessions
            .spawn(server.handle_request(listen_ip, client, direction, request));
        self.active.insert(handle.id(), client);
    }
}

/// Running server
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<JoinSet<()>>,
    audit: AuditLogger,
}

impl ServerHandle {
    /// Actual listening address (useful after binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests. A graceful shutdown lets running transfers
    /// finish; otherwise they are aborted, releasing their files and locks.
    pub async fn shutdown(self, graceful: bool) -> Result<()> {
        self.token.cancel();
        let mut sessions = self.task.await.map_err(|e| TftpError::Other(e.into()))?;

        info!(
            "Shutting down ({}) with {} active sessions",
            if graceful { "graceful" } else { "immediate" },
            sessions.len()
        );
        self.audit.server_shutdown(graceful, sessions.len());

        if graceful {
            while sessions.join_next().await.is_some() {}
        } else {
            sessions.shutdown().await;
        }
        Ok(())
    }

    /// Wait until the dispatcher stops, then drain its sessions
    pub async fn wait(self) -> Result<()> {
        let mut sessions = self.task.await.map_err(|e| TftpError::Other(e.into()))?;
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

/// Map a requested filename onto a path under `root_dir`.
///
/// Rejects parent-directory components, symlinks and anything that would
/// resolve outside the root.
pub fn resolve_path(root_dir: &Path, filename: &str) -> Result<PathBuf> {
    let denied = || TftpError::AccessViolation(filename.to_string());

    let normalized = filename.replace('\\', "/");
    if normalized.split('/').any(|component| component == "..") {
        return Err(denied());
    }

    let relative = normalized.trim_start_matches('/');
    if relative.is_empty() {
        return Err(denied());
    }
    let file_path = root_dir.join(relative);

    match std::fs::symlink_metadata(&file_path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(denied());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => return Err(denied()),
    }

    let canonical_root = root_dir.canonicalize().map_err(|_| denied())?;

    if let Ok(canonical_file) = file_path.canonicalize() {
        if !canonical_file.starts_with(&canonical_root) {
            return Err(denied());
        }
    } else if let Some(parent) = file_path.parent()
        && let Ok(canonical_parent) = parent.canonicalize()
        && !canonical_parent.starts_with(&canonical_root)
    {
        return Err(denied());
    }

    Ok(file_path)
}

async fn send_error_on_socket(socket: &UdpSocket, client: SocketAddr, err: &TftpError) {
    let packet = Packet::Error {
        code: err.error_code(),
        message: err.to_string(),
    };
    match socket.send_to(&packet.encode(), client).await {
        Ok(_) => debug!("Sent ERROR packet: code={}, msg={}", err.error_code(), err),
        Err(e) => debug!("Failed to send ERROR to {}: {}", client, e),
    }
}
