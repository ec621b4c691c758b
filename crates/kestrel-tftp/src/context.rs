//! Transfer context: one session's I/O loop
//!
//! A [`TransferContext`] owns everything a single transfer touches: the UDP
//! socket whose port is our TID, the peer's TID, the local reader or writer,
//! the advisory lock and the metrics. [`TransferContext::run`] consumes the
//! context, so whatever way the loop ends the socket, file and lock are
//! dropped with it.
//!
//! The loop is strictly sequential: act on the state machine's actions,
//! then wait (bounded by the retransmission timeout) for the next datagram.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TftpError};
use crate::lock::LockGuard;
use crate::metrics::{MetricsCollector, TransferMetrics};
use crate::options::MAX_BLKSIZE;
use crate::packet::{ErrorCode, Opcode, Packet};
use crate::state::{Action, Event, StateMachine, Transition};
use crate::stream::{BlockReader, BlockWriter};

/// Largest datagram a session ever needs to receive, plus one byte so an
/// oversized DATA packet is seen as oversized instead of truncated
const RECV_BUFFER_SIZE: usize = MAX_BLKSIZE as usize + 4 + 1;

/// Called once per DATA block moved, with its block number and payload
pub type BlockObserver = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Local end of the transfer
pub enum Endpoint {
    /// We send DATA read from here
    Reader(BlockReader),
    /// We receive DATA and write it here
    Writer(BlockWriter),
}

/// How a transfer ended, with its counters either way
#[derive(Debug)]
pub struct Outcome {
    pub metrics: TransferMetrics,
    pub result: Result<()>,
}

impl Outcome {
    /// A transfer that failed before any packet was exchanged
    pub fn failed(err: TftpError) -> Self {
        Self {
            metrics: MetricsCollector::new().snapshot(),
            result: Err(err),
        }
    }

    pub fn into_result(self) -> Result<TransferMetrics> {
        self.result.map(|()| self.metrics)
    }
}

enum Flow {
    Continue { sent: bool },
    Done,
}

pub struct TransferContext {
    socket: UdpSocket,
    peer: SocketAddr,
    /// False until the first reply tells a client the server's TID
    peer_bound: bool,
    machine: StateMachine,
    endpoint: Endpoint,
    lock: Option<LockGuard>,
    metrics: MetricsCollector,
    observer: Option<BlockObserver>,
    /// Encoded form and DATA payload length of the last packet sent
    last_sent: Option<(Bytes, usize)>,
    recv_buf: Vec<u8>,
}

impl TransferContext {
    /// Client download: `server` is the listening address the RRQ goes to
    pub fn client_download(
        socket: UdpSocket,
        server: SocketAddr,
        machine: StateMachine,
        writer: BlockWriter,
    ) -> Self {
        Self::new(socket, server, false, machine, Endpoint::Writer(writer))
    }

    /// Client upload: `server` is the listening address the WRQ goes to
    pub fn client_upload(
        socket: UdpSocket,
        server: SocketAddr,
        machine: StateMachine,
        reader: BlockReader,
    ) -> Self {
        Self::new(socket, server, false, machine, Endpoint::Reader(reader))
    }

    /// Server side of an accepted request; the client's TID is already known
    pub fn server_session(
        socket: UdpSocket,
        client: SocketAddr,
        machine: StateMachine,
        endpoint: Endpoint,
    ) -> Self {
        Self::new(socket, client, true, machine, endpoint)
    }

    fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        peer_bound: bool,
        machine: StateMachine,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            socket,
            peer,
            peer_bound,
            machine,
            endpoint,
            lock: None,
            metrics: MetricsCollector::new(),
            observer: None,
            last_sent: None,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    /// Hold `guard` until the transfer ends
    pub fn with_lock(mut self, guard: Option<LockGuard>) -> Self {
        self.lock = guard;
        self
    }

    pub fn with_observer(mut self, observer: Option<BlockObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the transfer to its end
    pub async fn run(mut self) -> Outcome {
        let result = self.drive().await;
        self.metrics.finish();
        let metrics = self.metrics.snapshot();

        match &result {
            Ok(()) => debug!(
                bytes = metrics.bytes_transferred,
                blocks = metrics.blocks,
                "Transfer completed"
            ),
            Err(e) => debug!(bytes = metrics.bytes_transferred, "Transfer failed: {}", e),
        }

        Outcome { metrics, result }
    }

    async fn drive(&mut self) -> Result<()> {
        debug!(
            peer = %self.peer,
            locked = self.lock.is_some(),
            "Starting transfer"
        );
        self.metrics.start();

        let transition = self.machine.start();
        if let Flow::Done = self.apply(transition).await? {
            return Ok(());
        }
        let mut deadline = self.next_deadline();

        loop {
            let event = match timeout_at(deadline, self.socket.recv_from(&mut self.recv_buf)).await
            {
                Err(_) => {
                    debug!(block = self.machine.block(), "Timed out waiting for peer");
                    Event::Timeout
                }
                Ok(Err(e)) => return Err(TftpError::Io(e)),
                Ok(Ok((len, from))) => {
                    let opcode = Opcode::peek(&self.recv_buf[..len]);
                    if !self.accept_source(from, opcode).await {
                        continue;
                    }
                    match Packet::decode(&self.recv_buf[..len]) {
                        Ok(packet) => {
                            trace!("Received {} from {}", packet, from);
                            Event::Packet(packet)
                        }
                        Err(e) => {
                            warn!("Malformed packet from {}: {}", from, e);
                            Event::Malformed(e.to_string())
                        }
                    }
                }
            };

            let transition = self.machine.step(event);
            match self.apply(transition).await? {
                Flow::Done => return Ok(()),
                Flow::Continue { sent: true } => deadline = self.next_deadline(),
                Flow::Continue { sent: false } => {}
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        Instant::now() + self.machine.retransmit().timeout()
    }

    /// Check a datagram's source against the peer TID.
    ///
    /// A client adopts the first reply's port as the server TID. Anything
    /// else from a stranger gets ERROR 5 and is otherwise ignored, except an
    /// ERROR, which is never answered.
    async fn accept_source(&mut self, from: SocketAddr, opcode: Option<Opcode>) -> bool {
        if from == self.peer {
            return true;
        }
        if !self.peer_bound && from.ip() == self.peer.ip() {
            debug!("Server TID is {}", from);
            self.peer = from;
            self.peer_bound = true;
            return true;
        }

        warn!("Packet from unknown TID {} (expected {})", from, self.peer);
        if opcode == Some(Opcode::Error) {
            return false;
        }
        let reply = Packet::error(ErrorCode::UnknownTid);
        if let Err(e) = self.socket.send_to(&reply.encode(), from).await {
            debug!("Failed to answer unknown TID {}: {}", from, e);
        }
        false
    }

    async fn apply(&mut self, transition: Transition) -> Result<Flow> {
        let mut sent = false;

        for action in transition.actions {
            match action {
                Action::Send(packet) => {
                    self.send(packet).await?;
                    sent = true;
                }
                Action::SendData(block) => {
                    let payload = match self.next_payload().await {
                        Ok(payload) => payload,
                        Err(err) => return self.local_failure(err).await,
                    };
                    self.machine.record_data_sent(payload.len());
                    self.metrics.record_block(payload.len());
                    self.observe(block, &payload);
                    self.send(Packet::Data { block, payload }).await?;
                    sent = true;
                }
                Action::Resend => {
                    if let Some((bytes, payload_len)) = &self.last_sent {
                        debug!("Resending last packet to {}", self.peer);
                        self.socket.send_to(bytes, self.peer).await?;
                        self.metrics.record_resend(*payload_len);
                        sent = true;
                    }
                }
                Action::Write(payload) => {
                    let block = self.machine.block();
                    self.metrics.record_block(payload.len());
                    self.observe(block, &payload);
                    if let Err(err) = self.write_payload(&payload).await {
                        return self.local_failure(err).await;
                    }
                }
                Action::Negotiated(options) => {
                    if let Endpoint::Reader(reader) = &mut self.endpoint {
                        reader.set_block_size(options.block_size());
                    }
                    if let Some(size) = options.transfer_size {
                        self.metrics.set_expected_size(size);
                    }
                    debug!(
                        blksize = options.block_size(),
                        timeout = ?options.timeout,
                        tsize = ?options.transfer_size,
                        "Options settled"
                    );
                }
                Action::Duplicate => {
                    self.metrics.record_duplicate();
                    debug!(block = self.machine.block(), "Duplicate packet");
                }
                Action::Notify(packet) => self.notify(packet).await,
                Action::Finish => {
                    if let Endpoint::Writer(writer) = &mut self.endpoint {
                        writer.finish().await?;
                    }
                    return Ok(Flow::Done);
                }
                Action::Fail(err) => return Err(err),
            }
        }

        Ok(Flow::Continue { sent })
    }

    /// Abort on a failure of our own, telling the peer where appropriate
    async fn local_failure(&mut self, err: TftpError) -> Result<Flow> {
        let transition = self.machine.step(Event::LocalFailure(err));
        let mut failure = None;
        for action in transition.actions {
            match action {
                Action::Notify(packet) => self.notify(packet).await,
                Action::Fail(err) => failure = Some(err),
                _ => {}
            }
        }
        Err(failure.unwrap_or_else(|| {
            TftpError::IllegalOperation("transfer aborted after completion".to_string())
        }))
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        let bytes = packet.encode();
        trace!("Sending {} to {}", packet, self.peer);
        self.socket.send_to(&bytes, self.peer).await?;
        self.last_sent = Some((bytes, packet.payload_len()));
        Ok(())
    }

    /// ERROR packets are fire and forget
    async fn notify(&mut self, packet: Packet) {
        info!("Sending {} to {}", packet, self.peer);
        if let Err(e) = self.socket.send_to(&packet.encode(), self.peer).await {
            debug!("Failed to send error to {}: {}", self.peer, e);
        }
    }

    async fn next_payload(&mut self) -> Result<Bytes> {
        match &mut self.endpoint {
            Endpoint::Reader(reader) => reader.next_block().await.map_err(TftpError::from),
            Endpoint::Writer(_) => Err(TftpError::IllegalOperation(
                "asked to send data on a receiving transfer".to_string(),
            )),
        }
    }

    async fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        match &mut self.endpoint {
            Endpoint::Writer(writer) => writer.write_block(payload).await,
            Endpoint::Reader(_) => Err(TftpError::IllegalOperation(
                "received data on a sending transfer".to_string(),
            )),
        }
    }

    fn observe(&self, block: u16, payload: &[u8]) {
        if let Some(observer) = &self.observer {
            observer(block, payload);
        }
    }
}
