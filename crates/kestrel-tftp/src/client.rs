//! Client API
//!
//! ```no_run
//! # async fn example() -> kestrel_tftp::Result<()> {
//! use kestrel_tftp::{Destination, OptionSet, TftpClient, TransferSettings};
//!
//! let client = TftpClient::new("192.0.2.10:69".parse().unwrap())
//!     .with_options(OptionSet::new().with_blksize(1428));
//! let metrics = client
//!     .download("pxelinux.0", Destination::from_arg("pxelinux.0"), TransferSettings::default())
//!     .await?;
//! println!("{} bytes", metrics.bytes_transferred);
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::config::SocketConfig;
use crate::context::{BlockObserver, Outcome, TransferContext};
use crate::error::Result;
use crate::lock::{FileLock, lock_backend};
use crate::metrics::TransferMetrics;
use crate::options::OptionSet;
use crate::packet::TransferMode;
use crate::retransmit::{DEFAULT_RETRIES, DEFAULT_TIMEOUT, RetransmissionController};
use crate::socket;
use crate::state::{Direction, StateMachine};
use crate::stream::{BlockReader, BlockWriter, Destination, Source};

/// Connection-wide client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server listening address (port 69 unless the server says otherwise)
    pub server: SocketAddr,
    pub options: OptionSet,
    pub mode: TransferMode,
    /// Local address to send from; the wildcard of the server's family if unset
    pub local_ip: Option<IpAddr>,
    pub timeout: Duration,
    pub retries: u32,
    /// Wait for a held lock on the local file instead of failing
    pub lock_blocking: bool,
    pub lock: Arc<dyn FileLock>,
    pub socket: SocketConfig,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            options: OptionSet::default(),
            mode: TransferMode::Octet,
            local_ip: None,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            lock_blocking: false,
            lock: lock_backend(true),
            socket: SocketConfig::default(),
        }
    }
}

/// Per-call overrides
#[derive(Clone, Default)]
pub struct TransferSettings {
    pub on_block: Option<BlockObserver>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl TransferSettings {
    pub fn on_block(mut self, observer: impl Fn(u16, &[u8]) + Send + Sync + 'static) -> Self {
        self.on_block = Some(Arc::new(observer));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TftpClient {
    config: ClientConfig,
}

impl TftpClient {
    pub fn new(server: SocketAddr) -> Self {
        Self::from_config(ClientConfig::new(server))
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn with_options(mut self, options: OptionSet) -> Self {
        self.config.options = options;
        self
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn with_local_ip(mut self, ip: IpAddr) -> Self {
        self.config.local_ip = Some(ip);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Turn advisory locking of the local file on or off
    pub fn with_flock(mut self, enabled: bool) -> Self {
        self.config.lock = lock_backend(enabled);
        self
    }

    pub fn with_lock_backend(mut self, lock: Arc<dyn FileLock>) -> Self {
        self.config.lock = lock;
        self
    }

    pub fn with_lock_blocking(mut self, blocking: bool) -> Self {
        self.config.lock_blocking = blocking;
        self
    }

    /// Fetch `filename` from the server (RRQ)
    pub async fn download(
        &self,
        filename: &str,
        destination: Destination,
        settings: TransferSettings,
    ) -> Result<TransferMetrics> {
        self.download_outcome(filename, destination, settings)
            .await
            .into_result()
    }

    /// Like [`download`](Self::download), keeping the counters of a failed transfer
    pub async fn download_outcome(
        &self,
        filename: &str,
        destination: Destination,
        settings: TransferSettings,
    ) -> Outcome {
        let span = info_span!(
            "download",
            session = %Uuid::new_v4(),
            server = %self.config.server,
            file = %filename
        );

        async move {
            let context = match self.prepare_download(filename, destination, &settings).await {
                Ok(context) => context,
                Err(err) => return Outcome::failed(err),
            };
            let outcome = context.run().await;
            self.report(&outcome, "Downloaded");
            outcome
        }
        .instrument(span)
        .await
    }

    /// Send `source` to the server as `filename` (WRQ)
    pub async fn upload(
        &self,
        filename: &str,
        source: Source,
        settings: TransferSettings,
    ) -> Result<TransferMetrics> {
        self.upload_outcome(filename, source, settings)
            .await
            .into_result()
    }

    /// Like [`upload`](Self::upload), keeping the counters of a failed transfer
    pub async fn upload_outcome(
        &self,
        filename: &str,
        source: Source,
        settings: TransferSettings,
    ) -> Outcome {
        let span = info_span!(
            "upload",
            session = %Uuid::new_v4(),
            server = %self.config.server,
            file = %filename
        );

        async move {
            let context = match self.prepare_upload(filename, source, &settings).await {
                Ok(context) => context,
                Err(err) => return Outcome::failed(err),
            };
            let outcome = context.run().await;
            self.report(&outcome, "Uploaded");
            outcome
        }
        .instrument(span)
        .await
    }

    async fn prepare_download(
        &self,
        filename: &str,
        destination: Destination,
        settings: &TransferSettings,
    ) -> Result<TransferContext> {
        self.config.options.validate()?;

        let (writer, guard) = destination
            .open(Arc::clone(&self.config.lock), self.config.lock_blocking)
            .await?;
        let socket = self.bind()?;

        let machine = StateMachine::client(
            Direction::Receiving,
            filename,
            self.config.mode,
            self.config.options,
            self.retransmit(settings),
        );
        let writer = BlockWriter::new(writer, self.config.mode, filename);

        info!("Downloading {} from {}", filename, self.config.server);
        Ok(
            TransferContext::client_download(socket, self.config.server, machine, writer)
                .with_lock(guard)
                .with_observer(settings.on_block.clone()),
        )
    }

    async fn prepare_upload(
        &self,
        filename: &str,
        source: Source,
        settings: &TransferSettings,
    ) -> Result<TransferContext> {
        self.config.options.validate()?;

        let (reader, guard, size) = source
            .open(Arc::clone(&self.config.lock), self.config.lock_blocking)
            .await?;
        let socket = self.bind()?;

        // tsize announces the real size when we know it.
        let mut options = self.config.options;
        if let (Some(_), Some(size)) = (options.transfer_size, size) {
            options.transfer_size = Some(size);
        }

        let machine = StateMachine::client(
            Direction::Sending,
            filename,
            self.config.mode,
            options,
            self.retransmit(settings),
        );
        let reader = BlockReader::new(reader, self.config.mode, options.block_size());

        info!("Uploading {} to {}", filename, self.config.server);
        Ok(
            TransferContext::client_upload(socket, self.config.server, machine, reader)
                .with_lock(guard)
                .with_observer(settings.on_block.clone()),
        )
    }

    fn bind(&self) -> Result<tokio::net::UdpSocket> {
        let ip = self
            .config
            .local_ip
            .unwrap_or_else(|| socket::unspecified_for(&self.config.server));
        Ok(socket::bind_ephemeral(ip, &self.config.socket)?)
    }

    fn retransmit(&self, settings: &TransferSettings) -> RetransmissionController {
        RetransmissionController::new(
            settings.timeout.unwrap_or(self.config.timeout),
            settings.retries.unwrap_or(self.config.retries),
        )
    }

    fn report(&self, outcome: &Outcome, verb: &str) {
        match &outcome.result {
            Ok(()) => {
                if let Some(expected) = outcome.metrics.expected_size {
                    info!("Expected size {} bytes", expected);
                }
                outcome.metrics.log_summary(verb);
            }
            Err(e) => info!("Transfer failed: {}", e),
        }
    }
}
