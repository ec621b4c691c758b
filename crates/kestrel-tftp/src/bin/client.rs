use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use kestrel_tftp::config::{LogFormat, LoggingConfig};
use kestrel_tftp::{
    Destination, OptionSet, Source, TftpClient, TransferMode, TransferSettings, logging,
};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Kestrel TFTP client
#[derive(Parser, Debug)]
#[command(name = "kestrel-tftp-client")]
#[command(about = "TFTP client (RFC 1350, blksize/timeout/tsize options)", long_about = None)]
struct Cli {
    /// TFTP server host or address, optionally with a port (e.g., 192.168.1.100:69)
    server: String,

    /// Server port when SERVER has none
    #[arg(short = 'P', long, default_value_t = 69)]
    port: u16,

    /// Transfer mode (octet or netascii)
    #[arg(short, long, default_value = "octet")]
    mode: TransferMode,

    /// Request this block size (8-65536 bytes)
    #[arg(short, long)]
    blksize: Option<u32>,

    /// Request this retransmission timeout from the server, in seconds
    #[arg(long)]
    timeout_option: Option<u8>,

    /// Request the transfer size option
    #[arg(long)]
    tsize: bool,

    /// Local wait before retransmitting, in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Retransmissions before giving up
    #[arg(short, long, default_value_t = 3)]
    retries: u32,

    /// Local address to send from
    #[arg(long)]
    local_ip: Option<IpAddr>,

    /// Disable advisory locking of the local file
    #[arg(long)]
    no_flock: bool,

    /// Wait for a locked local file instead of failing
    #[arg(long)]
    lock_blocking: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download REMOTE into LOCAL ("-" for stdout)
    Get {
        remote: String,
        local: Option<String>,
    },
    /// Upload LOCAL ("-" for stdin) as REMOTE
    Put {
        local: String,
        remote: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging_config = LoggingConfig {
        level: if cli.verbose { "debug" } else { "info" }.to_string(),
        format: cli.log_format,
        file: None,
        audit_enabled: false,
    };
    let _log_guard = logging::init(&logging_config)?;

    let server = resolve_server(&cli.server, cli.port).await?;

    let mut options = OptionSet::new();
    if let Some(blksize) = cli.blksize {
        options = options.with_blksize(blksize);
    }
    if let Some(secs) = cli.timeout_option {
        options = options.with_timeout(secs);
    }
    if cli.tsize {
        options = options.with_transfer_size(0);
    }

    let mut client = TftpClient::new(server)
        .with_options(options)
        .with_mode(cli.mode)
        .with_timeout(Duration::from_secs(cli.timeout))
        .with_retries(cli.retries)
        .with_flock(!cli.no_flock)
        .with_lock_blocking(cli.lock_blocking);
    if let Some(ip) = cli.local_ip {
        client = client.with_local_ip(ip);
    }

    match cli.command {
        Command::Get { remote, local } => {
            let local = local.unwrap_or_else(|| default_local_name(&remote));
            client
                .download(&remote, Destination::from_arg(&local), TransferSettings::default())
                .await
                .with_context(|| format!("Download of {} failed", remote))?;
        }
        Command::Put { local, remote } => {
            let remote = match remote {
                Some(remote) => remote,
                None if local == "-" => bail!("a remote name is required when uploading stdin"),
                None => default_local_name(&local),
            };
            client
                .upload(&remote, Source::from_arg(&local), TransferSettings::default())
                .await
                .with_context(|| format!("Upload of {} failed", local))?;
        }
    }

    Ok(())
}

async fn resolve_server(server: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((server, port))
        .await
        .with_context(|| format!("Failed to resolve {}", server))?
        .next()
        .with_context(|| format!("No address for {}", server))
}

fn default_local_name(remote: &str) -> String {
    Path::new(remote)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(remote)
        .to_string()
}
