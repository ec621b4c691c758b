use anyhow::Context;
use clap::Parser;
use kestrel_tftp::config::{LogFormat, ServerConfig, load_config, validate_config, write_config};
use kestrel_tftp::{OptionKind, TftpServer, logging};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kestrel-tftp-server", about = "Standalone TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/kestrel/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Options to negotiate, e.g. "blksize,tsize"
    #[arg(long, value_delimiter = ',', value_parser = parse_option_kind)]
    allowed_options: Option<Vec<OptionKind>>,

    /// Retransmission timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Retransmissions before a session is abandoned
    #[arg(long)]
    retries: Option<u32>,

    /// Accept uploads (still limited to write.allowed_patterns)
    #[arg(long, value_parser = clap::value_parser!(bool))]
    write_enabled: Option<bool>,

    /// Wait for locked files instead of refusing the request
    #[arg(long)]
    lock_blocking: bool,

    /// Disable advisory file locking
    #[arg(long)]
    no_flock: bool,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn parse_option_kind(value: &str) -> Result<OptionKind, String> {
    OptionKind::from_name(value).ok_or_else(|| format!("unknown option '{}'", value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        ServerConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(allowed) = cli.allowed_options {
        config.allowed_options = allowed;
    }
    if let Some(timeout_secs) = cli.timeout_secs {
        config.timeout_secs = timeout_secs;
    }
    if let Some(retries) = cli.retries {
        config.retries = retries;
    }
    if let Some(enabled) = cli.write_enabled {
        config.write.enabled = enabled;
    }
    if cli.lock_blocking {
        config.lock_blocking = true;
    }
    if cli.no_flock {
        config.flock = false;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir)
            .await
            .with_context(|| format!("Failed to create {}", config.root_dir.display()))?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    let _log_guard = logging::init(&config.logging)?;

    let handle = TftpServer::from_config(&config)
        .bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received interrupt, waiting for active transfers");
    handle.shutdown(true).await?;

    Ok(())
}
