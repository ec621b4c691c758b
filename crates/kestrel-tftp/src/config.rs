use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TftpError};
use crate::options::{MAX_BLKSIZE, MIN_BLKSIZE, OptionKind, ServerPolicy};

/// Upload policy
///
/// Writes are disabled unless explicitly enabled, and then only for paths
/// matching one of `allowed_patterns`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub enabled: bool,

    /// When false an upload onto an existing file is answered with
    /// "File already exists"
    pub allow_overwrite: bool,

    /// Glob patterns relative to the root, e.g. `["*.txt", "configs/*.cfg"]`
    pub allowed_patterns: Vec<String>,
}

impl WriteConfig {
    pub fn permits(&self, filename: &str) -> bool {
        let filename = filename.trim_start_matches('/');
        self.enabled
            && self.allowed_patterns.iter().any(|pattern| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(filename))
                    .unwrap_or(false)
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Seconds to wait for each reply before retransmitting
    pub timeout_secs: u64,
    /// Retransmissions of one packet before the session is abandoned
    pub retries: u32,
    /// Options the server is willing to negotiate
    pub allowed_options: Vec<OptionKind>,
    /// Largest blksize granted (65464 keeps a DATA packet inside one
    /// Ethernet-sized IP datagram after fragmentation headers)
    pub max_blksize: u32,
    /// Timeout the server proposes when a client asks for a longer one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_timeout_secs: Option<u8>,
    /// Largest file served or accepted, 0 for unlimited
    pub max_file_size_bytes: u64,
    /// Wait for a held file lock instead of refusing the request
    pub lock_blocking: bool,
    /// Take advisory locks on served and written files
    pub flock: bool,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/srv/tftp"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            timeout_secs: 5,
            retries: 3,
            allowed_options: OptionKind::ALL.to_vec(),
            max_blksize: 65464,
            preferred_timeout_secs: None,
            max_file_size_bytes: 0,
            lock_blocking: false,
            flock: true,
            write: WriteConfig::default(),
            logging: LoggingConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn option_policy(&self) -> ServerPolicy {
        ServerPolicy {
            allowed: self.allowed_options.clone(),
            max_blksize: self.max_blksize,
            preferred_timeout: self.preferred_timeout_secs,
        }
    }

    pub fn max_file_size(&self) -> Option<u64> {
        (self.max_file_size_bytes > 0).then_some(self.max_file_size_bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Emit one JSON audit record per request and per finished transfer
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text for humans
    Text,
    /// One JSON object per line for log collectors
    Json,
}

/// Socket tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// SO_RCVBUF in KB, 0 keeps the OS default
    pub recv_buffer_kb: usize,
    /// SO_SNDBUF in KB, 0 keeps the OS default
    pub send_buffer_kb: usize,
    /// SO_REUSEADDR on the listening socket
    pub reuse_address: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_kb: 1024,
            send_buffer_kb: 1024,
            reuse_address: false,
        }
    }
}

pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    write_config(path, &ServerConfig::default())
}

pub fn write_config(path: &Path, config: &ServerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Check a server configuration before binding.
///
/// With `validate_bind` set the listening address is test-bound once.
pub fn validate_config(config: &ServerConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Config(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Config(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    if config.timeout_secs == 0 {
        return Err(TftpError::Config("timeout_secs must be at least 1".to_string()));
    }

    if !(MIN_BLKSIZE..=MAX_BLKSIZE).contains(&config.max_blksize) {
        return Err(TftpError::Config(format!(
            "max_blksize must be in range {}-{}",
            MIN_BLKSIZE, MAX_BLKSIZE
        )));
    }

    if config.preferred_timeout_secs == Some(0) {
        return Err(TftpError::Config(
            "preferred_timeout_secs must be at least 1".to_string(),
        ));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TftpError::Config(format!("logging.file parent error: {}", e))),
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::Config(format!("logging.file not writable: {}", e)))?;
    }

    validate_write_config(&config.write)
}

pub fn validate_write_config(config: &WriteConfig) -> Result<()> {
    if config.enabled && config.allowed_patterns.is_empty() {
        return Err(TftpError::Config(
            "write.enabled is set but write.allowed_patterns is empty; \
            uploads would all be refused"
                .to_string(),
        ));
    }

    for pattern in &config.allowed_patterns {
        if pattern.trim().is_empty() {
            return Err(TftpError::Config(
                "write.allowed_patterns contains an empty pattern".to_string(),
            ));
        }

        if pattern == "*" || pattern == "**" || pattern == "**/*" {
            return Err(TftpError::Config(format!(
                "write pattern '{}' matches every upload; name the files instead, e.g. '*.bin' or 'cfg/*.conf'",
                pattern
            )));
        }

        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(TftpError::Config(format!(
                "Write pattern '{}' is invalid: {}",
                pattern, e
            )));
        }
    }

    Ok(())
}
