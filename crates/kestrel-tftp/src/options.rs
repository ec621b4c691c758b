//! Transfer option handling (RFC 2347, 2348, 2349)
//!
//! [`OptionSet`] is the typed form of the `name\0value\0` pairs carried by
//! RRQ, WRQ and OACK packets. The server side runs [`negotiate`]; the client
//! side validates the server's answer with [`OptionSet::accept_oack`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, TftpError};
use crate::packet::{Packet, RawOption};

pub const DEFAULT_BLKSIZE: u32 = 512; // RFC 1350 standard block size
pub const MIN_BLKSIZE: u32 = 8; // RFC 2348 lower bound
pub const MAX_BLKSIZE: u32 = 65536;
pub const DEFAULT_TIMEOUT_SECS: u8 = 5;

/// Options this implementation understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Blksize,
    Timeout,
    Tsize,
}

impl OptionKind {
    pub const ALL: [OptionKind; 3] = [OptionKind::Blksize, OptionKind::Timeout, OptionKind::Tsize];

    pub fn name(self) -> &'static str {
        match self {
            OptionKind::Blksize => "blksize",
            OptionKind::Timeout => "timeout",
            OptionKind::Tsize => "tsize",
        }
    }

    /// Option names are case-insensitive (RFC 2347)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

/// Which request the options travel with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Requested or negotiated transfer options
///
/// `None` means the option is absent and the RFC default applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionSet {
    pub blksize: Option<u32>,
    pub timeout: Option<u8>,
    /// Upload: the announced size. Download request: 0, filled in by the server.
    pub transfer_size: Option<u64>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blksize(mut self, blksize: u32) -> Self {
        self.blksize = Some(blksize);
        self
    }

    pub fn with_timeout(mut self, secs: u8) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_transfer_size(mut self, size: u64) -> Self {
        self.transfer_size = Some(size);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.blksize.is_none() && self.timeout.is_none() && self.transfer_size.is_none()
    }

    /// Effective payload size per DATA packet
    pub fn block_size(&self) -> usize {
        self.blksize.unwrap_or(DEFAULT_BLKSIZE) as usize
    }

    /// Check locally requested values before anything goes on the wire
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.blksize
            && !(MIN_BLKSIZE..=MAX_BLKSIZE).contains(&size)
        {
            return Err(TftpError::InvalidOption(format!(
                "blksize {} outside {}..={}",
                size, MIN_BLKSIZE, MAX_BLKSIZE
            )));
        }
        if self.timeout == Some(0) {
            return Err(TftpError::InvalidOption(
                "timeout must be between 1 and 255 seconds".to_string(),
            ));
        }
        Ok(())
    }

    /// Wire form, in a fixed order: blksize, timeout, tsize
    pub fn to_raw(&self) -> Vec<RawOption> {
        let mut raw = Vec::new();
        if let Some(size) = self.blksize {
            raw.push(RawOption::new(OptionKind::Blksize.name(), size.to_string()));
        }
        if let Some(secs) = self.timeout {
            raw.push(RawOption::new(OptionKind::Timeout.name(), secs.to_string()));
        }
        if let Some(size) = self.transfer_size {
            raw.push(RawOption::new(OptionKind::Tsize.name(), size.to_string()));
        }
        raw
    }

    /// Lenient parse of a peer's request: unknown options and unparsable
    /// values are skipped, the first occurrence of a name wins.
    pub fn from_request(raw: &[RawOption]) -> Self {
        let mut set = OptionSet::default();
        for option in raw {
            match OptionKind::from_name(&option.name) {
                Some(OptionKind::Blksize) if set.blksize.is_none() => {
                    set.blksize = option.value.parse().ok();
                }
                Some(OptionKind::Timeout) if set.timeout.is_none() => {
                    set.timeout = option.value.parse::<u8>().ok().filter(|secs| *secs > 0);
                }
                Some(OptionKind::Tsize) if set.transfer_size.is_none() => {
                    set.transfer_size = option.value.parse().ok();
                }
                Some(_) => {}
                None => tracing::debug!("Ignoring unknown option: {}", option.name),
            }
        }
        set
    }

    /// Validate an OACK against what we (the client) requested and return
    /// the negotiated set. Anything the server left out falls back to the
    /// RFC default.
    pub fn accept_oack(&self, oack: &[RawOption], kind: RequestKind) -> Result<OptionSet> {
        let mut accepted = OptionSet::default();

        for option in oack {
            let Some(option_kind) = OptionKind::from_name(&option.name) else {
                return Err(TftpError::FailedNegotiation(format!(
                    "server acknowledged unknown option {}",
                    option.name
                )));
            };

            match option_kind {
                OptionKind::Blksize => {
                    let requested = self.blksize.ok_or_else(|| unrequested(option_kind))?;
                    let value: u32 = parse_value(option)?;
                    if !(MIN_BLKSIZE..=requested).contains(&value) {
                        return Err(TftpError::FailedNegotiation(format!(
                            "blksize {} outside {}..={}",
                            value, MIN_BLKSIZE, requested
                        )));
                    }
                    accepted.blksize = Some(value);
                }
                OptionKind::Timeout => {
                    let requested = self.timeout.ok_or_else(|| unrequested(option_kind))?;
                    let value: u8 = parse_value(option)?;
                    if value == 0 || value > requested {
                        return Err(TftpError::FailedNegotiation(format!(
                            "timeout {} outside 1..={}",
                            value, requested
                        )));
                    }
                    accepted.timeout = Some(value);
                }
                OptionKind::Tsize => {
                    let requested = self.transfer_size.ok_or_else(|| unrequested(option_kind))?;
                    let value: u64 = parse_value(option)?;
                    if kind == RequestKind::Write && value != requested {
                        return Err(TftpError::FailedNegotiation(format!(
                            "server changed tsize from {} to {}",
                            requested, value
                        )));
                    }
                    accepted.transfer_size = Some(value);
                }
            }
        }

        Ok(accepted)
    }
}

fn unrequested(kind: OptionKind) -> TftpError {
    TftpError::FailedNegotiation(format!("server acknowledged unrequested option {}", kind.name()))
}

fn parse_value<T: std::str::FromStr>(option: &RawOption) -> Result<T> {
    option.value.parse().map_err(|_| {
        TftpError::FailedNegotiation(format!(
            "invalid value {:?} for option {}",
            option.value, option.name
        ))
    })
}

/// What a server is willing to grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPolicy {
    pub allowed: Vec<OptionKind>,
    /// Upper bound for blksize, itself clamped to [`MAX_BLKSIZE`]
    pub max_blksize: u32,
    /// Retransmission interval the server would rather use
    pub preferred_timeout: Option<u8>,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            allowed: OptionKind::ALL.to_vec(),
            max_blksize: 65464, // RFC 2348 maximum block size
            preferred_timeout: None,
        }
    }
}

impl ServerPolicy {
    fn allows(&self, kind: OptionKind) -> bool {
        self.allowed.contains(&kind)
    }
}

/// Outcome of server-side negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub accepted: OptionSet,
    /// OACK to send, `None` when nothing was requested or everything declined
    pub reply: Option<Packet>,
}

/// Decide which requested options the server grants.
///
/// `file_size` is the size of the file about to be served; it is only
/// consulted for read requests, where it replaces the client's tsize
/// placeholder.
pub fn negotiate(
    requested: &OptionSet,
    policy: &ServerPolicy,
    kind: RequestKind,
    file_size: Option<u64>,
) -> Negotiation {
    let mut accepted = OptionSet::default();

    if let Some(size) = requested.blksize
        && policy.allows(OptionKind::Blksize)
        && size >= MIN_BLKSIZE
    {
        let ceiling = policy.max_blksize.clamp(MIN_BLKSIZE, MAX_BLKSIZE);
        let chosen = size.min(ceiling);
        if chosen != DEFAULT_BLKSIZE {
            accepted.blksize = Some(chosen);
        }
    }

    if let Some(secs) = requested.timeout
        && policy.allows(OptionKind::Timeout)
    {
        let chosen = policy.preferred_timeout.map_or(secs, |p| p.min(secs)).max(1);
        if chosen != DEFAULT_TIMEOUT_SECS {
            accepted.timeout = Some(chosen);
        }
    }

    if let Some(size) = requested.transfer_size
        && policy.allows(OptionKind::Tsize)
    {
        accepted.transfer_size = match kind {
            RequestKind::Write => Some(size),
            RequestKind::Read => file_size,
        };
    }

    let reply = if accepted.is_empty() {
        None
    } else {
        Some(Packet::Oack {
            options: accepted.to_raw(),
        })
    };

    Negotiation { accepted, reply }
}
