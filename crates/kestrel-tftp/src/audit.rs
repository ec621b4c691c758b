use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{Level, event};

use crate::metrics::TransferMetrics;
use crate::options::OptionSet;
use crate::packet::TransferMode;

/// Audit records for the server
///
/// Every event is written as a single JSON object on the `audit` tracing
/// target so log collectors can pick it out of the regular log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
        writes_enabled: bool,
    },

    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        graceful: bool,
        active_sessions: usize,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    /// Request refused before any data moved
    RequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error_code: u16,
        reason: String,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks: u64,
        duration_ms: u64,
        /// Bytes per second, absent when the transfer was too quick to measure
        #[serde(skip_serializing_if = "Option::is_none")]
        throughput_bps: Option<u64>,
        resent_bytes: u64,
        duplicate_packets: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
        bytes_transferred: u64,
    },

    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Transfer session this event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "kestrel-tftp".to_string(),
            severity: severity.to_string(),
            session_id: None,
        }
    }

    pub fn with_session(severity: &str, session_id: &str) -> Self {
        let mut fields = Self::new(severity);
        fields.session_id = Some(session_id.to_string());
        fields
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(target: "audit", Level::ERROR, audit_event = %json),
            "warn" => event!(target: "audit", Level::WARN, audit_event = %json),
            _ => event!(target: "audit", Level::INFO, audit_event = %json),
        }
    }

    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::RequestDenied { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::ProtocolViolation { common, .. } => common,
        }
    }
}

/// Emits [`AuditEvent`]s when auditing is enabled
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn emit(&self, event: AuditEvent) {
        if self.enabled {
            event.log();
        }
    }

    pub fn server_started(&self, bind_addr: SocketAddr, root_dir: &str, writes_enabled: bool) {
        self.emit(AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
            writes_enabled,
        });
    }

    pub fn server_shutdown(&self, graceful: bool, active_sessions: usize) {
        self.emit(AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            graceful,
            active_sessions,
        });
    }

    pub fn read_request(
        &self,
        session_id: &str,
        client_addr: SocketAddr,
        filename: &str,
        mode: TransferMode,
        options: &OptionSet,
    ) {
        self.emit(AuditEvent::ReadRequest {
            common: CommonFields::with_session("info", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options_json(options),
        });
    }

    pub fn write_request(
        &self,
        session_id: &str,
        client_addr: SocketAddr,
        filename: &str,
        mode: TransferMode,
        options: &OptionSet,
    ) {
        self.emit(AuditEvent::WriteRequest {
            common: CommonFields::with_session("info", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options_json(options),
        });
    }

    pub fn request_denied(
        &self,
        session_id: &str,
        client_addr: SocketAddr,
        filename: &str,
        error_code: u16,
        reason: &str,
    ) {
        self.emit(AuditEvent::RequestDenied {
            common: CommonFields::with_session("warn", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error_code,
            reason: reason.to_string(),
        });
    }

    pub fn transfer_completed(
        &self,
        session_id: &str,
        client_addr: SocketAddr,
        filename: &str,
        metrics: &TransferMetrics,
    ) {
        self.emit(AuditEvent::TransferCompleted {
            common: CommonFields::with_session("info", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred: metrics.bytes_transferred,
            blocks: metrics.blocks,
            duration_ms: metrics.duration.as_millis() as u64,
            throughput_bps: metrics.throughput().map(|bps| bps as u64),
            resent_bytes: metrics.resent_bytes,
            duplicate_packets: metrics.duplicate_count,
        });
    }

    pub fn transfer_failed(
        &self,
        session_id: &str,
        client_addr: SocketAddr,
        filename: &str,
        error: &str,
        bytes_transferred: u64,
    ) {
        self.emit(AuditEvent::TransferFailed {
            common: CommonFields::with_session("error", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
            bytes_transferred,
        });
    }

    pub fn protocol_violation(&self, client_addr: SocketAddr, violation: &str) {
        self.emit(AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        });
    }
}

fn options_json(options: &OptionSet) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    if let Some(blksize) = options.blksize {
        map.insert("blksize".to_string(), blksize.into());
    }
    if let Some(timeout) = options.timeout {
        map.insert("timeout".to_string(), timeout.into());
    }
    if let Some(tsize) = options.transfer_size {
        map.insert("tsize".to_string(), tsize.into());
    }
    serde_json::Value::Object(map)
}
