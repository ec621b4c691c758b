//! Per-transfer counters
//!
//! One [`MetricsCollector`] lives inside each transfer context. When the
//! transfer ends it is frozen into a [`TransferMetrics`] snapshot that the
//! client API hands back to the caller and the server writes to the audit log.

use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct MetricsCollector {
    bytes_transferred: u64,
    resent_bytes: u64,
    duplicate_count: u64,
    blocks: u64,
    expected_size: Option<u64>,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of the transfer; later calls keep the first timestamp
    pub fn start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    /// A new (not retransmitted) DATA block went out or came in
    pub fn record_block(&mut self, payload_len: usize) {
        self.blocks += 1;
        self.bytes_transferred += payload_len as u64;
    }

    pub fn record_resend(&mut self, payload_len: usize) {
        self.resent_bytes += payload_len as u64;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicate_count += 1;
    }

    /// Size announced through the tsize option, if any
    pub fn set_expected_size(&mut self, size: u64) {
        self.expected_size = Some(size);
    }

    pub fn finish(&mut self) {
        if self.end.is_none() {
            self.end = Some(Instant::now());
        }
    }

    pub fn snapshot(&self) -> TransferMetrics {
        let duration = match (self.start, self.end) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };

        TransferMetrics {
            bytes_transferred: self.bytes_transferred,
            resent_bytes: self.resent_bytes,
            duplicate_count: self.duplicate_count,
            blocks: self.blocks,
            expected_size: self.expected_size,
            duration,
        }
    }
}

/// Frozen view of a finished (or failed) transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferMetrics {
    pub bytes_transferred: u64,
    /// Sum of DATA payload bytes sent more than once
    pub resent_bytes: u64,
    /// Packets received and ignored as duplicates
    pub duplicate_count: u64,
    pub blocks: u64,
    pub expected_size: Option<u64>,
    pub duration: Duration,
}

impl TransferMetrics {
    /// Bytes per second, `None` when the duration is too short to measure
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            Some(self.bytes_transferred as f64 / secs)
        } else {
            None
        }
    }

    pub fn kbps(&self) -> Option<f64> {
        self.throughput().map(|bps| bps * 8.0 / 1024.0)
    }

    /// Write the end-of-transfer summary to the log
    pub fn log_summary(&self, verb: &str) {
        match self.kbps() {
            Some(kbps) => {
                tracing::info!(
                    "{} {} bytes in {:.2} seconds",
                    verb,
                    self.bytes_transferred,
                    self.duration.as_secs_f64()
                );
                tracing::info!("Average rate: {:.2} kbps", kbps);
            }
            None => tracing::info!("Duration too short, rate undetermined"),
        }
        tracing::info!("{} bytes in resent data", self.resent_bytes);
        tracing::info!("Received {} duplicate packets", self.duplicate_count);
    }
}
