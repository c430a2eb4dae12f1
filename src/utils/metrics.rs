//! Observability counters.
//!
//! Process-wide atomic counters for connections, frames and transfers.
//! Reads are relaxed; a snapshot is a best-effort view, not a consistent cut.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for engine operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established (dialed or accepted)
    pub connections_total: AtomicU64,
    /// Currently live connections
    pub connections_active: AtomicU64,
    /// Dial attempts that failed
    pub connect_failures: AtomicU64,
    /// Session tokens issued or accepted
    pub handshakes_completed: AtomicU64,
    /// Requests rejected for a missing or wrong token
    pub unauthorized_requests: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Frames that failed to decode (connection-fatal)
    pub malformed_frames: AtomicU64,
    /// Frames with a known type but no registered handler
    pub unhandled_messages: AtomicU64,
    pub transfers_started: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    pub segments_sent: AtomicU64,
    pub segments_received: AtomicU64,
    pub checksum_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            unauthorized_requests: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            unhandled_messages: AtomicU64::new(0),
            transfers_started: AtomicU64::new(0),
            transfers_completed: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            segments_sent: AtomicU64::new(0),
            segments_received: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate so a stray double-close cannot wrap the gauge.
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unauthorized_request(&self) {
        self.unauthorized_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unhandled_message(&self) {
        self.unhandled_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_started(&self) {
        self.transfers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_sent(&self) {
        self.segments_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_received(&self) {
        self.segments_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            unauthorized_requests: self.unauthorized_requests.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unhandled_messages: self.unhandled_messages.load(Ordering::Relaxed),
            transfers_started: self.transfers_started.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            segments_sent: self.segments_sent.load(Ordering::Relaxed),
            segments_received: self.segments_received.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            connect_failures = s.connect_failures,
            handshakes_completed = s.handshakes_completed,
            unauthorized_requests = s.unauthorized_requests,
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            malformed_frames = s.malformed_frames,
            unhandled_messages = s.unhandled_messages,
            transfers_started = s.transfers_started,
            transfers_completed = s.transfers_completed,
            transfers_failed = s.transfers_failed,
            segments_sent = s.segments_sent,
            segments_received = s.segments_received,
            checksum_failures = s.checksum_failures,
            uptime_seconds = s.uptime_seconds,
            "Engine metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connect_failures: u64,
    pub handshakes_completed: u64,
    pub unauthorized_requests: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub malformed_frames: u64,
    pub unhandled_messages: u64,
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub segments_sent: u64,
    pub segments_received: u64,
    pub checksum_failures: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs the elapsed time of an operation when dropped.
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let m = Metrics::new();
        m.connection_established();
        m.connection_established();
        m.connection_closed();
        m.frame_sent(100);
        m.frame_received(40);
        m.transfer_started();
        m.checksum_failure();

        let s = m.snapshot();
        assert_eq!(s.connections_total, 2);
        assert_eq!(s.connections_active, 1);
        assert_eq!(s.frames_sent, 1);
        assert_eq!(s.bytes_sent, 100);
        assert_eq!(s.bytes_received, 40);
        assert_eq!(s.transfers_started, 1);
        assert_eq!(s.checksum_failures, 1);
    }

    #[test]
    fn test_active_gauge_never_wraps() {
        let m = Metrics::new();
        m.connection_closed();
        assert_eq!(m.snapshot().connections_active, 0);
    }
}
