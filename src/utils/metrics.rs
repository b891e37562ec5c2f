//! Observability and Metrics
//!
//! Relaxed atomic counters for connection, bundle, TLS and authentication
//! activity. Values read from other threads are advisory only; nothing in the
//! crate makes a correctness decision based on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for connection-layer operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections admitted by workers
    pub connections_total: AtomicU64,
    /// Currently registered connections
    pub connections_active: AtomicU64,
    /// Connections cancelled by their watchdog
    pub connections_timed_out: AtomicU64,
    /// Sockets rejected by the admission predicate
    pub connections_rejected: AtomicU64,
    /// Total TLS handshakes started
    pub handshakes_total: AtomicU64,
    /// TLS sessions that reached OPEN
    pub handshakes_success: AtomicU64,
    /// TLS handshakes or verifications that failed
    pub handshakes_failed: AtomicU64,
    /// Bundles queued for sending
    pub bundles_sent: AtomicU64,
    /// Bundles fully decoded
    pub bundles_received: AtomicU64,
    /// Wire bytes written by bundle channels
    pub bytes_sent: AtomicU64,
    /// Wire bytes read by bundle channels
    pub bytes_received: AtomicU64,
    /// Control panel authentication failures
    pub auth_failures: AtomicU64,
    /// Protocol violations (bad header, oversized bundle, bad envelope)
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_timed_out: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            bundles_sent: AtomicU64::new(0),
            bundles_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_timed_out(&self) {
        self.connections_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bundle_sent(&self) {
        self.bundles_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bundle_received(&self) {
        self.bundles_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, byte_count: u64) {
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_timed_out: self.connections_timed_out.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            bundles_sent: self.bundles_sent.load(Ordering::Relaxed),
            bundles_received: self.bundles_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_timed_out = snapshot.connections_timed_out,
            connections_rejected = snapshot.connections_rejected,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            bundles_sent = snapshot.bundles_sent,
            bundles_received = snapshot.bundles_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            auth_failures = snapshot.auth_failures,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection layer metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_timed_out: u64,
    pub connections_rejected: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub bundles_sent: u64,
    pub bundles_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub auth_failures: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        metrics.connection_timed_out();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.connections_timed_out, 1);
    }

    #[test]
    fn test_bundle_counters() {
        let metrics = Metrics::new();
        metrics.bundle_sent();
        metrics.bytes_written(128);
        metrics.bundle_received();
        metrics.bytes_read(64);
        metrics.protocol_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bundles_sent, 1);
        assert_eq!(snapshot.bytes_sent, 128);
        assert_eq!(snapshot.bundles_received, 1);
        assert_eq!(snapshot.bytes_received, 64);
        assert_eq!(snapshot.protocol_errors, 1);
    }
}
