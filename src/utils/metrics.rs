//! Per-connection counters
//!
//! Each session owns one [`Metrics`]; nothing here is process-global.
//! Counters are relaxed atomics, read together through [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Counters for one connection
#[derive(Debug)]
pub struct Metrics {
    /// Frames written to the transport
    pub packets_sent: AtomicU64,
    /// Frames read from the transport
    pub packets_received: AtomicU64,
    /// Payload bytes written
    pub bytes_sent: AtomicU64,
    /// Payload bytes read
    pub bytes_received: AtomicU64,
    /// Service messages handed to services
    pub messages_dispatched: AtomicU64,
    /// Service messages collected from services
    pub messages_collected: AtomicU64,
    /// Key exchanges this side started
    pub handshakes_started: AtomicU64,
    /// Keys installed
    pub keys_installed: AtomicU64,
    /// Messages addressed to no registered service
    pub unknown_service: AtomicU64,
    /// Service messages that failed to parse
    pub malformed_messages: AtomicU64,
    /// Outbound messages dropped for exceeding the frame limit
    pub oversize_dropped: AtomicU64,
    /// Connection-fatal protocol errors
    pub fatal_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            messages_collected: AtomicU64::new(0),
            handshakes_started: AtomicU64::new(0),
            keys_installed: AtomicU64::new(0),
            unknown_service: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            oversize_dropped: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn packet_sent(&self, byte_count: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, byte_count: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn message_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_collected(&self, count: usize) {
        self.messages_collected
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn handshake_started(&self) {
        self.handshakes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn key_installed(&self) {
        self.keys_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_service(&self) {
        self.unknown_service.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversize_dropped(&self) {
        self.oversize_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_collected: self.messages_collected.load(Ordering::Relaxed),
            handshakes_started: self.handshakes_started.load(Ordering::Relaxed),
            keys_installed: self.keys_installed.load(Ordering::Relaxed),
            unknown_service: self.unknown_service.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            oversize_dropped: self.oversize_dropped.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            packets_sent = s.packets_sent,
            packets_received = s.packets_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            messages_dispatched = s.messages_dispatched,
            messages_collected = s.messages_collected,
            handshakes_started = s.handshakes_started,
            keys_installed = s.keys_installed,
            unknown_service = s.unknown_service,
            malformed_messages = s.malformed_messages,
            oversize_dropped = s.oversize_dropped,
            fatal_errors = s.fatal_errors,
            uptime_seconds = s.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_dispatched: u64,
    pub messages_collected: u64,
    pub handshakes_started: u64,
    pub keys_installed: u64,
    pub unknown_service: u64,
    pub malformed_messages: u64,
    pub oversize_dropped: u64,
    pub fatal_errors: u64,
    pub uptime_seconds: u64,
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
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
