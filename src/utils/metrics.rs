//! Session counters
//!
//! Lock-free counters describing one endpoint. A server or client owns an
//! `Arc<Metrics>` and hands clones to its I/O tasks; readers take a
//! [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Counters for a server or client
#[derive(Debug, Default)]
pub struct Metrics {
    accepted: AtomicU64,
    in_slots: AtomicU64,
    refused: AtomicU64,
    handshakes: AtomicU64,
    sent: AtomicU64,
    sent_bytes: AtomicU64,
    received: AtomicU64,
    received_bytes: AtomicU64,
    dropped_datagrams: AtomicU64,
    bad_signatures: AtomicU64,
    bad_credentials: AtomicU64,
    io_errors: AtomicU64,
    malformed: AtomicU64,
    started: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Some(Instant::now()),
            ..Self::default()
        }
    }

    /// A TCP connection was accepted, before slot assignment
    pub fn connection_accepted(&self) {
        bump(&self.accepted, 1);
    }

    pub fn connection_admitted(&self) {
        bump(&self.in_slots, 1);
    }

    /// Refused because every slot was taken
    pub fn connection_rejected(&self) {
        bump(&self.refused, 1);
    }

    /// A slot was released. Never drops below zero.
    pub fn connection_closed(&self) {
        let _ = self
            .in_slots
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn handshake_completed(&self) {
        bump(&self.handshakes, 1);
    }

    pub fn message_sent(&self, byte_count: u64) {
        bump(&self.sent, 1);
        bump(&self.sent_bytes, byte_count);
    }

    pub fn message_received(&self, byte_count: u64) {
        bump(&self.received, 1);
        bump(&self.received_bytes, byte_count);
    }

    /// Datagram discarded before reaching a handler
    pub fn datagram_dropped(&self) {
        bump(&self.dropped_datagrams, 1);
    }

    /// Signed message whose HMAC did not verify
    pub fn integrity_failure(&self) {
        bump(&self.bad_signatures, 1);
    }

    /// Request refused for a bad token or claimed id
    pub fn authorization_failure(&self) {
        bump(&self.bad_credentials, 1);
    }

    pub fn connection_error(&self) {
        bump(&self.io_errors, 1);
    }

    /// Message that failed to decode
    pub fn protocol_error(&self) {
        bump(&self.malformed, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: read(&self.accepted),
            connections_active: read(&self.in_slots),
            connections_rejected: read(&self.refused),
            handshakes_completed: read(&self.handshakes),
            messages_sent: read(&self.sent),
            messages_received: read(&self.received),
            bytes_sent: read(&self.sent_bytes),
            bytes_received: read(&self.received_bytes),
            datagrams_dropped: read(&self.dropped_datagrams),
            integrity_failures: read(&self.bad_signatures),
            authorization_failures: read(&self.bad_credentials),
            connection_errors: read(&self.io_errors),
            protocol_errors: read(&self.malformed),
            uptime_seconds: self.started.map_or(0, |t| t.elapsed().as_secs()),
        }
    }

    /// Emit one structured `info` event with every counter.
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            accepted = s.connections_total,
            active = s.connections_active,
            rejected = s.connections_rejected,
            handshakes = s.handshakes_completed,
            sent = s.messages_sent,
            received = s.messages_received,
            bytes_out = s.bytes_sent,
            bytes_in = s.bytes_received,
            datagrams_dropped = s.datagrams_dropped,
            integrity_failures = s.integrity_failures,
            authorization_failures = s.authorization_failures,
            connection_errors = s.connection_errors,
            protocol_errors = s.protocol_errors,
            uptime_secs = s.uptime_seconds,
            "Session metrics"
        );
    }
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub handshakes_completed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub datagrams_dropped: u64,
    pub integrity_failures: u64,
    pub authorization_failures: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}
