//! # Network Quality Measurement
//!
//! Client-side probes for connection quality:
//! - **Latency**: a ping every `ping_interval` over UDP; RTT average,
//!   jitter and per-interval loss
//! - **Bandwidth**: one large reliable payload, timed until acknowledged
//! - **Throughput**: a burst of small unreliable packets, measured by the
//!   bytes the server acknowledges before completion or timeout
//!
//! Every method takes the current [`Instant`] so runs can be scripted in
//! tests without sleeping.

pub mod bandwidth;
pub mod latency;
pub mod throughput;

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{ProtocolError, Result};
use crate::service::client::{Client, ClientEvent};

pub use bandwidth::{BandwidthReport, BandwidthTest};
pub use latency::{LatencyTracker, LossReport};
pub use throughput::{ThroughputReport, ThroughputTest};

/// A finished measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityReport {
    Loss(LossReport),
    Bandwidth(BandwidthReport),
    Throughput(ThroughputReport),
}

/// Drives the probes over a [`Client`].
#[derive(Debug)]
pub struct QualityMonitor {
    latency: LatencyTracker,
    bandwidth: BandwidthTest,
    throughput: ThroughputTest,
    ping_interval: Duration,
    next_ping: Option<Instant>,
    last_loss: Option<LossReport>,
}

impl QualityMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            latency: LatencyTracker::new(config.ping_timeout, config.sample_window),
            bandwidth: BandwidthTest::new(config.bandwidth_payload_size),
            throughput: ThroughputTest::new(
                config.throughput_packet_count,
                config.throughput_packet_size,
                config.throughput_timeout,
            ),
            ping_interval: config.ping_interval,
            next_ping: None,
            last_loss: None,
        }
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn last_loss(&self) -> Option<LossReport> {
        self.last_loss
    }

    /// Send a ping when one is due and close timed-out throughput runs.
    ///
    /// Each ping after the first also closes the previous interval and
    /// yields its [`LossReport`].
    pub fn poll(&mut self, client: &Client, now: Instant) -> Result<Vec<QualityReport>> {
        let mut reports = Vec::new();

        if let Some(report) = self.throughput.poll_timeout(now) {
            warn!(%report, "Throughput test timed out");
            reports.push(QualityReport::Throughput(report));
        }

        if !client.is_active() {
            self.next_ping = None;
            return Ok(reports);
        }

        if self.next_ping.is_some_and(|at| now < at) {
            return Ok(reports);
        }

        if self.next_ping.is_some() {
            let report = self.latency.finish_interval();
            info!(%report, "Network quality");
            self.last_loss = Some(report);
            reports.push(QualityReport::Loss(report));
        }

        let expired = self.latency.expire(now);
        if expired > 0 {
            debug!(expired, "Pings timed out");
        }
        let ping_id = self.latency.record_sent(now);
        client.request_ping(ping_id)?;
        self.next_ping = Some(now + self.ping_interval);

        Ok(reports)
    }

    /// Feed a client event; returns a report when it completes a test.
    pub fn on_event(&mut self, event: &ClientEvent, now: Instant) -> Option<QualityReport> {
        match event {
            ClientEvent::PingReply(ping_id) => {
                if let Some(rtt) = self.latency.on_reply(*ping_id, now) {
                    debug!(ping_id, rtt_ms = rtt.as_secs_f64() * 1000.0, "Ping reply");
                }
                None
            }
            ClientEvent::BandwidthReply => {
                let report = self.bandwidth.on_reply(now)?;
                info!(%report, "Bandwidth test finished");
                Some(QualityReport::Bandwidth(report))
            }
            ClientEvent::ThroughputReply { packet_id, size } => {
                let report = self.throughput.on_reply(*packet_id, *size, now)?;
                info!(%report, "Throughput test finished");
                Some(QualityReport::Throughput(report))
            }
            ClientEvent::Disconnected | ClientEvent::ConnectionFailed(_) => {
                self.stop();
                None
            }
            _ => None,
        }
    }

    pub fn start_bandwidth_test(&mut self, client: &Client, now: Instant) -> Result<()> {
        if !client.is_active() {
            return Err(ProtocolError::NotConnected);
        }
        let payload = self.bandwidth.start(now);
        info!(bytes = payload.len(), "Starting bandwidth test");
        client.request_bandwidth_test(payload).inspect_err(|_| {
            self.bandwidth.cancel();
        })
    }

    /// Refused while a previous run is still collecting acknowledgements.
    pub fn start_throughput_test(&mut self, client: &Client, now: Instant) -> Result<()> {
        if !client.is_active() {
            return Err(ProtocolError::NotConnected);
        }
        let packets = self.throughput.start(now)?;
        info!(packets = packets.len(), "Starting throughput test");
        for (packet_id, payload) in packets {
            if let Err(e) = client.send_throughput_packet(packet_id, payload) {
                self.throughput.cancel();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Abandon running tests and pause pinging until the next poll.
    pub fn stop(&mut self) {
        self.next_ping = None;
        self.bandwidth.cancel();
        self.throughput.cancel();
    }
}
