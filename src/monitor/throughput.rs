//! Burst of small unreliable packets, measured by acknowledged bytes.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng;

use super::bandwidth::megabits_per_second;
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    pub acknowledged: usize,
    pub total: usize,
    pub packet_size: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub megabits_per_second: f64,
    pub timed_out: bool,
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Throughput: {:.2} Mbps, received {} / {} packets with size {}B",
            self.megabits_per_second, self.acknowledged, self.total, self.packet_size
        )
    }
}

#[derive(Debug)]
struct Run {
    started: Instant,
    acked: BTreeSet<i32>,
    bytes: u64,
}

#[derive(Debug)]
pub struct ThroughputTest {
    packet_count: usize,
    packet_size: usize,
    timeout: Duration,
    run: Option<Run>,
}

impl ThroughputTest {
    pub fn new(packet_count: usize, packet_size: usize, timeout: Duration) -> Self {
        Self {
            packet_count,
            packet_size,
            timeout,
            run: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Start a run and return `(packet_id, payload)` pairs, ids from 1.
    pub fn start(&mut self, now: Instant) -> Result<Vec<(i32, Vec<u8>)>> {
        if self.run.is_some() {
            return Err(ProtocolError::Custom(
                "throughput test already running".into(),
            ));
        }
        let mut rng = rand::rng();
        let packets = (1..=self.packet_count as i32)
            .map(|id| {
                let mut payload = vec![0u8; self.packet_size];
                rng.fill(&mut payload[..]);
                (id, payload)
            })
            .collect();
        self.run = Some(Run {
            started: now,
            acked: BTreeSet::new(),
            bytes: 0,
        });
        Ok(packets)
    }

    pub fn cancel(&mut self) {
        self.run = None;
    }

    /// Count an acknowledgement; completes the run once every packet is in.
    pub fn on_reply(&mut self, packet_id: i32, size: i32, now: Instant) -> Option<ThroughputReport> {
        let run = self.run.as_mut()?;
        if packet_id < 1 || packet_id as usize > self.packet_count {
            return None;
        }
        if run.acked.insert(packet_id) {
            run.bytes += u64::try_from(size).unwrap_or(0);
        }
        if run.acked.len() == self.packet_count {
            return self.finish(now, false);
        }
        None
    }

    /// End the run if it has been going longer than the timeout.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<ThroughputReport> {
        let started = self.run.as_ref()?.started;
        if now.saturating_duration_since(started) < self.timeout {
            return None;
        }
        self.finish(now, true)
    }

    fn finish(&mut self, now: Instant, timed_out: bool) -> Option<ThroughputReport> {
        let run = self.run.take()?;
        let elapsed = now.saturating_duration_since(run.started);
        Some(ThroughputReport {
            acknowledged: run.acked.len(),
            total: self.packet_count,
            packet_size: self.packet_size,
            bytes: run.bytes,
            elapsed,
            megabits_per_second: megabits_per_second(run.bytes, elapsed),
            timed_out,
        })
    }
}
