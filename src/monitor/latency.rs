//! Round-trip time, jitter and loss from periodic pings.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Loss and latency over one ping interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossReport {
    pub sent: u32,
    pub received: u32,
    pub loss_percent: f64,
    pub average_rtt_ms: f64,
    pub jitter_ms: f64,
}

impl fmt::Display for LossReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet loss: {:.2}% | Avg RTT: {:.2} ms | Jitter: {:.2} ms",
            self.loss_percent, self.average_rtt_ms, self.jitter_ms
        )
    }
}

#[derive(Debug)]
pub struct LatencyTracker {
    next_id: i32,
    pending: BTreeMap<i32, Instant>,
    samples: VecDeque<Duration>,
    window: usize,
    timeout: Duration,
    sent_interval: u32,
    received_interval: u32,
}

impl LatencyTracker {
    pub fn new(timeout: Duration, window: usize) -> Self {
        Self {
            next_id: 0,
            pending: BTreeMap::new(),
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
            timeout,
            sent_interval: 0,
            received_interval: 0,
        }
    }

    /// Register a ping sent at `now` and return its id.
    pub fn record_sent(&mut self, now: Instant) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.insert(id, now);
        self.sent_interval += 1;
        id
    }

    /// Match a reply; unknown or expired ids yield `None`.
    pub fn on_reply(&mut self, id: i32, now: Instant) -> Option<Duration> {
        let sent_at = self.pending.remove(&id)?;
        let rtt = now.saturating_duration_since(sent_at);
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        self.received_interval += 1;
        Some(rtt)
    }

    /// Forget pings older than the timeout. They stay counted as sent.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let timeout = self.timeout;
        self.pending
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) <= timeout);
        before - self.pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn samples(&self) -> impl Iterator<Item = Duration> + '_ {
        self.samples.iter().copied()
    }

    pub fn average_rtt(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    /// Mean absolute difference between consecutive samples.
    pub fn jitter(&self) -> Duration {
        if self.samples.len() < 2 {
            return Duration::ZERO;
        }
        let total: Duration = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| if a > b { *a - *b } else { *b - *a })
            .sum();
        total / (self.samples.len() - 1) as u32
    }

    /// Close the current interval and reset its counters.
    pub fn finish_interval(&mut self) -> LossReport {
        let sent = self.sent_interval;
        let received = self.received_interval;
        let loss_percent = if sent > 0 {
            f64::from(sent.saturating_sub(received)) / f64::from(sent) * 100.0
        } else {
            0.0
        };
        self.sent_interval = 0;
        self.received_interval = 0;

        LossReport {
            sent,
            received,
            loss_percent,
            average_rtt_ms: self.average_rtt().as_secs_f64() * 1000.0,
            jitter_ms: self.jitter().as_secs_f64() * 1000.0,
        }
    }
}
