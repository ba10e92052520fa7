//! One-shot upload bandwidth probe.

use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthReport {
    pub bytes: usize,
    pub elapsed: Duration,
    pub megabits_per_second: f64,
}

impl fmt::Display for BandwidthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bandwidth: {:.2} Mbps", self.megabits_per_second)
    }
}

#[derive(Debug)]
pub struct BandwidthTest {
    payload_size: usize,
    started: Option<Instant>,
}

impl BandwidthTest {
    pub fn new(payload_size: usize) -> Self {
        Self {
            payload_size,
            started: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Start timing and return the random payload to send.
    pub fn start(&mut self, now: Instant) -> Vec<u8> {
        let mut payload = vec![0u8; self.payload_size];
        rand::rng().fill(&mut payload[..]);
        self.started = Some(now);
        payload
    }

    pub fn cancel(&mut self) {
        self.started = None;
    }

    /// Finish the test when the server acknowledges the payload.
    pub fn on_reply(&mut self, now: Instant) -> Option<BandwidthReport> {
        let started = self.started.take()?;
        let elapsed = now.saturating_duration_since(started);
        Some(BandwidthReport {
            bytes: self.payload_size,
            elapsed,
            megabits_per_second: megabits_per_second(self.payload_size as u64, elapsed),
        })
    }
}

/// Rate in Mbit/s; a zero duration reports 0.
pub(crate) fn megabits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_configured_size() {
        let mut test = BandwidthTest::new(512 * 1024);
        let payload = test.start(Instant::now());
        assert_eq!(payload.len(), 512 * 1024);
        assert!(test.is_running());
    }

    #[test]
    fn reply_computes_rate() {
        let start = Instant::now();
        let mut test = BandwidthTest::new(1_000_000);
        test.start(start);

        let report = test.on_reply(start + Duration::from_secs(2)).unwrap();
        assert!((report.megabits_per_second - 4.0).abs() < 1e-9);
        assert!(!test.is_running());
        assert!(test.on_reply(start + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn zero_elapsed_is_zero_rate() {
        assert_eq!(megabits_per_second(1024, Duration::ZERO), 0.0);
    }
}
