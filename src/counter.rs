//! A small helper for turning a monotonically increasing byte counter into a
//! per-second rate, used for the per-peer and aggregate throughput figures
//! exposed to the operator UI (`spec.md` §4.5 "Stats").

use std::time::{Duration, Instant};

/// Tracks a cumulative byte count and derives a bytes/sec rate from the
/// delta observed between two polls, as `spec.md` §4.5 requires
/// ("aggregate download/upload speeds (delta/sec via polling)").
#[derive(Debug)]
pub(crate) struct ThroughputCounter {
    /// Total bytes counted so far.
    total: u64,
    /// The total as it was at the last call to `update`.
    last_total: u64,
    /// The most recently computed rate, in bytes/sec.
    rate: f64,
    /// When `update` was last called.
    last_update: Instant,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self { total: 0, last_total: 0, rate: 0.0, last_update: Instant::now() }
    }

    /// Adds `n` bytes to the running total.
    pub fn add(&mut self, n: u64) {
        self.total += n;
    }

    /// Returns the running total.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Recomputes the rate based on the bytes counted since the last call to
    /// `update`, and the elapsed wall-clock time.
    ///
    /// Should be called periodically (e.g. by the swarm manager's stats
    /// poll); calling it more often than bytes actually arrive just yields a
    /// rate of zero for that interval, which is correct.
    pub fn update(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        if elapsed > Duration::from_millis(0) {
            let delta = self.total.saturating_sub(self.last_total);
            self.rate = delta as f64 / elapsed.as_secs_f64();
            self.last_total = self.total;
            self.last_update = now;
        }
        self.rate
    }

    /// Returns the most recently computed rate without recomputing it.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn rate_is_zero_before_any_bytes() {
        let mut counter = ThroughputCounter::new();
        assert_eq!(counter.update(), 0.0);
    }

    #[test]
    fn rate_reflects_bytes_added_between_updates() {
        let mut counter = ThroughputCounter::new();
        counter.add(1000);
        sleep(Duration::from_millis(20));
        let rate = counter.update();
        assert!(rate > 0.0);
        assert_eq!(counter.total(), 1000);
    }
}
