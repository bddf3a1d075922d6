//! Monotone freshness clock (§3).
//!
//! Stamps outbound events with a 64-bit millisecond counter that only ever
//! advances, even if the wall clock jumps backward (NTP correction, user
//! changing the clock) or forward by an implausible amount (suspend/resume).
//! External clients use this to detect staleness independently of
//! wall-clock time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum single-update delta accepted from the wall clock.
const MAX_DELTA: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct FreshnessClock {
    last_ms: u64,
    last_wall_ms: u64,
}

impl FreshnessClock {
    pub fn new() -> Self {
        let wall = wall_clock_ms();
        Self { last_ms: wall, last_wall_ms: wall }
    }

    /// Advance the clock using the current wall-clock reading and return the
    /// new value. Strictly non-decreasing (I-7 in §8).
    pub fn update(&mut self) -> u64 {
        self.update_with_wall(wall_clock_ms())
    }

    fn update_with_wall(&mut self, wall_ms: u64) -> u64 {
        // saturating_sub clamps a backward jump to 0, so the clock never
        // regresses even if the wall clock does.
        let raw_delta = wall_ms.saturating_sub(self.last_wall_ms);
        let clamped_delta = raw_delta.min(MAX_DELTA.as_millis() as u64);
        self.last_wall_ms = wall_ms;
        self.last_ms += clamped_delta;
        self.last_ms
    }

    pub fn current(&self) -> u64 {
        self.last_ms
    }
}

impl Default for FreshnessClock {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_under_forward_jumps() {
        let mut clock = FreshnessClock::new();
        let a = clock.update_with_wall(1_000);
        let b = clock.update_with_wall(50_000);
        assert!(b >= a);
    }

    #[test]
    fn monotone_under_backward_jumps() {
        let mut clock = FreshnessClock::new();
        let a = clock.update_with_wall(100_000);
        let b = clock.update_with_wall(1_000); // clock stepped backward
        assert!(b >= a, "freshness must never regress: {a} -> {b}");
    }

    #[test]
    fn clamps_implausible_forward_jump() {
        let mut clock = FreshnessClock::new();
        let a = clock.update_with_wall(0);
        let huge = 1_000 * 24 * 60 * 60 * 1000; // 1000 days forward
        let b = clock.update_with_wall(huge);
        assert!(b - a <= MAX_DELTA.as_millis() as u64);
    }

    #[test]
    fn successive_updates_non_decreasing() {
        let mut clock = FreshnessClock::new();
        let mut prev = clock.update();
        for _ in 0..5 {
            let next = clock.update();
            assert!(next >= prev);
            prev = next;
        }
    }
}
