//! Quench computation (§4.3, §4.6 step 5, §8 boundary).
//!
//! The manager recomputes this once per pass and hands it to the
//! server-connection broker as `server::Quench`. Quench activates exactly
//! when the inbound backlog reaches `queue_quench_max` and stays active
//! (`Forever`) until the backlog drops back below it; below that
//! threshold, a multiplicative per-batch deadline smooths sustained bursts
//! without a hard stop. Per the Open Question in §9, the batch window is
//! not reset by an idle gap — only by actually reaching its deadline.

use std::time::{Duration, Instant};

use crate::server::broker::Quench as BrokerQuench;

#[derive(Debug, Clone)]
pub struct QuenchTracker {
    queue_quench_max: usize,
    quench_batch: usize,
    process_rate: Duration,
    batch_start: Option<Instant>,
    batch_ingested: usize,
}

impl QuenchTracker {
    pub fn new(queue_quench_max: usize, quench_batch: usize, process_rate: Duration) -> Self {
        Self { queue_quench_max, quench_batch, process_rate, batch_start: None, batch_ingested: 0 }
    }

    /// Call once per ingested inbound event, before `compute`.
    pub fn note_ingested(&mut self, now: Instant) {
        if self.batch_start.is_none() {
            self.batch_start = Some(now);
        }
        self.batch_ingested += 1;
        if self.batch_ingested >= self.quench_batch {
            // Batch deadline is fixed relative to when *this* batch
            // started; reaching it is what starts the next batch, an idle
            // gap in between does not.
        }
    }

    /// Recomputes the directive to send the broker this pass, given the
    /// current total inbound backlog across all workspaces.
    pub fn compute(&mut self, inbound_queue_len: usize, now: Instant) -> BrokerQuench {
        if inbound_queue_len >= self.queue_quench_max {
            return BrokerQuench::Forever;
        }

        match self.batch_start {
            Some(start) if self.batch_ingested > 0 => {
                let deadline = start + self.batch_ingested as u32 * self.process_rate;
                if now >= deadline {
                    self.batch_start = None;
                    self.batch_ingested = 0;
                    BrokerQuench::None
                } else {
                    BrokerQuench::Deadline(deadline)
                }
            }
            _ => BrokerQuench::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_with_no_batch_is_unquenched() {
        let mut t = QuenchTracker::new(50, 100, Duration::from_millis(5));
        assert_eq!(t.compute(0, Instant::now()), BrokerQuench::None);
    }

    #[test]
    fn reaching_queue_quench_max_is_forever() {
        let mut t = QuenchTracker::new(50, 100, Duration::from_millis(5));
        assert_eq!(t.compute(50, Instant::now()), BrokerQuench::Forever);
        assert_eq!(t.compute(51, Instant::now()), BrokerQuench::Forever);
    }

    #[test]
    fn below_max_with_active_batch_yields_a_deadline() {
        let mut t = QuenchTracker::new(50, 4, Duration::from_millis(5));
        let t0 = Instant::now();
        for _ in 0..4 {
            t.note_ingested(t0);
        }
        match t.compute(10, t0) {
            BrokerQuench::Deadline(d) => assert_eq!(d, t0 + Duration::from_millis(20)),
            other => panic!("expected a deadline, got {other:?}"),
        }
    }

    #[test]
    fn deadline_reached_resets_batch_without_needing_idle() {
        let mut t = QuenchTracker::new(50, 4, Duration::from_millis(5));
        let t0 = Instant::now();
        for _ in 0..4 {
            t.note_ingested(t0);
        }
        let after = t0 + Duration::from_millis(25);
        assert_eq!(t.compute(10, after), BrokerQuench::None);
    }
}
