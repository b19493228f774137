//! Rate-limit accountant (C9): global + per-link token buckets
//! (`spec.md` §4.7). Cyclone's own `security::RateLimiter` is a
//! sliding-window request counter, a different shape than the refill-once-
//! per-second octet bucket the spec calls for, so this module is a fresh
//! design rather than an adaptation — grounded in the accounting rules
//! `spec.md` §4.7 and §8 scenario 4 spell out exactly.

use crate::conn::{ConnKind, Connection, ConnState, OrState};

/// Process-wide read allowance, refilled once per second up to `cap`.
#[derive(Debug)]
pub struct GlobalBucket {
    level: u64,
    cap: u64,
}

impl GlobalBucket {
    pub fn new(cap: u64) -> Self {
        Self { level: cap, cap }
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    /// Octets available to hand out this call, never more than `level`.
    pub fn available(&self, want: u64) -> u64 {
        want.min(self.level)
    }

    /// Decrement after a successful read of `n` octets. Never underflows
    /// (invariant 2/7: `global_read_bucket` stays non-negative).
    pub fn consume(&mut self, n: u64) {
        self.level = self.level.saturating_sub(n);
    }

    /// Once-per-second refill, capped at the configured maximum.
    pub fn refill(&mut self) {
        self.level = self.cap;
    }
}

/// Per-OR-link receiver bucket, bounded to `[0, 10*bandwidth]`
/// (invariant 3).
#[derive(Debug, Clone, Copy)]
pub struct ReceiverBucket;

impl ReceiverBucket {
    pub fn clamp(level: i64, bandwidth: u32) -> i64 {
        level.clamp(0, 10 * bandwidth as i64)
    }
}

/// True iff this connection is an OR link eligible for a bandwidth-tick
/// credit: open, rate-limited, and below 9x its bandwidth
/// (`spec.md` §4.7 `receiver_bucket_should_increase`).
pub fn receiver_bucket_should_increase(conn: &Connection) -> bool {
    conn.kind == ConnKind::Or
        && conn.state == ConnState::Or(OrState::Open)
        && conn.bandwidth > 0
        && conn.receiver_bucket < 9 * conn.bandwidth as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn global_bucket_never_negative_under_consume_then_refill() {
        let mut bucket = GlobalBucket::new(100);
        bucket.consume(150);
        assert_eq!(bucket.level(), 0);
        bucket.refill();
        assert_eq!(bucket.level(), 100);
    }

    #[test]
    fn available_never_exceeds_current_level() {
        let bucket = GlobalBucket::new(50);
        assert_eq!(bucket.available(200), 50);
        assert_eq!(bucket.available(10), 10);
    }

    proptest! {
        #[test]
        fn receiver_bucket_stays_within_bounds(
            bandwidth in 1u32..10_000,
            deltas in proptest::collection::vec(-20_000i64..20_000, 0..200),
        ) {
            let mut level: i64 = 0;
            for d in deltas {
                level = ReceiverBucket::clamp(level + d, bandwidth);
                prop_assert!(level >= 0);
                prop_assert!(level <= 10 * bandwidth as i64);
            }
        }
    }
}
