//! Optional per-flow token-bucket shaping.
//!
//! A shaped flow may only be served while its bucket covers the head packet. When it does not,
//! the scheduler parks the flow (taking it out of the start index with its start number kept)
//! and records the moment its bucket will cover the packet. Parked flows rejoin the start index
//! on the first dequeue at or after that moment; the soonest such moment is what the scheduler
//! reports as its wakeup time.

use std::time::Duration;

use super::FlowId;
use crate::clock::duration_nanos;
use crate::config::ShaperConfig;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Token bucket measured in bytes, refilled continuously.
///
/// Tokens are held as byte-nanoseconds so refills never lose fractions of a byte.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Refill rate in bytes per second.
    rate: u64,
    /// Capacity in byte-nanoseconds.
    depth: u128,
    /// Current level in byte-nanoseconds.
    level: u128,
    last_refill: Duration,
}

impl TokenBucket {
    /// Full bucket as of `now`.
    pub fn new(config: ShaperConfig, now: Duration) -> Self {
        let depth = config.burst as u128 * NANOS_PER_SEC;
        Self {
            rate: config.rate,
            depth,
            level: depth,
            last_refill: now,
        }
    }

    pub fn refill(&mut self, now: Duration) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = duration_nanos(now - self.last_refill) as u128;
        self.level = (self.level + elapsed * self.rate as u128).min(self.depth);
        self.last_refill = now;
    }

    /// Tokens a packet of `len` bytes needs. A packet larger than the bucket only needs a full
    /// bucket, otherwise it could never be sent.
    fn required(&self, len: usize) -> u128 {
        (len as u128 * NANOS_PER_SEC).min(self.depth)
    }

    /// Whole bytes currently available.
    pub fn tokens(&self) -> u64 {
        (self.level / NANOS_PER_SEC) as u64
    }

    pub fn covers(&self, len: usize) -> bool {
        self.level >= self.required(len)
    }

    /// Take the tokens for a packet of `len` bytes.
    pub fn consume(&mut self, len: usize) {
        self.level = self.level.saturating_sub(len as u128 * NANOS_PER_SEC);
    }

    /// Earliest time the bucket covers `len` bytes, given the state at the last refill.
    pub fn ready_at(&self, len: usize) -> Duration {
        let missing = self.required(len).saturating_sub(self.level);
        if missing == 0 {
            return self.last_refill;
        }
        let rate = self.rate.max(1) as u128;
        let wait = missing.div_ceil(rate);
        self.last_refill + Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
    }

    /// Refill to capacity and restart accounting at `now`.
    pub fn reset(&mut self, now: Duration) {
        self.level = self.depth;
        self.last_refill = now;
    }
}

/// Flows waiting for their buckets, with their release times.
#[derive(Debug, Clone, Default)]
pub struct ThrottleList {
    parked: Vec<(FlowId, Duration)>,
}

impl ThrottleList {
    pub fn park(&mut self, flow: FlowId, until: Duration) {
        debug_assert!(!self.contains(flow), "flow {flow} parked twice");
        self.parked.push((flow, until));
    }

    /// Remove and return the flows due at `now`, in the order they were parked.
    pub fn release_due(&mut self, now: Duration) -> Vec<FlowId> {
        let mut due = Vec::new();
        self.parked.retain(|&(flow, until)| {
            if until <= now {
                due.push(flow);
                false
            } else {
                true
            }
        });
        due
    }

    pub fn remove(&mut self, flow: FlowId) -> bool {
        let before = self.parked.len();
        self.parked.retain(|&(parked, _)| parked != flow);
        before != self.parked.len()
    }

    pub fn contains(&self, flow: FlowId) -> bool {
        self.parked.iter().any(|&(parked, _)| parked == flow)
    }

    /// Soonest release time.
    pub fn next_wakeup(&self) -> Option<Duration> {
        self.parked.iter().map(|&(_, until)| until).min()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    pub fn clear(&mut self) {
        self.parked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(rate: u64, burst: u64) -> TokenBucket {
        TokenBucket::new(ShaperConfig { rate, burst }, Duration::ZERO)
    }

    #[test]
    fn starts_full_and_caps_refill() {
        let mut b = bucket(1000, 1500);
        assert_eq!(b.tokens(), 1500);
        b.refill(Duration::from_secs(10));
        assert_eq!(b.tokens(), 1500);
    }

    #[test]
    fn consume_and_wait_for_refill() {
        let mut b = bucket(1000, 1500);
        b.consume(1500);
        assert_eq!(b.tokens(), 0);
        assert!(!b.covers(500));
        // 500 bytes at 1000 B/s take half a second.
        assert_eq!(b.ready_at(500), Duration::from_millis(500));
        b.refill(Duration::from_millis(250));
        assert_eq!(b.tokens(), 250);
        assert!(!b.covers(500));
        b.refill(Duration::from_millis(500));
        assert!(b.covers(500));
    }

    #[test]
    fn oversized_packet_needs_only_a_full_bucket() {
        let mut b = bucket(1000, 100);
        assert!(b.covers(1500));
        b.consume(1500);
        assert_eq!(b.tokens(), 0);
        assert_eq!(b.ready_at(1500), Duration::from_millis(100));
    }

    #[test]
    fn throttle_list_releases_due_flows() {
        let a = FlowId::new(1).unwrap();
        let c = FlowId::new(3).unwrap();
        let mut list = ThrottleList::default();
        list.park(a, Duration::from_millis(5));
        list.park(c, Duration::from_millis(2));
        assert_eq!(list.next_wakeup(), Some(Duration::from_millis(2)));
        assert_eq!(list.release_due(Duration::from_millis(3)), vec![c]);
        assert!(list.contains(a));
        assert!(list.remove(a));
        assert!(list.is_empty());
        assert_eq!(list.next_wakeup(), None);
    }
}
