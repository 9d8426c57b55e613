//! Packet representation handed to the scheduler.
//!
//! The scheduler only needs to know how long a queued item is, so it is generic over
//! [`Datagram`]. [`Packet`] is the concrete type used by the link driver and the binary.

use crate::scheduler::FlowSelector;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static PACKET_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Largest payload the binary generates (standard Ethernet MTU).
pub const MAX_PACKET_SIZE: usize = 1500;

/// Anything the scheduler can queue: it only has to report its wire length in bytes.
pub trait Datagram {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datagram for Bytes {
    fn len(&self) -> usize {
        Bytes::len(self)
    }
}

impl Datagram for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// A classified packet travelling from a producer through the scheduler to the link.
///
/// `selector` is the classification result the producer attached; the scheduler does not look
/// inside the payload. `timestamp` is set on creation so the egress side can measure sojourn time.
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub selector: FlowSelector,
    pub timestamp: Instant,
    payload: Bytes,
}

impl Packet {
    pub fn new(selector: FlowSelector, payload: impl Into<Bytes>) -> Packet {
        Packet {
            id: PACKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            selector,
            timestamp: Instant::now(),
            payload: payload.into(),
        }
    }

    /// Packet of `len` zero bytes, used by traffic generators and tests.
    pub fn zeroed(selector: FlowSelector, len: usize) -> Packet {
        Packet::new(selector, vec![0u8; len])
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Datagram for Packet {
    fn len(&self) -> usize {
        self.payload.len()
    }
}
