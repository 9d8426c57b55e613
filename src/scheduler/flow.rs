//! Flow records.
//!
//! Every slot of the flow table is a [`Flow`]. Slot 0 is the default flow, whose queue fans out
//! into four strict-priority bands; every other slot is a guaranteed flow with a single FIFO.
//! A slot without parameters is unconfigured and rejects traffic.

use std::collections::VecDeque;
use std::time::Duration;

use super::shaper::TokenBucket;
use super::vtime::VirtualTime;
use super::FlowId;
use crate::band::{Band, BandTable};
use crate::config::{FlowParams, Rate, RATE_SHIFT};
use crate::error::CszError;
use crate::packet::Datagram;
use crate::stats::QueueCounters;

/// Number of length cells in a [`ServiceTable`].
pub const SERVICE_TABLE_SLOTS: usize = 256;

/// Largest service increment a single packet may be charged (about 73 minutes of virtual
/// time). Keeps every start and finish number well inside half of the virtual-time circle.
pub const MAX_SERVICE_INCREMENT: u64 = 1 << 42;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Length → virtual service increment lookup for one flow.
///
/// Slot `i` holds the virtual time a packet of `(i + 1) << cell_log` bytes consumes when sent at
/// the flow's guaranteed share of the link. Packets longer than the last cell are charged the
/// last cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTable {
    cell_log: u8,
    slots: Box<[u64]>,
}

impl ServiceTable {
    pub fn new(id: FlowId, rate: Rate, link_rate: u64, cell_log: u8) -> Result<Self, CszError> {
        if rate.raw() == 0 {
            return Err(CszError::ZeroRate(id.get()));
        }
        if link_rate == 0 {
            return Err(CszError::ZeroLinkRate);
        }
        let divisor = link_rate as u128 * rate.raw() as u128;
        let slots = (0..SERVICE_TABLE_SLOTS)
            .map(|slot| {
                let cell_bytes = ((slot as u128) + 1) << cell_log;
                let increment = ((cell_bytes * NANOS_PER_SEC) << RATE_SHIFT) / divisor;
                if increment > MAX_SERVICE_INCREMENT as u128 {
                    Err(CszError::ServiceTimeOverflow(id.get()))
                } else {
                    Ok((increment as u64).max(1))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            cell_log,
            slots: slots.into_boxed_slice(),
        })
    }

    /// Virtual time consumed by a packet of `len` bytes.
    pub fn increment(&self, len: usize) -> u64 {
        let slot = (len >> self.cell_log).min(SERVICE_TABLE_SLOTS - 1);
        self.slots[slot]
    }
}

/// Parameters plus the lookup table derived from them.
#[derive(Debug, Clone)]
pub struct FlowSetup {
    pub params: FlowParams,
    pub table: ServiceTable,
}

/// Queue shape of a flow slot.
#[derive(Debug)]
pub enum FlowKind<P> {
    Guaranteed(VecDeque<P>),
    Default {
        bands: BandTable<VecDeque<P>>,
        band_counters: BandTable<QueueCounters>,
        /// Increment charged speculatively for the packet peeked after the last dequeue,
        /// 0 when nothing was charged.
        peeked: u64,
    },
}

/// One slot of the flow table.
#[derive(Debug)]
pub struct Flow<P> {
    id: FlowId,
    setup: Option<FlowSetup>,
    /// Finish number of the head packet.
    pub(crate) start: VirtualTime,
    /// Finish number of the last queued packet.
    pub(crate) finish: VirtualTime,
    backlog_packets: usize,
    backlog_bytes: usize,
    kind: FlowKind<P>,
    shaper: Option<TokenBucket>,
    pub(crate) counters: QueueCounters,
    pub(crate) throttles: u64,
}

impl<P: Datagram> Flow<P> {
    pub fn new(id: FlowId) -> Self {
        let kind = if id.is_default() {
            FlowKind::Default {
                bands: BandTable::from_fn(|_| VecDeque::new()),
                band_counters: BandTable::default(),
                peeked: 0,
            }
        } else {
            FlowKind::Guaranteed(VecDeque::new())
        };
        Self {
            id,
            setup: None,
            start: VirtualTime::ZERO,
            finish: VirtualTime::ZERO,
            backlog_packets: 0,
            backlog_bytes: 0,
            kind,
            shaper: None,
            counters: QueueCounters::default(),
            throttles: 0,
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Install parameters. The shaper restarts full; queued packets and virtual times stay.
    pub fn configure(&mut self, setup: FlowSetup, now: Duration) {
        self.shaper = setup
            .params
            .shaper
            .map(|config| TokenBucket::new(config, now));
        self.setup = Some(setup);
    }

    pub fn unconfigure(&mut self) {
        self.setup = None;
        self.shaper = None;
    }

    pub fn is_configured(&self) -> bool {
        self.setup.is_some()
    }

    pub fn params(&self) -> Option<&FlowParams> {
        self.setup.as_ref().map(|setup| &setup.params)
    }

    /// Raw guaranteed rate, 0 when unconfigured.
    pub fn rate(&self) -> u64 {
        self.setup
            .as_ref()
            .map_or(0, |setup| setup.params.rate.raw() as u64)
    }

    /// Whether the flow has room for another packet.
    pub fn admits(&self) -> bool {
        self.setup
            .as_ref()
            .is_some_and(|setup| self.backlog_bytes < setup.params.max_queue_bytes)
    }

    /// Service increment for a packet of `len` bytes; 1 when unconfigured.
    pub fn increment(&self, len: usize) -> u64 {
        self.setup
            .as_ref()
            .map_or(1, |setup| setup.table.increment(len))
    }

    pub fn backlog_packets(&self) -> usize {
        self.backlog_packets
    }

    pub fn backlog_bytes(&self) -> usize {
        self.backlog_bytes
    }

    pub fn is_backlogged(&self) -> bool {
        self.backlog_packets > 0
    }

    /// Append a packet. `band` is only consulted by the default flow.
    pub fn push(&mut self, item: P, band: Band) {
        let len = item.len();
        match &mut self.kind {
            FlowKind::Guaranteed(queue) => queue.push_back(item),
            FlowKind::Default {
                bands,
                band_counters,
                ..
            } => {
                bands[band].push_back(item);
                band_counters[band].record_enqueue(len);
            }
        }
        self.backlog_packets += 1;
        self.backlog_bytes += len;
        self.counters.record_enqueue(len);
    }

    /// Remove the next packet: the FIFO head, or the head of the highest-priority non-empty
    /// band for the default flow.
    pub fn pop(&mut self) -> Option<P> {
        let item = match &mut self.kind {
            FlowKind::Guaranteed(queue) => queue.pop_front(),
            FlowKind::Default {
                bands,
                band_counters,
                ..
            } => Band::ALL.into_iter().find_map(|band| {
                let item = bands[band].pop_front()?;
                band_counters[band].record_send(item.len());
                Some(item)
            }),
        }?;
        let len = item.len();
        self.backlog_packets -= 1;
        self.backlog_bytes -= len;
        self.counters.record_send(len);
        Some(item)
    }

    /// Length of the packet [`Flow::pop`] would return.
    pub fn peek_len(&self) -> Option<usize> {
        match &self.kind {
            FlowKind::Guaranteed(queue) => queue.front().map(Datagram::len),
            FlowKind::Default { bands, .. } => Band::ALL
                .into_iter()
                .find_map(|band| bands[band].front().map(Datagram::len)),
        }
    }

    /// Take the speculative charge recorded for the default flow, leaving 0 behind.
    pub fn take_peeked(&mut self) -> u64 {
        match &mut self.kind {
            FlowKind::Default { peeked, .. } => std::mem::take(peeked),
            FlowKind::Guaranteed(_) => 0,
        }
    }

    pub fn set_peeked(&mut self, value: u64) {
        if let FlowKind::Default { peeked, .. } = &mut self.kind {
            *peeked = value;
        }
    }

    pub fn shaper_mut(&mut self) -> Option<&mut TokenBucket> {
        self.shaper.as_mut()
    }

    /// Count an admission reject against this flow (and band, for the default flow).
    pub fn record_drop(&mut self, band: Band) {
        self.counters.record_drop();
        if let FlowKind::Default { band_counters, .. } = &mut self.kind {
            band_counters[band].record_drop();
        }
    }

    /// Drop every queued packet and zero the virtual times; returns how many were dropped.
    pub fn purge(&mut self, now: Duration) -> usize {
        let purged = self.backlog_packets;
        match &mut self.kind {
            FlowKind::Guaranteed(queue) => queue.clear(),
            FlowKind::Default {
                bands,
                band_counters,
                peeked,
            } => {
                for band in Band::ALL {
                    band_counters[band].record_purge(bands[band].len());
                    bands[band].clear();
                }
                *peeked = 0;
            }
        }
        self.counters.record_purge(purged);
        self.backlog_packets = 0;
        self.backlog_bytes = 0;
        self.start = VirtualTime::ZERO;
        self.finish = VirtualTime::ZERO;
        if let Some(shaper) = self.shaper.as_mut() {
            shaper.reset(now);
        }
        purged
    }

    /// Per-band backlog and counters; `None` for guaranteed flows.
    pub fn band_view(&self) -> Option<BandTable<(usize, QueueCounters)>> {
        match &self.kind {
            FlowKind::Default {
                bands,
                band_counters,
                ..
            } => Some(BandTable::from_fn(|band| {
                (bands[band].len(), band_counters[band])
            })),
            FlowKind::Guaranteed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(id: FlowId, rate: Rate, limit: usize) -> FlowSetup {
        FlowSetup {
            params: FlowParams::new(rate, limit),
            table: ServiceTable::new(id, rate, 1_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn service_table_scales_inversely_with_rate() {
        let id = FlowId::new(1).unwrap();
        let quarter = ServiceTable::new(id, Rate::from_ratio(1, 4), 1_000_000, 0).unwrap();
        let half = ServiceTable::new(id, Rate::from_ratio(1, 2), 1_000_000, 0).unwrap();
        // 100 bytes sit in cell 100, which covers 101 bytes: 101 us at full rate.
        assert_eq!(quarter.increment(100), 404_000);
        assert_eq!(half.increment(100), 202_000);
        // Past the last cell the last cell is charged.
        assert_eq!(half.increment(10_000), half.increment(255));
    }

    #[test]
    fn service_table_quantizes_by_cell() {
        let id = FlowId::new(1).unwrap();
        let table = ServiceTable::new(id, Rate::ONE, 1_000_000, 3).unwrap();
        assert_eq!(table.increment(0), table.increment(7));
        assert_eq!(table.increment(8), table.increment(15));
        assert!(table.increment(8) > table.increment(7));
    }

    #[test]
    fn service_table_rejects_tiny_rates() {
        let id = FlowId::new(2).unwrap();
        let err = ServiceTable::new(id, Rate::from_raw(1), 1, 10).unwrap_err();
        assert!(matches!(err, CszError::ServiceTimeOverflow(2)));
    }

    #[test]
    fn default_flow_pops_highest_band_first() {
        let mut flow: Flow<Vec<u8>> = Flow::new(FlowId::new(0).unwrap());
        flow.configure(setup(flow.id(), Rate::ONE, 10_000), Duration::ZERO);
        flow.push(vec![0; 30], Band::BestEffortLow);
        flow.push(vec![0; 20], Band::BestEffortHigh);
        flow.push(vec![0; 10], Band::Predicted);
        assert_eq!(flow.backlog_bytes(), 60);
        assert_eq!(flow.peek_len(), Some(10));
        assert_eq!(flow.pop().map(|p| p.len()), Some(10));
        assert_eq!(flow.pop().map(|p| p.len()), Some(20));
        assert_eq!(flow.pop().map(|p| p.len()), Some(30));
        assert_eq!(flow.pop(), None);
        let bands = flow.band_view().unwrap();
        assert_eq!(bands[Band::BestEffortLow].1.sent_packets, 1);
    }

    #[test]
    fn admission_follows_byte_limit() {
        let id = FlowId::new(3).unwrap();
        let mut flow: Flow<Vec<u8>> = Flow::new(id);
        assert!(!flow.admits());
        flow.configure(setup(id, Rate::ONE, 100), Duration::ZERO);
        assert!(flow.admits());
        flow.push(vec![0; 100], Band::Predicted);
        assert!(!flow.admits());
        assert_eq!(flow.purge(Duration::ZERO), 1);
        assert!(flow.admits());
        assert_eq!(flow.counters.purged, 1);
    }

    #[test]
    fn unconfigure_forgets_rate_and_table() {
        let id = FlowId::new(1).unwrap();
        let mut flow: Flow<Vec<u8>> = Flow::new(id);
        flow.configure(setup(id, Rate::from_ratio(1, 4), 10_000), Duration::ZERO);
        assert_eq!(flow.increment(100), 404_000);
        assert_eq!(flow.rate(), 16_384);
        flow.unconfigure();
        assert!(!flow.is_configured());
        assert_eq!(flow.increment(100), 1);
        assert_eq!(flow.rate(), 0);
        assert!(!flow.admits());
    }
}
