//! Clark-Shenker-Zhang (CSZ) fair-queueing scheduler.
//!
//! Each configured flow is guaranteed a share of the link. The scheduler emulates an idealised
//! fluid server that serves every active flow simultaneously in proportion to its share, and
//! sends packets in the order that server would finish them.
//!
//! Algorithm:
//! 1. The round number is the fluid server's virtual clock. Between two updates it advances by
//!    the elapsed wall-clock time divided by the sum of the shares of the active flows, so it
//!    runs faster when fewer flows compete.
//! 2. On enqueue, a packet of length `L` on a flow with share `r` consumes `L / (B * r)` virtual
//!    time (`B` = link bandwidth). An active flow extends its finish number by that amount; an
//!    idle flow restarts from the current round number and becomes active.
//! 3. A flow's start number is the finish number of its head packet. Dequeue always serves the
//!    flow with the smallest start number and then advances that flow's start number by the
//!    service of its next packet.
//! 4. A flow stays active until the round number reaches its finish number. The finish index
//!    finds those flows in order, and retiring one removes its share from the aggregate.
//!
//! Slot 0 is the default flow. It is scheduled against the guaranteed flows like any other
//! flow, but inside it packets leave by strict band priority, so the start number is charged
//! speculatively for the packet expected next and corrected once the actual packet is known.

use std::fmt;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::flow::{Flow, FlowSetup, ServiceTable};
use super::index::OrderedIndex;
use super::shaper::ThrottleList;
use super::vtime::VirtualTime;
use super::{DropReason, FlowId, FlowSelector, Qdisc, Verdict, DEFAULT_FLOW, MAX_FLOWS};
use crate::band::Band;
use crate::clock::{duration_nanos, Clock};
use crate::config::{validate_params, CszConfig, FlowParams, RATE_SHIFT};
use crate::error::CszError;
use crate::packet::{Datagram, Packet};
use crate::stats::{BandStats, CszStats, FlowStats};

/// Cap on a single round-number advance; keeps the result inside half the virtual-time circle
/// even for absurd `max_delay` settings.
const MAX_ADVANCE: u64 = 1 << 62;

/// Scheduling state of one flow slot, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub id: FlowId,
    pub configured: bool,
    pub start: VirtualTime,
    pub finish: VirtualTime,
    /// Counted in the aggregate rate until the round number reaches its finish number.
    pub active: bool,
    pub in_start_index: bool,
    pub in_finish_index: bool,
    /// Held back by its token bucket.
    pub throttled: bool,
    pub backlog_packets: usize,
    pub backlog_bytes: usize,
}

/// CSZ scheduler over items of type `P`.
///
/// All entry points take `&mut self`; the caller provides exclusive access.
pub struct CszScheduler<P = Packet> {
    /// Flow table; slot 0 is the default flow.
    flows: Vec<Flow<P>>,
    cell_log: u8,
    /// Link bandwidth in bytes per second.
    link_rate: u64,
    /// Longest accountable gap between updates, in nanoseconds.
    max_delay: u64,
    clock: Box<dyn Clock>,
    /// Round number as of the last update.
    round: VirtualTime,
    /// Wall-clock time of the last update.
    checkpoint_time: Duration,
    /// Round number the next update advances from.
    checkpoint_round: VirtualTime,
    /// Sum of the raw rates of the flows in `finish_index`.
    aggregate_rate: u64,
    /// Backlogged flows that are not throttled, by start number.
    start_index: OrderedIndex,
    /// Active flows, by finish number.
    finish_index: OrderedIndex,
    throttled: ThrottleList,
    /// Total queued packets across all flows and bands.
    len: usize,
    /// Rejects of packets naming no flow slot of this table.
    unclassified_drops: u64,
    clock_faults: u64,
}

impl<P: Datagram> CszScheduler<P> {
    /// Build a scheduler from `config`, reading time from `clock`.
    ///
    /// Every flow slot is allocated here and lives as long as the scheduler; both indices start
    /// empty and the round number starts at zero.
    pub fn new(config: CszConfig, clock: impl Clock + 'static) -> Result<Self, CszError> {
        config.validate()?;
        let now = clock.now();

        let mut flows: Vec<Flow<P>> = (0..config.flows)
            .map(|slot| Flow::new(FlowId(slot as u8)))
            .collect();

        let configured = config
            .default_flow
            .iter()
            .map(|params| (DEFAULT_FLOW, params))
            .chain(config.guaranteed.iter().map(|flow| (FlowId(flow.id), &flow.params)));
        for (id, params) in configured {
            let table = ServiceTable::new(id, params.rate, config.link_rate, config.cell_log)?;
            flows[id.index()].configure(
                FlowSetup {
                    params: params.clone(),
                    table,
                },
                now,
            );
        }

        debug!(
            flows = config.flows,
            cell_log = config.cell_log,
            link_rate = config.link_rate,
            "csz scheduler initialized"
        );

        Ok(Self {
            flows,
            cell_log: config.cell_log,
            link_rate: config.link_rate,
            max_delay: duration_nanos(config.max_delay),
            clock: Box::new(clock),
            round: VirtualTime::ZERO,
            checkpoint_time: now,
            checkpoint_round: VirtualTime::ZERO,
            aggregate_rate: 0,
            start_index: OrderedIndex::with_capacity(MAX_FLOWS),
            finish_index: OrderedIndex::with_capacity(MAX_FLOWS),
            throttled: ThrottleList::default(),
            len: 0,
            unclassified_drops: 0,
            clock_faults: 0,
        })
    }

    /// Bring the round number up to date and return it.
    ///
    /// Flows whose finish number the round number reaches are retired on the way: each one
    /// leaves the finish index, its rate leaves the aggregate, and the rest of the elapsed time
    /// is accounted at the now higher per-flow speed. While no flow is active the round number
    /// stays put.
    ///
    /// A gap longer than `max_delay` (or a clock that went backwards) cannot be accounted
    /// reliably; the scheduler then resets itself, dropping every queued packet.
    pub fn advance_round(&mut self) -> VirtualTime {
        let now = self.clock.now();

        // ========================================================================
        // STEP 1: Measure the gap since the last checkpoint
        // ========================================================================
        let mut remaining = match now.checked_sub(self.checkpoint_time) {
            Some(elapsed) if duration_nanos(elapsed) <= self.max_delay => duration_nanos(elapsed),
            _ => {
                self.clock_faults += 1;
                warn!(
                    now_ns = duration_nanos(now),
                    checkpoint_ns = duration_nanos(self.checkpoint_time),
                    max_delay_ns = self.max_delay,
                    backlog = self.len,
                    "clock fault, resetting scheduler"
                );
                self.reset_at(now);
                return self.round;
            }
        };
        self.checkpoint_time = now;

        loop {
            // ====================================================================
            // STEP 2: Idle server, the round number is frozen
            // ====================================================================
            let Some((id, finish)) = self.finish_index.first() else {
                debug_assert_eq!(self.aggregate_rate, 0, "idle scheduler with a rate");
                self.aggregate_rate = 0;
                self.round = self.checkpoint_round;
                return self.round;
            };

            // ====================================================================
            // STEP 3: Advance up to the earliest finish number
            // ====================================================================
            debug_assert!(self.aggregate_rate > 0, "active flows with a zero rate");
            let aggregate = self.aggregate_rate.max(1) as u128;
            let advance = ((remaining as u128) << RATE_SHIFT) / aggregate;
            let advance = u64::try_from(advance).unwrap_or(MAX_ADVANCE).min(MAX_ADVANCE);
            let candidate = self.checkpoint_round.wrapping_add(advance);

            if finish.is_ahead_of(candidate) {
                self.round = candidate;
                self.checkpoint_round = candidate;
                return candidate;
            }

            // ====================================================================
            // STEP 4: Retire the flow and account the time spent reaching it
            // ====================================================================
            self.finish_index.pop_first();
            let flow = &self.flows[id.index()];
            let to_finish = finish.since(self.checkpoint_round).max(0) as u128;
            let consumed = (to_finish * aggregate) >> RATE_SHIFT;
            remaining = remaining.saturating_sub(u64::try_from(consumed).unwrap_or(u64::MAX));
            self.aggregate_rate = self.aggregate_rate.saturating_sub(flow.rate());
            if finish.is_ahead_of(self.checkpoint_round) {
                self.checkpoint_round = finish;
            }
            debug!(
                flow = %id,
                finish = %finish,
                aggregate_rate = self.aggregate_rate,
                backlog = flow.backlog_packets(),
                "flow retired"
            );
        }
    }

    /// Admit `item` to the flow named by `selector`.
    ///
    /// Rejects leave every piece of scheduling state untouched, the round number included.
    pub fn enqueue(&mut self, item: P, selector: FlowSelector) -> Verdict {
        let (id, band) = match selector {
            FlowSelector::Guaranteed(id) if id.is_default() => {
                self.unclassified_drops += 1;
                trace!(flow = %id, "guaranteed selector names the default flow");
                return Verdict::Dropped(DropReason::Unclassified);
            }
            FlowSelector::Guaranteed(id) => (id, Band::Predicted),
            FlowSelector::Default(band) => (DEFAULT_FLOW, band),
        };

        // ========================================================================
        // STEP 1: Admission control
        // ========================================================================
        let Some(flow) = self.flows.get_mut(id.index()) else {
            self.unclassified_drops += 1;
            trace!(flow = %id, "flow outside the table");
            return Verdict::Dropped(DropReason::Unconfigured);
        };
        if !flow.is_configured() {
            flow.record_drop(band);
            trace!(flow = %id, "flow not configured");
            return Verdict::Dropped(DropReason::Unconfigured);
        }
        if !flow.admits() {
            flow.record_drop(band);
            trace!(flow = %id, backlog_bytes = flow.backlog_bytes(), "queue full");
            return Verdict::Dropped(DropReason::QueueFull);
        }

        // ========================================================================
        // STEP 2: Extend or restart the flow's finish number
        // ========================================================================
        let round = self.advance_round();
        let flow = &mut self.flows[id.index()];
        let increment = flow.increment(item.len());

        if self.finish_index.contains(id) {
            flow.finish = flow.finish.wrapping_add(increment);
            self.finish_index.reposition(id, flow.finish);
        } else {
            flow.finish = round.wrapping_add(increment);
            self.finish_index.insert(id, flow.finish);
            self.aggregate_rate += flow.rate();
            debug!(
                flow = %id,
                finish = %flow.finish,
                aggregate_rate = self.aggregate_rate,
                "flow activated"
            );
        }

        // ========================================================================
        // STEP 3: An empty flow becomes eligible with this packet at its head
        // ========================================================================
        if !flow.is_backlogged() {
            flow.start = flow.finish;
            self.start_index.insert(id, flow.start);
        }

        flow.push(item, band);
        self.len += 1;
        trace!(flow = %id, %band, start = %flow.start, finish = %flow.finish, "enqueued");
        Verdict::Accepted
    }

    /// Remove the packet with the smallest start number.
    ///
    /// # Returns
    /// `None` when nothing is queued, or when every backlogged flow is held back by its token
    /// bucket (see [`CszScheduler::next_wakeup`])
    pub fn dequeue(&mut self) -> Option<P> {
        let now = self.clock.now();
        self.release_throttled(now);
        self.advance_round();

        while let Some((id, _)) = self.start_index.pop_first() {
            let flow = &mut self.flows[id.index()];
            let Some(head_len) = flow.peek_len() else {
                continue;
            };

            // ====================================================================
            // STEP 1: Shaped flows wait for their bucket
            // ====================================================================
            if let Some(bucket) = flow.shaper_mut() {
                bucket.refill(now);
                if !bucket.covers(head_len) {
                    let until = bucket.ready_at(head_len);
                    flow.throttles += 1;
                    self.throttled.park(id, until);
                    trace!(flow = %id, until_ns = duration_nanos(until), "flow throttled");
                    continue;
                }
                bucket.consume(head_len);
            }

            let Some(item) = flow.pop() else {
                continue;
            };

            // ====================================================================
            // STEP 2: Advance the start number to the next packet
            // ====================================================================
            if id.is_default() {
                // Band priority may have sent something other than what was charged.
                let peeked = flow.take_peeked();
                if flow.is_backlogged() {
                    let dequeued = flow.increment(item.len());
                    if peeked != 0 && peeked != dequeued {
                        flow.start = flow.start.wrapping_sub(peeked).wrapping_add(dequeued);
                    }
                    if let Some(next_len) = flow.peek_len() {
                        let charge = flow.increment(next_len);
                        flow.start = flow.start.wrapping_add(charge);
                        flow.set_peeked(charge);
                    }
                }
            } else if let Some(next_len) = flow.peek_len() {
                flow.start = flow.start.wrapping_add(flow.increment(next_len));
            }

            if flow.is_backlogged() {
                if flow.start.is_ahead_of(flow.finish) {
                    flow.start = flow.finish;
                }
                self.start_index.insert(id, flow.start);
            }

            self.len -= 1;
            trace!(flow = %id, len = item.len(), start = %flow.start, "dequeued");
            return Some(item);
        }
        None
    }

    fn release_throttled(&mut self, now: Duration) {
        for id in self.throttled.release_due(now) {
            let flow = &self.flows[id.index()];
            if flow.is_backlogged() {
                self.start_index.insert(id, flow.start);
                trace!(flow = %id, "flow released from throttle");
            }
        }
    }

    /// Drop every queued packet and return to the freshly initialized state.
    pub fn reset(&mut self) {
        let now = self.clock.now();
        self.reset_at(now);
    }

    fn reset_at(&mut self, now: Duration) {
        let purged: usize = self.flows.iter_mut().map(|flow| flow.purge(now)).sum();
        self.start_index.clear();
        self.finish_index.clear();
        self.throttled.clear();
        self.round = VirtualTime::ZERO;
        self.checkpoint_round = VirtualTime::ZERO;
        self.checkpoint_time = now;
        self.aggregate_rate = 0;
        self.len = 0;
        if purged > 0 {
            debug!(purged, "scheduler reset");
        }
    }

    /// Release the scheduler and every packet it still holds.
    pub fn destroy(mut self) {
        self.reset();
    }

    /// Reconfigure a flow slot at runtime.
    ///
    /// The round number is brought up to date under the old rates first. Queued packets keep
    /// the virtual times they were charged; only new packets see the new rate.
    pub fn change_flow(&mut self, id: FlowId, params: FlowParams) -> Result<(), CszError> {
        if id.index() >= self.flows.len() {
            return Err(CszError::FlowOutOfRange {
                id: id.get(),
                flows: self.flows.len(),
            });
        }
        if id.is_default() && params.shaper.is_some() {
            return Err(CszError::ShapingOnDefaultFlow);
        }
        validate_params(id.get(), &params)?;
        let table = ServiceTable::new(id, params.rate, self.link_rate, self.cell_log)?;

        self.advance_round();
        let now = self.clock.now();
        let flow = &mut self.flows[id.index()];
        if self.finish_index.contains(id) {
            self.aggregate_rate = self.aggregate_rate - flow.rate() + params.rate.raw() as u64;
        }
        let shaped = params.shaper.is_some();
        flow.configure(FlowSetup { params, table }, now);
        if !shaped && self.throttled.remove(id) && flow.is_backlogged() {
            self.start_index.insert(id, flow.start);
        }
        debug!(flow = %id, rate = %flow.rate(), "flow reconfigured");
        Ok(())
    }

    /// Drop a flow's backlog, deactivate it, and reject its traffic from now on.
    ///
    /// # Returns
    /// Number of packets dropped
    pub fn unconfigure_flow(&mut self, id: FlowId) -> Result<usize, CszError> {
        if id.index() >= self.flows.len() {
            return Err(CszError::FlowOutOfRange {
                id: id.get(),
                flows: self.flows.len(),
            });
        }
        self.advance_round();
        let now = self.clock.now();
        let flow = &mut self.flows[id.index()];
        if self.finish_index.remove(id) {
            self.aggregate_rate = self.aggregate_rate.saturating_sub(flow.rate());
        }
        self.start_index.remove(id);
        self.throttled.remove(id);
        let purged = flow.purge(now);
        flow.unconfigure();
        self.len -= purged;
        debug!(flow = %id, purged, "flow unconfigured");
        Ok(purged)
    }

    /// Round number as of the last update.
    pub fn round_number(&self) -> VirtualTime {
        self.round
    }

    /// Sum of the raw rates of the active flows.
    pub fn aggregate_rate(&self) -> u64 {
        self.aggregate_rate
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of flow slots, the default flow included.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Clock time at which a throttled flow becomes eligible again.
    pub fn next_wakeup(&self) -> Option<Duration> {
        self.throttled.next_wakeup()
    }

    /// Time left until [`CszScheduler::next_wakeup`]; zero once it has passed.
    pub fn wakeup_delay(&self) -> Option<Duration> {
        let wakeup = self.next_wakeup()?;
        Some(wakeup.saturating_sub(self.clock.now()))
    }

    pub fn clock_faults(&self) -> u64 {
        self.clock_faults
    }

    pub fn flow_snapshot(&self, id: FlowId) -> Option<FlowSnapshot> {
        let flow = self.flows.get(id.index())?;
        Some(FlowSnapshot {
            id,
            configured: flow.is_configured(),
            start: flow.start,
            finish: flow.finish,
            active: self.finish_index.contains(id),
            in_start_index: self.start_index.contains(id),
            in_finish_index: self.finish_index.contains(id),
            throttled: self.throttled.contains(id),
            backlog_packets: flow.backlog_packets(),
            backlog_bytes: flow.backlog_bytes(),
        })
    }

    /// Snapshots of every flow slot in id order.
    pub fn flow_snapshots(&self) -> Vec<FlowSnapshot> {
        (0..self.flows.len())
            .filter_map(|slot| self.flow_snapshot(FlowId(slot as u8)))
            .collect()
    }

    pub fn stats(&self) -> CszStats {
        let flows: Vec<FlowStats> = self
            .flows
            .iter()
            .map(|flow| FlowStats {
                id: flow.id(),
                rate: flow.params().map(|params| params.rate),
                active: self.finish_index.contains(flow.id()),
                backlog_packets: flow.backlog_packets(),
                backlog_bytes: flow.backlog_bytes(),
                start: flow.start,
                finish: flow.finish,
                throttles: flow.throttles,
                counters: flow.counters,
            })
            .collect();
        let bands = self.flows[DEFAULT_FLOW.index()]
            .band_view()
            .map(|view| {
                view.iter()
                    .map(|(band, (backlog_packets, counters))| BandStats {
                        band,
                        backlog_packets: *backlog_packets,
                        counters: *counters,
                    })
                    .collect()
            })
            .unwrap_or_default();

        CszStats {
            round: self.round,
            aggregate_rate: self.aggregate_rate,
            active_flows: self.finish_index.len(),
            backlog_packets: self.len,
            backlog_bytes: self.flows.iter().map(Flow::backlog_bytes).sum(),
            drops: self.unclassified_drops
                + flows.iter().map(|flow| flow.counters.drops).sum::<u64>(),
            clock_faults: self.clock_faults,
            flows,
            bands,
        }
    }
}

impl<P: Datagram> Qdisc for CszScheduler<P> {
    type Item = P;

    fn enqueue(&mut self, item: P, selector: FlowSelector) -> Verdict {
        CszScheduler::enqueue(self, item, selector)
    }

    fn dequeue(&mut self) -> Option<P> {
        CszScheduler::dequeue(self)
    }

    fn reset(&mut self) {
        CszScheduler::reset(self)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn next_wakeup(&self) -> Option<Duration> {
        CszScheduler::next_wakeup(self)
    }

    fn wakeup_delay(&self) -> Option<Duration> {
        CszScheduler::wakeup_delay(self)
    }
}

impl<P> fmt::Debug for CszScheduler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CszScheduler")
            .field("flows", &self.flows.len())
            .field("round", &self.round)
            .field("aggregate_rate", &self.aggregate_rate)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
