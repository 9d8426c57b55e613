//! Queueing-discipline boundary and the CSZ scheduler.
//!
//! A [`Qdisc`] is what an egress point drives: it hands packets in with their classification,
//! pulls packets out when the link can transmit, and may reset the discipline. [`csz`] holds the
//! Clark-Shenker-Zhang implementation; the remaining submodules are its building blocks.

pub mod csz;
pub mod flow;
pub mod index;
pub mod shaper;
pub mod vtime;

pub use csz::{CszScheduler, FlowSnapshot};
pub use vtime::VirtualTime;

use crate::band::Band;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Capacity of the flow table, the default flow included.
pub const MAX_FLOWS: usize = 16;

/// Slot 0 of the flow table: the default flow carrying the four priority bands.
pub const DEFAULT_FLOW: FlowId = FlowId(0);

/// Index of a flow slot, `0..MAX_FLOWS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowId(u8);

impl FlowId {
    pub const fn new(id: u8) -> Option<FlowId> {
        if (id as usize) < MAX_FLOWS {
            Some(FlowId(id))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_default(self) -> bool {
        self.0 == DEFAULT_FLOW.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification result attached to a packet at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowSelector {
    /// One of the guaranteed flows `1..MAX_FLOWS`.
    Guaranteed(FlowId),
    /// The default flow, in the given priority band.
    Default(Band),
}

impl FlowSelector {
    /// Decode a raw classification value.
    ///
    /// `1..16` selects a guaranteed flow, `16..20` selects default-flow band `raw - 16`, and `0`
    /// (unclassified traffic) goes to the default flow's predicted band.
    ///
    /// # Returns
    /// `None` for values that map to no flow
    pub fn from_raw(raw: u32) -> Option<FlowSelector> {
        match raw {
            0 => Some(FlowSelector::Default(Band::Predicted)),
            r if (r as usize) < MAX_FLOWS => FlowId::new(r as u8).map(FlowSelector::Guaranteed),
            r => Band::from_index(r as usize - MAX_FLOWS).map(FlowSelector::Default),
        }
    }

    /// Flow slot this selector resolves to.
    pub fn flow_id(self) -> FlowId {
        match self {
            FlowSelector::Guaranteed(id) => id,
            FlowSelector::Default(_) => DEFAULT_FLOW,
        }
    }
}

/// Why a packet was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// The flow's queued bytes already reached its limit.
    QueueFull,
    /// The selected slot has no parameters, or lies beyond the configured table.
    Unconfigured,
    /// A guaranteed selector named the default flow slot.
    Unclassified,
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum Verdict {
    Accepted,
    Dropped(DropReason),
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Entry points an egress point drives. Callers hold exclusive access for each call.
pub trait Qdisc {
    type Item;

    /// Queue `item` for the flow named by `selector`. Never blocks; the only failure is a drop.
    fn enqueue(&mut self, item: Self::Item, selector: FlowSelector) -> Verdict;

    /// Next item to transmit, if any is eligible now.
    fn dequeue(&mut self) -> Option<Self::Item>;

    /// Drop everything queued and return to the freshly initialized state.
    fn reset(&mut self);

    /// Number of queued items.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clock time at which a dequeue should be retried when items are queued but none is
    /// eligible. `None` when there is nothing to wait for.
    fn next_wakeup(&self) -> Option<Duration> {
        None
    }

    /// Time left until [`Qdisc::next_wakeup`], measured on the qdisc's own clock.
    fn wakeup_delay(&self) -> Option<Duration> {
        None
    }
}
