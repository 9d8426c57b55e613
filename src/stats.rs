//! Scheduler statistics.
//!
//! Counters are updated inline on the enqueue/dequeue paths (plain integers, the scheduler is
//! single-threaded) and exported as serde snapshots so the binary can stream them as JSON.
//! They are cumulative: `reset()` clears scheduling state, not statistics.

use serde::{Deserialize, Serialize};

use crate::band::Band;
use crate::config::Rate;
use crate::scheduler::{FlowId, VirtualTime};

/// Packet and byte counters for one queue (a flow or a default-flow band).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub enqueued_packets: u64,
    pub enqueued_bytes: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
    /// Admission rejects.
    pub drops: u64,
    /// Packets discarded by a reset or a clock fault.
    pub purged: u64,
}

impl QueueCounters {
    pub(crate) fn record_enqueue(&mut self, len: usize) {
        self.enqueued_packets += 1;
        self.enqueued_bytes += len as u64;
    }

    pub(crate) fn record_send(&mut self, len: usize) {
        self.sent_packets += 1;
        self.sent_bytes += len as u64;
    }

    pub(crate) fn record_drop(&mut self) {
        self.drops += 1;
    }

    pub(crate) fn record_purge(&mut self, packets: usize) {
        self.purged += packets as u64;
    }
}

/// Point-in-time view of one flow slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStats {
    pub id: FlowId,
    /// `None` for unconfigured slots.
    pub rate: Option<Rate>,
    pub active: bool,
    pub backlog_packets: usize,
    pub backlog_bytes: usize,
    pub start: VirtualTime,
    pub finish: VirtualTime,
    /// Times the flow's token bucket held it back.
    pub throttles: u64,
    #[serde(flatten)]
    pub counters: QueueCounters,
}

/// Point-in-time view of one default-flow band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    pub band: Band,
    pub backlog_packets: usize,
    #[serde(flatten)]
    pub counters: QueueCounters,
}

/// Scheduler-wide snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CszStats {
    pub round: VirtualTime,
    /// Sum of the raw rates of active flows.
    pub aggregate_rate: u64,
    pub active_flows: usize,
    pub backlog_packets: usize,
    pub backlog_bytes: usize,
    /// Admission rejects, including packets that matched no flow.
    pub drops: u64,
    pub clock_faults: u64,
    pub flows: Vec<FlowStats>,
    pub bands: Vec<BandStats>,
}

impl CszStats {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn flow(&self, id: FlowId) -> Option<&FlowStats> {
        self.flows.iter().find(|flow| flow.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut c = QueueCounters::default();
        c.record_enqueue(100);
        c.record_enqueue(50);
        c.record_send(100);
        c.record_drop();
        c.record_purge(1);
        assert_eq!(c.enqueued_packets, 2);
        assert_eq!(c.enqueued_bytes, 150);
        assert_eq!(c.sent_bytes, 100);
        assert_eq!(c.drops, 1);
        assert_eq!(c.purged, 1);
    }

    #[test]
    fn band_stats_serialize_flat() {
        let stats = BandStats {
            band: Band::BestEffortHigh,
            backlog_packets: 2,
            counters: QueueCounters {
                sent_packets: 3,
                ..QueueCounters::default()
            },
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["band"], "BestEffortHigh");
        assert_eq!(json["sent_packets"], 3);
    }
}
