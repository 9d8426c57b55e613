//! Ordered flow index.
//!
//! The scheduler keeps two of these over the same flow table: one keyed by start number (which
//! flow transmits next) and one keyed by finish number (which flow the round number retires
//! next). Keys are [`VirtualTime`] values compared with wrapping arithmetic, which rules out a
//! plain ordered map; with at most [`MAX_FLOWS`](super::MAX_FLOWS) members a sorted vector is
//! both simple and fast.
//!
//! Entries with equal keys stay in insertion order: a new entry goes after every entry whose
//! key is not ahead of its own.

use super::vtime::VirtualTime;
use super::FlowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    key: VirtualTime,
    flow: FlowId,
}

/// Flows sorted by a virtual-time key, smallest first.
#[derive(Debug, Clone, Default)]
pub struct OrderedIndex {
    entries: Vec<Entry>,
}

impl OrderedIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert `flow` under `key`.
    ///
    /// The scan runs from the tail because freshly activated flows usually carry the largest
    /// keys. A flow must not already be a member.
    pub fn insert(&mut self, flow: FlowId, key: VirtualTime) {
        debug_assert!(!self.contains(flow), "flow {flow} inserted twice");
        let position = self
            .entries
            .iter()
            .rposition(|entry| !entry.key.is_ahead_of(key))
            .map_or(0, |last_not_after| last_not_after + 1);
        self.entries.insert(position, Entry { key, flow });
    }

    /// Remove `flow`; returns whether it was a member.
    pub fn remove(&mut self, flow: FlowId) -> bool {
        match self.entries.iter().position(|entry| entry.flow == flow) {
            Some(position) => {
                self.entries.remove(position);
                true
            }
            None => false,
        }
    }

    /// Move `flow` to the position its new `key` calls for.
    pub fn reposition(&mut self, flow: FlowId, key: VirtualTime) {
        self.remove(flow);
        self.insert(flow, key);
    }

    /// Smallest entry.
    pub fn first(&self) -> Option<(FlowId, VirtualTime)> {
        self.entries.first().map(|entry| (entry.flow, entry.key))
    }

    pub fn pop_first(&mut self) -> Option<(FlowId, VirtualTime)> {
        if self.entries.is_empty() {
            None
        } else {
            let entry = self.entries.remove(0);
            Some((entry.flow, entry.key))
        }
    }

    pub fn contains(&self, flow: FlowId) -> bool {
        self.entries.iter().any(|entry| entry.flow == flow)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Members in key order.
    pub fn flows(&self) -> impl Iterator<Item = FlowId> + '_ {
        self.entries.iter().map(|entry| entry.flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> FlowId {
        FlowId::new(n).unwrap()
    }

    fn vt(n: u64) -> VirtualTime {
        VirtualTime::from_raw(n)
    }

    #[test]
    fn pops_in_key_order() {
        let mut index = OrderedIndex::default();
        index.insert(id(1), vt(30));
        index.insert(id(2), vt(10));
        index.insert(id(3), vt(20));
        let order: Vec<_> = index.flows().collect();
        assert_eq!(order, vec![id(2), id(3), id(1)]);
        assert_eq!(index.pop_first(), Some((id(2), vt(10))));
        assert_eq!(index.first(), Some((id(3), vt(20))));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut index = OrderedIndex::default();
        index.insert(id(4), vt(5));
        index.insert(id(1), vt(5));
        index.insert(id(7), vt(5));
        index.insert(id(2), vt(1));
        let order: Vec<_> = index.flows().collect();
        assert_eq!(order, vec![id(2), id(4), id(1), id(7)]);

        // Re-inserting an equal key goes to the back of its peers.
        index.reposition(id(4), vt(5));
        let order: Vec<_> = index.flows().collect();
        assert_eq!(order, vec![id(2), id(1), id(7), id(4)]);
    }

    #[test]
    fn orders_across_wraparound() {
        let mut index = OrderedIndex::default();
        let near_end = vt(u64::MAX - 1);
        index.insert(id(1), near_end.wrapping_add(5));
        index.insert(id(2), near_end);
        let order: Vec<_> = index.flows().collect();
        assert_eq!(order, vec![id(2), id(1)]);
    }

    #[test]
    fn remove_and_contains() {
        let mut index = OrderedIndex::with_capacity(4);
        index.insert(id(1), vt(1));
        assert!(index.contains(id(1)));
        assert!(index.remove(id(1)));
        assert!(!index.remove(id(1)));
        assert!(index.is_empty());
        assert_eq!(index.pop_first(), None);
    }
}
