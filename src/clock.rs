// vector clock for causal ordering of trade traffic
//
// entries are keyed by stringified node id for wire compatibility and are
// never removed: hold-back messages may still reference a departed node, and
// dropping its entry would strand them
use std::collections::BTreeMap;

use crate::message::NodeId;

/// Wire representation of a clock: node id (stringified) to logical time.
pub type ClockMap = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockOrder {
    Before,
    After,
    Concurrent,
    Equal,
}

#[derive(Debug, Clone)]
pub struct VectorClock {
    owner: String,
    entries: ClockMap,
}

impl VectorClock {
    pub fn new(node_id: NodeId) -> Self {
        let owner = node_id.to_string();
        let entries = [(owner.clone(), 0)].into_iter().collect();
        Self { owner, entries }
    }

    /// Raise our own entry and return the resulting snapshot, for attaching
    /// to an outgoing message.
    pub fn increment(&mut self) -> ClockMap {
        *self.entries.entry(self.owner.clone()).or_insert(0) += 1;
        self.entries.clone()
    }

    /// Element-wise max with a received clock over the union of keys, then
    /// raise our own entry to capture the receive event.
    pub fn observe(&mut self, received: &ClockMap) {
        for (node, time) in received {
            let entry = self.entries.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*time);
        }
        *self.entries.entry(self.owner.clone()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> ClockMap {
        self.entries.clone()
    }

    pub fn local_time(&self) -> u64 {
        self.entries.get(&self.owner).copied().unwrap_or(0)
    }

    pub fn add_node(&mut self, node_id: NodeId) {
        self.entries.entry(node_id.to_string()).or_insert(0);
    }

    /// The causal delivery predicate: a clocked message from `sender` is
    /// deliverable iff it is the next in sequence from that sender and we
    /// have already seen everything it depends on. Messages without a clock
    /// bypass causal ordering entirely.
    pub fn can_deliver(&self, sender: NodeId, received: Option<&ClockMap>) -> bool {
        let Some(received) = received else {
            return true;
        };
        let sender = sender.to_string();
        let local_sender_time = self.entries.get(&sender).copied().unwrap_or(0);
        if received.get(&sender).copied().unwrap_or(0) != local_sender_time + 1 {
            return false;
        }
        received
            .iter()
            .filter(|(node, _)| **node != sender)
            .all(|(node, time)| *time <= self.entries.get(node).copied().unwrap_or(0))
    }

    pub fn compare(&self, other: &ClockMap) -> ClockOrder {
        let mut less = false;
        let mut greater = false;
        for node in self.entries.keys().chain(other.keys()) {
            let ours = self.entries.get(node).copied().unwrap_or(0);
            let theirs = other.get(node).copied().unwrap_or(0);
            less |= ours < theirs;
            greater |= ours > theirs;
        }
        match (less, greater) {
            (true, false) => ClockOrder::Before,
            (false, true) => ClockOrder::After,
            (false, false) => ClockOrder::Equal,
            (true, true) => ClockOrder::Concurrent,
        }
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries = self.entries.iter();
        write!(f, "[")?;
        if let Some((node, time)) = entries.next() {
            write!(f, "{node}:{time}")?;
        }
        for (node, time) in entries {
            write!(f, ", {node}:{time}")?;
        }
        write!(f, "]")
    }
}
