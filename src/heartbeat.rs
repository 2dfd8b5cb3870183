// heartbeat bookkeeping and two-phase failure detection
//
// eventually-perfect detector: a first timeout only SUSPECTS a node; the
// suspicion is cleared by a fresh heartbeat and confirmed as FAILED by a
// second timeout. the same progression is applied against the coordinator
// using the last-acknowledgment timestamp, where any message from the
// coordinator counts as an acknowledgment
use std::{
    collections::{BTreeSet, HashMap},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::message::NodeId;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FailureReport {
    /// Nodes confirmed failed this check; already removed from tracking.
    pub failed: Vec<NodeId>,
    /// The coordinator was among the confirmed failures, or missed its
    /// acknowledgment window twice.
    pub leader_failed: bool,
}

#[derive(Debug)]
pub struct FailureDetector {
    node_id: NodeId,
    timeout: Duration,
    last_seen: HashMap<NodeId, Instant>,
    suspected: BTreeSet<NodeId>,
    last_leader_ack: Instant,
    /// No verdicts before this; lets initial heartbeats arrive.
    grace_until: Instant,
}

impl FailureDetector {
    pub fn new(node_id: NodeId, timeout: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            node_id,
            timeout,
            last_seen: HashMap::new(),
            suspected: BTreeSet::new(),
            last_leader_ack: now,
            grace_until: now + grace,
        }
    }

    /// Start tracking a node, granting it a fresh window.
    pub fn track(&mut self, node: NodeId, now: Instant) {
        if node == self.node_id {
            return;
        }
        self.last_seen.insert(node, now);
        self.suspected.remove(&node);
    }

    pub fn forget(&mut self, node: NodeId) {
        self.last_seen.remove(&node);
        self.suspected.remove(&node);
    }

    pub fn observe_heartbeat(&mut self, node: NodeId, now: Instant) {
        self.last_seen.insert(node, now);
        if self.suspected.remove(&node) {
            info!(node, "suspicion cleared, node recovered");
        }
    }

    pub fn observe_leader_ack(&mut self, now: Instant) {
        self.last_leader_ack = now;
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        node == self.node_id
            || (self.last_seen.contains_key(&node) && !self.suspected.contains(&node))
    }

    pub fn tracked(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.last_seen.keys().copied()
    }

    pub fn suspected(&self) -> &BTreeSet<NodeId> {
        &self.suspected
    }

    /// Periodic check, expected at roughly half the heartbeat interval.
    pub fn check(&mut self, now: Instant, coordinator: Option<NodeId>) -> FailureReport {
        let mut report = FailureReport::default();
        if now < self.grace_until {
            return report;
        }
        let overdue = self
            .last_seen
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.timeout)
            .map(|(node, _)| *node)
            .collect::<Vec<_>>();
        for node in overdue {
            if self.suspected.remove(&node) {
                error!(node, "node FAILED, sustained heartbeat absence");
                self.last_seen.remove(&node);
                report.failed.push(node);
                if coordinator == Some(node) {
                    report.leader_failed = true;
                }
            } else {
                warn!(node, "node SUSPECTED, missed heartbeat window");
                self.suspected.insert(node);
            }
        }
        // non-leaders also watch for the coordinator going quiet towards us
        // specifically, even while its multicast heartbeats still arrive
        if let Some(leader) = coordinator {
            if leader != self.node_id
                && now.duration_since(self.last_leader_ack) > self.timeout
                && !report.failed.contains(&leader)
            {
                if self.suspected.remove(&leader) {
                    error!(leader, "leader CONFIRMED failed, no acknowledgment");
                    report.leader_failed = true;
                } else {
                    warn!(leader, "leader SUSPECTED, no acknowledgment");
                    self.suspected.insert(leader);
                }
            }
        }
        if !report.failed.is_empty() || report.leader_failed {
            debug!(?report, "failure check verdict");
        }
        report
    }
}
