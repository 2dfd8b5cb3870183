// Bully leader election. priority equals node id; the highest reachable
// priority wins. the state machine emits effects for the orchestrator to
// perform, so no sends happen from in here and the whole protocol is
// testable as plain calls
use tracing::{debug, info, warn};

use crate::message::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    /// ELECTION sent to the higher-priority set; waiting for an OK until the
    /// round's timer fires.
    WaitingOk { round: u64 },
    /// An OK arrived; a higher node owns the election, await COORDINATOR.
    Deferring,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEffect {
    /// Unicast ELECTION to each listed higher-priority peer.
    SendElection(Vec<NodeId>),
    /// Arm the OK-wait timer for the given round.
    ArmTimeout { round: u64 },
    /// Unicast OK to a lower-priority campaigner.
    SendOk(NodeId),
    /// Schedule our own campaign after a short delay.
    ScheduleElection,
    /// We won: announce COORDINATOR via reliable multicast.
    AnnounceVictory,
    /// The agreed coordinator changed to this node (possibly us).
    CoordinatorChanged(NodeId),
}

#[derive(Debug)]
pub struct Bully {
    node_id: NodeId,
    state: ElectionState,
    coordinator: Option<NodeId>,
    round: u64,
}

impl Bully {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: ElectionState::Idle,
            coordinator: None,
            round: 0,
        }
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.coordinator
    }

    pub fn is_leader(&self) -> bool {
        self.coordinator == Some(self.node_id)
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.state, ElectionState::WaitingOk { .. })
    }

    /// Adopt a coordinator without an election (JOIN_RESPONSE bootstrap).
    pub fn set_coordinator(&mut self, coordinator: NodeId) {
        info!(node = self.node_id, coordinator, "coordinator set");
        self.coordinator = Some(coordinator);
        if coordinator != self.node_id {
            self.state = ElectionState::Idle;
        }
    }

    /// Drop the coordinator reference if it names the departed node. Returns
    /// whether an election is now required.
    pub fn on_peer_gone(&mut self, node: NodeId) -> bool {
        if self.coordinator == Some(node) {
            self.coordinator = None;
            true
        } else {
            false
        }
    }

    /// Begin a campaign against the given higher-priority peers. Re-entry
    /// while a round is outstanding is a no-op.
    pub fn start(&mut self, higher_peers: Vec<NodeId>) -> Vec<ElectionEffect> {
        if self.in_progress() {
            debug!(node = self.node_id, "election already in progress");
            return Vec::new();
        }
        info!(node = self.node_id, ?higher_peers, "starting election");
        if higher_peers.is_empty() {
            return self.declare_victory();
        }
        self.round += 1;
        self.state = ElectionState::WaitingOk { round: self.round };
        vec![
            ElectionEffect::SendElection(higher_peers),
            ElectionEffect::ArmTimeout { round: self.round },
        ]
    }

    pub fn on_election(&mut self, from: NodeId, priority: u32) -> Vec<ElectionEffect> {
        if priority >= self.node_id {
            // a higher-priority campaigner would never address us
            warn!(node = self.node_id, from, priority, "unexpected ELECTION from above");
            return Vec::new();
        }
        info!(node = self.node_id, from, "ELECTION received, answering OK");
        vec![ElectionEffect::SendOk(from), ElectionEffect::ScheduleElection]
    }

    pub fn on_ok(&mut self, from: NodeId) {
        info!(node = self.node_id, from, "OK received, deferring to higher node");
        if self.in_progress() {
            self.state = ElectionState::Deferring;
        }
    }

    /// The round's OK-wait expired. Stale rounds are ignored.
    pub fn on_timeout(&mut self, round: u64) -> Vec<ElectionEffect> {
        match self.state {
            ElectionState::WaitingOk { round: waiting } if waiting == round => {
                info!(node = self.node_id, round, "no OK before timeout");
                self.declare_victory()
            }
            _ => {
                debug!(node = self.node_id, round, "stale election timeout");
                Vec::new()
            }
        }
    }

    pub fn on_coordinator(&mut self, from: NodeId) -> Vec<ElectionEffect> {
        info!(node = self.node_id, coordinator = from, "COORDINATOR received");
        let changed = self.coordinator != Some(from);
        self.coordinator = Some(from);
        self.state = if from == self.node_id {
            ElectionState::Leader
        } else {
            ElectionState::Idle
        };
        if changed {
            vec![ElectionEffect::CoordinatorChanged(from)]
        } else {
            Vec::new()
        }
    }

    fn declare_victory(&mut self) -> Vec<ElectionEffect> {
        info!(node = self.node_id, "declaring victory");
        let changed = self.coordinator != Some(self.node_id);
        self.coordinator = Some(self.node_id);
        self.state = ElectionState::Leader;
        let mut effects = vec![ElectionEffect::AnnounceVictory];
        if changed {
            effects.push(ElectionEffect::CoordinatorChanged(self.node_id));
        }
        effects
    }
}
