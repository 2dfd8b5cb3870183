// coordinator-held registry: latest known ledger snapshot per node. every
// node keeps one so a future coordinator starts warm from gossip, but only
// the coordinator's copy is authoritative
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    ledger::LedgerState,
    message::NodeId,
};

#[derive(Debug, Default)]
pub struct LedgerRegistry {
    entries: HashMap<NodeId, LedgerState>,
}

impl LedgerRegistry {
    /// Rebuild from scratch around our own snapshot, the first step of the
    /// bootstrap a fresh coordinator runs before polling peers.
    pub fn reset_to(&mut self, own: LedgerState) {
        self.entries.clear();
        self.entries.insert(own.node_id, own);
    }

    /// Record the latest snapshot for its node. Divergent history for an
    /// already-stored trade id is logged for operator attention; the newer
    /// snapshot still wins.
    pub fn store(&mut self, state: LedgerState) {
        if let Some(previous) = self.entries.get(&state.node_id) {
            for tx in &state.transactions {
                let conflicting = previous.transactions.iter().any(|old| {
                    old.trade_id == tx.trade_id
                        && (old.kind != tx.kind
                            || old.amount != tx.amount
                            || old.counterparty != tx.counterparty)
                });
                if conflicting {
                    warn!(
                        node = state.node_id,
                        trade_id = %tx.trade_id,
                        "registry snapshots disagree on trade outcome"
                    );
                }
            }
        }
        debug!(node = state.node_id, balance = state.balance, "registry updated");
        self.entries.insert(state.node_id, state);
    }

    pub fn get(&self, node: NodeId) -> Option<&LedgerState> {
        self.entries.get(&node)
    }

    /// Fast-path balance adjustments the coordinator applies when relaying a
    /// trade confirmation, ahead of the parties' own LEDGER_SYNC pushes.
    pub fn credit(&mut self, node: NodeId, amount: i64) {
        if let Some(state) = self.entries.get_mut(&node) {
            state.balance += amount;
        }
    }

    pub fn debit(&mut self, node: NodeId, amount: i64) {
        if let Some(state) = self.entries.get_mut(&node) {
            state.balance -= amount;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
