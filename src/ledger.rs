// energy-credit ledger: balance, transaction log, pending and completed
// trades. every execute path is idempotent on trade id so duplicate
// confirmations and replayed multicast copies cannot double-apply
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    clock::ClockMap,
    message::{now_unix, NodeId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Buy,
    Sell,
}

/// Which side of a trade this node has committed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeRole {
    Buy,
    Sell,
}

impl TradeRole {
    /// The role the counterparty takes when we take this one.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub amount: i64,
    pub counterparty: NodeId,
    pub trade_id: String,
    #[serde(default)]
    pub executed_at: f64,
    #[serde(default)]
    pub clock: Option<ClockMap>,
    #[serde(default)]
    pub balance_after: i64,
}

#[derive(Debug, Clone)]
pub struct PendingTrade {
    pub role: TradeRole,
    pub amount: i64,
    pub counterparty: NodeId,
    pub created_at: f64,
}

/// Serializable full-replacement snapshot, carried by LEDGER_SYNC,
/// JOIN_RESPONSE and GOSSIP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    pub node_id: NodeId,
    pub balance: i64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub completed_trades: BTreeSet<String>,
}

impl LedgerState {
    pub fn initial(node_id: NodeId, credits: i64) -> Self {
        Self {
            node_id,
            balance: credits,
            transactions: Vec::new(),
            completed_trades: BTreeSet::new(),
        }
    }
}

#[derive(Debug)]
pub struct EnergyLedger {
    node_id: NodeId,
    balance: i64,
    min_balance: i64,
    transactions: Vec<Transaction>,
    completed: BTreeSet<String>,
    pending: HashMap<String, PendingTrade>,
}

impl EnergyLedger {
    pub fn new(node_id: NodeId, initial_credits: i64, min_credits: i64) -> Self {
        info!(node = node_id, credits = initial_credits, "ledger initialized");
        Self {
            node_id,
            balance: initial_credits,
            min_balance: min_credits,
            transactions: Vec::new(),
            completed: BTreeSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn can_sell(&self, amount: i64) -> bool {
        self.balance - amount >= self.min_balance
    }

    /// Deduct credits for a sale. Returns false only when the balance is
    /// insufficient at execution time; a repeated trade id is a no-op success.
    pub fn execute_sell(
        &mut self,
        amount: i64,
        buyer: NodeId,
        trade_id: &str,
        clock: Option<ClockMap>,
    ) -> bool {
        if self.completed.contains(trade_id) {
            warn!(node = self.node_id, trade_id, "duplicate SELL ignored");
            return true;
        }
        if !self.can_sell(amount) {
            warn!(
                node = self.node_id,
                have = self.balance,
                need = amount,
                "SELL failed, insufficient balance"
            );
            return false;
        }
        self.balance -= amount;
        self.record(TransactionKind::Sell, amount, buyer, trade_id, clock);
        info!(node = self.node_id, amount, buyer, balance = self.balance, trade_id, "SELL");
        true
    }

    /// Add credits for a purchase. Receiving credits cannot fail.
    pub fn execute_buy(
        &mut self,
        amount: i64,
        seller: NodeId,
        trade_id: &str,
        clock: Option<ClockMap>,
    ) -> bool {
        if self.completed.contains(trade_id) {
            warn!(node = self.node_id, trade_id, "duplicate BUY ignored");
            return true;
        }
        self.balance += amount;
        self.record(TransactionKind::Buy, amount, seller, trade_id, clock);
        info!(node = self.node_id, amount, seller, balance = self.balance, trade_id, "BUY");
        true
    }

    fn record(
        &mut self,
        kind: TransactionKind,
        amount: i64,
        counterparty: NodeId,
        trade_id: &str,
        clock: Option<ClockMap>,
    ) {
        self.transactions.push(Transaction {
            kind,
            amount,
            counterparty,
            trade_id: trade_id.into(),
            executed_at: now_unix(),
            clock,
            balance_after: self.balance,
        });
        self.completed.insert(trade_id.into());
    }

    pub fn add_pending(&mut self, trade_id: &str, role: TradeRole, amount: i64, counterparty: NodeId) {
        debug!(node = self.node_id, trade_id, ?role, amount, counterparty, "pending trade added");
        self.pending.insert(
            trade_id.into(),
            PendingTrade {
                role,
                amount,
                counterparty,
                created_at: now_unix(),
            },
        );
    }

    pub fn pending(&self, trade_id: &str) -> Option<&PendingTrade> {
        self.pending.get(trade_id)
    }

    pub fn remove_pending(&mut self, trade_id: &str) {
        if self.pending.remove(trade_id).is_some() {
            debug!(node = self.node_id, trade_id, "pending trade removed");
        }
    }

    /// Whether the trade id is known at all, pending or completed.
    pub fn has_trade(&self, trade_id: &str) -> bool {
        self.pending.contains_key(trade_id) || self.completed.contains(trade_id)
    }

    /// Apply the recorded side of a pending trade. Completed ids succeed
    /// without re-applying; an unknown id is reported as failure.
    pub fn execute_pending(&mut self, trade_id: &str, clock: Option<ClockMap>) -> bool {
        if self.completed.contains(trade_id) {
            self.pending.remove(trade_id);
            return true;
        }
        let Some(trade) = self.pending.get(trade_id).cloned() else {
            warn!(node = self.node_id, trade_id, "pending trade not found");
            return false;
        };
        let done = match trade.role {
            TradeRole::Sell => self.execute_sell(trade.amount, trade.counterparty, trade_id, clock),
            TradeRole::Buy => self.execute_buy(trade.amount, trade.counterparty, trade_id, clock),
        };
        if done {
            self.pending.remove(trade_id);
        }
        done
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Most recent transactions, newest first.
    pub fn recent_transactions(&self, count: usize) -> Vec<&Transaction> {
        self.transactions.iter().rev().take(count).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> LedgerState {
        LedgerState {
            node_id: self.node_id,
            balance: self.balance,
            transactions: self.transactions.clone(),
            completed_trades: self.completed.clone(),
        }
    }

    /// Full-state replacement from a coordinator-supplied snapshot. Snapshots
    /// addressed to another node are ignored.
    pub fn apply_snapshot(&mut self, state: LedgerState) {
        if state.node_id != self.node_id {
            warn!(
                node = self.node_id,
                snapshot_node = state.node_id,
                "ignoring ledger snapshot for another node"
            );
            return;
        }
        let old_balance = self.balance;
        self.balance = state.balance;
        self.transactions = state.transactions;
        self.completed = state.completed_trades;
        info!(
            node = self.node_id,
            old_balance,
            balance = self.balance,
            transactions = self.transactions.len(),
            "ledger state synchronized"
        );
    }
}
