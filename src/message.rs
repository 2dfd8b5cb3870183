// wire codec: one self-describing JSON record per UDP datagram
//
// field semantics, not byte layout, are the compatibility contract across
// implementations sharing a group, so the envelope stays flat and readable
// and optional fields decode to defaults
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{
    clock::ClockMap,
    config::MAX_DATAGRAM,
    ledger::{LedgerState, TradeRole},
};

pub type NodeId = u32;

/// Wall-clock seconds since the unix epoch, attached to every envelope.
pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub priority: u32,
    /// Absent on HEARTBEAT, which never participates in causal ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<ClockMap>,
    /// Present on reliably-sent kinds; the key for ACK matching and dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default)]
    pub sent_at: f64,
    pub body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    Heartbeat {
        #[serde(default)]
        balance: Option<i64>,
    },
    Election,
    Ok,
    Coordinator,
    Join,
    JoinResponse {
        coordinator_id: NodeId,
        #[serde(default)]
        known_nodes: Vec<NodeId>,
        #[serde(default)]
        clock_state: ClockMap,
        ledger_state: LedgerState,
    },
    Leave,
    TradeRequest {
        trade_id: String,
        target_id: NodeId,
        amount: i64,
        trade_type: TradeRole,
    },
    TradeResponse {
        trade_id: String,
        accepted: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    TradeConfirm {
        trade_id: String,
        success: bool,
        buyer_id: NodeId,
        seller_id: NodeId,
        amount: i64,
    },
    LedgerSync {
        ledger_state: LedgerState,
    },
    StateRequest,
    Ack {
        msg_id: String,
    },
    Gossip {
        ledger_state: LedgerState,
    },
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::Election => "ELECTION",
            Self::Ok => "OK",
            Self::Coordinator => "COORDINATOR",
            Self::Join => "JOIN",
            Self::JoinResponse { .. } => "JOIN_RESPONSE",
            Self::Leave => "LEAVE",
            Self::TradeRequest { .. } => "TRADE_REQUEST",
            Self::TradeResponse { .. } => "TRADE_RESPONSE",
            Self::TradeConfirm { .. } => "TRADE_CONFIRM",
            Self::LedgerSync { .. } => "LEDGER_SYNC",
            Self::StateRequest => "STATE_REQUEST",
            Self::Ack { .. } => "ACK",
            Self::Gossip { .. } => "GOSSIP",
        }
    }

    /// Kinds whose delivery is gated by the vector clock.
    pub fn is_causal(&self) -> bool {
        matches!(self, Self::TradeRequest { .. } | Self::TradeConfirm { .. })
    }
}

impl Envelope {
    pub fn new(sender: NodeId, body: Body) -> Self {
        Self {
            sender,
            priority: sender,
            clock: None,
            msg_id: None,
            sent_at: now_unix(),
            body,
        }
    }

    pub fn with_clock(mut self, clock: ClockMap) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_msg_id(mut self, msg_id: String) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let buf = serde_json::to_vec(self)?;
        anyhow::ensure!(
            buf.len() <= MAX_DATAGRAM,
            "{} message of {} bytes exceeds datagram limit",
            self.body.kind(),
            buf.len()
        );
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}
