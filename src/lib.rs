//! Peer-to-peer coordination runtime for a replicated energy-credit ledger.
//!
//! A fixed-size group of peers on a shared LAN exchange UDP multicast and
//! unicast datagrams to elect a leader (Bully), detect failures by
//! heartbeat, deliver trades in causal order by vector clock, and keep
//! per-node balances consistent through a coordinator-held registry plus
//! anti-entropy gossip.

pub mod clock;
pub mod config;
pub mod delivery;
pub mod election;
pub mod event;
pub mod heartbeat;
pub mod ledger;
pub mod message;
pub mod net;
pub mod node;
pub mod registry;
