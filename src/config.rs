// runtime configuration, environment-first with CLI overrides applied by the
// binary. every knob recognized here is also listed in SPEC_FULL.md §6
use std::{
    collections::{BTreeSet, HashMap},
    env,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    time::Duration,
};

use crate::message::NodeId;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
pub const DEFAULT_MULTICAST_PORT: u16 = 5007;
pub const DEFAULT_UNICAST_PORT_BASE: u16 = 6000;

/// One self-describing record per datagram; anything larger is a local error.
pub const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub unicast_port_base: u16,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub election_timeout: Duration,
    pub gossip_interval: Duration,
    pub initial_credits: i64,
    pub min_credits: i64,
    pub max_nodes: u32,
    /// Copies sent by repeated multicast, and rounds of local-error unicast retry.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Rounds of send + ACK wait for loss-sensitive unicast.
    pub ack_attempts: u32,
    pub ack_timeout: Duration,
    /// Static peer seed map; learn-on-receive overrides these over time.
    pub seed_peers: HashMap<NodeId, IpAddr>,
    /// Peers known at startup (beyond those discovered later).
    pub known_nodes: BTreeSet<NodeId>,
}

impl Config {
    pub fn from_env(node_id: NodeId) -> anyhow::Result<Self> {
        let config = Self {
            node_id,
            multicast_group: env_or("MULTICAST_GROUP", DEFAULT_MULTICAST_GROUP)?,
            multicast_port: env_or("MULTICAST_PORT", DEFAULT_MULTICAST_PORT)?,
            unicast_port_base: env_or("UNICAST_PORT_BASE", DEFAULT_UNICAST_PORT_BASE)?,
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL", 2.0)?,
            heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT", 6.0)?,
            election_timeout: env_secs("ELECTION_TIMEOUT", 5.0)?,
            gossip_interval: env_secs("GOSSIP_INTERVAL", 10.0)?,
            initial_credits: env_or("INITIAL_ENERGY_CREDITS", 100)?,
            min_credits: env_or("MIN_ENERGY_CREDITS", 0)?,
            max_nodes: env_or("MAX_NODES", 10)?,
            retry_count: env_or("MESSAGE_RETRY_COUNT", 3)?,
            retry_delay: env_secs("MESSAGE_RETRY_DELAY", 0.1)?,
            ack_attempts: env_or("MESSAGE_ACK_ATTEMPTS", 5)?,
            ack_timeout: env_secs("MESSAGE_ACK_TIMEOUT", 1.5)?,
            seed_peers: match env::var("PEER_ADDRESSES") {
                Ok(spec) => parse_peer_map(&spec)?,
                Err(_) => HashMap::new(),
            },
            known_nodes: BTreeSet::new(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.node_id >= 1 && self.node_id <= self.max_nodes,
            "node id {} outside [1, {}]",
            self.node_id,
            self.max_nodes
        );
        anyhow::ensure!(
            self.heartbeat_timeout > self.heartbeat_interval,
            "heartbeat timeout must exceed heartbeat interval"
        );
        anyhow::ensure!(self.min_credits <= self.initial_credits);
        anyhow::ensure!(self.retry_count >= 1 && self.ack_attempts >= 1);
        Ok(())
    }

    pub fn unicast_port(&self, node: NodeId) -> u16 {
        self.unicast_port_base + node as u16
    }
}

/// Parse `"1:192.168.0.10,2:192.168.0.11"` into a seed address map.
pub fn parse_peer_map(spec: &str) -> anyhow::Result<HashMap<NodeId, IpAddr>> {
    let mut peers = HashMap::new();
    for entry in spec.split(',').filter(|entry| !entry.trim().is_empty()) {
        let (node, ip) = entry
            .trim()
            .split_once(':')
            .ok_or(anyhow::anyhow!("malformed peer entry {entry:?}"))?;
        peers.insert(node.trim().parse::<NodeId>()?, ip.trim().parse::<IpAddr>()?);
    }
    Ok(peers)
}

/// Parse `"1,2,3"` into a startup membership set.
pub fn parse_node_list(spec: &str) -> anyhow::Result<BTreeSet<NodeId>> {
    spec.split(',')
        .filter(|id| !id.trim().is_empty())
        .map(|id| Ok(id.trim().parse::<NodeId>()?))
        .collect()
}

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => Ok(value
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {key}: {err}"))?),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: f64) -> anyhow::Result<Duration> {
    let secs = env_or(key, default)?;
    anyhow::ensure!(secs > 0.0, "{key} must be positive");
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::from_env(3).unwrap();
        assert_eq!(config.multicast_port, DEFAULT_MULTICAST_PORT);
        assert_eq!(config.unicast_port(3), 6003);
        assert!(config.heartbeat_timeout > config.heartbeat_interval);
    }

    #[test]
    fn node_id_bounds() {
        assert!(Config::from_env(0).is_err());
        assert!(Config::from_env(11).is_err());
    }

    #[test]
    fn peer_map_parsing() {
        let peers = parse_peer_map("1:192.168.0.10, 2:10.0.0.7").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[&2], "10.0.0.7".parse::<IpAddr>().unwrap());
        assert!(parse_peer_map("oops").is_err());
    }

    #[test]
    fn node_list_parsing() {
        let nodes = parse_node_list("1, 2,3,").unwrap();
        assert_eq!(nodes.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
