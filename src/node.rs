// the orchestrator: one event-driven state machine per process owning the
// clock, ledger, membership, failure detector, election, registry, hold-back
// buffer and dedup cache. inbound datagrams, operator commands and timers all
// arrive as events; sends go out through the generic net handles so tests can
// record them
use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clock::VectorClock,
    config::Config,
    delivery::{DedupCache, HoldbackBuffer},
    election::{Bully, ElectionEffect},
    event::{OnEvent, Timer},
    heartbeat::FailureDetector,
    ledger::{EnergyLedger, LedgerState, TradeRole},
    message::{now_unix, Body, Envelope, NodeId},
    net::{GroupNet, PeerNet},
    registry::LedgerRegistry,
};

const DRAIN_INTERVAL: Duration = Duration::from_millis(500);
const DEDUP_PURGE_INTERVAL: Duration = Duration::from_secs(5);
const ELECTION_KICKOFF_DELAY: Duration = Duration::from_millis(100);
const STATE_PROBE_PACE: Duration = Duration::from_millis(500);
const LEAVE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Multicast,
    Unicast,
}

/// A decoded datagram with its provenance.
#[derive(Debug)]
pub struct Inbound {
    pub envelope: Envelope,
    pub from: SocketAddr,
    pub via: Via,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Balance,
    Sell { target: NodeId, amount: i64 },
    Buy { target: NodeId, amount: i64 },
    Nodes,
    History,
    Election,
    Quit,
}

impl Command {
    /// Parse one operator input line; `Ok(None)` for blank input.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(None);
        };
        let mut trade = |role: &str| {
            let usage = format!("usage: {role} <node_id> <amount>");
            let target = words.next().ok_or(usage.clone())?;
            let amount = words.next().ok_or(usage.clone())?;
            Ok::<_, String>((
                target.parse::<NodeId>().map_err(|_| usage.clone())?,
                amount.parse::<i64>().map_err(|_| usage)?,
            ))
        };
        let command = match command.to_ascii_lowercase().as_str() {
            "help" => Self::Help,
            "status" => Self::Status,
            "balance" => Self::Balance,
            "sell" => {
                let (target, amount) = trade("sell")?;
                Self::Sell { target, amount }
            }
            "buy" => {
                let (target, amount) = trade("buy")?;
                Self::Buy { target, amount }
            }
            "nodes" => Self::Nodes,
            "history" => Self::History,
            "election" => Self::Election,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("unknown command: {other}. type 'help' for commands")),
        };
        Ok(Some(command))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Arms the periodic timers and announces JOIN. Sent once at startup.
    Init,
    Heartbeat,
    FailureCheck,
    Drain,
    Gossip,
    DedupPurge,
    /// Fires one heartbeat interval after startup; elects if no coordinator
    /// announced itself by then.
    StartupProbe,
    ElectionTimeout { round: u64 },
    ElectionKickoff,
    /// Paced registry bootstrap poll of one peer.
    StateProbe(NodeId),
    FinishShutdown,
}

#[derive(Debug, derive_more::From)]
pub enum NodeEvent {
    Inbound(Inbound),
    Command(Command),
    Tick(Tick),
}

pub struct Node<G, P> {
    id: NodeId,
    config: Config,
    clock: VectorClock,
    ledger: EnergyLedger,
    detector: FailureDetector,
    election: Bully,
    registry: LedgerRegistry,
    holdback: HoldbackBuffer,
    dedup: DedupCache,
    known_nodes: BTreeSet<NodeId>,
    /// Learn-on-receive address table, seeded from configuration.
    peer_addrs: std::collections::HashMap<NodeId, IpAddr>,
    group_net: G,
    peer_net: P,
    shutdown: CancellationToken,
    next_seq: u64,
}

impl<G: GroupNet, P: PeerNet> Node<G, P> {
    pub fn new(config: Config, group_net: G, peer_net: P, shutdown: CancellationToken) -> Self {
        let now = Instant::now();
        let mut node = Self {
            id: config.node_id,
            clock: VectorClock::new(config.node_id),
            ledger: EnergyLedger::new(config.node_id, config.initial_credits, config.min_credits),
            detector: FailureDetector::new(
                config.node_id,
                config.heartbeat_timeout,
                config.heartbeat_interval,
                now,
            ),
            election: Bully::new(config.node_id),
            registry: LedgerRegistry::default(),
            holdback: HoldbackBuffer::default(),
            dedup: DedupCache::default(),
            known_nodes: [config.node_id].into_iter().collect(),
            peer_addrs: config.seed_peers.clone(),
            group_net,
            peer_net,
            shutdown,
            next_seq: 0,
            config,
        };
        for peer in node.config.known_nodes.clone() {
            node.register_peer(peer, None, now);
        }
        node.registry.reset_to(node.ledger.snapshot());
        node
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.known_nodes
            .iter()
            .copied()
            .filter(|node| *node != self.id)
            .collect()
    }

    fn peer_addr(&self, node: NodeId) -> SocketAddr {
        let ip = self
            .peer_addrs
            .get(&node)
            .copied()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, self.config.unicast_port(node))
    }

    fn register_peer(&mut self, node: NodeId, ip: Option<IpAddr>, now: Instant) {
        if node == self.id {
            return;
        }
        if let Some(ip) = ip {
            self.peer_addrs.insert(node, ip);
        }
        if self.known_nodes.insert(node) {
            info!(node, "peer registered");
            self.clock.add_node(node);
            self.detector.track(node, now);
        }
    }

    fn fresh_msg_id(&mut self) -> String {
        self.next_seq += 1;
        format!("m{}-{}-{}", self.id, (now_unix() * 1000.0) as u64, self.next_seq)
    }

    fn fresh_trade_id(&mut self) -> String {
        self.next_seq += 1;
        format!("t{}-{}-{}", self.id, (now_unix() * 1000.0) as u64, self.next_seq)
    }

    /// Build an envelope stamped with a freshly incremented clock.
    fn clocked(&mut self, body: Body) -> Envelope {
        let clock = self.clock.increment();
        Envelope::new(self.id, body).with_clock(clock)
    }

    /// Coordinator keeps its own registry entry current after ledger changes.
    fn update_own_registry(&mut self) {
        if self.election.is_leader() {
            self.registry.store(self.ledger.snapshot());
        }
    }

    // ======================================================================
    // Inbound routing
    // ======================================================================

    fn on_inbound(&mut self, inbound: Inbound, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        let Inbound { envelope, from, via } = inbound;
        // loopback of our own multicast
        if envelope.sender == self.id {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(msg_id) = &envelope.msg_id {
            if self.dedup.observe(msg_id, now) {
                debug!(%msg_id, kind = envelope.body.kind(), "duplicate dropped");
                return Ok(());
            }
        }
        self.register_peer(envelope.sender, Some(from.ip()), now);
        if self.election.coordinator() == Some(envelope.sender) {
            self.detector.observe_leader_ack(now);
        }
        if let Body::Heartbeat { balance } = &envelope.body {
            debug!(sender = envelope.sender, ?balance, "heartbeat");
            self.detector.observe_heartbeat(envelope.sender, now);
            return Ok(());
        }
        // causal gate applies to group traffic: direct exchanges between two
        // peers are already ordered by the protocol round-trips themselves
        if via == Via::Multicast
            && envelope.body.is_causal()
            && !self.clock.can_deliver(envelope.sender, envelope.clock.as_ref())
        {
            self.holdback.push(envelope, from);
            return Ok(());
        }
        if let Some(clock) = &envelope.clock {
            self.clock.observe(clock);
        }
        self.dispatch(envelope, timer)
    }

    fn dispatch(&mut self, envelope: Envelope, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        debug!(sender = envelope.sender, kind = envelope.body.kind(), "dispatch");
        match &envelope.body {
            Body::Heartbeat { .. } => {}
            Body::Election => {
                let effects = self.election.on_election(envelope.sender, envelope.priority);
                self.apply_election_effects(effects, timer)?
            }
            Body::Ok => self.election.on_ok(envelope.sender),
            Body::Coordinator => {
                let effects = self.election.on_coordinator(envelope.sender);
                self.apply_election_effects(effects, timer)?
            }
            Body::Join => self.handle_join(envelope.sender)?,
            Body::JoinResponse { .. } => self.handle_join_response(&envelope)?,
            Body::Leave => self.handle_leave(envelope.sender, timer)?,
            Body::TradeRequest { trade_id, amount, trade_type, .. } => {
                self.handle_trade_request(
                    envelope.sender,
                    trade_id.clone(),
                    *amount,
                    *trade_type,
                )?
            }
            Body::TradeResponse { trade_id, accepted, reason } => self.handle_trade_response(
                envelope.sender,
                trade_id.clone(),
                *accepted,
                reason.clone(),
            )?,
            Body::TradeConfirm { .. } => self.handle_trade_confirm(&envelope)?,
            Body::LedgerSync { ledger_state } => {
                self.handle_ledger_sync(envelope.sender, ledger_state.clone(), envelope.msg_id.clone())?
            }
            Body::StateRequest => self.handle_state_request(envelope.sender)?,
            Body::Ack { msg_id } => self.peer_net.acknowledge(msg_id),
            Body::Gossip { ledger_state } => {
                debug!(sender = envelope.sender, "gossip snapshot stored");
                self.registry.store(ledger_state.clone())
            }
        }
        Ok(())
    }

    // ======================================================================
    // Membership
    // ======================================================================

    fn handle_join(&mut self, joiner: NodeId) -> anyhow::Result<()> {
        info!(joiner, "node joined");
        self.detector.track(joiner, Instant::now());
        if !self.election.is_leader() {
            return Ok(());
        }
        // the coordinator hands the joiner everything it needs to take part:
        // who leads, who exists, the clock state, and its previous ledger if
        // the registry still holds one
        let clock = self.clock.increment();
        let ledger_state = self
            .registry
            .get(joiner)
            .cloned()
            .unwrap_or(LedgerState::initial(joiner, self.config.initial_credits));
        let response = Envelope::new(
            self.id,
            Body::JoinResponse {
                coordinator_id: self.id,
                known_nodes: self.known_nodes.iter().copied().collect(),
                clock_state: self.clock.snapshot(),
                ledger_state: ledger_state.clone(),
            },
        )
        .with_clock(clock.clone())
        .with_msg_id(self.fresh_msg_id());
        self.peer_net.send_acked(&response, self.peer_addr(joiner))?;

        // redundant LEDGER_SYNC in case the join response is lost after its
        // ACK round gives up
        let sync = Envelope::new(self.id, Body::LedgerSync { ledger_state })
            .with_clock(clock.clone())
            .with_msg_id(self.fresh_msg_id());
        self.peer_net.send_acked(&sync, self.peer_addr(joiner))?;

        let announce = Envelope::new(self.id, Body::Coordinator)
            .with_clock(clock)
            .with_msg_id(self.fresh_msg_id());
        self.group_net.send_repeated(&announce)
    }

    fn handle_join_response(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let Body::JoinResponse { coordinator_id, known_nodes, clock_state, ledger_state } =
            &envelope.body
        else {
            unreachable!()
        };
        info!(coordinator = coordinator_id, "join response received");
        if !clock_state.is_empty() {
            self.clock.observe(clock_state);
        }
        self.election.set_coordinator(*coordinator_id);
        let now = Instant::now();
        for node in known_nodes.clone() {
            self.register_peer(node, None, now);
        }
        self.ledger.apply_snapshot(ledger_state.clone());
        if let Some(msg_id) = envelope.msg_id.clone() {
            let ack = self.clocked(Body::Ack { msg_id });
            self.peer_net.send(&ack, self.peer_addr(envelope.sender))?;
        }
        Ok(())
    }

    fn handle_leave(&mut self, leaver: NodeId, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        info!(leaver, "node left");
        self.known_nodes.remove(&leaver);
        self.detector.forget(leaver);
        // the clock entry stays: hold-back messages may still reference it
        if self.election.on_peer_gone(leaver) {
            info!(leaver, "coordinator left, electing");
            self.start_election(timer)?;
        }
        Ok(())
    }

    // ======================================================================
    // Election
    // ======================================================================

    fn start_election(&mut self, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        let higher = self
            .peers()
            .into_iter()
            .filter(|peer| *peer > self.id)
            .collect();
        let effects = self.election.start(higher);
        self.apply_election_effects(effects, timer)
    }

    fn apply_election_effects(
        &mut self,
        effects: Vec<ElectionEffect>,
        timer: &mut dyn Timer<NodeEvent>,
    ) -> anyhow::Result<()> {
        for effect in effects {
            match effect {
                ElectionEffect::SendElection(targets) => {
                    let envelope = self.clocked(Body::Election);
                    for target in targets {
                        self.peer_net.send(&envelope, self.peer_addr(target))?
                    }
                }
                ElectionEffect::ArmTimeout { round } => {
                    timer.set(self.config.election_timeout, Tick::ElectionTimeout { round })?;
                }
                ElectionEffect::SendOk(target) => {
                    let envelope = self.clocked(Body::Ok);
                    self.peer_net.send(&envelope, self.peer_addr(target))?
                }
                ElectionEffect::ScheduleElection => {
                    timer.set(ELECTION_KICKOFF_DELAY, Tick::ElectionKickoff)?;
                }
                ElectionEffect::AnnounceVictory => {
                    let msg_id = self.fresh_msg_id();
                    let envelope = self.clocked(Body::Coordinator).with_msg_id(msg_id);
                    self.group_net.send_repeated(&envelope)?
                }
                ElectionEffect::CoordinatorChanged(coordinator) => {
                    self.on_coordinator_changed(coordinator, timer)?
                }
            }
        }
        Ok(())
    }

    fn on_coordinator_changed(
        &mut self,
        coordinator: NodeId,
        timer: &mut dyn Timer<NodeEvent>,
    ) -> anyhow::Result<()> {
        if coordinator == self.id {
            info!("assumed coordinator role, bootstrapping registry");
            self.registry.reset_to(self.ledger.snapshot());
            for (index, peer) in self.peers().into_iter().enumerate() {
                timer.set(
                    STATE_PROBE_PACE * (index as u32 + 1),
                    Tick::StateProbe(peer),
                )?;
            }
        } else {
            info!(coordinator, "following new coordinator");
            // a fresh window, so the handover itself does not read as silence
            self.detector.observe_leader_ack(Instant::now());
            let msg_id = self.fresh_msg_id();
            let sync = self
                .clocked(Body::LedgerSync { ledger_state: self.ledger.snapshot() })
                .with_msg_id(msg_id);
            self.peer_net.send_acked(&sync, self.peer_addr(coordinator))?;
        }
        Ok(())
    }

    // ======================================================================
    // Trading
    // ======================================================================

    fn propose_trade(&mut self, target: NodeId, amount: i64, role: TradeRole) -> anyhow::Result<()> {
        if target == self.id {
            println!("cannot trade with yourself");
            return Ok(());
        }
        if !self.known_nodes.contains(&target) || !self.detector.is_alive(target) {
            println!("node {target} not available");
            return Ok(());
        }
        if role == TradeRole::Sell && !self.ledger.can_sell(amount) {
            println!(
                "cannot sell {amount} credits: balance {} would drop below {}",
                self.ledger.balance(),
                self.config.min_credits
            );
            return Ok(());
        }
        let trade_id = self.fresh_trade_id();
        let request = self.clocked(Body::TradeRequest {
            trade_id: trade_id.clone(),
            target_id: target,
            amount,
            trade_type: role,
        });
        self.ledger.add_pending(&trade_id, role, amount, target);
        info!(target, amount, ?role, %trade_id, "trade proposed");
        self.peer_net.send(&request, self.peer_addr(target))
    }

    fn handle_trade_request(
        &mut self,
        proposer: NodeId,
        trade_id: String,
        amount: i64,
        their_role: TradeRole,
    ) -> anyhow::Result<()> {
        info!(proposer, amount, ?their_role, %trade_id, "trade request");
        if self.ledger.has_trade(&trade_id) {
            debug!(%trade_id, "already known, ignoring duplicate request");
            return Ok(());
        }
        let our_role = their_role.opposite();
        let (accepted, reason) = match our_role {
            // receiving credits cannot fail
            TradeRole::Buy => (true, None),
            TradeRole::Sell if self.ledger.can_sell(amount) => (true, None),
            TradeRole::Sell => (false, Some("insufficient credits".to_string())),
        };
        if accepted {
            self.ledger.add_pending(&trade_id, our_role, amount, proposer);
            self.update_own_registry();
        }
        info!(%trade_id, accepted, "trade request evaluated");
        let response = self.clocked(Body::TradeResponse { trade_id, accepted, reason });
        self.peer_net.send(&response, self.peer_addr(proposer))
    }

    fn handle_trade_response(
        &mut self,
        counterparty: NodeId,
        trade_id: String,
        accepted: bool,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        if !accepted {
            info!(counterparty, %trade_id, ?reason, "trade rejected");
            self.ledger.remove_pending(&trade_id);
            self.update_own_registry();
            return Ok(());
        }
        info!(counterparty, %trade_id, "trade accepted");
        let Some(pending) = self.ledger.pending(&trade_id) else {
            warn!(%trade_id, "response for unknown trade");
            return Ok(());
        };
        let amount = pending.amount;
        let (buyer_id, seller_id) = match pending.role {
            TradeRole::Sell => (pending.counterparty, self.id),
            TradeRole::Buy => (self.id, pending.counterparty),
        };
        self.ledger.execute_pending(&trade_id, Some(self.clock.snapshot()));
        self.update_own_registry();

        // loss here would leave the counterparty half-settled, so confirm
        // with ack rounds
        let msg_id = self.fresh_msg_id();
        let confirm = self
            .clocked(Body::TradeConfirm {
                trade_id,
                success: true,
                buyer_id,
                seller_id,
                amount,
            })
            .with_msg_id(msg_id);
        self.peer_net.send_acked(&confirm, self.peer_addr(counterparty))
    }

    fn handle_trade_confirm(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let Body::TradeConfirm { trade_id, success, buyer_id, seller_id, amount } = &envelope.body
        else {
            unreachable!()
        };
        if !success {
            warn!(%trade_id, "trade failed at proposer");
            self.ledger.remove_pending(trade_id);
            self.update_own_registry();
            return Ok(());
        }
        info!(sender = envelope.sender, %trade_id, "trade confirmed");
        if self.election.is_leader() {
            // relay so every replica can settle, and adjust the registry
            // ahead of the parties' own syncs
            self.group_net.send(envelope)?;
            self.registry.credit(*buyer_id, *amount);
            self.registry.debit(*seller_id, *amount);
        }
        self.ledger.execute_pending(trade_id, Some(self.clock.snapshot()));
        self.update_own_registry();
        if let Some(msg_id) = envelope.msg_id.clone() {
            let ack = self.clocked(Body::Ack { msg_id });
            self.peer_net.send(&ack, self.peer_addr(envelope.sender))?;
        }
        if !self.election.is_leader() {
            if let Some(coordinator) = self.election.coordinator() {
                if coordinator != self.id {
                    let msg_id = self.fresh_msg_id();
                    let sync = self
                        .clocked(Body::LedgerSync { ledger_state: self.ledger.snapshot() })
                        .with_msg_id(msg_id);
                    self.peer_net.send_acked(&sync, self.peer_addr(coordinator))?;
                }
            }
        }
        Ok(())
    }

    // ======================================================================
    // Registry, sync, gossip
    // ======================================================================

    fn handle_ledger_sync(
        &mut self,
        sender: NodeId,
        state: LedgerState,
        msg_id: Option<String>,
    ) -> anyhow::Result<()> {
        if self.election.coordinator() == Some(sender) {
            self.ledger.apply_snapshot(state);
        } else if self.election.is_leader() {
            self.registry.store(state);
        } else {
            debug!(sender, "ledger sync from non-coordinator peer ignored");
        }
        if let Some(msg_id) = msg_id {
            let ack = self.clocked(Body::Ack { msg_id });
            self.peer_net.send(&ack, self.peer_addr(sender))?
        }
        Ok(())
    }

    fn handle_state_request(&mut self, requester: NodeId) -> anyhow::Result<()> {
        info!(requester, "state requested");
        let msg_id = self.fresh_msg_id();
        let sync = self
            .clocked(Body::LedgerSync { ledger_state: self.ledger.snapshot() })
            .with_msg_id(msg_id);
        self.peer_net.send_acked(&sync, self.peer_addr(requester))
    }

    // ======================================================================
    // Timers
    // ======================================================================

    fn on_tick(&mut self, tick: Tick, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        match tick {
            Tick::Init => {
                timer.set(DRAIN_INTERVAL, Tick::Drain)?;
                timer.set(self.config.heartbeat_interval / 2, Tick::FailureCheck)?;
                timer.set(self.config.gossip_interval, Tick::Gossip)?;
                timer.set(DEDUP_PURGE_INTERVAL, Tick::DedupPurge)?;
                timer.set(self.config.heartbeat_interval, Tick::StartupProbe)?;
                self.on_tick(Tick::Heartbeat, timer)?;
                let msg_id = self.fresh_msg_id();
                let join = self.clocked(Body::Join).with_msg_id(msg_id);
                info!("announcing join");
                self.group_net.send_repeated(&join)?
            }
            Tick::Heartbeat => {
                let heartbeat = Envelope::new(
                    self.id,
                    Body::Heartbeat { balance: Some(self.ledger.balance()) },
                );
                // liveness probe only: no clock, or lost heartbeats would
                // block trade delivery through the hold-back queue
                self.group_net.send(&heartbeat)?;
                timer.set(self.config.heartbeat_interval, Tick::Heartbeat)?;
            }
            Tick::FailureCheck => {
                let report = self.detector.check(Instant::now(), self.election.coordinator());
                for node in &report.failed {
                    warn!(node, "removing failed node");
                    self.known_nodes.remove(node);
                    // registry snapshot is kept for rejoin recovery
                }
                if report.leader_failed {
                    if let Some(coordinator) = self.election.coordinator() {
                        self.election.on_peer_gone(coordinator);
                    }
                    warn!("leader failure detected, electing");
                    self.start_election(timer)?;
                }
                timer.set(self.config.heartbeat_interval / 2, Tick::FailureCheck)?;
            }
            Tick::Drain => {
                self.drain_holdback(timer)?;
                timer.set(DRAIN_INTERVAL, Tick::Drain)?;
            }
            Tick::Gossip => {
                let peers = self.peers();
                if let Some(target) = peers.choose(&mut rand::thread_rng()).copied() {
                    let gossip =
                        self.clocked(Body::Gossip { ledger_state: self.ledger.snapshot() });
                    debug!(target, "gossiping ledger snapshot");
                    self.peer_net.send(&gossip, self.peer_addr(target))?
                }
                timer.set(self.config.gossip_interval, Tick::Gossip)?;
            }
            Tick::DedupPurge => {
                self.dedup.purge(Instant::now());
                timer.set(DEDUP_PURGE_INTERVAL, Tick::DedupPurge)?;
            }
            Tick::StartupProbe => {
                if self.election.coordinator().is_none() {
                    info!("no coordinator heard from, electing");
                    self.start_election(timer)?
                }
            }
            Tick::ElectionTimeout { round } => {
                let effects = self.election.on_timeout(round);
                self.apply_election_effects(effects, timer)?
            }
            Tick::ElectionKickoff => self.start_election(timer)?,
            Tick::StateProbe(peer) => {
                if self.election.is_leader() && self.known_nodes.contains(&peer) {
                    let request = self.clocked(Body::StateRequest);
                    self.peer_net.send_retry(&request, self.peer_addr(peer))?
                }
            }
            Tick::FinishShutdown => self.shutdown.cancel(),
        }
        Ok(())
    }

    /// Drain the hold-back buffer to a fixpoint: each delivery advances the
    /// clock, which may unblock entries behind it.
    fn drain_holdback(&mut self, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        loop {
            let clock = &self.clock;
            let batch = self
                .holdback
                .drain_deliverable(|sender, received| clock.can_deliver(sender, received));
            if batch.is_empty() {
                return Ok(());
            }
            for (envelope, _) in batch {
                debug!(sender = envelope.sender, "delivering buffered message");
                if let Some(clock) = &envelope.clock {
                    self.clock.observe(clock);
                }
                self.dispatch(envelope, timer)?
            }
        }
    }

    // ======================================================================
    // Operator commands
    // ======================================================================

    fn on_command(&mut self, command: Command, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        match command {
            Command::Help => print_help(),
            Command::Status => self.print_status(),
            Command::Balance => println!("balance: {} credits", self.ledger.balance()),
            Command::Sell { target, amount } => self.propose_trade(target, amount, TradeRole::Sell)?,
            Command::Buy { target, amount } => self.propose_trade(target, amount, TradeRole::Buy)?,
            Command::Nodes => self.print_nodes(),
            Command::History => self.print_history(),
            Command::Election => {
                println!("starting election...");
                self.start_election(timer)?
            }
            Command::Quit => {
                println!("shutting down...");
                info!("leaving the group");
                // hand the coordinator our final state before going dark
                if let Some(coordinator) = self.election.coordinator() {
                    if coordinator != self.id {
                        let msg_id = self.fresh_msg_id();
                        let sync = self
                            .clocked(Body::LedgerSync { ledger_state: self.ledger.snapshot() })
                            .with_msg_id(msg_id);
                        self.peer_net.send_acked(&sync, self.peer_addr(coordinator))?;
                    }
                }
                let leave = self.clocked(Body::Leave);
                self.group_net.send(&leave)?;
                timer.set(LEAVE_GRACE, Tick::FinishShutdown)?;
            }
        }
        Ok(())
    }

    fn print_status(&self) {
        let role = if self.election.is_leader() { "coordinator" } else { "follower" };
        let coordinator = match self.election.coordinator() {
            Some(node) => node.to_string(),
            None => "unknown".to_string(),
        };
        let active = self
            .known_nodes
            .iter()
            .copied()
            .filter(|node| self.detector.is_alive(*node))
            .collect::<Vec<_>>();
        println!("node {} | {role} | coordinator {coordinator}", self.id);
        println!("balance: {} credits", self.ledger.balance());
        println!("active nodes: {active:?}");
        println!("vector clock: {}", self.clock);
        println!(
            "buffered: {} | pending trades: {} | registry entries: {}",
            self.holdback.len(),
            self.ledger.pending_count(),
            self.registry.len(),
        );
    }

    fn print_nodes(&self) {
        let coordinator = self.election.coordinator();
        for node in &self.known_nodes {
            let mut notes = Vec::new();
            if *node == self.id {
                notes.push("self");
            }
            if Some(*node) == coordinator {
                notes.push("coordinator");
            }
            if self.detector.suspected().contains(node) {
                notes.push("suspected");
            } else if self.detector.is_alive(*node) {
                notes.push("active");
            }
            println!("node {node} ({})", notes.join(", "));
        }
    }

    fn print_history(&self) {
        let recent = self.ledger.recent_transactions(10);
        if recent.is_empty() {
            println!("no transactions yet");
            return;
        }
        for tx in recent {
            let direction = match tx.kind {
                crate::ledger::TransactionKind::Buy => "from",
                crate::ledger::TransactionKind::Sell => "to",
            };
            println!(
                "{:?} {} credits {direction} node {} (balance {}, trade {})",
                tx.kind, tx.amount, tx.counterparty, tx.balance_after, tx.trade_id,
            );
        }
    }
}

fn print_help() {
    println!(
        "commands:\n  \
         help       show this message\n  \
         status     node status\n  \
         balance    current energy credits\n  \
         sell N A   sell A credits to node N\n  \
         buy N A    buy A credits from node N\n  \
         nodes      list known nodes\n  \
         history    recent transactions\n  \
         election   force a leader election\n  \
         quit       leave and shut down"
    );
}

impl<G: GroupNet, P: PeerNet> OnEvent<NodeEvent> for Node<G, P> {
    fn on_event(&mut self, event: NodeEvent, timer: &mut dyn Timer<NodeEvent>) -> anyhow::Result<()> {
        match event {
            NodeEvent::Inbound(inbound) => self.on_inbound(inbound, timer),
            NodeEvent::Command(command) => self.on_command(command, timer),
            NodeEvent::Tick(tick) => self.on_tick(tick, timer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ClockMap, event::TimerId, ledger::TransactionKind};

    #[derive(Debug, Default)]
    struct FakeGroup {
        sent: Vec<Envelope>,
        repeated: Vec<Envelope>,
    }

    impl GroupNet for FakeGroup {
        fn send(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
            self.sent.push(envelope.clone());
            Ok(())
        }

        fn send_repeated(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
            self.repeated.push(envelope.clone());
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct FakePeers {
        sent: Vec<(Envelope, SocketAddr)>,
        retried: Vec<(Envelope, SocketAddr)>,
        acked: Vec<(Envelope, SocketAddr)>,
        acknowledged: Vec<String>,
    }

    impl PeerNet for FakePeers {
        fn send(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()> {
            self.sent.push((envelope.clone(), to));
            Ok(())
        }

        fn send_retry(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()> {
            self.retried.push((envelope.clone(), to));
            Ok(())
        }

        fn send_acked(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()> {
            self.acked.push((envelope.clone(), to));
            Ok(())
        }

        fn acknowledge(&mut self, msg_id: &str) {
            self.acknowledged.push(msg_id.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingTimer {
        armed: Vec<(Duration, NodeEvent)>,
        next: TimerId,
    }

    impl Timer<NodeEvent> for RecordingTimer {
        fn set_internal(&mut self, duration: Duration, event: NodeEvent) -> anyhow::Result<TimerId> {
            self.armed.push((duration, event));
            self.next += 1;
            Ok(self.next)
        }

        fn unset(&mut self, _: TimerId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl RecordingTimer {
        fn armed_ticks(&self) -> Vec<&Tick> {
            self.armed
                .iter()
                .filter_map(|(_, event)| match event {
                    NodeEvent::Tick(tick) => Some(tick),
                    _ => None,
                })
                .collect()
        }
    }

    type TestNode = Node<FakeGroup, FakePeers>;

    fn test_node(id: NodeId, known: &[NodeId]) -> TestNode {
        test_node_with_credits(id, known, 100)
    }

    fn test_node_with_credits(id: NodeId, known: &[NodeId], credits: i64) -> TestNode {
        let mut config = Config::from_env(id).unwrap();
        config.initial_credits = credits;
        config.known_nodes = known.iter().copied().collect();
        Node::new(
            config,
            FakeGroup::default(),
            FakePeers::default(),
            CancellationToken::new(),
        )
    }

    fn addr(node: NodeId) -> SocketAddr {
        ([127, 0, 0, 1], 6000 + node as u16).into()
    }

    fn unicast(envelope: Envelope) -> NodeEvent {
        let from = addr(envelope.sender);
        Inbound { envelope, from, via: Via::Unicast }.into()
    }

    fn multicast(envelope: Envelope) -> NodeEvent {
        let from = addr(envelope.sender);
        Inbound { envelope, from, via: Via::Multicast }.into()
    }

    fn drive(node: &mut TestNode, event: NodeEvent, timer: &mut RecordingTimer) {
        node.on_event(event, timer).unwrap()
    }

    fn clock_map(entries: &[(NodeId, u64)]) -> ClockMap {
        entries
            .iter()
            .map(|(node, time)| (node.to_string(), *time))
            .collect()
    }

    fn shuttle_unicast(from: &mut TestNode, to: &mut TestNode, timer: &mut RecordingTimer) {
        let (envelope, _) = from.peer_net.sent.remove(0);
        drive(to, unicast(envelope), timer);
    }

    #[test]
    fn s1_clean_trade_settles_both_sides() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1, 2]);
        let mut n2 = test_node(2, &[1, 2]);

        drive(&mut n1, Command::Sell { target: 2, amount: 30 }.into(), &mut timer);
        assert_eq!(n1.peer_net.sent.len(), 1);
        // request -> n2
        shuttle_unicast(&mut n1, &mut n2, &mut timer);
        // response -> n1
        shuttle_unicast(&mut n2, &mut n1, &mut timer);
        // n1 settled its side and confirms with ack retry
        assert_eq!(n1.ledger.balance(), 70);
        assert_eq!(n1.peer_net.acked.len(), 1);
        let (confirm, to) = n1.peer_net.acked.remove(0);
        assert_eq!(to, addr(2));
        drive(&mut n2, unicast(confirm.clone()), &mut timer);

        assert_eq!(n2.ledger.balance(), 130);
        // the confirm is acknowledged back to the proposer
        let (ack, _) = n2.peer_net.sent.pop().unwrap();
        let Body::Ack { ref msg_id } = ack.body else {
            panic!("expected ack");
        };
        assert_eq!(Some(msg_id), confirm.msg_id.as_ref());
        drive(&mut n1, unicast(ack.clone()), &mut timer);
        assert_eq!(n1.peer_net.acknowledged, vec![msg_id.clone()]);

        let tx1 = &n1.ledger.transactions()[0];
        let tx2 = &n2.ledger.transactions()[0];
        assert_eq!(tx1.kind, TransactionKind::Sell);
        assert_eq!(tx2.kind, TransactionKind::Buy);
        assert_eq!(tx1.trade_id, tx2.trade_id);
        assert_eq!((tx1.counterparty, tx2.counterparty), (2, 1));
    }

    #[test]
    fn s5_insufficient_funds_stops_locally() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node_with_credits(1, &[1, 2], 10);
        drive(&mut n1, Command::Sell { target: 2, amount: 20 }.into(), &mut timer);
        assert!(n1.peer_net.sent.is_empty());
        assert!(n1.peer_net.acked.is_empty());
        assert_eq!(n1.ledger.balance(), 10);
        assert_eq!(n1.ledger.pending_count(), 0);
    }

    #[test]
    fn s6_duplicate_confirm_is_idempotent() {
        let mut timer = RecordingTimer::default();
        let mut n2 = test_node(2, &[1, 2]);
        let request = Envelope::new(1, Body::TradeRequest {
            trade_id: "t1-1".into(),
            target_id: 2,
            amount: 30,
            trade_type: TradeRole::Sell,
        })
        .with_clock(clock_map(&[(1, 1)]));
        drive(&mut n2, unicast(request), &mut timer);

        let confirm = |msg_id: &str| {
            Envelope::new(1, Body::TradeConfirm {
                trade_id: "t1-1".into(),
                success: true,
                buyer_id: 2,
                seller_id: 1,
                amount: 30,
            })
            .with_clock(clock_map(&[(1, 3), (2, 2)]))
            .with_msg_id(msg_id.into())
        };
        drive(&mut n2, unicast(confirm("m1-a")), &mut timer);
        assert_eq!(n2.ledger.balance(), 130);
        // a late retransmit escapes the dedup cache under a new id
        drive(&mut n2, unicast(confirm("m1-b")), &mut timer);
        assert_eq!(n2.ledger.balance(), 130);
        assert_eq!(n2.ledger.transactions().len(), 1);
    }

    #[test]
    fn s4_causal_deferral_holds_confirm_until_dependencies() {
        let mut timer = RecordingTimer::default();
        let mut n3 = test_node(3, &[1, 2, 3]);
        // the trade request reaches us directly
        let request = Envelope::new(1, Body::TradeRequest {
            trade_id: "t1-9".into(),
            target_id: 3,
            amount: 30,
            trade_type: TradeRole::Sell,
        })
        .with_clock(clock_map(&[(1, 1)]));
        drive(&mut n3, unicast(request), &mut timer);

        // the relayed confirm arrives before the clock state it depends on
        let confirm = Envelope::new(1, Body::TradeConfirm {
            trade_id: "t1-9".into(),
            success: true,
            buyer_id: 3,
            seller_id: 1,
            amount: 30,
        })
        .with_clock(clock_map(&[(1, 3), (2, 2)]))
        .with_msg_id("m1-c".into());
        drive(&mut n3, multicast(confirm), &mut timer);
        assert_eq!(n3.holdback.len(), 1);
        drive(&mut n3, Tick::Drain.into(), &mut timer);
        assert_eq!(n3.holdback.len(), 1);
        assert_eq!(n3.ledger.balance(), 100);

        // an intermediate message carries the missing clock entries
        let sync = Envelope::new(1, Body::LedgerSync {
            ledger_state: LedgerState::initial(1, 70),
        })
        .with_clock(clock_map(&[(1, 2), (2, 2)]));
        drive(&mut n3, unicast(sync), &mut timer);
        drive(&mut n3, Tick::Drain.into(), &mut timer);
        assert!(n3.holdback.is_empty());
        assert_eq!(n3.ledger.balance(), 130);
        assert!(n3.ledger.has_trade("t1-9"));
    }

    #[test]
    fn duplicate_msg_id_is_dropped() {
        let mut timer = RecordingTimer::default();
        let mut n3 = test_node(3, &[1, 3]);
        drive(&mut n3, Command::Election.into(), &mut timer);
        assert!(n3.is_leader());

        let sync = Envelope::new(1, Body::LedgerSync {
            ledger_state: LedgerState::initial(1, 70),
        })
        .with_clock(clock_map(&[(1, 1)]))
        .with_msg_id("m1-s".into());
        drive(&mut n3, unicast(sync.clone()), &mut timer);
        drive(&mut n3, unicast(sync), &mut timer);
        // one ACK back, not two
        let acks = n3
            .peer_net
            .sent
            .iter()
            .filter(|(envelope, _)| matches!(envelope.body, Body::Ack { .. }))
            .count();
        assert_eq!(acks, 1);
    }

    #[test]
    fn lone_node_elects_itself_on_startup_probe() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1]);
        drive(&mut n1, Tick::StartupProbe.into(), &mut timer);
        assert!(n1.is_leader());
        assert!(matches!(
            n1.group_net.repeated.last().unwrap().body,
            Body::Coordinator
        ));
    }

    #[test]
    fn election_timeout_declares_victory_and_bootstraps() {
        let mut timer = RecordingTimer::default();
        let mut n2 = test_node(2, &[1, 2, 3]);
        drive(&mut n2, Tick::ElectionKickoff.into(), &mut timer);
        let (election, to) = n2.peer_net.sent.remove(0);
        assert!(matches!(election.body, Body::Election));
        assert_eq!(to, addr(3));
        assert!(timer
            .armed_ticks()
            .iter()
            .any(|tick| matches!(tick, Tick::ElectionTimeout { round: 1 })));

        drive(&mut n2, Tick::ElectionTimeout { round: 1 }.into(), &mut timer);
        assert!(n2.is_leader());
        assert_eq!(n2.registry.len(), 1);
        let probes = timer
            .armed_ticks()
            .into_iter()
            .filter(|tick| matches!(tick, Tick::StateProbe(_)))
            .count();
        assert_eq!(probes, 2);

        drive(&mut n2, Tick::StateProbe(1).into(), &mut timer);
        assert!(matches!(n2.peer_net.retried[0].0.body, Body::StateRequest));
    }

    #[test]
    fn ok_defers_then_coordinator_pushes_state() {
        let mut timer = RecordingTimer::default();
        let mut n2 = test_node(2, &[1, 2, 3]);
        drive(&mut n2, Tick::ElectionKickoff.into(), &mut timer);
        drive(&mut n2, unicast(Envelope::new(3, Body::Ok).with_clock(clock_map(&[(3, 1)]))), &mut timer);
        // the armed timeout fires but must not elect us
        drive(&mut n2, Tick::ElectionTimeout { round: 1 }.into(), &mut timer);
        assert!(!n2.is_leader());

        drive(
            &mut n2,
            multicast(Envelope::new(3, Body::Coordinator).with_clock(clock_map(&[(3, 2)]))),
            &mut timer,
        );
        assert_eq!(n2.election.coordinator(), Some(3));
        // follower pushes its snapshot to the new coordinator, ack-retried
        let (sync, to) = n2.peer_net.acked.remove(0);
        assert!(matches!(sync.body, Body::LedgerSync { .. }));
        assert_eq!(to, addr(3));
    }

    #[test]
    fn s3_join_response_carries_registry_snapshot() {
        let mut timer = RecordingTimer::default();
        let mut n3 = test_node(3, &[1, 3]);
        drive(&mut n3, Command::Election.into(), &mut timer);
        assert!(n3.is_leader());

        // node 1's pre-crash state reached the registry via sync
        let mut state = LedgerState::initial(1, 70);
        state.completed_trades.insert("t1-1".into());
        let sync = Envelope::new(1, Body::LedgerSync { ledger_state: state })
            .with_clock(clock_map(&[(1, 1)]))
            .with_msg_id("m1-pre".into());
        drive(&mut n3, unicast(sync), &mut timer);

        // node 1 restarts and joins; it must get 70 back, not a fresh 100
        let join = Envelope::new(1, Body::Join)
            .with_clock(clock_map(&[(1, 1)]))
            .with_msg_id("m1-join".into());
        drive(&mut n3, multicast(join), &mut timer);

        let (response, to) = n3.peer_net.acked.remove(0);
        assert_eq!(to, addr(1));
        let Body::JoinResponse { coordinator_id, known_nodes, ledger_state, .. } = response.body
        else {
            panic!("expected join response");
        };
        assert_eq!(coordinator_id, 3);
        assert!(known_nodes.contains(&1));
        assert_eq!(ledger_state.balance, 70);
        // plus the redundant sync and the repeated coordinator announcement
        let (sync, _) = n3.peer_net.acked.remove(0);
        assert!(matches!(sync.body, Body::LedgerSync { .. }));
        assert!(matches!(n3.group_net.repeated.last().unwrap().body, Body::Coordinator));
    }

    #[test]
    fn joiner_adopts_join_response() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1]);
        let response = Envelope::new(3, Body::JoinResponse {
            coordinator_id: 3,
            known_nodes: vec![1, 2, 3],
            clock_state: clock_map(&[(2, 4), (3, 5)]),
            ledger_state: LedgerState::initial(1, 70),
        })
        .with_clock(clock_map(&[(3, 5)]))
        .with_msg_id("m3-jr".into());
        drive(&mut n1, unicast(response), &mut timer);

        assert_eq!(n1.election.coordinator(), Some(3));
        assert_eq!(n1.ledger.balance(), 70);
        assert!(n1.known_nodes.contains(&2));
        let (ack, to) = n1.peer_net.sent.remove(0);
        assert_eq!(to, addr(3));
        assert!(matches!(ack.body, Body::Ack { ref msg_id } if msg_id == "m3-jr"));
    }

    #[test]
    fn coordinator_leave_triggers_election() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1, 2, 3]);
        drive(
            &mut n1,
            multicast(Envelope::new(3, Body::Coordinator).with_clock(clock_map(&[(3, 1)]))),
            &mut timer,
        );
        assert_eq!(n1.election.coordinator(), Some(3));
        n1.peer_net.acked.clear();

        drive(&mut n1, multicast(Envelope::new(3, Body::Leave).with_clock(clock_map(&[(3, 2)]))), &mut timer);
        assert!(!n1.known_nodes.contains(&3));
        // campaigning against the one remaining higher peer
        let (election, to) = n1.peer_net.sent.remove(0);
        assert!(matches!(election.body, Body::Election));
        assert_eq!(to, addr(2));
    }

    #[test]
    fn quit_pushes_state_then_leaves() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1, 2, 3]);
        drive(
            &mut n1,
            multicast(Envelope::new(3, Body::Coordinator).with_clock(clock_map(&[(3, 1)]))),
            &mut timer,
        );
        n1.peer_net.acked.clear();

        drive(&mut n1, Command::Quit.into(), &mut timer);
        let (sync, to) = n1.peer_net.acked.remove(0);
        assert!(matches!(sync.body, Body::LedgerSync { .. }));
        assert_eq!(to, addr(3));
        assert!(matches!(n1.group_net.sent.last().unwrap().body, Body::Leave));
        assert!(timer
            .armed_ticks()
            .iter()
            .any(|tick| matches!(tick, Tick::FinishShutdown)));

        drive(&mut n1, Tick::FinishShutdown.into(), &mut timer);
        assert!(n1.shutdown.is_cancelled());
    }

    #[test]
    fn request_rejected_when_we_cannot_sell() {
        let mut timer = RecordingTimer::default();
        let mut n2 = test_node_with_credits(2, &[1, 2], 10);
        // node 1 wants to buy 50 from us
        let request = Envelope::new(1, Body::TradeRequest {
            trade_id: "t1-2".into(),
            target_id: 2,
            amount: 50,
            trade_type: TradeRole::Buy,
        })
        .with_clock(clock_map(&[(1, 1)]));
        drive(&mut n2, unicast(request), &mut timer);

        let (response, _) = n2.peer_net.sent.remove(0);
        let Body::TradeResponse { accepted, reason, .. } = response.body else {
            panic!("expected trade response");
        };
        assert!(!accepted);
        assert!(reason.unwrap().contains("insufficient"));
        assert_eq!(n2.ledger.pending_count(), 0);
    }

    #[test]
    fn rejection_clears_proposer_pending() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1, 2]);
        drive(&mut n1, Command::Buy { target: 2, amount: 50 }.into(), &mut timer);
        let (request, _) = n1.peer_net.sent.remove(0);
        let Body::TradeRequest { trade_id, .. } = &request.body else {
            panic!("expected trade request");
        };
        assert_eq!(n1.ledger.pending_count(), 1);

        let response = Envelope::new(2, Body::TradeResponse {
            trade_id: trade_id.clone(),
            accepted: false,
            reason: Some("insufficient credits".into()),
        })
        .with_clock(clock_map(&[(1, 1), (2, 2)]));
        drive(&mut n1, unicast(response), &mut timer);
        assert_eq!(n1.ledger.pending_count(), 0);
        assert_eq!(n1.ledger.balance(), 100);
    }

    #[test]
    fn coordinator_relays_confirm_and_adjusts_registry() {
        let mut timer = RecordingTimer::default();
        let mut n3 = test_node(3, &[1, 2, 3]);
        drive(&mut n3, Command::Election.into(), &mut timer);
        for node in [1, 2] {
            let sync = Envelope::new(node, Body::LedgerSync {
                ledger_state: LedgerState::initial(node, 100),
            })
            .with_clock(clock_map(&[(node, 1)]))
            .with_msg_id(format!("m{node}-s"));
            drive(&mut n3, unicast(sync), &mut timer);
        }

        // n3 is the counterparty buying 30 from node 1
        let request = Envelope::new(1, Body::TradeRequest {
            trade_id: "t1-3".into(),
            target_id: 3,
            amount: 30,
            trade_type: TradeRole::Sell,
        })
        .with_clock(clock_map(&[(1, 2)]));
        drive(&mut n3, unicast(request), &mut timer);

        let confirm = Envelope::new(1, Body::TradeConfirm {
            trade_id: "t1-3".into(),
            success: true,
            buyer_id: 3,
            seller_id: 1,
            amount: 30,
        })
        .with_clock(clock_map(&[(1, 4), (3, 3)]))
        .with_msg_id("m1-cf".into());
        drive(&mut n3, unicast(confirm), &mut timer);

        assert_eq!(n3.ledger.balance(), 130);
        // relayed to the group for the other replicas
        assert!(matches!(
            n3.group_net.sent.last().unwrap().body,
            Body::TradeConfirm { .. }
        ));
        // registry adjusted ahead of the seller's own sync
        assert_eq!(n3.registry.get(1).unwrap().balance, 70);
        assert_eq!(n3.registry.get(3).unwrap().balance, 130);
    }

    #[test]
    fn heartbeat_does_not_touch_the_clock() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1, 2]);
        let before = n1.clock.snapshot();
        drive(
            &mut n1,
            multicast(Envelope::new(2, Body::Heartbeat { balance: Some(90) })),
            &mut timer,
        );
        assert_eq!(n1.clock.snapshot(), before);
        assert!(n1.detector.is_alive(2));
    }

    #[test]
    fn any_observed_message_registers_the_sender() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1]);
        let gossip = Envelope::new(9, Body::Gossip {
            ledger_state: LedgerState::initial(9, 80),
        })
        .with_clock(clock_map(&[(9, 1)]));
        drive(&mut n1, unicast(gossip), &mut timer);
        assert!(n1.known_nodes.contains(&9));
        assert_eq!(n1.registry.get(9).unwrap().balance, 80);
    }

    #[test]
    fn trade_to_unknown_node_is_refused() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1]);
        drive(&mut n1, Command::Sell { target: 2, amount: 10 }.into(), &mut timer);
        assert!(n1.peer_net.sent.is_empty());
        assert_eq!(n1.ledger.pending_count(), 0);
    }

    #[test]
    fn init_arms_periodic_timers_and_announces_join() {
        let mut timer = RecordingTimer::default();
        let mut n1 = test_node(1, &[1, 2]);
        drive(&mut n1, Tick::Init.into(), &mut timer);
        let ticks = timer.armed_ticks();
        for expected in [
            Tick::Drain,
            Tick::FailureCheck,
            Tick::Gossip,
            Tick::DedupPurge,
            Tick::StartupProbe,
            Tick::Heartbeat,
        ] {
            assert!(ticks.iter().any(|tick| **tick == expected), "missing {expected:?}");
        }
        assert!(matches!(n1.group_net.repeated.last().unwrap().body, Body::Join));
        // first heartbeat went out immediately, without a clock
        let heartbeat = n1.group_net.sent.last().unwrap();
        assert!(matches!(heartbeat.body, Body::Heartbeat { .. }));
        assert!(heartbeat.clock.is_none());
    }

    #[test]
    fn command_parse_accepts_the_operator_surface() {
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(Command::parse("balance").unwrap(), Some(Command::Balance));
        assert_eq!(
            Command::parse("sell 2 30").unwrap(),
            Some(Command::Sell { target: 2, amount: 30 })
        );
        assert_eq!(
            Command::parse("BUY 3 5").unwrap(),
            Some(Command::Buy { target: 3, amount: 5 })
        );
        assert_eq!(Command::parse("q").unwrap(), Some(Command::Quit));
        assert!(Command::parse("sell nope").is_err());
        assert!(Command::parse("frobnicate").is_err());
    }
}
