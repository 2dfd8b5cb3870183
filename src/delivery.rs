// hold-back buffer for causal deferral and the recent-msg-id dedup cache
use std::{
    collections::VecDeque,
    net::SocketAddr,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use tracing::debug;

use crate::{
    clock::ClockMap,
    message::{Envelope, NodeId},
};

/// FIFO of causal messages that failed the delivery predicate. Entries wait
/// until the drainer finds their dependencies satisfied.
#[derive(Debug, Default)]
pub struct HoldbackBuffer {
    entries: VecDeque<(Envelope, SocketAddr)>,
}

impl HoldbackBuffer {
    pub fn push(&mut self, envelope: Envelope, from: SocketAddr) {
        debug!(sender = envelope.sender, kind = envelope.body.kind(), "buffered for causal delivery");
        self.entries.push_back((envelope, from));
    }

    /// One scan: remove and return every entry the predicate now admits.
    /// Callers deliver the batch (which advances the clock) and re-scan until
    /// a pass yields nothing, since each delivery may unblock later entries.
    pub fn drain_deliverable(
        &mut self,
        mut can_deliver: impl FnMut(NodeId, Option<&ClockMap>) -> bool,
    ) -> Vec<(Envelope, SocketAddr)> {
        let mut deliverable = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some((envelope, from)) = self.entries.pop_front() {
            if can_deliver(envelope.sender, envelope.clock.as_ref()) {
                deliverable.push((envelope, from));
            } else {
                remaining.push_back((envelope, from));
            }
        }
        self.entries = remaining;
        deliverable
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub const DEDUP_TTL: Duration = Duration::from_secs(30);
const DEDUP_CAPACITY: usize = 4096;

/// Recent-msg-id table suppressing repeated multicast copies and re-sent
/// ACKed unicasts. TTL-evicted by a purge timer, capacity-bounded so a
/// missing purge cannot grow it without limit.
#[derive(Debug)]
pub struct DedupCache {
    seen: LruCache<String, Instant>,
    ttl: Duration,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_TTL)
    }
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(DEDUP_CAPACITY).unwrap()),
            ttl,
        }
    }

    /// Record the id and report whether it was already present.
    pub fn observe(&mut self, msg_id: &str, now: Instant) -> bool {
        if self.seen.contains(msg_id) {
            return true;
        }
        self.seen.put(msg_id.into(), now);
        false
    }

    pub fn purge(&mut self, now: Instant) {
        let expired = self
            .seen
            .iter()
            .filter(|(_, inserted)| now.duration_since(**inserted) >= self.ttl)
            .map(|(msg_id, _)| msg_id.clone())
            .collect::<Vec<_>>();
        for msg_id in expired {
            self.seen.pop(&msg_id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
