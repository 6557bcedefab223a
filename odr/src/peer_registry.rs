use core::cmp::Reverse;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use enum_map::EnumMap;
use enumset::EnumSet;
use itertools::Itertools as _;
use log::debug;
use parking_lot::Mutex;
use prometheus_metrics::Metrics;
use tokio::sync::watch;

use crate::{
    misc::{BlockHead, PeerId, RequestKind, SequenceId, ServerAnnouncement},
    odr_config::OdrConfig,
    score::{Outcome, Score},
};

/// A connected serving peer.
#[derive(Clone, Debug)]
pub struct Peer {
    peer_id: PeerId,
    head: BlockHead,
    capabilities: EnumSet<RequestKind>,
    costs: EnumMap<RequestKind, u64>,
    capacity: usize,
    reliability: Score,
    in_flight: HashSet<SequenceId>,
}

impl Peer {
    #[must_use]
    pub fn new(
        announcement: ServerAnnouncement,
        default_capacity: usize,
        reliability: Score,
    ) -> Self {
        let ServerAnnouncement {
            peer_id,
            head,
            capabilities,
            costs,
            capacity,
            ..
        } = announcement;

        Self {
            peer_id,
            head,
            capabilities,
            costs,
            capacity: capacity.unwrap_or(default_capacity).max(1),
            reliability,
            in_flight: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[must_use]
    pub const fn head(&self) -> BlockHead {
        self.head
    }

    #[must_use]
    pub fn serves(&self, kind: RequestKind) -> bool {
        self.capabilities.contains(kind)
    }

    #[must_use]
    pub fn cost(&self, kind: RequestKind) -> u64 {
        self.costs[kind]
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn reliability(&self) -> Score {
        self.reliability
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.capacity
    }
}

/// Connected serving peers and their live metadata.
///
/// Every operation takes the registry lock once, so operations are atomic with respect to each
/// other. Every mutation bumps a generation counter that can be watched with [`Self::subscribe`].
pub struct PeerRegistry {
    config: OdrConfig,
    peers: Mutex<BTreeMap<PeerId, Peer>>,
    generation: watch::Sender<u64>,
    metrics: Option<Arc<Metrics>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new(config: OdrConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            config,
            peers: Mutex::default(),
            generation: watch::Sender::new(0),
            metrics,
        }
    }

    /// Adds a peer after a successful handshake.
    ///
    /// A repeated handshake replaces the metadata but keeps outstanding dispatches attributed to
    /// the peer.
    pub fn add(&self, mut peer: Peer) {
        let peer_count = {
            let mut peers = self.peers.lock();

            if let Some(previous) = peers.remove(&peer.peer_id) {
                peer.in_flight = previous.in_flight;
            }

            debug!("serving peer added: {} (head: {})", peer.peer_id, peer.head.number);

            peers.insert(peer.peer_id, peer);
            peers.len()
        };

        self.update_connected_servers(peer_count);
        self.notify();
    }

    /// Removes a peer and returns the sequence ids of dispatches that were outstanding on it.
    pub fn remove(&self, peer_id: PeerId) -> Vec<SequenceId> {
        let (removed, peer_count) = {
            let mut peers = self.peers.lock();
            let removed = peers.remove(&peer_id);
            (removed, peers.len())
        };

        let Some(peer) = removed else {
            return vec![];
        };

        debug!(
            "serving peer removed: {peer_id} (outstanding dispatches: {})",
            peer.in_flight.len(),
        );

        self.update_connected_servers(peer_count);
        self.notify();

        peer.in_flight.into_iter().sorted().collect()
    }

    /// Returns snapshots of peers satisfying `predicate`, most reliable first.
    pub fn for_each(&self, predicate: impl Fn(&Peer) -> bool) -> Vec<Peer> {
        self.peers
            .lock()
            .values()
            .filter(|peer| predicate(peer))
            .sorted_by_key(|peer| (Reverse(peer.reliability), peer.peer_id))
            .cloned()
            .collect()
    }

    /// Returns the peer with capacity left that satisfies `predicate` and has the lowest cost.
    /// Ties are broken toward higher reliability.
    pub fn best(
        &self,
        predicate: impl Fn(&Peer) -> bool,
        cost: impl Fn(&Peer) -> u64,
    ) -> Option<PeerId> {
        Self::find_best(&self.peers.lock(), predicate, cost)
    }

    /// Like [`Self::best`], but also records a dispatch of `sequence_id` to the chosen peer under
    /// the same lock.
    pub fn reserve_best(
        &self,
        predicate: impl Fn(&Peer) -> bool,
        cost: impl Fn(&Peer) -> u64,
        sequence_id: SequenceId,
    ) -> Option<PeerId> {
        let peer_id = {
            let mut peers = self.peers.lock();
            let peer_id = Self::find_best(&peers, predicate, cost)?;

            peers
                .get_mut(&peer_id)?
                .in_flight
                .insert(sequence_id)
                .then_some(peer_id)?
        };

        self.notify();

        Some(peer_id)
    }

    /// Records a dispatch of `sequence_id` to `peer_id`.
    ///
    /// Returns `false` if the peer is unknown, has no capacity left, or already has the dispatch.
    pub fn reserve(&self, peer_id: PeerId, sequence_id: SequenceId) -> bool {
        let reserved = self
            .peers
            .lock()
            .get_mut(&peer_id)
            .filter(|peer| peer.has_capacity())
            .is_some_and(|peer| peer.in_flight.insert(sequence_id));

        if reserved {
            self.notify();
        }

        reserved
    }

    /// Resolves a dispatch. Returns `true` only for the first release of an outstanding dispatch.
    pub fn release(&self, peer_id: PeerId, sequence_id: SequenceId) -> bool {
        let released = self
            .peers
            .lock()
            .get_mut(&peer_id)
            .is_some_and(|peer| peer.in_flight.remove(&sequence_id));

        if released {
            self.notify();
        }

        released
    }

    pub fn update_head(&self, peer_id: PeerId, head: BlockHead) -> bool {
        let updated = self
            .peers
            .lock()
            .get_mut(&peer_id)
            .map(|peer| peer.head = head)
            .is_some();

        if updated {
            self.notify();
        }

        updated
    }

    pub fn record_outcome(&self, peer_id: PeerId, outcome: Outcome) -> Option<Score> {
        let reliability = self.peers.lock().get_mut(&peer_id).map(|peer| {
            peer.reliability = peer.reliability.apply(outcome, &self.config);
            peer.reliability
        });

        if reliability.is_some() {
            self.notify();
        }

        reliability
    }

    /// Returns a receiver that observes every registry mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    #[must_use]
    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.lock().contains_key(&peer_id)
    }

    #[must_use]
    pub fn get(&self, peer_id: PeerId) -> Option<Peer> {
        self.peers.lock().get(&peer_id).cloned()
    }

    #[must_use]
    pub fn in_flight(&self, peer_id: PeerId) -> Option<usize> {
        self.peers.lock().get(&peer_id).map(Peer::in_flight)
    }

    #[must_use]
    pub fn is_dispatched(&self, peer_id: PeerId, sequence_id: SequenceId) -> bool {
        self.peers
            .lock()
            .get(&peer_id)
            .is_some_and(|peer| peer.in_flight.contains(&sequence_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    fn find_best(
        peers: &BTreeMap<PeerId, Peer>,
        predicate: impl Fn(&Peer) -> bool,
        cost: impl Fn(&Peer) -> u64,
    ) -> Option<PeerId> {
        peers
            .values()
            .filter(|peer| peer.has_capacity() && predicate(peer))
            .min_by_key(|peer| (cost(peer), Reverse(peer.reliability), peer.peer_id))
            .map(Peer::peer_id)
    }

    fn notify(&self) {
        self.generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn update_connected_servers(&self, peer_count: usize) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_connected_servers(peer_count);
        }
    }
}
