use std::{collections::HashSet, sync::Arc};

use crate::{
    misc::{PeerId, RequestKind},
    peer_registry::{Peer, PeerRegistry},
    request::Request,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Selection {
    /// The request has been recorded as in flight on this peer.
    Selected(PeerId),
    /// No eligible untried peer has capacity right now.
    NotYetAvailable {
        /// Connected peers that pass the eligibility predicate.
        eligible: usize,
        /// Eligible peers that have not been tried for this request.
        untried: usize,
    },
}

impl Selection {
    /// Every currently eligible peer has already been tried.
    #[must_use]
    pub const fn is_exhausted(self) -> bool {
        matches!(self, Self::NotYetAvailable { eligible, untried } if eligible > 0 && untried == 0)
    }
}

/// Eligibility used for every retrieval: the peer serves the request kind and its head is recent
/// enough.
#[must_use]
pub fn default_eligibility(peer: &Peer, request: &Request) -> bool {
    request.can_be_served_by(peer)
}

pub struct RequestDistributor {
    registry: Arc<PeerRegistry>,
}

impl RequestDistributor {
    #[must_use]
    pub const fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Picks the cheapest eligible peer not in `tried` and reserves it for `request`.
    pub fn distribute(
        &self,
        request: &Request,
        eligibility: impl Fn(&Peer, &Request) -> bool,
        tried: &HashSet<PeerId>,
    ) -> Selection {
        let kind = request.kind();
        let candidate =
            |peer: &Peer| !tried.contains(&peer.peer_id()) && eligibility(peer, request);

        if let Some(peer_id) = self.registry.reserve_best(
            candidate,
            |peer| Self::estimated_cost(peer, kind),
            request.sequence_id(),
        ) {
            return Selection::Selected(peer_id);
        }

        let eligible = self.registry.for_each(|peer| eligibility(peer, request));
        let untried = eligible
            .iter()
            .filter(|peer| !tried.contains(&peer.peer_id()))
            .count();

        Selection::NotYetAvailable {
            eligible: eligible.len(),
            untried,
        }
    }

    /// Declared cost of `kind` scaled by the load the peer would have after the dispatch.
    #[must_use]
    pub fn estimated_cost(peer: &Peer, kind: RequestKind) -> u64 {
        let load = u64::try_from(peer.in_flight()).unwrap_or(u64::MAX);
        peer.cost(kind).saturating_mul(load.saturating_add(1))
    }
}
