pub use crate::{
    error::{OdrError, RetrieveError, ValidationError},
    messages::{NetworkToOdr, OdrToNetwork},
    misc::{
        BlockHead, BlockNumber, DialFailure, DiscoveredServer, NodeAddress, PeerId, RequestKind,
        SequenceId, ServerAnnouncement, Topic, UnixSeconds,
    },
    odr::{ChainVerifier, LightOdr, OdrQuery, TrustedHeader},
    odr_config::OdrConfig,
    peer_registry::{Peer, PeerRegistry},
    request::{Request, RequestKey, Response, Validator},
    request_distributor::{default_eligibility, RequestDistributor, Selection},
    result_cache::ResultCache,
    retrieve_manager::RetrieveManager,
    score::{Outcome, Score},
    server_pool::{DialState, ServerPool, ServerPoolEntry},
    service::{les_topic, LightService},
};

mod error;
mod messages;
mod misc;
mod odr;
mod odr_config;
mod peer_registry;
mod request;
mod request_distributor;
mod result_cache;
mod retrieve_manager;
mod score;
mod server_pool;
mod service;
