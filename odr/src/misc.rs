use core::net::SocketAddr;

use derive_more::{Display, From};
use enum_map::{Enum, EnumMap};
use enumset::{EnumSet, EnumSetType};
use ethereum_types::{H256, H512};
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

pub type BlockNumber = u64;
pub type SequenceId = u64;
pub type UnixSeconds = u64;

#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Debug,
    Display,
    From,
    Deserialize,
    Serialize,
)]
pub struct PeerId(H512);

impl PeerId {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == H512::len_bytes()).then(|| Self(H512::from_slice(bytes)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BlockHead {
    pub hash: H256,
    pub number: BlockNumber,
}

#[derive(Debug, Hash, Enum, EnumSetType, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RequestKind {
    Header,
    Body,
    Receipts,
    StateProof,
    Code,
    TxStatus,
}

/// Network topic that discovered servers are advertised under.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, From, Deserialize, Serialize)]
pub struct Topic(String);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct NodeAddress {
    pub peer_id: PeerId,
    pub address: SocketAddr,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DiscoveredServer {
    pub topic: Topic,
    pub node: NodeAddress,
}

/// Handshake data of a serving peer.
#[derive(Clone, Debug)]
pub struct ServerAnnouncement {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    pub head: BlockHead,
    pub capabilities: EnumSet<RequestKind>,
    pub costs: EnumMap<RequestKind, u64>,
    pub capacity: Option<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DialFailure {
    Unreachable,
    HandshakeFailed,
    WrongNetwork,
    TooManyPeers,
}
