use bytes::Bytes;
use ethereum_types::H256;
use tokio::time::Instant;

use crate::{
    error::ValidationError,
    misc::{BlockNumber, PeerId, RequestKind, SequenceId},
    peer_registry::Peer,
};

pub type Validator = Box<dyn Fn(&[u8]) -> Result<(), ValidationError> + Send + Sync>;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RequestKey {
    Hash(H256),
    Number(BlockNumber),
    Account {
        block_hash: H256,
        address_hash: H256,
    },
    Storage {
        block_hash: H256,
        address_hash: H256,
        key: H256,
    },
    Code {
        block_hash: H256,
        code_hash: H256,
    },
    Transactions(Vec<H256>),
}

/// A single logical retrieval.
///
/// Requests are created by [`RetrieveManager::new_request`], which assigns the sequence id that
/// the serving peer has to echo back in its response.
///
/// [`RetrieveManager::new_request`]: crate::RetrieveManager::new_request
#[derive(Clone, Debug)]
pub struct Request {
    kind: RequestKind,
    key: RequestKey,
    min_block_number: Option<BlockNumber>,
    sequence_id: SequenceId,
    created_at: Instant,
}

impl Request {
    pub(crate) fn new(kind: RequestKind, key: RequestKey, sequence_id: SequenceId) -> Self {
        Self {
            kind,
            key,
            min_block_number: None,
            sequence_id,
            created_at: Instant::now(),
        }
    }

    /// Restricts the request to peers whose head is at least `number`.
    #[must_use]
    pub const fn with_min_block_number(mut self, number: BlockNumber) -> Self {
        self.min_block_number = Some(number);
        self
    }

    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    #[must_use]
    pub const fn key(&self) -> &RequestKey {
        &self.key
    }

    #[must_use]
    pub const fn min_block_number(&self) -> Option<BlockNumber> {
        self.min_block_number
    }

    #[must_use]
    pub const fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn can_be_served_by(&self, peer: &Peer) -> bool {
        peer.serves(self.kind)
            && self
                .min_block_number
                .is_none_or(|number| peer.head().number >= number)
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub sequence_id: SequenceId,
    pub peer_id: PeerId,
    pub payload: Bytes,
    pub received_at: Instant,
}

impl Response {
    #[must_use]
    pub fn new(sequence_id: SequenceId, peer_id: PeerId, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            peer_id,
            payload: payload.into(),
            received_at: Instant::now(),
        }
    }
}
