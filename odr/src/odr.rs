use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use database::Database;
use ethereum_types::H256;
use hashing::{EMPTY_TRIE_ROOT, KECCAK_EMPTY, KECCAK_EMPTY_LIST_RLP};
use log::{debug, warn};
use prometheus_metrics::Metrics;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{OdrError, ValidationError},
    misc::{BlockNumber, RequestKind},
    odr_config::OdrConfig,
    request::{RequestKey, Validator},
    result_cache::ResultCache,
    retrieve_manager::RetrieveManager,
};

const CACHE_KEY_PREFIX: &[u8] = b"odr/";

// RLP encodings of an empty list and of a body with no transactions and no uncles.
const EMPTY_RECEIPTS: &[u8] = &[0xc0];
const EMPTY_BODY: &[u8] = &[0xc2, 0xc0, 0xc0];

/// Header fields a verified query can be checked against.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct TrustedHeader {
    pub hash: H256,
    pub number: BlockNumber,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub uncles_hash: H256,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum OdrQuery {
    HeaderByHash {
        hash: H256,
        number: Option<BlockNumber>,
    },
    HeaderByNumber {
        number: BlockNumber,
    },
    BlockBody {
        header: TrustedHeader,
    },
    Receipts {
        header: TrustedHeader,
    },
    AccountProof {
        header: TrustedHeader,
        address_hash: H256,
    },
    StorageProof {
        header: TrustedHeader,
        address_hash: H256,
        storage_root: H256,
        key: H256,
    },
    Code {
        header: TrustedHeader,
        code_hash: H256,
    },
    TxStatus {
        hashes: Vec<H256>,
    },
}

impl OdrQuery {
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::HeaderByHash { .. } | Self::HeaderByNumber { .. } => RequestKind::Header,
            Self::BlockBody { .. } => RequestKind::Body,
            Self::Receipts { .. } => RequestKind::Receipts,
            Self::AccountProof { .. } | Self::StorageProof { .. } => RequestKind::StateProof,
            Self::Code { .. } => RequestKind::Code,
            Self::TxStatus { .. } => RequestKind::TxStatus,
        }
    }

    fn request_key(&self) -> RequestKey {
        match self {
            Self::HeaderByHash { hash, .. } => RequestKey::Hash(*hash),
            Self::HeaderByNumber { number } => RequestKey::Number(*number),
            Self::BlockBody { header } | Self::Receipts { header } => RequestKey::Hash(header.hash),
            Self::AccountProof {
                header,
                address_hash,
            } => RequestKey::Account {
                block_hash: header.hash,
                address_hash: *address_hash,
            },
            Self::StorageProof {
                header,
                address_hash,
                key,
                ..
            } => RequestKey::Storage {
                block_hash: header.hash,
                address_hash: *address_hash,
                key: *key,
            },
            Self::Code { header, code_hash } => RequestKey::Code {
                block_hash: header.hash,
                code_hash: *code_hash,
            },
            Self::TxStatus { hashes } => RequestKey::Transactions(hashes.clone()),
        }
    }

    // Peers must have at least this block to serve the query.
    const fn min_block_number(&self) -> Option<BlockNumber> {
        match self {
            Self::HeaderByHash { number, .. } => *number,
            Self::HeaderByNumber { number } => Some(*number),
            Self::BlockBody { header }
            | Self::Receipts { header }
            | Self::AccountProof { header, .. }
            | Self::StorageProof { header, .. }
            | Self::Code { header, .. } => Some(header.number),
            Self::TxStatus { .. } => None,
        }
    }

    // Answers that follow from the trusted data alone.
    fn local_answer(&self) -> Option<Bytes> {
        match self {
            Self::Code { code_hash, .. } if *code_hash == KECCAK_EMPTY => Some(Bytes::new()),
            Self::Receipts { header } if header.receipts_root == EMPTY_TRIE_ROOT => {
                Some(Bytes::from_static(EMPTY_RECEIPTS))
            }
            Self::BlockBody { header }
                if header.transactions_root == EMPTY_TRIE_ROOT
                    && header.uncles_hash == KECCAK_EMPTY_LIST_RLP =>
            {
                Some(Bytes::from_static(EMPTY_BODY))
            }
            _ => None,
        }
    }

    // Only content-addressed results are cached.
    fn cache_key(&self) -> Option<Vec<u8>> {
        let hash = match self {
            Self::HeaderByHash { hash, .. } => hash,
            Self::BlockBody { header } | Self::Receipts { header } => &header.hash,
            Self::Code { code_hash, .. } => code_hash,
            Self::HeaderByNumber { .. }
            | Self::AccountProof { .. }
            | Self::StorageProof { .. }
            | Self::TxStatus { .. } => return None,
        };

        let kind: &str = self.kind().into();

        Some([CACHE_KEY_PREFIX, kind.as_bytes(), b"/", hash.as_bytes()].concat())
    }
}

/// Verification of payloads that cannot be checked by hashing alone.
pub trait ChainVerifier: Send + Sync {
    fn verify_header_by_number(
        &self,
        number: BlockNumber,
        header: &[u8],
    ) -> Result<(), ValidationError>;

    fn verify_body(&self, header: &TrustedHeader, body: &[u8]) -> Result<(), ValidationError>;

    fn verify_receipts(
        &self,
        header: &TrustedHeader,
        receipts: &[u8],
    ) -> Result<(), ValidationError>;

    fn verify_account_proof(
        &self,
        state_root: H256,
        address_hash: H256,
        proof: &[u8],
    ) -> Result<(), ValidationError>;

    fn verify_storage_proof(
        &self,
        storage_root: H256,
        key: H256,
        proof: &[u8],
    ) -> Result<(), ValidationError>;

    fn verify_tx_status(&self, hashes: &[H256], status: &[u8]) -> Result<(), ValidationError>;
}

/// Entry point for chain and state logic.
///
/// Every returned payload has passed the validator built for its query.
pub struct LightOdr {
    retrieve_manager: Arc<RetrieveManager>,
    verifier: Arc<dyn ChainVerifier>,
    cache: Option<ResultCache>,
    metrics: Option<Arc<Metrics>>,
}

impl LightOdr {
    /// Verified results are cached in `database` if `cache_verified_results` is enabled.
    pub fn new(
        config: OdrConfig,
        retrieve_manager: Arc<RetrieveManager>,
        verifier: Arc<dyn ChainVerifier>,
        database: Option<Arc<Database>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let cache = database
            .filter(|_| config.cache_verified_results)
            .map(|database| ResultCache::new(database, config.max_cached_results))
            .transpose()?;

        Ok(Self {
            retrieve_manager,
            verifier,
            cache,
            metrics,
        })
    }

    pub async fn fetch(&self, query: OdrQuery) -> Result<Bytes, OdrError> {
        self.fetch_with_cancel(query, &CancellationToken::new())
            .await
    }

    pub async fn fetch_with_cancel(
        &self,
        query: OdrQuery,
        cancel: &CancellationToken,
    ) -> Result<Bytes, OdrError> {
        if let Some(payload) = query.local_answer() {
            return Ok(payload);
        }

        let cache_key = query.cache_key();

        if let Some(payload) = self.load_cached(&query, cache_key.as_deref()) {
            return Ok(payload);
        }

        let mut request = self
            .retrieve_manager
            .new_request(query.kind(), query.request_key());

        if let Some(number) = query.min_block_number() {
            request = request.with_min_block_number(number);
        }

        let validator = self.validator(&query);

        let payload = self
            .retrieve_manager
            .retrieve_with_cancel(request, validator, None, cancel)
            .await?;

        if let Some(key) = cache_key {
            self.store_cached(&key, &payload);
        }

        Ok(payload)
    }

    /// Cancels every query in progress and waits for them to release their peers.
    pub async fn stop(&self) {
        self.retrieve_manager.stop().await;
    }

    fn validator(&self, query: &OdrQuery) -> Validator {
        let verifier = Arc::clone(&self.verifier);

        match query.clone() {
            OdrQuery::HeaderByHash { hash, .. } => {
                Box::new(move |header: &[u8]| verify_hash(hash, header))
            }
            OdrQuery::HeaderByNumber { number } => Box::new(move |header: &[u8]| {
                verifier.verify_header_by_number(number, header)
            }),
            OdrQuery::BlockBody { header } => {
                Box::new(move |body: &[u8]| verifier.verify_body(&header, body))
            }
            OdrQuery::Receipts { header } => {
                Box::new(move |receipts: &[u8]| verifier.verify_receipts(&header, receipts))
            }
            OdrQuery::AccountProof {
                header,
                address_hash,
            } => Box::new(move |proof: &[u8]| {
                verifier.verify_account_proof(header.state_root, address_hash, proof)
            }),
            OdrQuery::StorageProof {
                storage_root, key, ..
            } => Box::new(move |proof: &[u8]| {
                verifier.verify_storage_proof(storage_root, key, proof)
            }),
            OdrQuery::Code { code_hash, .. } => {
                Box::new(move |code: &[u8]| verify_hash(code_hash, code))
            }
            OdrQuery::TxStatus { hashes } => {
                Box::new(move |status: &[u8]| verifier.verify_tx_status(&hashes, status))
            }
        }
    }

    fn load_cached(&self, query: &OdrQuery, key: Option<&[u8]>) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        let key = key?;

        match cache.get(key) {
            Ok(Some(payload)) => {
                debug!("answering {query:?} from cache");

                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.register_cache_hit(query.kind().into());
                }

                Some(payload.into())
            }
            Ok(None) => None,
            Err(error) => {
                warn!("failed to read cached ODR result: {error:?}");
                None
            }
        }
    }

    fn store_cached(&self, key: &[u8], payload: &[u8]) {
        if let Some(cache) = self.cache.as_ref() {
            if let Err(error) = cache.insert(key, payload) {
                warn!("failed to cache verified ODR result: {error:?}");
            }
        }
    }
}

fn verify_hash(expected: H256, payload: &[u8]) -> Result<(), ValidationError> {
    let actual = hashing::keccak_256(payload);

    if actual == expected {
        Ok(())
    } else {
        Err(ValidationError::Invalid(anyhow!(
            "hash mismatch (expected: {expected:?}, actual: {actual:?})",
        )))
    }
}
