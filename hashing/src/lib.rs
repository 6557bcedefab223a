use ethereum_types::H256;
use hex_literal::hex;
use tiny_keccak::{Hasher as _, Keccak};

/// `keccak256([])`. Accounts without code carry this code hash.
pub const KECCAK_EMPTY: H256 = H256(hex!(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
));

/// `keccak256(rlp([]))`. Headers of blocks without uncles carry this uncles hash.
pub const KECCAK_EMPTY_LIST_RLP: H256 = H256(hex!(
    "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
));

/// Root of an empty Merkle Patricia trie.
pub const EMPTY_TRIE_ROOT: H256 = H256(hex!(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
));

#[inline]
#[must_use]
pub fn keccak_256(bytes: impl AsRef<[u8]>) -> H256 {
    keccak_256_multiple(core::iter::once(bytes))
}

// Hashes the concatenation of `parts` without allocating it.
#[must_use]
pub fn keccak_256_multiple<I, B>(parts: I) -> H256
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Keccak::v256();
    let mut output = H256::zero();

    for part in parts {
        hasher.update(part.as_ref());
    }

    hasher.finalize(output.as_bytes_mut());

    output
}
