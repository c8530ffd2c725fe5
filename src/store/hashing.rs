//! Bitcoin-compatible hashing for headers and blocks.

use sha2::{Digest, Sha256};

/// Calculate Bitcoin double SHA256 hash.
///
/// Used for block/header hashes and for linking headers by their
/// previous-hash field.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Double SHA256 of `data`, byte-reversed.
///
/// Upstream nodes report block hashes as hex strings in reversed byte
/// order; this produces bytes that compare equal to the decoded form of
/// those strings.
pub fn hash_rev(data: &[u8]) -> [u8; 32] {
    let mut out = sha256d(data);
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mainnet genesis header, wire encoding.
    const GENESIS_HEADER_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
    const GENESIS_HASH_HEX: &str =
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

    #[test]
    fn test_sha256d_differs_from_single_pass() {
        let result = sha256d(b"hello world");
        assert_eq!(result.len(), 32);

        let single = Sha256::digest(b"hello world");
        assert_ne!(result.as_slice(), single.as_slice());
    }

    #[test]
    fn test_hash_rev_genesis_vector() {
        let header = hex::decode(GENESIS_HEADER_HEX).unwrap();
        assert_eq!(header.len(), 80);

        let hash = hash_rev(&header);
        assert_eq!(hex::encode(hash), GENESIS_HASH_HEX);
    }

    #[test]
    fn test_hash_rev_is_reversed_sha256d() {
        let data = b"deterministic test";
        let mut fwd = sha256d(data);
        fwd.reverse();
        assert_eq!(fwd, hash_rev(data));
    }
}
