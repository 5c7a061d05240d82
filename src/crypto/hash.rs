// Cryptographic hashing wrapper
use sha2::{Digest, Sha256};

/// SHA-256: used for block hashing and proof-of-work.
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lower-case hex rendering of a SHA-256 digest.
pub fn hash_sha256_hex(data: &[u8]) -> String {
    hex::encode(hash_sha256(data))
}
