// Data structures: Block
//
// Canonical hash input is the plain concatenation
//   decimal(index) | previous_hash | decimal(timestamp) | data | decimal(difficulty) | nonce
// with no separators. This exact form is pinned by the wire format: two
// peers mining on the same data must arrive at the same hash.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::hash::hash_sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: i64,
    pub data: Vec<u8>,
    pub difficulty: u32,
    pub nonce: String,
    pub hash: String,
}

impl Block {
    /// The canonical hash-input string described above.
    fn canonical_string(&self) -> String {
        let mut s = String::with_capacity(64 + self.data.len() + self.nonce.len());
        s.push_str(&self.index.to_string());
        s.push_str(&self.previous_hash);
        s.push_str(&self.timestamp.to_string());
        s.push_str(&String::from_utf8_lossy(&self.data));
        s.push_str(&self.difficulty.to_string());
        s.push_str(&self.nonce);
        s
    }

    /// Recomputes this block's hash from its fields, independent of the
    /// `hash` field currently stored on it.
    pub fn recompute_hash(&self) -> String {
        hash_sha256_hex(self.canonical_string().as_bytes())
    }

    /// True if `hash` is self-consistent: it recomputes to itself.
    pub fn has_self_consistent_hash(&self) -> bool {
        self.hash == self.recompute_hash()
    }

    /// True if `hash` meets its own proof-of-work difficulty target.
    pub fn meets_difficulty(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    /// Genesis block: index 0, empty previous hash, literal data, mined at
    /// the given timestamp and difficulty.
    pub fn genesis(timestamp: i64, difficulty: u32) -> Block {
        let mut b = Block {
            index: 0,
            previous_hash: String::new(),
            timestamp,
            data: b"Genesis Block".to_vec(),
            difficulty,
            nonce: String::new(),
            hash: String::new(),
        };
        b.mine();
        b
    }

    /// Builds and mines a new block linked to `previous`.
    pub fn create(previous: &Block, data: Vec<u8>, difficulty: u32) -> Block {
        let timestamp = now_unix();
        let mut b = Block {
            index: previous.index + 1,
            previous_hash: previous.hash.clone(),
            timestamp,
            data,
            difficulty,
            nonce: String::new(),
            hash: String::new(),
        };
        b.mine();
        b
    }

    /// Brute-force nonce search: tries `nonce = 0, 1, 2, ...` (rendered as
    /// lower-case hex) until the resulting hash has `difficulty` leading
    /// zero hex digits. Mutates `nonce` and `hash` in place.
    fn mine(&mut self) {
        let mut i: u64 = 0;
        loop {
            self.nonce = format!("{i:x}");
            let hash = self.recompute_hash();
            if meets_difficulty(&hash, self.difficulty) {
                self.hash = hash;
                return;
            }
            i = i.wrapping_add(1);
        }
    }
}

/// True if `hash` has at least `difficulty` leading `'0'` hex characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.as_bytes()[..difficulty].iter().all(|&b| b == b'0')
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_mining_determinism() {
        let g = Block::genesis(1_600_000_000, 1);
        assert!(g.hash.starts_with('0'));
        assert_eq!(g.hash, g.recompute_hash());
        assert!(g.meets_difficulty());
    }

    #[test]
    fn test_create_links_to_previous() {
        let g = Block::genesis(1_600_000_000, 1);
        let b1 = Block::create(&g, b"hello".to_vec(), 1);
        assert_eq!(b1.index, g.index + 1);
        assert_eq!(b1.previous_hash, g.hash);
        assert!(b1.has_self_consistent_hash());
        assert!(b1.meets_difficulty());
    }

    #[test]
    fn test_recompute_hash_detects_tampering() {
        let g = Block::genesis(1_600_000_000, 1);
        let mut tampered = g.clone();
        tampered.data = b"tampered".to_vec();
        assert!(!tampered.has_self_consistent_hash());
    }

    #[test]
    fn test_meets_difficulty_zero_always_true() {
        assert!(meets_difficulty("ffffffff", 0));
    }

    #[test]
    fn test_meets_difficulty_checks_prefix() {
        assert!(meets_difficulty("00abc", 2));
        assert!(!meets_difficulty("0abc", 2));
    }

    #[test]
    fn test_canonical_string_has_no_separators() {
        let b = Block {
            index: 1,
            previous_hash: "ph".to_string(),
            timestamp: 2,
            data: b"d".to_vec(),
            difficulty: 3,
            nonce: "n".to_string(),
            hash: String::new(),
        };
        assert_eq!(b.canonical_string(), "1ph2d3n");
    }
}
