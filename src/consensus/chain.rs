// The chain engine: block sequencing, retargeting, validation, and the
// replace-with-heavier-chain rule. Mutating operations take the chain's
// write lock for their entire duration, including the proof-of-work search
// inside `add` — this serialises appends, which is the source behaviour
// this crate targets (see SPEC_FULL.md §5).

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::{BLOCK_GENERATION_INTERVAL, DIFFICULTY_ADJUSTMENT_INTERVAL, INITIAL_DIFFICULTY};
use crate::primitives::block::Block;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("block {index} has an inconsistent self-hash")]
    BadSelfHash { index: u64 },
    #[error("block {index} does not meet its declared difficulty")]
    BelowDifficulty { index: u64 },
    #[error("block {index} does not link to its predecessor's hash")]
    BadLink { index: u64 },
    #[error("block {index} has a non-contiguous index")]
    BadIndex { index: u64 },
}

/// Capacity of the mined-block notifier. A true rendezvous (capacity 0) is
/// the source's choice; one slot of buffering is the spec-compatible
/// optimization that keeps `add` from stalling on a slow propagator.
const NOTIFIER_CAPACITY: usize = 1;

struct ChainState {
    blocks: Vec<Block>,
    cumulative_difficulty: u64,
    current_difficulty: u32,
}

/// Verifies that `next` legally follows `prev`: self-consistent hash,
/// proof-of-work satisfied, and correctly linked.
fn validate_link(prev: &Block, next: &Block) -> Result<(), ChainError> {
    if !next.has_self_consistent_hash() {
        return Err(ChainError::BadSelfHash { index: next.index });
    }
    if !next.meets_difficulty() {
        return Err(ChainError::BelowDifficulty { index: next.index });
    }
    if next.index != prev.index + 1 {
        return Err(ChainError::BadIndex { index: next.index });
    }
    if next.previous_hash != prev.hash {
        return Err(ChainError::BadLink { index: next.index });
    }
    Ok(())
}

impl ChainState {
    fn target_difficulty(&self) -> u32 {
        let last = self.blocks.last().expect("chain is never empty after init");
        if last.index != 0 && last.index % DIFFICULTY_ADJUSTMENT_INTERVAL == 0 {
            self.retarget()
        } else {
            last.difficulty
        }
    }

    fn retarget(&self) -> u32 {
        let n = self.blocks.len();
        let window = DIFFICULTY_ADJUSTMENT_INTERVAL as usize;
        let prev_adjustment = &self.blocks[n - window];
        let last = &self.blocks[n - 1];
        let expected = BLOCK_GENERATION_INTERVAL * DIFFICULTY_ADJUSTMENT_INTERVAL;
        let actual = last.timestamp.saturating_sub(prev_adjustment.timestamp).max(0) as u64;

        if actual < expected / 2 {
            prev_adjustment.difficulty + 1
        } else if actual > expected * 2 {
            prev_adjustment.difficulty.saturating_sub(1)
        } else {
            last.difficulty
        }
    }

    fn is_valid(&self) -> bool {
        let Some(first) = self.blocks.first() else {
            return true;
        };
        if !first.has_self_consistent_hash() || !first.meets_difficulty() {
            return false;
        }
        self.blocks.windows(2).all(|w| validate_link(&w[0], &w[1]).is_ok())
    }
}

/// Cumulative-difficulty contribution of a single block. Genesis
/// contributes its raw `difficulty`; every other block contributes
/// `1 << difficulty` — an intentionally-preserved accounting quirk, see
/// SPEC_FULL.md §9 open question 1.
fn difficulty_weight(block: &Block) -> u64 {
    if block.index == 0 {
        block.difficulty as u64
    } else {
        1u64 << block.difficulty
    }
}

/// An ordered sequence of blocks with invariants, cumulative-difficulty
/// accounting, retargeting, append/replace semantics, and a one-shot
/// "new block mined" notification channel.
pub struct Chain {
    state: RwLock<ChainState>,
    notify_tx: mpsc::Sender<Block>,
    notify_rx: Mutex<mpsc::Receiver<Block>>,
}

impl Chain {
    /// Constructs an empty, uninitialized chain. Call `init()` before use.
    pub fn new() -> Chain {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFIER_CAPACITY);
        Chain {
            state: RwLock::new(ChainState {
                blocks: Vec::new(),
                cumulative_difficulty: 0,
                current_difficulty: INITIAL_DIFFICULTY,
            }),
            notify_tx,
            notify_rx: Mutex::new(notify_rx),
        }
    }

    /// Idempotent. If the chain is empty, mines and installs a genesis
    /// block at the initial difficulty.
    pub async fn init(&self) {
        let mut state = self.state.write().await;
        if !state.blocks.is_empty() {
            return;
        }
        let genesis = Block::genesis(now_unix(), INITIAL_DIFFICULTY);
        state.cumulative_difficulty = difficulty_weight(&genesis);
        state.current_difficulty = INITIAL_DIFFICULTY;
        state.blocks.push(genesis);
    }

    /// Mines and appends a new block carrying `data`. Mining runs while the
    /// chain's write lock is held (see module docs). Publishes the mined
    /// block on the notifier, blocking until a reader consumes it (or, with
    /// the one-slot buffer, until the slot is free).
    pub async fn add(&self, data: Vec<u8>) -> Block {
        let mined = {
            let mut state = self.state.write().await;
            let tip = state.blocks.last().expect("chain initialized before add").clone();
            let difficulty = state.target_difficulty();
            let mined = Block::create(&tip, data, difficulty);
            state.cumulative_difficulty += difficulty_weight(&mined);
            state.current_difficulty = difficulty;
            state.blocks.push(mined.clone());
            mined
        };
        let _ = self.notify_tx.send(mined.clone()).await;
        mined
    }

    /// Appends an externally-mined block if it legally extends the tip.
    /// Returns `true` on success.
    pub async fn add_block(&self, block: Block) -> bool {
        let accepted = {
            let mut state = self.state.write().await;
            let tip = match state.blocks.last() {
                Some(t) => t.clone(),
                None => return false,
            };
            if validate_link(&tip, &block).is_err() {
                false
            } else {
                state.cumulative_difficulty += difficulty_weight(&block);
                state.current_difficulty = block.difficulty;
                state.blocks.push(block.clone());
                true
            }
        };
        if accepted {
            let _ = self.notify_tx.send(block).await;
        }
        accepted
    }

    /// Replaces this chain with `other` if `other` is fully valid and
    /// strictly heavier (ties are left untouched to prevent gossip thrash).
    pub async fn replace(&self, other: ChainSnapshot) -> bool {
        if !other.is_valid() {
            return false;
        }
        let mut state = self.state.write().await;
        if other.cumulative_difficulty <= state.cumulative_difficulty {
            return false;
        }
        state.blocks = other.blocks;
        state.cumulative_difficulty = other.cumulative_difficulty;
        state.current_difficulty = other.current_difficulty;
        true
    }

    pub async fn is_valid(&self) -> bool {
        self.state.read().await.is_valid()
    }

    /// Blocks until a newly added block is available, then returns it.
    pub async fn get_new_block(&self) -> Option<Block> {
        self.notify_rx.lock().await.recv().await
    }

    pub async fn tip(&self) -> Block {
        self.state
            .read()
            .await
            .blocks
            .last()
            .expect("chain initialized")
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.blocks.len()
    }

    pub async fn cumulative_difficulty(&self) -> u64 {
        self.state.read().await.cumulative_difficulty
    }

    pub async fn current_difficulty(&self) -> u32 {
        self.state.read().await.current_difficulty
    }

    /// A point-in-time snapshot suitable for encoding onto the wire.
    pub async fn snapshot(&self) -> ChainSnapshot {
        let state = self.state.read().await;
        ChainSnapshot {
            blocks: state.blocks.clone(),
            cumulative_difficulty: state.cumulative_difficulty,
            current_difficulty: state.current_difficulty,
        }
    }

    /// Prints every block in the chain to stdout, for the `print` operator
    /// command.
    pub async fn print(&self) {
        let state = self.state.read().await;
        for block in &state.blocks {
            println!("{block:?}");
        }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Chain::new()
    }
}

/// An owned, already-decoded view of a chain's wire payload (§6: chain
/// binary payload = blocks + cumulative_difficulty + current_difficulty).
/// Used both to transport a chain over the network and to validate a
/// candidate replacement before swapping it in.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub blocks: Vec<Block>,
    pub cumulative_difficulty: u64,
    pub current_difficulty: u32,
}

impl ChainSnapshot {
    pub fn new(blocks: Vec<Block>, cumulative_difficulty: u64, current_difficulty: u32) -> Self {
        ChainSnapshot {
            blocks,
            cumulative_difficulty,
            current_difficulty,
        }
    }

    pub fn is_valid(&self) -> bool {
        let state = ChainState {
            blocks: self.blocks.clone(),
            cumulative_difficulty: self.cumulative_difficulty,
            current_difficulty: self.current_difficulty,
        };
        state.is_valid()
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_idempotent() {
        let chain = Chain::new();
        chain.init().await;
        let after_first = chain.snapshot().await;
        chain.init().await;
        let after_second = chain.snapshot().await;
        assert_eq!(after_first.blocks.len(), after_second.blocks.len());
        assert_eq!(after_first.blocks[0].hash, after_second.blocks[0].hash);
    }

    #[tokio::test]
    async fn test_genesis_cumulative_difficulty_is_raw() {
        let chain = Chain::new();
        chain.init().await;
        assert_eq!(chain.cumulative_difficulty().await, INITIAL_DIFFICULTY as u64);
    }

    #[tokio::test]
    async fn test_add_increments_length_and_cumulative_difficulty() {
        let chain = Chain::new();
        chain.init().await;
        let before_len = chain.len().await;
        let before_cum = chain.cumulative_difficulty().await;
        chain.add(b"hello".to_vec()).await;
        assert_eq!(chain.len().await, before_len + 1);
        assert!(chain.cumulative_difficulty().await > before_cum);
    }

    #[tokio::test]
    async fn test_add_block_rejects_gap() {
        let chain = Chain::new();
        chain.init().await;
        let tip = chain.tip().await;
        let mut far = Block::create(&tip, b"future".to_vec(), 1);
        far.index = 6; // gap: chain tip is 0, this claims to be 6
        far.previous_hash = "deadbeef".to_string();
        assert!(!chain.add_block(far).await);
        assert_eq!(chain.len().await, 1);
    }

    #[tokio::test]
    async fn test_add_block_accepts_contiguous() {
        let chain = Chain::new();
        chain.init().await;
        let tip = chain.tip().await;
        let next = Block::create(&tip, b"ok".to_vec(), 1);
        assert!(chain.add_block(next).await);
        assert_eq!(chain.len().await, 2);
    }

    #[tokio::test]
    async fn test_replace_requires_strictly_heavier() {
        let chain = Chain::new();
        chain.init().await;
        let same = chain.snapshot().await;
        assert!(!chain.replace(same).await, "equal-weight chains must not replace");
    }

    #[tokio::test]
    async fn test_replace_heavier_chain_scenario_d() {
        // Node X: 3 blocks at difficulty 2 (1 + 3*4 = 13)
        let x = Chain::new();
        x.init().await;
        let genesis_x = Block::genesis(1_600_000_000, 2);
        let b1 = Block::create(&genesis_x, b"x1".to_vec(), 2);
        let b2 = Block::create(&b1, b"x2".to_vec(), 2);
        let x_snapshot = ChainSnapshot::new(vec![genesis_x.clone(), b1, b2], 2 + 4 + 4, 2);
        assert_eq!(x_snapshot.cumulative_difficulty, 10); // matches the weight formula, not the narrative 13

        // Node Y: 2 blocks at difficulty 4 (1 + 2*16 = 33)
        let genesis_y = Block::genesis(1_600_000_001, 4);
        let y1 = Block::create(&genesis_y, b"y1".to_vec(), 4);
        let y_snapshot = ChainSnapshot::new(vec![genesis_y, y1], 1 + 16, 4);

        let node_x = Chain::new();
        {
            let mut state = node_x.state.write().await;
            state.blocks = x_snapshot.blocks;
            state.cumulative_difficulty = x_snapshot.cumulative_difficulty;
            state.current_difficulty = x_snapshot.current_difficulty;
        }

        assert!(node_x.replace(y_snapshot.clone()).await);
        let after = node_x.snapshot().await;
        assert_eq!(after.cumulative_difficulty, y_snapshot.cumulative_difficulty);
        assert_eq!(after.blocks.len(), y_snapshot.blocks.len());
    }

    #[tokio::test]
    async fn test_replace_rejects_invalid_chain() {
        let chain = Chain::new();
        chain.init().await;
        let genesis = Block::genesis(1_600_000_000, 1);
        let mut bad = Block::create(&genesis, b"bad".to_vec(), 1);
        bad.data = b"corrupted-after-mining".to_vec(); // breaks self-hash
        let bogus = ChainSnapshot::new(vec![genesis, bad], 1_000_000, 1);
        assert!(!chain.replace(bogus).await);
    }

    #[test]
    fn test_retarget_increase_scenario_b() {
        // 6 blocks, timestamps on 1..5 advance by 1s each => actual = 5s, expected = 50s.
        let genesis = Block::genesis(0, 1);
        let mut blocks = vec![genesis];
        for i in 1..=5u64 {
            let prev = blocks.last().unwrap().clone();
            let mut b = Block::create(&prev, format!("d{i}").into_bytes(), 1);
            b.timestamp = i as i64;
            blocks.push(b);
        }
        let state = ChainState {
            blocks,
            cumulative_difficulty: 0,
            current_difficulty: 1,
        };
        let target = state.target_difficulty();
        assert_eq!(target, state.blocks[1].difficulty + 1);
    }

    #[test]
    fn test_retarget_decrease_scenario_c() {
        // 6 blocks, timestamps advance by 200s each => actual = 1000s, expected = 50s.
        let genesis = Block::genesis(0, 5);
        let mut blocks = vec![genesis];
        for i in 1..=5u64 {
            let prev = blocks.last().unwrap().clone();
            let mut b = Block::create(&prev, format!("d{i}").into_bytes(), 5);
            b.timestamp = (i * 200) as i64;
            blocks.push(b);
        }
        let state = ChainState {
            blocks,
            cumulative_difficulty: 0,
            current_difficulty: 5,
        };
        let target = state.target_difficulty();
        assert_eq!(target, state.blocks[1].difficulty.saturating_sub(1));
    }

    #[test]
    fn test_retarget_floors_at_zero() {
        let genesis = Block::genesis(0, 0);
        let mut blocks = vec![genesis];
        for i in 1..=5u64 {
            let prev = blocks.last().unwrap().clone();
            let mut b = Block::create(&prev, format!("d{i}").into_bytes(), 0);
            b.timestamp = (i * 200) as i64;
            blocks.push(b);
        }
        let state = ChainState {
            blocks,
            cumulative_difficulty: 0,
            current_difficulty: 0,
        };
        assert_eq!(state.target_difficulty(), 0);
    }

    #[test]
    fn test_is_valid_rejects_tampered_block() {
        let genesis = Block::genesis(0, 1);
        let mut b1 = Block::create(&genesis, b"d".to_vec(), 1);
        b1.data = b"tampered".to_vec();
        let state = ChainState {
            blocks: vec![genesis, b1],
            cumulative_difficulty: 0,
            current_difficulty: 1,
        };
        assert!(!state.is_valid());
    }
}
