use std::time::Duration;

/// Target seconds between mined blocks, used by the retarget algorithm.
pub const BLOCK_GENERATION_INTERVAL: u64 = 10;

/// Re-evaluate difficulty every N blocks.
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 5;

/// Difficulty assigned to the very first block a chain ever mines.
pub const INITIAL_DIFFICULTY: u32 = 1;

/// Dial timeout for outbound connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Total read+write deadline applied to a connection after it is established.
pub const RW_TIMEOUT: Duration = Duration::from_secs(2);

/// Default P2P bind address. Override with the `MESHCHAIN_BIND` environment
/// variable for multi-node testing on one machine.
pub const P2P_BIND_ADDRESS_DEFAULT: &str = "0.0.0.0";

pub fn p2p_bind_address() -> String {
    let v = std::env::var("MESHCHAIN_BIND").unwrap_or_else(|_| P2P_BIND_ADDRESS_DEFAULT.to_string());
    if v.trim().is_empty() {
        P2P_BIND_ADDRESS_DEFAULT.to_string()
    } else {
        v
    }
}
