//! Candidate Intake (spec §4.C).
//!
//! Two independent producers feed a single deduplicated candidate stream:
//! the [`subgraph`] poller (authoritative, slow, wide) and the [`watcher`]
//! realtime event watcher (fast, narrow, per-chain). Both share the
//! 5-minute identity dedup window defined here.

pub mod subgraph;
pub mod watcher;

use crate::types::Candidate;
use alloy::primitives::Address;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Dedup window for `(chainId, borrower, debt, collateral)` identity (spec
/// §3, §8): a candidate already emitted within the window is suppressed.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Shared dedup table between the subgraph poller and the realtime
/// watcher for a given chain. Entries older than [`DEDUP_WINDOW`] are
/// treated as absent and overwritten rather than actively swept, since the
/// table is bounded by the number of distinct borrower/asset identities
/// actually seen, not by time.
#[derive(Default)]
pub struct Dedup {
    seen: DashMap<(u64, Address, Address, Address), Instant>,
}

impl Dedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true (and records the sighting) if `candidate` has not been
    /// emitted within the dedup window; false if it is a within-window
    /// duplicate.
    pub fn should_emit(&self, candidate: &Candidate) -> bool {
        let key = candidate.identity_key();
        let now = Instant::now();
        if let Some(last) = self.seen.get(&key) {
            if now.duration_since(*last) < DEDUP_WINDOW {
                return false;
            }
        }
        self.seen.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetAmount;
    use alloy::primitives::U256;

    fn candidate() -> Candidate {
        Candidate {
            borrower: Address::with_last_byte(1),
            chain_id: 1,
            debt: AssetAmount { symbol: "USDC".into(), address: Address::with_last_byte(2), decimals: 6, amount: U256::from(1u64) },
            collateral: AssetAmount { symbol: "WETH".into(), address: Address::with_last_byte(3), decimals: 18, amount: U256::from(1u64) },
            health_factor: 0.95,
        }
    }

    #[test]
    fn first_sighting_emits_then_suppresses_duplicate() {
        let dedup = Dedup::new();
        let c = candidate();
        assert!(dedup.should_emit(&c));
        assert!(!dedup.should_emit(&c));
    }

    #[test]
    fn distinct_borrower_is_independent() {
        let dedup = Dedup::new();
        let mut c = candidate();
        assert!(dedup.should_emit(&c));
        c.borrower = Address::with_last_byte(9);
        assert!(dedup.should_emit(&c));
    }
}
