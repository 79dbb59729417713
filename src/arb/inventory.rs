//! Inventory Manager (spec §4.K).
//!
//! Generalizes the TTL-cache pattern of `pool/v3_syncer.rs::decimals_cache`
//! (a plain `HashMap` cache with a freshness window) to ERC20 balance
//! caching with a 5 s TTL, and adds the spec's bridge-intent escalation:
//! a trade the cached balance cannot cover, or one that would drain a large
//! share of the configured per-chain float, raises a [`BridgeIntent`]
//! instead of silently failing at execution time.

use crate::chain::ChainClientPool;
use crate::contracts::IERC20;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const BALANCE_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeIntentPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct BridgeIntent {
    pub chain_id: u64,
    pub token: Address,
    pub priority: BridgeIntentPriority,
    pub reason: String,
}

/// Drain-ratio thresholds for a covered trade (spec §4.K names the ">50%"
/// trigger; the low/medium/high split below it is this crate's own
/// escalation curve, recorded in DESIGN.md).
fn priority_for_drain_ratio(ratio: f64) -> Option<BridgeIntentPriority> {
    if ratio > 0.9 {
        Some(BridgeIntentPriority::High)
    } else if ratio > 0.7 {
        Some(BridgeIntentPriority::Medium)
    } else if ratio > 0.5 {
        Some(BridgeIntentPriority::Low)
    } else {
        None
    }
}

/// Caches ERC20 balances for 5 s and tracks a per-`(chain, token)` float
/// baseline against which drain ratios are computed (spec §4.K).
pub struct InventoryManager {
    pool: Arc<ChainClientPool>,
    balances: DashMap<(u64, Address, Address), (U256, Instant)>,
    floats: DashMap<(u64, Address), U256>,
}

impl InventoryManager {
    pub fn new(pool: Arc<ChainClientPool>) -> Self {
        Self { pool, balances: DashMap::new(), floats: DashMap::new() }
    }

    /// Records the baseline float a chain/token's balance is measured
    /// against for drain-ratio purposes. Call once at startup per
    /// configured pair's base/quote tokens.
    pub fn set_float(&self, chain_id: u64, token: Address, float: U256) {
        self.floats.insert((chain_id, token), float);
    }

    pub async fn balance_of(&self, chain_id: u64, token: Address, holder: Address) -> Result<U256> {
        let key = (chain_id, token, holder);
        if let Some(entry) = self.balances.get(&key) {
            if entry.1.elapsed() < BALANCE_CACHE_TTL {
                return Ok(entry.0);
            }
        }
        let provider = self.pool.get_client(chain_id).await?;
        let contract = IERC20::new(token, provider);
        let balance = contract.balanceOf(holder).call().await.context("balanceOf call failed")?;
        self.balances.insert(key, (balance, Instant::now()));
        Ok(balance)
    }

    /// Checks whether `holder`'s cached balance of `token` covers
    /// `amount_needed`, raising a [`BridgeIntent`] when it cannot, or when
    /// the trade would drain more than half of the configured float (spec
    /// §4.K).
    pub async fn check(&self, chain_id: u64, token: Address, holder: Address, amount_needed: U256) -> Result<Option<BridgeIntent>> {
        let balance = self.balance_of(chain_id, token, holder).await?;
        if balance < amount_needed {
            let intent = BridgeIntent { chain_id, token, priority: BridgeIntentPriority::High, reason: "balance cannot cover trade".into() };
            warn!(chain_id, token = %token, "inventory: {}", intent.reason);
            return Ok(Some(intent));
        }

        let float = self.floats.get(&(chain_id, token)).map(|f| *f).unwrap_or(balance);
        if float.is_zero() {
            return Ok(None);
        }
        let ratio = crate::types::u256_to_f64(amount_needed) / crate::types::u256_to_f64(float);
        if let Some(priority) = priority_for_drain_ratio(ratio) {
            let intent = BridgeIntent { chain_id, token, priority, reason: format!("fill drains {:.0}% of per-chain float", ratio * 100.0) };
            warn!(chain_id, token = %token, priority = ?intent.priority, "inventory: {}", intent.reason);
            return Ok(Some(intent));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_ratio_thresholds_escalate() {
        assert_eq!(priority_for_drain_ratio(0.4), None);
        assert_eq!(priority_for_drain_ratio(0.6), Some(BridgeIntentPriority::Low));
        assert_eq!(priority_for_drain_ratio(0.8), Some(BridgeIntentPriority::Medium));
        assert_eq!(priority_for_drain_ratio(0.95), Some(BridgeIntentPriority::High));
    }

    #[tokio::test]
    async fn check_flags_insufficient_balance_without_rpc_when_cached() {
        let mgr = InventoryManager::new(Arc::new(ChainClientPool::new()));
        mgr.balances.insert((1, Address::ZERO, Address::ZERO), (U256::from(10u64), Instant::now()));
        let intent = mgr.check(1, Address::ZERO, Address::ZERO, U256::from(20u64)).await.unwrap();
        assert_eq!(intent.unwrap().priority, BridgeIntentPriority::High);
    }

    #[tokio::test]
    async fn check_flags_large_drain_against_float() {
        let mgr = InventoryManager::new(Arc::new(ChainClientPool::new()));
        mgr.balances.insert((1, Address::ZERO, Address::ZERO), (U256::from(100u64), Instant::now()));
        mgr.set_float(1, Address::ZERO, U256::from(100u64));
        let intent = mgr.check(1, Address::ZERO, Address::ZERO, U256::from(80u64)).await.unwrap();
        assert_eq!(intent.unwrap().priority, BridgeIntentPriority::Medium);
    }

    #[tokio::test]
    async fn check_is_quiet_for_small_fills() {
        let mgr = InventoryManager::new(Arc::new(ChainClientPool::new()));
        mgr.balances.insert((1, Address::ZERO, Address::ZERO), (U256::from(100u64), Instant::now()));
        mgr.set_float(1, Address::ZERO, U256::from(100u64));
        let intent = mgr.check(1, Address::ZERO, Address::ZERO, U256::from(10u64)).await.unwrap();
        assert!(intent.is_none());
    }
}
