//! Quoter Mesh (spec §4.K).
//!
//! Generalizes `arbitrage/multicall_quoter.rs`'s batched-quoting shape
//! (pre-screen via Multicall3, classify revert-as-data as retryable vs.
//! fatal, haircut the result) onto alloy's typed `IQuoterV2` binding instead
//! of hand-rolled selector encoding, and adds the spec's halve-amountIn
//! retry and `sqrtPriceLimit` candidate list on top.

use crate::arb::backoff::SaturationBackoff;
use crate::chain::ChainClientPool;
use crate::contracts::{IQuoterV2, UniswapV3Pool};
use alloy::primitives::aliases::U160;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLOT0_CACHE_TTL: Duration = Duration::from_secs(30);
const MAX_HALVINGS: u32 = 4;

const RETRYABLE_SUBSTRINGS: [&str; 4] = ["spl", "insufficient liquidity", "price limit", "unexpected error"];

fn is_retryable(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    RETRYABLE_SUBSTRINGS.iter().any(|p| lower.contains(p))
}

/// A hard price-limit saturation is a `"price limit"`/`"spl"` revert that
/// does not recover by halving `amountIn` — the mesh should back off the
/// `(pair, venue, direction)` instead of burning retries on it.
fn is_hard_price_limit(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("price limit") || lower.contains("spl")
}

fn min_sqrt_ratio_plus_one() -> U160 {
    U160::from(4_295_128_740u128)
}

fn max_sqrt_ratio_minus_one() -> U160 {
    "1461446703485210103287273052203988822378723970341".parse().expect("valid MAX_SQRT_RATIO-1 constant")
}

pub struct QuoteRequest {
    pub chain_id: u64,
    pub pair_id: String,
    pub venue_id: String,
    pub quoter: Address,
    pub pool_address: Address,
    pub token_in: Address,
    pub token_out: Address,
    pub fee: u32,
    pub amount_in: U256,
    pub configured_sqrt_price_limit: U160,
    pub zero_for_one: bool,
}

/// Calls `IQuoterV2.quoteExactInputSingle`, applying the spec's
/// `sqrtPriceLimit` candidate ordering, halve-and-retry on transient
/// reverts, and per-`(pair, venue, direction)` saturation backoff.
pub struct QuoterMesh {
    pool: Arc<ChainClientPool>,
    backoff: SaturationBackoff,
    slot0_cache: DashMap<(u64, Address), (U160, Instant)>,
}

impl QuoterMesh {
    pub fn new(pool: Arc<ChainClientPool>) -> Self {
        Self { pool, backoff: SaturationBackoff::new(), slot0_cache: DashMap::new() }
    }

    /// Returns the quoted `amountOut`, or `0` when the pair/venue/direction
    /// is in saturation backoff or every retry attempt exhausted without a
    /// live quote (spec §4.K: "return 0 silently").
    pub async fn quote(&self, req: QuoteRequest) -> Result<U256> {
        if self.backoff.is_saturated(&req.pair_id, &req.venue_id, req.zero_for_one) {
            return Ok(U256::ZERO);
        }

        let candidates = self.sqrt_price_limit_candidates(req.chain_id, req.pool_address, req.configured_sqrt_price_limit, req.zero_for_one).await;

        let provider = self.pool.get_client(req.chain_id).await?;
        let quoter = IQuoterV2::new(req.quoter, provider);

        let mut amount = req.amount_in;
        let mut scale = 1u64;
        let mut last_error: Option<String> = None;

        for _ in 0..=MAX_HALVINGS {
            for &limit in &candidates {
                let params = crate::contracts::IQuoterV2::QuoteExactInputSingleParams {
                    tokenIn: req.token_in,
                    tokenOut: req.token_out,
                    amountIn: amount,
                    fee: req.fee,
                    sqrtPriceLimitX96: limit,
                };
                match quoter.quoteExactInputSingle(params).call().await {
                    Ok(result) => {
                        self.backoff.record_success(&req.pair_id, &req.venue_id, req.zero_for_one);
                        return Ok(result.amountOut * U256::from(scale));
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        if is_hard_price_limit(&msg) {
                            self.backoff.record_saturation(&req.pair_id, &req.venue_id, req.zero_for_one);
                            return Ok(U256::ZERO);
                        }
                        last_error = Some(msg);
                    }
                }
            }

            match &last_error {
                Some(msg) if is_retryable(msg) => {
                    amount /= U256::from(2u64);
                    scale *= 2;
                    if amount.is_zero() {
                        break;
                    }
                }
                _ => break,
            }
        }

        match last_error {
            Some(msg) if is_retryable(&msg) => Ok(U256::ZERO),
            Some(msg) => Err(anyhow::anyhow!("quoter mesh: {msg}")),
            None => Ok(U256::ZERO),
        }
    }

    /// `configured limit, 0, clamped bound, cached slot0 sqrtPrice ±1`, in
    /// that order (spec §4.K).
    async fn sqrt_price_limit_candidates(&self, chain_id: u64, pool_address: Address, configured: U160, zero_for_one: bool) -> Vec<U160> {
        let clamped = if zero_for_one { min_sqrt_ratio_plus_one() } else { max_sqrt_ratio_minus_one() };
        let mut candidates = vec![configured, U160::ZERO, clamped];
        if let Some(sqrt_price) = self.cached_slot0(chain_id, pool_address).await {
            candidates.push(sqrt_price.saturating_add(U160::from(1u8)));
            candidates.push(sqrt_price.saturating_sub(U160::from(1u8)));
        }
        candidates
    }

    async fn cached_slot0(&self, chain_id: u64, pool_address: Address) -> Option<U160> {
        let key = (chain_id, pool_address);
        if let Some(entry) = self.slot0_cache.get(&key) {
            if entry.1.elapsed() < SLOT0_CACHE_TTL {
                return Some(entry.0);
            }
        }
        let provider = self.pool.get_client(chain_id).await.ok()?;
        let pool = UniswapV3Pool::new(pool_address, provider);
        let slot0 = pool.slot0().call().await.context("UniswapV3Pool.slot0").ok()?;
        self.slot0_cache.insert(key, (slot0.sqrtPriceX96, Instant::now()));
        Some(slot0.sqrtPriceX96)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_patterns_match_spec_list() {
        assert!(is_retryable("execution reverted: SPL"));
        assert!(is_retryable("Insufficient Liquidity for this trade"));
        assert!(is_retryable("price limit already reached"));
        assert!(is_retryable("unexpected error during call"));
        assert!(!is_retryable("nonce too low"));
    }

    #[test]
    fn hard_price_limit_is_a_subset_of_retryable() {
        assert!(is_hard_price_limit("SPL"));
        assert!(is_hard_price_limit("price limit"));
        assert!(!is_hard_price_limit("insufficient liquidity"));
    }

    #[tokio::test]
    async fn sqrt_price_limit_candidates_include_configured_and_clamped_bound() {
        let mesh = QuoterMesh::new(Arc::new(ChainClientPool::new()));
        let candidates = mesh.sqrt_price_limit_candidates(1, Address::ZERO, U160::from(42u64), true).await;
        assert_eq!(candidates[0], U160::from(42u64));
        assert_eq!(candidates[1], U160::ZERO);
        assert_eq!(candidates[2], min_sqrt_ratio_plus_one());
    }

    #[tokio::test]
    async fn sqrt_price_limit_candidates_use_max_bound_for_one_for_zero() {
        let mesh = QuoterMesh::new(Arc::new(ChainClientPool::new()));
        let candidates = mesh.sqrt_price_limit_candidates(1, Address::ZERO, U160::ZERO, false).await;
        assert_eq!(candidates[2], max_sqrt_ratio_minus_one());
    }
}
