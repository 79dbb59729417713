//! Price Graph (spec §4.K).
//!
//! Generalizes `arbitrage/detector.rs`'s pool-scanning/spread-calculation
//! shape into periodic multi-tier depth sampling: every `quoteIntervalMs`,
//! samples a [`DepthPoint`] at each of [`DEPTH_TIERS`] for every `(pair,
//! venue)` the [`PairRegistry`] resolved, keeping only the latest sample per
//! tier.

use crate::arb::quoter_mesh::{QuoteRequest, QuoterMesh};
use crate::arb::registry::PairRegistry;
use crate::config::{FabricConfig, VenueConfig, VenueKind};
use crate::types::{u256_to_f64, DepthPoint, DEPTH_TIERS};
use alloy::primitives::aliases::U160;
use alloy::primitives::U256;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

fn token_float(amount: U256, decimals: u8) -> f64 {
    u256_to_f64(amount) / 10f64.powi(decimals as i32)
}

fn scaled_amount(base: U256, multiplier: f64) -> U256 {
    let bps = (multiplier * 10_000.0).round() as u64;
    (base * U256::from(bps)) / U256::from(10_000u64)
}

/// Primary-tier index (the `1×` sample) in [`DEPTH_TIERS`].
const PRIMARY_TIER_INDEX: usize = 2;

/// Periodically-refreshed depth curve per `(pairId, venueId)` (spec §4.K).
pub struct PriceGraph {
    quoter_mesh: Arc<QuoterMesh>,
    points: DashMap<(String, String), Vec<DepthPoint>>,
}

impl PriceGraph {
    pub fn new(quoter_mesh: Arc<QuoterMesh>) -> Self {
        Self { quoter_mesh, points: DashMap::new() }
    }

    /// One sampling pass over every registered pair/venue (spec §4.K). The
    /// caller drives the `quoteIntervalMs` cadence.
    pub async fn sample_all(&self, registry: &PairRegistry, fabric: &FabricConfig) {
        for resolved in registry.pairs() {
            for (venue_id, pool_address) in &resolved.pools {
                let Some(venue) = fabric.venue(venue_id) else { continue };
                if let Err(e) = self.sample_pair_venue(&resolved.pair.id, &resolved.pair.base, &resolved.pair.quote, resolved.pair.base_decimals, resolved.pair.quote_decimals, resolved.pair.chain_id, resolved.pair.trade_size_base, venue_id, *pool_address, venue).await {
                    warn!(pair = %resolved.pair.id, venue = %venue_id, error = %e, "price graph: sampling failed");
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn sample_pair_venue(
        &self,
        pair_id: &str,
        base: &alloy::primitives::Address,
        quote: &alloy::primitives::Address,
        base_decimals: u8,
        quote_decimals: u8,
        chain_id: u64,
        trade_size_base: U256,
        venue_id: &str,
        pool_address: alloy::primitives::Address,
        venue: &VenueConfig,
    ) -> anyhow::Result<()> {
        let mut points = Vec::with_capacity(DEPTH_TIERS.len());
        let now_ms = Utc::now().timestamp_millis();

        for &multiplier in DEPTH_TIERS.iter() {
            let amount_in = scaled_amount(trade_size_base, multiplier);
            let quoter = match venue.kind {
                VenueKind::UniV3 => venue.quoter,
                _ => None,
            };
            let amount_out = if let (VenueKind::UniV3, Some(quoter)) = (venue.kind, quoter) {
                let req = QuoteRequest {
                    chain_id,
                    pair_id: pair_id.to_string(),
                    venue_id: venue_id.to_string(),
                    quoter,
                    pool_address,
                    token_in: *base,
                    token_out: *quote,
                    fee: venue.fee.unwrap_or(3_000),
                    amount_in,
                    configured_sqrt_price_limit: U160::ZERO,
                    zero_for_one: true,
                };
                self.quoter_mesh.quote(req).await.unwrap_or(U256::ZERO)
            } else {
                U256::ZERO
            };

            let price_quote_per_base = if amount_in.is_zero() {
                0.0
            } else {
                token_float(amount_out, quote_decimals) / token_float(amount_in, base_decimals)
            };
            let price_base_per_quote = if price_quote_per_base > 0.0 { 1.0 / price_quote_per_base } else { 0.0 };

            points.push(DepthPoint {
                multiplier,
                amount_in,
                amount_out,
                price_quote_per_base,
                price_base_per_quote,
                slippage_bps: 0,
                gas_estimate: 0,
                updated_at_ms: now_ms,
            });
        }

        let primary_price = points[PRIMARY_TIER_INDEX].price_quote_per_base;
        if primary_price > 0.0 {
            for point in &mut points {
                point.slippage_bps = (((point.price_quote_per_base / primary_price) - 1.0) * 10_000.0) as i64;
            }
        }

        self.points.insert((pair_id.to_string(), venue_id.to_string()), points);
        Ok(())
    }

    pub fn primary(&self, pair_id: &str, venue_id: &str) -> Option<DepthPoint> {
        self.points.get(&(pair_id.to_string(), venue_id.to_string())).map(|v| v[PRIMARY_TIER_INDEX])
    }

    /// `now - primary.updatedAt <= 3*quoteInterval` (spec §4.K).
    pub fn is_fresh(&self, pair_id: &str, venue_id: &str, quote_interval_ms: u64, now_ms: i64) -> bool {
        self.primary(pair_id, venue_id).map(|p| now_ms - p.updated_at_ms <= 3 * quote_interval_ms as i64).unwrap_or(false)
    }

    /// Largest tier whose `|slippageBps| <= max`, else the smallest tier
    /// (spec §4.K `suggest(pair, venue, maxSlippageBps)`).
    pub fn suggest(&self, pair_id: &str, venue_id: &str, max_slippage_bps: u32) -> Option<DepthPoint> {
        let points = self.points.get(&(pair_id.to_string(), venue_id.to_string()))?;
        let mut best: Option<DepthPoint> = None;
        for point in points.iter() {
            if point.slippage_bps.unsigned_abs() as u32 <= max_slippage_bps {
                best = Some(*point);
            }
        }
        Some(best.unwrap_or(points[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainClientPool;

    fn make_point(multiplier: f64, slippage_bps: i64, updated_at_ms: i64) -> DepthPoint {
        DepthPoint {
            multiplier,
            amount_in: U256::from(1u64),
            amount_out: U256::from(1u64),
            price_quote_per_base: 1.0,
            price_base_per_quote: 1.0,
            slippage_bps,
            gas_estimate: 0,
            updated_at_ms,
        }
    }

    fn graph() -> PriceGraph {
        PriceGraph::new(Arc::new(QuoterMesh::new(Arc::new(ChainClientPool::new()))))
    }

    #[test]
    fn suggest_picks_largest_tier_within_slippage_cap() {
        let g = graph();
        let points = vec![make_point(0.25, 5, 0), make_point(0.5, 10, 0), make_point(1.0, 40, 0), make_point(1.5, 90, 0), make_point(2.0, 150, 0)];
        g.points.insert(("p".into(), "v".into()), points);
        let picked = g.suggest("p", "v", 50).unwrap();
        assert_eq!(picked.multiplier, 1.0);
    }

    #[test]
    fn suggest_falls_back_to_smallest_tier_when_none_fit() {
        let g = graph();
        let points = vec![make_point(0.25, 500, 0), make_point(0.5, 600, 0)];
        g.points.insert(("p".into(), "v".into()), points);
        let picked = g.suggest("p", "v", 50).unwrap();
        assert_eq!(picked.multiplier, 0.25);
    }

    #[test]
    fn freshness_respects_three_times_quote_interval() {
        let g = graph();
        let points: Vec<DepthPoint> = DEPTH_TIERS.iter().map(|&m| make_point(m, 0, 1_000)).collect();
        g.points.insert(("p".into(), "v".into()), points);
        assert!(g.is_fresh("p", "v", 100, 1_300));
        assert!(!g.is_fresh("p", "v", 100, 1_301));
    }

    #[test]
    fn scaled_amount_applies_tier_multiplier() {
        assert_eq!(scaled_amount(U256::from(1_000_000u64), 0.25), U256::from(250_000u64));
        assert_eq!(scaled_amount(U256::from(1_000_000u64), 2.0), U256::from(2_000_000u64));
    }
}
