//! Single-Hop Solver (spec §4.K).
//!
//! Generalizes `arbitrage/detector.rs`'s `check_pair`/`calculate_spread`/
//! `calculate_profit` shape from a two-pool spread check into an ordered
//! venue-pair scan over [`PriceGraph`]-suggested trade sizes, quoted live
//! through the [`QuoterMesh`], producing scored [`QuoteEdge`]s.

use crate::arb::price_graph::PriceGraph;
use crate::arb::quoter_mesh::{QuoteRequest, QuoterMesh};
use crate::arb::registry::ResolvedPair;
use crate::config::{FabricConfig, VenueConfig, VenueKind};
use crate::oracle::PriceCache;
use crate::types::{u256_to_f64, EdgeLeg, EdgeRisk, EdgeSource, QuoteEdge};
use alloy::primitives::aliases::U160;
use alloy::primitives::{Address, U256};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Pre-filter fraction of `minNetUsd` the graph estimate must clear before
/// the solver spends live quote calls on a candidate (spec §4.K).
const PRE_FILTER_FRACTION: f64 = 0.6;

fn token_float(amount: U256, decimals: u8) -> f64 {
    u256_to_f64(amount) / 10f64.powi(decimals as i32)
}

pub struct SingleHopSolver {
    quoter_mesh: Arc<QuoterMesh>,
    price_graph: Arc<PriceGraph>,
    oracle: Arc<PriceCache>,
}

impl SingleHopSolver {
    pub fn new(quoter_mesh: Arc<QuoterMesh>, price_graph: Arc<PriceGraph>, oracle: Arc<PriceCache>) -> Self {
        Self { quoter_mesh, price_graph, oracle }
    }

    /// Scans every ordered `(sell, buy)` venue pair with `sell != buy` for
    /// `resolved` and returns the edges that clear the pre-filter and both
    /// floors (spec §4.K).
    pub async fn solve(&self, resolved: &ResolvedPair, fabric: &FabricConfig, gas_usd: f64) -> Vec<QuoteEdge> {
        let venue_ids: Vec<&String> = resolved.pools.keys().collect();
        let mut edges = Vec::new();
        for sell_id in &venue_ids {
            for buy_id in &venue_ids {
                if sell_id == buy_id {
                    continue;
                }
                if let Some(edge) = self.solve_pair(resolved, fabric, sell_id, buy_id, gas_usd).await {
                    edges.push(edge);
                }
            }
        }
        edges
    }

    async fn solve_pair(&self, resolved: &ResolvedPair, fabric: &FabricConfig, sell_id: &str, buy_id: &str, gas_usd: f64) -> Option<QuoteEdge> {
        let pair = &resolved.pair;
        let max_slip = fabric.max_slippage_bps;

        let suggested_sell = self.price_graph.suggest(&pair.id, sell_id, max_slip)?;
        let suggested_buy = self.price_graph.suggest(&pair.id, buy_id, max_slip)?;
        let trade_base = pair.trade_size_base.min(suggested_sell.amount_in).min(suggested_buy.amount_in);
        if trade_base.is_zero() {
            return None;
        }

        let sell_primary = self.price_graph.primary(&pair.id, sell_id)?;
        let buy_primary = self.price_graph.primary(&pair.id, buy_id)?;
        let base_price_usd = self.oracle.price_usd(pair.chain_id, &pair.base_symbol).await.price?;
        if base_price_usd <= 0.0 {
            return None;
        }

        // Pre-filter: estimate net USD from the graph's cached curve before
        // spending live quote calls on this candidate.
        let trade_base_f = token_float(trade_base, pair.base_decimals);
        let est_quote_out = trade_base_f * sell_primary.price_quote_per_base;
        let est_base_back = est_quote_out * buy_primary.price_base_per_quote;
        let est_net_usd = (est_base_back - trade_base_f) * base_price_usd;
        let floor = fabric.min_net_usd_for(pair);
        if est_net_usd < PRE_FILTER_FRACTION * floor {
            return None;
        }

        let sell_venue = fabric.venue(sell_id)?;
        let buy_venue = fabric.venue(buy_id)?;
        let sell_pool = *resolved.pools.get(sell_id)?;
        let buy_pool = *resolved.pools.get(buy_id)?;

        let quote_out = self.quote(pair.chain_id, &pair.id, sell_id, sell_venue, sell_pool, trade_base, true, pair.base, pair.quote).await?;
        if quote_out.is_zero() {
            return None;
        }
        let bought_base = self.quote(pair.chain_id, &pair.id, buy_id, buy_venue, buy_pool, quote_out, false, pair.quote, pair.base).await?;
        if bought_base <= trade_base {
            return None;
        }

        let net_base = bought_base - trade_base;
        let net_base_f = token_float(net_base, pair.base_decimals);
        let net_usd = net_base_f * base_price_usd;
        let pnl_multiple = if gas_usd > 0.0 { net_usd / gas_usd } else { f64::INFINITY };

        let floor_pnl = fabric.min_pnl_multiple_for(pair);
        if net_usd < floor || pnl_multiple < floor_pnl {
            return None;
        }

        let size_multiplier = trade_base_f / token_float(pair.trade_size_base, pair.base_decimals).max(f64::MIN_POSITIVE);
        let created_at = Utc::now();
        Some(QuoteEdge {
            id: format!("{}:{}->{}", pair.id, sell_id, buy_id),
            source: EdgeSource::SingleHop,
            legs: vec![
                EdgeLeg { venue: sell_id.to_string(), token_in: pair.base, token_out: pair.quote, amount_in: trade_base, amount_out: quote_out },
                EdgeLeg { venue: buy_id.to_string(), token_in: pair.quote, token_out: pair.base, amount_in: quote_out, amount_out: bought_base },
            ],
            size_in: trade_base,
            est_net_usd: net_usd,
            est_gas_usd: gas_usd,
            risk: EdgeRisk { max_slippage_bps: max_slip, saturation_backoff_active: false },
            created_at,
            expires_at: Some(created_at + ChronoDuration::seconds(5)),
            tags: vec!["single_hop".into()],
            metadata: serde_json::json!({ "basePriceUsd": base_price_usd, "sizeMultiplier": size_multiplier }),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn quote(&self, chain_id: u64, pair_id: &str, venue_id: &str, venue: &VenueConfig, pool_address: Address, amount_in: U256, zero_for_one: bool, token_in: Address, token_out: Address) -> Option<U256> {
        if venue.kind != VenueKind::UniV3 {
            return None;
        }
        let quoter = venue.quoter?;
        let req = QuoteRequest {
            chain_id,
            pair_id: pair_id.to_string(),
            venue_id: venue_id.to_string(),
            quoter,
            pool_address,
            token_in,
            token_out,
            fee: venue.fee.unwrap_or(3_000),
            amount_in,
            configured_sqrt_price_limit: U160::ZERO,
            zero_for_one,
        };
        self.quoter_mesh.quote(req).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_float_scales_by_decimals() {
        assert_eq!(token_float(U256::from(1_500_000u64), 6), 1.5);
    }
}
