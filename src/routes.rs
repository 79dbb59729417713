//! Route Builder (spec §4.D) — pure `(cfg, chain, debtSym, collSym) ->
//! {options, gapFee, gapRouter}` enumerator. No I/O.
//!
//! Generalizes the teacher's `DexType` fee-tier enumeration (3 hardcoded
//! tiers in `pool/v3_syncer.rs::V3_FEE_TIERS`) to the spec's 4 tiers, and
//! extends it with UniV2/Solidly variants driven by `config.dexRouters`.

use crate::config::EngineConfig;
use crate::types::RouteOption;
use alloy::primitives::Address;

/// Default UniV3 fee tiers enumerated for every (chain, debt, collateral)
/// pair (spec §4.D).
pub const V3_FEE_TIERS: [u32; 4] = [100, 500, 3_000, 10_000];

/// Default fee used for the oracle↔DEX gap quote when no tier is specified.
pub const DEFAULT_GAP_FEE: u32 = 500;

#[derive(Debug, Clone)]
pub struct RouteSet {
    pub options: Vec<RouteOption>,
    pub gap_fee: u32,
    pub gap_router: Option<Address>,
}

/// Enumerates every available route option for a (chain, debt, collateral)
/// pair from static config — UniV3 across the default fee tiers plus any
/// configured UniV2-form and Solidly routers (spec §4.D).
pub fn build_routes(cfg: &EngineConfig, chain_id: u64, debt_symbol: &str, collateral_symbol: &str) -> RouteSet {
    let mut options = Vec::new();
    let mut gap_router = None;

    if let Some(chain) = cfg.chain(chain_id) {
        if chain.token(debt_symbol).is_some() && chain.token(collateral_symbol).is_some() {
            for fee in V3_FEE_TIERS {
                options.push(RouteOption::UniV3 { router: chain.univ3_router, fee });
            }
            gap_router = Some(chain.univ3_router);
        }
    }

    for router in cfg.dex_routers.univ2.values() {
        options.push(RouteOption::UniV2 { router: *router });
        if gap_router.is_none() {
            gap_router = Some(*router);
        }
    }

    for solidly in cfg.dex_routers.solidly.values() {
        for stable in [true, false] {
            options.push(RouteOption::SolidlyV2 { router: solidly.router, factory: solidly.factory, stable });
        }
    }

    RouteSet { options, gap_fee: DEFAULT_GAP_FEE, gap_router }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisConfig, ContractsConfig, DexRoutersConfig};
    use crate::types::{ChainConfig, RiskConfig, TokenInfo};
    use std::collections::{HashMap, HashSet};

    fn test_chain() -> ChainConfig {
        let mut tokens = HashMap::new();
        tokens.insert(
            "USDC".to_string(),
            TokenInfo { address: Address::with_last_byte(1), decimals: 6, oracle_feed: None, feed_denomination: None },
        );
        tokens.insert(
            "WETH".to_string(),
            TokenInfo { address: Address::with_last_byte(2), decimals: 18, oracle_feed: None, feed_denomination: None },
        );
        ChainConfig {
            chain_id: 42161,
            name: "arbitrum".into(),
            rpc_url: "http://localhost".into(),
            ws_url: None,
            private_submission_url: None,
            enabled: true,
            sequencer_feed: None,
            pool_addresses_provider: Address::with_last_byte(3),
            univ3_router: Address::with_last_byte(4),
            univ3_quoter: Address::with_last_byte(5),
            tokens,
            risk_overrides: None,
            native_symbol: "WETH".into(),
        }
    }

    fn test_cfg() -> EngineConfig {
        EngineConfig {
            chains: vec![test_chain()],
            markets: vec![],
            assets: HashMap::new(),
            risk: RiskConfig {
                dry_run: true,
                gas_cap_usd: 5.0,
                pnl_per_gas_min: 1.0,
                fail_rate_cap: 0.5,
                health_factor_max: 1.0,
                deny_assets: HashSet::new(),
                max_repay_usd: None,
                max_live_executions: 1,
                max_session_notional_usd: 1000.0,
                max_attempts_per_borrower_hour: 2,
            },
            dex_routers: DexRoutersConfig::default(),
            contracts: ContractsConfig { liquidator: HashMap::new(), multicall3: Address::ZERO },
            beneficiary: Address::ZERO,
            analysis: AnalysisConfig::default(),
        }
    }

    #[test]
    fn enumerates_all_v3_fee_tiers() {
        let cfg = test_cfg();
        let routes = build_routes(&cfg, 42161, "USDC", "WETH");
        let v3_count = routes.options.iter().filter(|o| matches!(o, RouteOption::UniV3 { .. })).count();
        assert_eq!(v3_count, V3_FEE_TIERS.len());
        assert_eq!(routes.gap_fee, DEFAULT_GAP_FEE);
        assert!(routes.gap_router.is_some());
    }

    #[test]
    fn unknown_token_yields_no_v3_routes() {
        let cfg = test_cfg();
        let routes = build_routes(&cfg, 42161, "DAI", "WETH");
        assert!(routes.options.is_empty());
    }
}
