//! Scorer / Policy Gate (spec §4.F).
//!
//! Generalizes the sequential boolean gate-chain shape of
//! `filters/whitelist.rs::is_pool_allowed` from a single bool into the
//! spec's ordered chain of 13 tagged rejection reasons, ending in either a
//! scored `Plan` or a `PolicyRejection`.

use crate::adaptive::AdaptiveThresholds;
use crate::chain::ChainClientPool;
use crate::config::EngineConfig;
use crate::contracts::IPool;
use crate::error::RejectReason;
use crate::oracle::PriceCache;
use crate::routes::build_routes;
use crate::simulate::{CallContext, NoPlanReason, Simulator};
use crate::types::Candidate;
use crate::types::Plan;
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PolicyRejection {
    pub reason: RejectReason,
    pub detail: Option<String>,
    pub snapshot: Option<serde_json::Value>,
}

impl PolicyRejection {
    fn new(reason: RejectReason) -> Self {
        Self { reason, detail: None, snapshot: None }
    }

    fn with_detail(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: Some(detail.into()), snapshot: None }
    }
}

pub struct PolicyGate {
    config: Arc<EngineConfig>,
    pool: Arc<ChainClientPool>,
    oracle: Arc<PriceCache>,
    simulator: Arc<Simulator>,
    adaptive: Arc<AdaptiveThresholds>,
}

impl PolicyGate {
    pub fn new(
        config: Arc<EngineConfig>,
        pool: Arc<ChainClientPool>,
        oracle: Arc<PriceCache>,
        simulator: Arc<Simulator>,
        adaptive: Arc<AdaptiveThresholds>,
    ) -> Self {
        Self { config, pool, oracle, simulator, adaptive }
    }

    /// Runs the ordered gate chain (spec §4.F) against a candidate. `ctx`
    /// supplies the liquidator contract/executor/beneficiary addresses for
    /// the candidate's chain.
    pub async fn evaluate(&self, candidate: &Candidate, ctx: &CallContext) -> Result<Plan, PolicyRejection> {
        // Gate 1: chain enabled.
        let chain = self
            .config
            .chain(candidate.chain_id)
            .filter(|c| c.enabled && candidate.chain_id == c.chain_id)
            .ok_or_else(|| PolicyRejection::new(RejectReason::MissingContract))?;

        // Gate 2: market enabled.
        let market = self
            .config
            .market(candidate.chain_id, &candidate.debt.symbol, &candidate.collateral.symbol)
            .filter(|m| m.enabled)
            .ok_or_else(|| PolicyRejection::new(RejectReason::MissingMarket))?;

        // Gate 3: debt asset not in denylist.
        if self.config.risk.deny_assets.contains(&candidate.debt.symbol) {
            return Err(PolicyRejection::new(RejectReason::AssetDenylist));
        }

        // Gate 4: AssetPolicy present.
        let policy = self.config.policy(&candidate.debt.symbol).ok_or_else(|| PolicyRejection::new(RejectReason::MissingPolicy))?;

        if chain.token(&candidate.debt.symbol).is_none() || chain.token(&candidate.collateral.symbol).is_none() {
            return Err(PolicyRejection::new(RejectReason::MissingToken));
        }

        // Gate 5: sequencer status (pre_sim stage).
        let grace = crate::config::EnvFlags::sequencer_grace_secs();
        let stale = crate::config::EnvFlags::sequencer_stale_secs();
        if !self.oracle.sequencer_ok(candidate.chain_id, grace, stale).await {
            return Err(PolicyRejection::with_detail(RejectReason::SequencerDown, "stage=pre_sim not_ok"));
        }

        // Gate 6: oracle <-> DEX gap vs adaptive gap cap.
        let price_debt = self.oracle.price_usd(candidate.chain_id, &candidate.debt.symbol).await;
        let price_coll = self.oracle.price_usd(candidate.chain_id, &candidate.collateral.symbol).await;

        let routes = build_routes(&self.config, candidate.chain_id, &candidate.debt.symbol, &candidate.collateral.symbol);
        let adaptive = self
            .adaptive
            .current(candidate.chain_id, &pair_key(&candidate.debt.symbol, &candidate.collateral.symbol), self.config.risk.health_factor_max, policy.gap_cap_bps)
            .await;

        let gap_bps = self
            .oracle
            .oracle_dex_gap_bps(candidate.chain_id, &candidate.collateral.symbol, &candidate.debt.symbol, routes.gap_fee, routes.gap_router)
            .await;
        if gap_bps > adaptive.gap_cap_bps as i64 {
            return Err(PolicyRejection::with_detail(RejectReason::GapExceedsCap, format!("gap={gap_bps}bps cap={}bps", adaptive.gap_cap_bps)));
        }

        // Gate 7: borrower health factor via getUserAccountData.
        let provider = self.pool.get_client(candidate.chain_id).await.map_err(|e| PolicyRejection::with_detail(RejectReason::MissingContract, e.to_string()))?;
        let pool_address = chain.pool_addresses_provider;
        let pool_contract = IPool::new(pool_address, provider);
        let account_data = pool_contract
            .getUserAccountData(candidate.borrower)
            .call()
            .await
            .map_err(|e| PolicyRejection::with_detail(RejectReason::MissingContract, e.to_string()))?;
        let hf = crate::types::UserAccountData {
            total_collateral_base: account_data.totalCollateralBase,
            total_debt_base: account_data.totalDebtBase,
            available_borrows_base: account_data.availableBorrowsBase,
            current_liquidation_threshold: account_data.currentLiquidationThreshold,
            ltv: account_data.ltv,
            health_factor: account_data.healthFactor,
        }
        .health_factor_f64();
        if !hf.is_finite() || hf <= 0.0 || hf >= adaptive.health_factor_max {
            return Err(PolicyRejection::with_detail(RejectReason::HealthFactorAboveMax, format!("hf={hf}")));
        }

        // Gate 8: simulator.
        let native_price = self.oracle.price_usd(candidate.chain_id, &chain.native_symbol).await.price.unwrap_or(0.0);
        let plan = self
            .simulator
            .simulate(
                candidate,
                market,
                policy,
                price_debt.price.unwrap_or(0.0),
                price_coll.price.unwrap_or(0.0),
                self.config.risk.gas_cap_usd,
                self.config.risk.max_repay_usd,
                native_price,
                &routes.options,
                ctx,
            )
            .await
            .map_err(|e| match e {
                crate::error::EngineError::ContractRevert(kind) => PolicyRejection::with_detail(RejectReason::ContractRevert, format!("{kind:?}")),
                other => PolicyRejection::with_detail(RejectReason::ContractRevert, other.to_string()),
            })?
            .map_err(|no_plan| match no_plan {
                NoPlanReason::MinProfitZero => PolicyRejection::new(RejectReason::MinProfitZero),
                NoPlanReason::PriceUnavailable => PolicyRejection::with_detail(RejectReason::PlanNull, "price-unavailable"),
                NoPlanReason::ZeroRepay => PolicyRejection::with_detail(RejectReason::PlanNull, "zero-repay"),
                NoPlanReason::NoRoute => PolicyRejection::with_detail(RejectReason::PlanNull, "no-route"),
            })?;

        // Gate 9: pnl/gas floor.
        if plan.pnl_per_gas() < self.config.risk.pnl_per_gas_min {
            return Err(PolicyRejection::with_detail(RejectReason::PlanPnlPerGas, format!("pnl_per_gas={}", plan.pnl_per_gas())));
        }

        Ok(plan)
    }
}

fn pair_key(debt: &str, collateral: &str) -> String {
    format!("{debt}/{collateral}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_stable() {
        assert_eq!(pair_key("USDC", "WETH"), "USDC/WETH");
    }
}
