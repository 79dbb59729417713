//! Core data model (spec §3).
//!
//! Token amounts are exact integers in native base units (`U256`). USD
//! values are finite non-negative `f64` produced through a single
//! conversion site, [`to_usd`]. ChainConfig/Market/policy types are
//! immutable once loaded; caches are owned by their component, not here.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Basis-point denominator used throughout (`bps` = 1/10_000).
pub const BPS_DENOM: u64 = 10_000;

/// Integer `ceil(a/b)`, used for `min_profit` and repay-amount rounding.
pub fn ceil_div(numerator: U256, denominator: U256) -> U256 {
    if denominator.is_zero() {
        return U256::ZERO;
    }
    let (q, r) = (numerator / denominator, numerator % denominator);
    if r.is_zero() {
        q
    } else {
        q + U256::from(1u8)
    }
}

/// Truncating integer division, the "floor" variant used for
/// `amountOutMin` and repay-amount math.
pub fn floor_div(numerator: U256, denominator: U256) -> U256 {
    if denominator.is_zero() {
        U256::ZERO
    } else {
        numerator / denominator
    }
}

/// Single conversion site: raw integer amount (native base units) to a
/// finite non-negative USD `f64` at the given price and decimals.
pub fn to_usd(amount: U256, decimals: u8, price_usd: f64) -> f64 {
    if price_usd <= 0.0 || !price_usd.is_finite() {
        return 0.0;
    }
    let scale = 10f64.powi(decimals as i32);
    let amount_f = u256_to_f64(amount);
    (amount_f / scale) * price_usd
}

pub(crate) fn u256_to_f64(value: U256) -> f64 {
    let limbs = value.as_limbs();
    let mut acc = 0f64;
    for limb in limbs.iter().rev() {
        acc = acc * 18_446_744_073_709_551_616.0 /* 2^64 */ + (*limb as f64);
    }
    acc
}

// ---------------------------------------------------------------------
// ChainConfig / TokenInfo / Market
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub enum FeedDenomination {
    Usd,
    Eth,
    Btc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    pub decimals: u8,
    pub oracle_feed: Option<Address>,
    pub feed_denomination: Option<FeedDenomination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub private_submission_url: Option<String>,
    pub enabled: bool,
    pub sequencer_feed: Option<Address>,
    pub pool_addresses_provider: Address,
    pub univ3_router: Address,
    pub univ3_quoter: Address,
    #[serde(default)]
    pub subgraph_url: Option<String>,
    pub tokens: HashMap<String, TokenInfo>,
    #[serde(default)]
    pub risk_overrides: Option<RiskConfig>,
    /// Symbol (must be a key of `tokens`) whose Chainlink feed prices this
    /// chain's native gas token, used to convert `GasQuote::total_wei` to
    /// USD (spec §4.E.8). Every configured chain in this domain is an
    /// ETH-denominated L2, so this defaults to `"WETH"`.
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
}

fn default_native_symbol() -> String {
    "WETH".to_string()
}

impl ChainConfig {
    pub fn token(&self, symbol: &str) -> Option<&TokenInfo> {
        self.tokens.get(symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub chain_id: u64,
    pub debt_symbol: String,
    pub collateral_symbol: String,
    pub enabled: bool,
    #[serde(default = "default_close_factor_bps")]
    pub close_factor_bps: u32,
    #[serde(default = "default_liquidation_bonus_bps")]
    pub liquidation_bonus_bps: u32,
}

fn default_close_factor_bps() -> u32 {
    5_000
}
fn default_liquidation_bonus_bps() -> u32 {
    800
}

/// Per-debt-symbol policy triple. Invariant: `0 < floor_bps < 10_000`;
/// `0 < gap_cap_bps <= 10_000`; `0 <= slippage_bps < 10_000`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AssetPolicy {
    pub floor_bps: u32,
    pub gap_cap_bps: u32,
    pub slippage_bps: u32,
}

impl AssetPolicy {
    pub fn is_valid(&self) -> bool {
        self.floor_bps > 0
            && self.floor_bps < BPS_DENOM as u32
            && self.gap_cap_bps > 0
            && self.gap_cap_bps <= BPS_DENOM as u32
            && self.slippage_bps < BPS_DENOM as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub dry_run: bool,
    pub gas_cap_usd: f64,
    pub pnl_per_gas_min: f64,
    pub fail_rate_cap: f64,
    pub health_factor_max: f64,
    #[serde(default)]
    pub deny_assets: HashSet<String>,
    pub max_repay_usd: Option<f64>,
    pub max_live_executions: u64,
    pub max_session_notional_usd: f64,
    pub max_attempts_per_borrower_hour: u32,
}

// ---------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetAmount {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
    pub amount: U256,
}

/// A prospective liquidation target. `health_factor` uses `f64::INFINITY`
/// as the "no debt" sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub borrower: Address,
    pub chain_id: u64,
    pub debt: AssetAmount,
    pub collateral: AssetAmount,
    pub health_factor: f64,
}

impl Candidate {
    /// Identity key used for the 5-minute dedup window (spec §3, §8).
    pub fn identity_key(&self) -> (u64, Address, Address, Address) {
        (self.chain_id, self.borrower, self.debt.address, self.collateral.address)
    }
}

// ---------------------------------------------------------------------
// RouteOption / RouteQuote
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOption {
    UniV3 { router: Address, fee: u32 },
    UniV2 { router: Address },
    SolidlyV2 { router: Address, factory: Address, stable: bool },
}

impl RouteOption {
    pub fn router(&self) -> Address {
        match self {
            RouteOption::UniV3 { router, .. } => *router,
            RouteOption::UniV2 { router } => *router,
            RouteOption::SolidlyV2 { router, .. } => *router,
        }
    }

    pub fn dex_id(&self) -> &'static str {
        match self {
            RouteOption::UniV3 { .. } => "univ3",
            RouteOption::UniV2 { .. } => "univ2",
            RouteOption::SolidlyV2 { .. } => "solidly",
        }
    }
}

impl fmt::Display for RouteOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteOption::UniV3 { fee, .. } => write!(f, "UniV3({}bps)", fee / 100),
            RouteOption::UniV2 { .. } => write!(f, "UniV2"),
            RouteOption::SolidlyV2 { stable, .. } => {
                write!(f, "Solidly({})", if *stable { "stable" } else { "volatile" })
            }
        }
    }
}

/// Invariant: `amount_out_min = quoted_out * (10_000 - slippage_bps) / 10_000`
/// (integer division, truncating).
#[derive(Debug, Clone)]
pub struct RouteQuote {
    pub option: RouteOption,
    pub quoted_out: U256,
    pub amount_out_min: U256,
}

impl RouteQuote {
    pub fn new(option: RouteOption, quoted_out: U256, slippage_bps: u32) -> Self {
        let amount_out_min = floor_div(
            quoted_out * U256::from(BPS_DENOM - slippage_bps as u64),
            U256::from(BPS_DENOM),
        );
        Self { option, quoted_out, amount_out_min }
    }
}

// ---------------------------------------------------------------------
// GasQuote
// ---------------------------------------------------------------------

/// Fallback gas-units estimate for chains without an L1-fee oracle and no
/// successful `estimateGas` yet (DESIGN.md open question #2).
pub const GAS_UNITS_HINT: u64 = 550_000;

#[derive(Debug, Clone, Copy)]
pub struct GasQuote {
    pub gas_limit: u64,
    pub fee_per_gas_wei: U256,
    pub l1_fee_wei: U256,
}

impl GasQuote {
    pub fn total_wei(&self) -> U256 {
        U256::from(self.gas_limit) * self.fee_per_gas_wei + self.l1_fee_wei
    }
}

// ---------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Flash,
    Funds,
}

/// Invariants (spec §3, §8):
/// - `repay_amount > 0`
/// - `min_profit = ceil_div(repay_amount * floor_bps, 10_000) > 0`
/// - `est_net_bps >= floor_bps`
/// - `gas_usd <= gas_cap_usd`
#[derive(Debug, Clone)]
pub struct Plan {
    pub repay_amount: U256,
    pub seize_amount: U256,
    pub repay_usd: f64,
    pub route: RouteOption,
    pub amount_out_min: U256,
    pub gas_usd: f64,
    pub est_net_bps: i64,
    pub net_usd: f64,
    pub min_profit: U256,
    pub mode: ExecutionMode,
    pub precommit: bool,
    pub deadline: DateTime<Utc>,
}

impl Plan {
    pub const DEADLINE_SECS: i64 = 300;

    pub fn pnl_per_gas(&self) -> f64 {
        if self.gas_usd == 0.0 {
            f64::INFINITY
        } else {
            self.net_usd / self.gas_usd
        }
    }
}

// ---------------------------------------------------------------------
// AdaptiveSample / AdaptiveResult
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveSample {
    pub base_health_factor_max: f64,
    pub base_gap_cap_bps: u32,
    pub observed_gap_bps: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveResult {
    pub health_factor_max: f64,
    pub gap_cap_bps: u32,
    pub volatility: f64,
}

// ---------------------------------------------------------------------
// AttemptRow
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Throttled,
    GapSkip,
    PolicySkip,
    DryRun,
    Sent,
    Success,
    Error,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptStatus::Throttled => "throttled",
            AttemptStatus::GapSkip => "gap_skip",
            AttemptStatus::PolicySkip => "policy_skip",
            AttemptStatus::DryRun => "dry_run",
            AttemptStatus::Sent => "sent",
            AttemptStatus::Success => "success",
            AttemptStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Append-only; owned by the Postgres store. In-memory instances are
/// ephemeral snapshots, never the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRow {
    pub id: i64,
    pub chain_id: u64,
    pub borrower: String,
    pub status: AttemptStatus,
    pub reason: Option<String>,
    pub tx_hash: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// QuoteEdge / DepthPoint (arbitrage fabric, spec §3/§4.K)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeSource {
    SingleHop,
    Triangular,
    CrossChain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeLeg {
    pub venue: String,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRisk {
    pub max_slippage_bps: u32,
    pub saturation_backoff_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEdge {
    pub id: String,
    pub source: EdgeSource,
    pub legs: Vec<EdgeLeg>,
    pub size_in: U256,
    pub est_net_usd: f64,
    pub est_gas_usd: f64,
    pub risk: EdgeRisk,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Sampled tiers of a pair's configured trade size (spec §3, §4.K).
pub const DEPTH_TIERS: [f64; 5] = [0.25, 0.5, 1.0, 1.5, 2.0];

#[derive(Debug, Clone, Copy)]
pub struct DepthPoint {
    pub multiplier: f64,
    pub amount_in: U256,
    pub amount_out: U256,
    pub price_quote_per_base: f64,
    pub price_base_per_quote: f64,
    pub slippage_bps: i64,
    pub gas_estimate: u64,
    pub updated_at_ms: i64,
}

// ---------------------------------------------------------------------
// UserAccountData (Aave Pool.getUserAccountData raw tuple, §6 supplement)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct UserAccountData {
    pub total_collateral_base: U256,
    pub total_debt_base: U256,
    pub available_borrows_base: U256,
    pub current_liquidation_threshold: U256,
    pub ltv: U256,
    pub health_factor: U256,
}

impl UserAccountData {
    /// Aave encodes health factor at 1e18 fixed point; `uint256::MAX` is the
    /// sentinel for "no debt" and maps to the `f64::INFINITY` candidate
    /// sentinel used elsewhere in this crate.
    pub fn health_factor_f64(&self) -> f64 {
        if self.total_debt_base.is_zero() {
            return f64::INFINITY;
        }
        u256_to_f64(self.health_factor) / 1e18
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up_on_remainder() {
        assert_eq!(ceil_div(U256::from(10u64), U256::from(3u64)), U256::from(4u64));
        assert_eq!(ceil_div(U256::from(9u64), U256::from(3u64)), U256::from(3u64));
    }

    #[test]
    fn floor_div_truncates() {
        assert_eq!(floor_div(U256::from(10u64), U256::from(3u64)), U256::from(3u64));
    }

    #[test]
    fn route_quote_amount_out_min_matches_invariant() {
        let q = RouteQuote::new(
            RouteOption::UniV3 { router: Address::ZERO, fee: 500 },
            U256::from(1_000_000u64),
            30,
        );
        // 1_000_000 * 9970 / 10000 = 997_000
        assert_eq!(q.amount_out_min, U256::from(997_000u64));
    }

    #[test]
    fn to_usd_zero_price_is_zero() {
        assert_eq!(to_usd(U256::from(1_000_000u64), 6, 0.0), 0.0);
    }

    #[test]
    fn to_usd_basic_conversion() {
        // 1,000,000 raw units at 6 decimals = 1.0 token, price $1 => $1.0
        let usd = to_usd(U256::from(1_000_000u64), 6, 1.0);
        assert!((usd - 1.0).abs() < 1e-9);
    }

    #[test]
    fn candidate_identity_key_ignores_health_factor() {
        let debt = AssetAmount { symbol: "USDC".into(), address: Address::ZERO, decimals: 6, amount: U256::from(1u64) };
        let coll = AssetAmount { symbol: "WETH".into(), address: Address::with_last_byte(1), decimals: 18, amount: U256::from(1u64) };
        let c1 = Candidate { borrower: Address::with_last_byte(2), chain_id: 42161, debt: debt.clone(), collateral: coll.clone(), health_factor: 0.9 };
        let c2 = Candidate { borrower: Address::with_last_byte(2), chain_id: 42161, debt, collateral: coll, health_factor: 0.95 };
        assert_eq!(c1.identity_key(), c2.identity_key());
    }

    #[test]
    fn user_account_data_no_debt_is_infinite_hf() {
        let uad = UserAccountData {
            total_collateral_base: U256::from(1000u64),
            total_debt_base: U256::ZERO,
            available_borrows_base: U256::ZERO,
            current_liquidation_threshold: U256::ZERO,
            ltv: U256::ZERO,
            health_factor: U256::MAX,
        };
        assert!(uad.health_factor_f64().is_infinite());
    }
}
