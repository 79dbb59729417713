//! Configuration loading (spec §6: `config.yaml`/`config.toml`, env interpolation).
//!
//! The canonical document has top-level keys `chains, markets, assets, risk,
//! dexRouters, contracts, beneficiary, analysis`. `${VAR}` references are
//! resolved against the process environment at load time; an unresolved
//! name becomes the literal `MISSING:<VAR>` rather than a load error, so a
//! misconfigured optional field degrades instead of crashing the whole load.
//!
//! TOML is the primary, tested format (native to this crate's dependency
//! stack — no YAML crate is declared). A `.yaml`/`.yml` path is accepted
//! only when it parses as a TOML-compatible document; the crate does not
//! carry a YAML parser (see DESIGN.md, Open Question resolution).

use crate::types::{AssetPolicy, ChainConfig, Market, RiskConfig};
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SolidlyRouterConfig {
    pub router: Address,
    pub factory: Address,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DexRoutersConfig {
    #[serde(default)]
    pub univ2: HashMap<String, Address>,
    #[serde(default)]
    pub solidly: HashMap<String, SolidlyRouterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractsConfig {
    /// Per-chain `Liquidator` contract address.
    pub liquidator: HashMap<u64, Address>,
    #[serde(default = "default_multicall3")]
    pub multicall3: Address,
}

fn default_multicall3() -> Address {
    "0xcA11bde05977b3631167028862bE2a173976CA11"
        .parse()
        .expect("Multicall3 address constant is valid")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_analysis_poll_secs() -> u64 {
    1
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { poll_interval_secs: default_analysis_poll_secs() }
    }
}

/// One DEX venue available to the arbitrage fabric's Pair Registry (spec
/// §4.K). `quoter`/`fee` apply to `UniV3`; `factory`/`stable` to `Solidly`;
/// `UniV2` needs only `router`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VenueKind {
    UniV3,
    UniV2,
    Solidly,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueConfig {
    pub id: String,
    pub kind: VenueKind,
    pub router: Address,
    #[serde(default)]
    pub quoter: Option<Address>,
    #[serde(default)]
    pub factory: Option<Address>,
    #[serde(default)]
    pub fee: Option<u32>,
    #[serde(default)]
    pub stable: Option<bool>,
}

/// One (chain, base, quote) pair the fabric trades single-hop across its
/// configured venues (spec §4.K). `trade_size_base` is the registry
/// default tier-1× size in base-token units; venues listing fewer than 2
/// ids here are dropped by the Pair Registry at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConfig {
    pub id: String,
    pub chain_id: u64,
    pub base: Address,
    pub base_symbol: String,
    pub base_decimals: u8,
    pub quote: Address,
    pub quote_symbol: String,
    pub quote_decimals: u8,
    pub trade_size_base: U256,
    pub venues: Vec<String>,
    #[serde(default)]
    pub min_net_usd: Option<f64>,
    #[serde(default)]
    pub min_pnl_multiple: Option<f64>,
}

fn default_quote_interval_ms() -> u64 {
    2_000
}
fn default_fabric_min_net_usd() -> f64 {
    5.0
}
fn default_fabric_min_pnl_multiple() -> f64 {
    2.0
}
fn default_fabric_max_slippage_bps() -> u32 {
    50
}

/// Arbitrage Fabric configuration (spec §4.K). Optional at the document
/// level: a liquidator-only deployment need not declare it, but the
/// `arb-fabric` binary fails fast (`ConfigurationError`, spec §7) when it
/// is absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricConfig {
    pub venues: Vec<VenueConfig>,
    pub pairs: Vec<PairConfig>,
    #[serde(default = "default_quote_interval_ms")]
    pub quote_interval_ms: u64,
    #[serde(default = "default_fabric_min_net_usd")]
    pub min_net_usd: f64,
    #[serde(default = "default_fabric_min_pnl_multiple")]
    pub min_pnl_multiple: f64,
    #[serde(default = "default_fabric_max_slippage_bps")]
    pub max_slippage_bps: u32,
}

impl FabricConfig {
    pub fn venue(&self, id: &str) -> Option<&VenueConfig> {
        self.venues.iter().find(|v| v.id == id)
    }

    pub fn pair(&self, id: &str) -> Option<&PairConfig> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn pairs_for_chain(&self, chain_id: u64) -> impl Iterator<Item = &PairConfig> {
        self.pairs.iter().filter(move |p| p.chain_id == chain_id)
    }

    /// Per-pair floor if set, else the fabric-wide default (spec §4.K
    /// "per-pair (else global) floors").
    pub fn min_net_usd_for(&self, pair: &PairConfig) -> f64 {
        pair.min_net_usd.unwrap_or(self.min_net_usd)
    }

    pub fn min_pnl_multiple_for(&self, pair: &PairConfig) -> f64 {
        pair.min_pnl_multiple.unwrap_or(self.min_pnl_multiple)
    }

    /// Drops pairs left with fewer than 2 resolvable venue ids (spec §4.K
    /// Pair Registry), logging the ones it drops.
    fn validate(&self) -> Result<()> {
        for pair in &self.pairs {
            let viable = pair.venues.iter().filter(|id| self.venue(id).is_some()).count();
            anyhow::ensure!(viable >= 2, "pair {} has fewer than 2 viable venues", pair.id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEngineConfig {
    pub chains: Vec<ChainConfig>,
    pub markets: Vec<Market>,
    pub assets: HashMap<String, AssetPolicy>,
    pub risk: RiskConfig,
    #[serde(default)]
    pub dex_routers: DexRoutersConfig,
    pub contracts: ContractsConfig,
    pub beneficiary: Address,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub fabric: Option<FabricConfig>,
}

/// Fully-loaded, validated configuration. Immutable for the lifetime of a
/// run (spec §3 "Ownership").
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chains: Vec<ChainConfig>,
    pub markets: Vec<Market>,
    pub assets: HashMap<String, AssetPolicy>,
    pub risk: RiskConfig,
    pub dex_routers: DexRoutersConfig,
    pub contracts: ContractsConfig,
    pub beneficiary: Address,
    pub analysis: AnalysisConfig,
    pub fabric: Option<FabricConfig>,
}

impl EngineConfig {
    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    /// Returns the fabric section or a `ConfigurationError`-shaped error
    /// when absent (spec §7 — fatal at startup for the `arb-fabric` bin).
    pub fn fabric(&self) -> Result<&FabricConfig> {
        self.fabric.as_ref().context("config has no [fabric] section")
    }

    pub fn market(&self, chain_id: u64, debt_symbol: &str, collateral_symbol: &str) -> Option<&Market> {
        self.markets
            .iter()
            .find(|m| m.chain_id == chain_id && m.debt_symbol == debt_symbol && m.collateral_symbol == collateral_symbol)
    }

    pub fn policy(&self, debt_symbol: &str) -> Option<&AssetPolicy> {
        self.assets.get(debt_symbol)
    }

    pub fn liquidator(&self, chain_id: u64) -> Option<Address> {
        self.contracts.liquidator.get(&chain_id).copied()
    }

    /// Validates the invariants spec §3 states for `AssetPolicy` and at
    /// least one enabled chain/market, failing fast at startup
    /// (`ConfigurationError` is fatal at load time per spec §7).
    fn validate(&self) -> Result<()> {
        for (symbol, policy) in &self.assets {
            anyhow::ensure!(policy.is_valid(), "asset policy for {symbol} violates spec §3 bps invariants");
        }
        anyhow::ensure!(!self.chains.is_empty(), "config has no chains");
        anyhow::ensure!(
            self.risk.fail_rate_cap >= 0.0 && self.risk.fail_rate_cap <= 1.0,
            "risk.failRateCap must be within [0,1]"
        );
        if let Some(fabric) = &self.fabric {
            fabric.validate()?;
        }
        Ok(())
    }
}

/// Resolves `${VAR}` references against the process environment. Unresolved
/// names become the literal `MISSING:<VAR>` (spec §6), not a load error.
pub fn interpolate_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = raw[i + 2..].find('}') {
                let name = &raw[i + 2..i + 2 + end];
                match std::env::var(name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&format!("MISSING:{name}")),
                }
                i += 2 + end + 1;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Loads and validates the engine configuration from a TOML document at
/// `path`, applying `${VAR}` interpolation before parsing.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    dotenv::dotenv().ok();
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
    let interpolated = interpolate_env(&raw);

    if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")) {
        tracing::warn!(
            path = %path.display(),
            "config.yaml is accepted only as a TOML-compatible document; this crate declares no YAML parser"
        );
    }

    let raw_cfg: RawEngineConfig = toml::from_str(&interpolated).context("parsing config document")?;

    let cfg = EngineConfig {
        chains: raw_cfg.chains,
        markets: raw_cfg.markets,
        assets: raw_cfg.assets,
        risk: raw_cfg.risk,
        dex_routers: raw_cfg.dex_routers,
        contracts: raw_cfg.contracts,
        beneficiary: raw_cfg.beneficiary,
        analysis: raw_cfg.analysis,
        fabric: raw_cfg.fabric,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Environment flags the core consumes directly (spec §6), outside the
/// config document — per-chain secrets and operational knobs that should
/// never live in a checked-in file.
pub struct EnvFlags;

impl EnvFlags {
    pub fn rpc_url(chain_id: u64) -> Option<String> {
        std::env::var(format!("RPC_URL_{chain_id}")).ok()
    }

    pub fn wallet_pk(chain_id: u64) -> Option<String> {
        std::env::var(format!("WALLET_PK_{chain_id}")).ok()
    }

    pub fn safe_address(chain_id: u64) -> Option<String> {
        std::env::var(format!("SAFE_ADDRESS_{chain_id}")).ok()
    }

    pub fn min_native_balance(chain_id: u64) -> Option<f64> {
        std::env::var(format!("MIN_NATIVE_BALANCE_{chain_id}")).ok().and_then(|v| v.parse().ok())
    }

    pub fn database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    pub fn redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok()
    }

    pub fn prom_port() -> u16 {
        std::env::var("PROM_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9464)
    }

    pub fn fabric_prom_port() -> u16 {
        std::env::var("FABRIC_PROM_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9470)
    }

    pub fn kill_switch_file() -> Option<String> {
        std::env::var("KILL_SWITCH_FILE").ok()
    }

    pub fn watch_realtime() -> bool {
        std::env::var("WATCH_REALTIME").map(|v| v != "0" && v.to_lowercase() != "false").unwrap_or(true)
    }

    pub fn watch_poll_ms() -> u64 {
        std::env::var("WATCH_POLL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(500)
    }

    pub fn watch_max_poll_ms() -> u64 {
        std::env::var("WATCH_MAX_POLL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5_000)
    }

    pub fn watch_rate_limit_backoff_ms() -> u64 {
        std::env::var("WATCH_RATE_LIMIT_BACKOFF_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000)
    }

    pub fn watch_max_rate_limit_backoff_ms() -> u64 {
        std::env::var("WATCH_MAX_RATE_LIMIT_BACKOFF_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(60_000)
    }

    pub fn fabric_throttle_limit() -> u32 {
        std::env::var("FABRIC_THROTTLE_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(6)
    }

    pub fn fabric_throttle_window_sec() -> u64 {
        std::env::var("FABRIC_THROTTLE_WINDOW_SEC").ok().and_then(|v| v.parse().ok()).unwrap_or(300)
    }

    pub fn sequencer_stale_secs() -> i64 {
        std::env::var("SEQUENCER_STALE_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3_600)
    }

    pub fn sequencer_grace_secs() -> i64 {
        std::env::var("SEQUENCER_GRACE_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3_600)
    }

    pub fn inventory_mode() -> bool {
        std::env::var("INVENTORY_MODE").map(|v| v != "0" && v.to_lowercase() != "false").unwrap_or(false)
    }

    pub fn inventory_refresh_ms() -> u64 {
        std::env::var("INVENTORY_REFRESH_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5_000)
    }

    pub fn fail_rate_auto_stop() -> bool {
        std::env::var("FAIL_RATE_AUTO_STOP").map(|v| v == "1" || v.to_lowercase() == "true").unwrap_or(false)
    }

    pub fn risk_engine_url() -> Option<String> {
        std::env::var("RISK_ENGINE_URL").ok()
    }

    pub fn subgraph_auth_token(chain_id: u64) -> Option<String> {
        std::env::var(format!("SUBGRAPH_AUTH_TOKEN_{chain_id}")).ok()
    }

    pub fn subgraph_poll_ms() -> u64 {
        std::env::var("SUBGRAPH_POLL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(500)
    }

    pub fn intake_queue_capacity() -> usize {
        std::env::var("INTAKE_QUEUE_CAPACITY").ok().and_then(|v| v.parse().ok()).unwrap_or(1_024)
    }

    /// Candidate config document awaiting the apply-staged gate (spec §6).
    pub fn agent_stage_file() -> Option<String> {
        std::env::var("AGENT_STAGE_FILE").ok()
    }

    /// Last-known-good config document the gate falls back to on failure.
    pub fn agent_prev_file() -> Option<String> {
        std::env::var("AGENT_PREV_FILE").ok()
    }

    /// Canary probe result file the gate consults before promoting a stage.
    pub fn agent_canary_file() -> Option<String> {
        std::env::var("AGENT_CANARY_FILE").ok()
    }

    /// Where the gate writes its pass/fail report.
    pub fn agent_report_file() -> Option<String> {
        std::env::var("AGENT_REPORT_FILE").ok()
    }
}

/// CLI flags mirroring/overriding the environment (spec §6, ambient —
/// teacher declares `clap` with `derive`+`env` features but does not yet
/// use them; this crate is the first caller).
#[derive(Debug, clap::Parser)]
#[command(name = "liquidation-engine", about = "Multi-chain Aave-v3 liquidation and DEX arbitrage opportunity engine")]
pub struct Cli {
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml")]
    pub config: std::path::PathBuf,

    #[arg(long, env = "DRY_RUN")]
    pub dry_run: Option<bool>,

    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolate_env_resolves_set_var() {
        std::env::set_var("ENGINE_TEST_VAR", "hello");
        assert_eq!(interpolate_env("x=${ENGINE_TEST_VAR}"), "x=hello");
        std::env::remove_var("ENGINE_TEST_VAR");
    }

    #[test]
    fn interpolate_env_marks_missing() {
        std::env::remove_var("ENGINE_TEST_VAR_MISSING");
        assert_eq!(interpolate_env("x=${ENGINE_TEST_VAR_MISSING}"), "x=MISSING:ENGINE_TEST_VAR_MISSING");
    }

    #[test]
    fn interpolate_env_passthrough_without_placeholder() {
        assert_eq!(interpolate_env("plain text"), "plain text");
    }

    fn venue(id: &str) -> VenueConfig {
        VenueConfig {
            id: id.into(),
            kind: VenueKind::UniV3,
            router: Address::ZERO,
            quoter: Some(Address::ZERO),
            factory: None,
            fee: Some(500),
            stable: None,
        }
    }

    fn pair(id: &str, venues: Vec<&str>) -> PairConfig {
        PairConfig {
            id: id.into(),
            chain_id: 42161,
            base: Address::ZERO,
            base_symbol: "WETH".into(),
            base_decimals: 18,
            quote: Address::ZERO,
            quote_symbol: "USDC".into(),
            quote_decimals: 6,
            trade_size_base: U256::from(1u64),
            venues: venues.into_iter().map(String::from).collect(),
            min_net_usd: None,
            min_pnl_multiple: None,
        }
    }

    #[test]
    fn fabric_validate_accepts_pair_with_two_viable_venues() {
        let fabric = FabricConfig {
            venues: vec![venue("a"), venue("b")],
            pairs: vec![pair("p0", vec!["a", "b"])],
            quote_interval_ms: default_quote_interval_ms(),
            min_net_usd: default_fabric_min_net_usd(),
            min_pnl_multiple: default_fabric_min_pnl_multiple(),
            max_slippage_bps: default_fabric_max_slippage_bps(),
        };
        assert!(fabric.validate().is_ok());
    }

    #[test]
    fn fabric_validate_rejects_pair_with_fewer_than_two_viable_venues() {
        let fabric = FabricConfig {
            venues: vec![venue("a")],
            pairs: vec![pair("p0", vec!["a", "unknown"])],
            quote_interval_ms: default_quote_interval_ms(),
            min_net_usd: default_fabric_min_net_usd(),
            min_pnl_multiple: default_fabric_min_pnl_multiple(),
            max_slippage_bps: default_fabric_max_slippage_bps(),
        };
        assert!(fabric.validate().is_err());
    }

    #[test]
    fn fabric_min_net_usd_for_prefers_per_pair_override() {
        let fabric = FabricConfig {
            venues: vec![venue("a"), venue("b")],
            pairs: vec![],
            quote_interval_ms: default_quote_interval_ms(),
            min_net_usd: 5.0,
            min_pnl_multiple: 2.0,
            max_slippage_bps: 50,
        };
        let mut p = pair("p0", vec!["a", "b"]);
        assert_eq!(fabric.min_net_usd_for(&p), 5.0);
        p.min_net_usd = Some(12.0);
        assert_eq!(fabric.min_net_usd_for(&p), 12.0);
    }
}
