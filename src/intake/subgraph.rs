//! Subgraph poller (spec §4.C.1).
//!
//! Queries `userReserves` for borrowers with at least one open position,
//! groups by borrower, computes a health factor in ETH terms, and emits
//! one candidate per (debt reserve × collateral reserve) cross product for
//! borrowers whose health factor falls in `(0, 1.1)`. Shaped after
//! `paper_trading/discord_alerts.rs`'s fallible-POST-with-logged-failure
//! pattern, generalized from a fire-and-forget webhook to a polled query
//! whose rows drive the rest of the engine.

use crate::config::EnvFlags;
use crate::intake::Dedup;
use crate::types::{AssetAmount, Candidate};
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Scale of `reserve.price.priceInEth` in the subgraph response (spec
/// §4.C.1). Kept fixed per DESIGN.md Open Question #3.
const PRICE_SCALE: f64 = 1e8;
/// Scale of `reserve.reserveLiquidationThreshold` (basis points).
const LIQ_THRESHOLD_SCALE: f64 = 10_000.0;
/// Health factor is rounded through this integer scale to preserve six
/// fractional digits before being converted back to `f64` (spec §4.C.1).
const HF_SCALE: f64 = 1_000_000.0;

const QUERY: &str = r#"query UserReserves($first: Int!) {
  userReserves(first: $first, where: { user_: { borrowedReservesCount_gt: 0 } }) {
    user { id }
    reserve {
      id
      symbol
      decimals
      underlyingAsset
      reserveLiquidationThreshold
      price { priceInEth }
    }
    usageAsCollateralEnabledOnUser
    currentTotalDebt
    currentATokenBalance
  }
}"#;

const SINGLE_USER_QUERY: &str = r#"query UserReservesByUser($user: String!) {
  userReserves(where: { user: $user }) {
    user { id }
    reserve {
      id
      symbol
      decimals
      underlyingAsset
      reserveLiquidationThreshold
      price { priceInEth }
    }
    usageAsCollateralEnabledOnUser
    currentTotalDebt
    currentATokenBalance
  }
}"#;

#[derive(Debug, Deserialize)]
struct SubgraphResponse {
    #[serde(default)]
    data: Option<SubgraphData>,
    #[serde(default)]
    errors: Option<Vec<SubgraphGraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct SubgraphGraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubgraphData {
    #[serde(rename = "userReserves")]
    user_reserves: Vec<UserReserveRow>,
}

#[derive(Debug, Deserialize)]
struct UserReserveRow {
    user: UserRef,
    reserve: ReserveRef,
    #[serde(rename = "usageAsCollateralEnabledOnUser")]
    usage_as_collateral: bool,
    #[serde(rename = "currentTotalDebt")]
    current_total_debt: String,
    #[serde(rename = "currentATokenBalance")]
    current_a_token_balance: String,
}

#[derive(Debug, Deserialize)]
struct UserRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ReserveRef {
    symbol: String,
    decimals: u8,
    #[serde(rename = "underlyingAsset")]
    underlying_asset: String,
    #[serde(rename = "reserveLiquidationThreshold")]
    reserve_liquidation_threshold: String,
    price: PriceRef,
}

#[derive(Debug, Deserialize)]
struct PriceRef {
    #[serde(rename = "priceInEth")]
    price_in_eth: String,
}

/// One reserve leg for a borrower, normalized to plain numbers for the HF
/// computation. Kept separate from `AssetAmount` since the raw `U256`
/// amount (needed later, exactly, for the simulator) and the `f64` ETH
/// value (needed only for the HF filter) serve different purposes.
struct Leg {
    symbol: String,
    address: Address,
    decimals: u8,
    amount: U256,
    eth_value: f64,
    adjusted_eth_value: f64,
    is_debt: bool,
    is_collateral: bool,
}

/// Polls `chain`'s subgraph endpoint on a fixed interval, emitting
/// deduplicated candidates onto `tx` (spec §4.C.1). Runs until the process
/// shuts down; transport/parse errors are logged and the poller retries on
/// the next tick rather than terminating the loop.
pub struct SubgraphPoller {
    chain_id: u64,
    url: String,
    auth_token: Option<String>,
    http: reqwest::Client,
    dedup: Arc<Dedup>,
    last_auth_alert: std::sync::Mutex<Option<Instant>>,
}

impl SubgraphPoller {
    pub fn new(chain_id: u64, url: String, dedup: Arc<Dedup>) -> Self {
        Self {
            chain_id,
            url,
            auth_token: EnvFlags::subgraph_auth_token(chain_id),
            http: reqwest::Client::new(),
            dedup,
            last_auth_alert: std::sync::Mutex::new(None),
        }
    }

    /// Shares the dedup table with the realtime watcher so identity-key
    /// suppression applies uniformly to both producers (spec §3, §8).
    pub fn dedup(&self) -> Arc<Dedup> {
        self.dedup.clone()
    }

    /// Runs the poll loop, sending one batch of newly-eligible candidates
    /// per tick. Returns only if the channel closes (shutdown).
    pub async fn run(&self, tx: mpsc::Sender<Candidate>) {
        let base_interval = Duration::from_millis(EnvFlags::subgraph_poll_ms());
        loop {
            match self.poll_once().await {
                Ok(candidates) => {
                    for candidate in candidates {
                        if !self.dedup.should_emit(&candidate) {
                            continue;
                        }
                        match tx.try_send(candidate) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(chain_id = self.chain_id, "subgraph: candidate queue full, dropping");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "subgraph: poll failed, retrying next tick");
                }
            }
            tokio::time::sleep(base_interval).await;
        }
    }

    pub(crate) async fn poll_once(&self) -> Result<Vec<Candidate>> {
        let rows = self.execute_query(QUERY, serde_json::json!({ "first": 500 })).await?;
        Ok(rows_to_candidates(self.chain_id, rows))
    }

    /// Re-queries a single borrower's reserves, used by the realtime
    /// watcher after a debounced on-chain event instead of waiting for the
    /// next wide poll (spec §4.C.2).
    pub async fn poll_single_user(&self, borrower: Address) -> Result<Vec<Candidate>> {
        let user = format!("{:#x}", borrower);
        let rows = self.execute_query(SINGLE_USER_QUERY, serde_json::json!({ "user": user })).await?;
        Ok(rows_to_candidates(self.chain_id, rows))
    }

    async fn execute_query(&self, query: &str, variables: serde_json::Value) -> Result<Vec<UserReserveRow>> {
        let mut req = self.http.post(&self.url).json(&serde_json::json!({
            "query": query,
            "variables": variables,
        }));
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.context("subgraph HTTP request failed")?;
        let status = resp.status();
        let body_text = resp.text().await.context("reading subgraph response body")?;

        if is_auth_error(&body_text) || status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::PAYMENT_REQUIRED {
            self.raise_auth_alert(&body_text);
            anyhow::bail!("subgraph auth error: {body_text}");
        }

        let parsed: SubgraphResponse = serde_json::from_str(&body_text).context("parsing subgraph JSON response")?;
        if let Some(errors) = parsed.errors {
            let joined = errors.into_iter().map(|e| e.message).collect::<Vec<_>>().join("; ");
            anyhow::bail!("subgraph returned GraphQL errors: {joined}");
        }
        Ok(parsed.data.map(|d| d.user_reserves).unwrap_or_default())
    }

    /// Rate-limits the subgraph-auth-failure critical alert to once per 10
    /// minutes per endpoint (spec §4.C.1, §5).
    fn raise_auth_alert(&self, body: &str) {
        let mut guard = self.last_auth_alert.lock().expect("mutex poisoned");
        let now = Instant::now();
        let should_alert = match *guard {
            Some(last) => now.duration_since(last) >= Duration::from_secs(600),
            None => true,
        };
        if should_alert {
            error!(chain_id = self.chain_id, url = %self.url, body, "subgraph: authentication failure (critical)");
            *guard = Some(now);
        }
    }
}

fn u256_to_f64(value: U256) -> f64 {
    let limbs = value.as_limbs();
    let mut acc = 0f64;
    for limb in limbs.iter().rev() {
        acc = acc * 18_446_744_073_709_551_616.0 /* 2^64 */ + (*limb as f64);
    }
    acc
}

fn is_auth_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["payment required", "unauthorized", "invalid api key", "does not exist"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn rows_to_candidates(chain_id: u64, rows: Vec<UserReserveRow>) -> Vec<Candidate> {
    let mut by_borrower: std::collections::HashMap<Address, Vec<Leg>> = std::collections::HashMap::new();

    for row in rows {
        let Ok(borrower) = row.user.id.parse::<Address>() else { continue };
        let Ok(underlying) = row.reserve.underlying_asset.parse::<Address>() else { continue };
        let price_in_eth: f64 = row.reserve.price.price_in_eth.parse().unwrap_or(0.0) / PRICE_SCALE;
        let liq_threshold: f64 = row.reserve.reserve_liquidation_threshold.parse().unwrap_or(0.0) / LIQ_THRESHOLD_SCALE;
        let decimals = row.reserve.decimals;
        let scale = 10f64.powi(decimals as i32);

        let debt_amount: U256 = row.current_total_debt.parse().unwrap_or(U256::ZERO);
        let coll_amount: U256 = row.current_a_token_balance.parse().unwrap_or(U256::ZERO);

        let is_debt = !debt_amount.is_zero();
        let is_collateral = row.usage_as_collateral && !coll_amount.is_zero();
        if !is_debt && !is_collateral {
            continue;
        }

        let debt_eth = u256_to_f64(debt_amount) / scale * price_in_eth;
        let coll_eth = u256_to_f64(coll_amount) / scale * price_in_eth;
        let adjusted_coll_eth = coll_eth * liq_threshold;

        let leg = Leg {
            symbol: row.reserve.symbol,
            address: underlying,
            decimals,
            amount: if is_debt { debt_amount } else { coll_amount },
            eth_value: if is_debt { debt_eth } else { coll_eth },
            adjusted_eth_value: adjusted_coll_eth,
            is_debt,
            is_collateral,
        };
        by_borrower.entry(borrower).or_default().push(leg);
    }

    let mut out = Vec::new();
    for (borrower, legs) in by_borrower {
        let total_debt_eth: f64 = legs.iter().filter(|l| l.is_debt).map(|l| l.eth_value).sum();
        let adjusted_coll_eth: f64 = legs.iter().filter(|l| l.is_collateral).map(|l| l.adjusted_eth_value).sum();

        let health_factor = if total_debt_eth <= 0.0 {
            f64::INFINITY
        } else {
            let scaled = (adjusted_coll_eth / total_debt_eth * HF_SCALE).round();
            scaled / HF_SCALE
        };

        if !(health_factor > 0.0 && health_factor < 1.1) {
            continue;
        }

        let debt_legs: Vec<&Leg> = legs.iter().filter(|l| l.is_debt).collect();
        let coll_legs: Vec<&Leg> = legs.iter().filter(|l| l.is_collateral).collect();
        for debt_leg in &debt_legs {
            for coll_leg in &coll_legs {
                if debt_leg.address == coll_leg.address {
                    continue;
                }
                out.push(Candidate {
                    borrower,
                    chain_id,
                    debt: AssetAmount {
                        symbol: debt_leg.symbol.clone(),
                        address: debt_leg.address,
                        decimals: debt_leg.decimals,
                        amount: debt_leg.amount,
                    },
                    collateral: AssetAmount {
                        symbol: coll_leg.symbol.clone(),
                        address: coll_leg.address,
                        decimals: coll_leg.decimals,
                        amount: coll_leg.amount,
                    },
                    health_factor,
                });
            }
        }
    }

    debug!(chain_id, count = out.len(), "subgraph: candidates produced this poll");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, symbol: &str, reserve: &str, debt: &str, coll_enabled: bool, coll: &str, threshold: &str, price: &str, decimals: u8) -> UserReserveRow {
        UserReserveRow {
            user: UserRef { id: user.into() },
            reserve: ReserveRef {
                symbol: symbol.into(),
                decimals,
                underlying_asset: reserve.into(),
                reserve_liquidation_threshold: threshold.into(),
                price: PriceRef { price_in_eth: price.into() },
            },
            usage_as_collateral: coll_enabled,
            current_total_debt: debt.into(),
            current_a_token_balance: coll.into(),
        }
    }

    #[test]
    fn is_auth_error_matches_known_patterns() {
        assert!(is_auth_error("Payment Required"));
        assert!(is_auth_error("error: unauthorized"));
        assert!(is_auth_error("Invalid API Key supplied"));
        assert!(!is_auth_error("internal server error"));
    }

    #[test]
    fn rows_to_candidates_emits_cross_product_for_low_health_factor() {
        let addr_debt = "0x0000000000000000000000000000000000000001";
        let addr_coll = "0x0000000000000000000000000000000000000002";
        let borrower = "0x0000000000000000000000000000000000000009";

        // priceInEth = 1e8 (i.e. 1.0 after /PRICE_SCALE) for both reserves;
        // liquidationThreshold = 8000 bps = 0.8. debt = 1000 units, coll =
        // 1000 units -> adjustedColl = 800, HF = 0.8.
        let rows = vec![
            row(borrower, "USDC", addr_debt, "1000000000000000000000", false, "0", "8000", "100000000", 18),
            row(borrower, "WETH", addr_coll, "0", true, "1000000000000000000000", "8000", "100000000", 18),
        ];

        let candidates = rows_to_candidates(1, rows);
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].health_factor - 0.8).abs() < 1e-6);
    }

    #[test]
    fn rows_to_candidates_skips_healthy_borrowers() {
        let addr_debt = "0x0000000000000000000000000000000000000001";
        let addr_coll = "0x0000000000000000000000000000000000000002";
        let borrower = "0x0000000000000000000000000000000000000009";

        // Same prices, threshold = 10000 bps = 1.0, coll 10x debt -> HF way above 1.1.
        let rows = vec![
            row(borrower, "USDC", addr_debt, "100000000000000000000", false, "0", "10000", "100000000", 18),
            row(borrower, "WETH", addr_coll, "0", true, "1000000000000000000000", "10000", "100000000", 18),
        ];

        let candidates = rows_to_candidates(1, rows);
        assert!(candidates.is_empty());
    }

    #[test]
    fn rows_to_candidates_zero_debt_is_infinite_health_factor_and_skipped() {
        let addr_coll = "0x0000000000000000000000000000000000000002";
        let borrower = "0x0000000000000000000000000000000000000009";
        let rows = vec![row(borrower, "WETH", addr_coll, "0", true, "1000000000000000000000", "8000", "100000000", 18)];
        let candidates = rows_to_candidates(1, rows);
        assert!(candidates.is_empty());
    }
}
