//! Executor (spec §4.I).
//!
//! Turns an approved `Plan` into at-most-one signed transaction. Generalizes
//! `arbitrage/executor.rs::TradeExecutor`'s dry-run flag, balance-check, and
//! `SignerMiddleware`-wrapped submission shape from a two-leg swap to a
//! single atomic `liquidateWithFlash`/`liquidateWithFunds` call, and adds the
//! spec's inventory-mode balance check and distributed per-sender nonce lock
//! (shared shape with [`crate::throttle::RateWindow`]).

use crate::chain::ChainClientPool;
use crate::config::EngineConfig;
use crate::contracts::IERC20;
use crate::oracle::PriceCache;
use crate::simulate::{classify_revert, encode_liquidate_call, CallContext, RevertClassification};
use crate::throttle::SessionCaps;
use crate::types::{Candidate, ExecutionMode, Plan, RouteQuote};
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::Provider;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const INVENTORY_CACHE_TTL: Duration = Duration::from_secs(5);
const NONCE_LOCK_TTL_MS: u64 = 30_000;

/// Outcome of one execution attempt (spec §4.I.6).
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Sent { tx_hash: String },
    HealthFactorRecovered,
    Reverted { message: String },
    Infra { message: String },
}

/// 5 s ERC20 balance cache used for the inventory-vs-flash decision (spec
/// §4.I.1), shared in shape with the fabric Inventory Manager (spec §4.K).
pub struct BalanceCache {
    pool: Arc<ChainClientPool>,
    entries: DashMap<(u64, Address, Address), (U256, Instant)>,
}

impl BalanceCache {
    pub fn new(pool: Arc<ChainClientPool>) -> Self {
        Self { pool, entries: DashMap::new() }
    }

    pub async fn balance_of(&self, chain_id: u64, token: Address, holder: Address) -> Result<U256> {
        let key = (chain_id, token, holder);
        if let Some(entry) = self.entries.get(&key) {
            if entry.1.elapsed() < INVENTORY_CACHE_TTL {
                return Ok(entry.0);
            }
        }
        let provider = self.pool.get_client(chain_id).await?;
        let contract = IERC20::new(token, provider);
        let balance = contract.balanceOf(holder).call().await.context("balanceOf call failed")?;
        self.entries.insert(key, (balance, Instant::now()));
        Ok(balance)
    }
}

/// Distributed per-`(chainId, sender)` nonce lock (spec §4.I.5): Redis
/// `SET NX PX` when configured, an in-memory per-key `tokio::sync::Mutex`
/// fallback otherwise.
pub struct NonceLock {
    redis: Option<redis::aio::ConnectionManager>,
    memory: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NonceLock {
    pub async fn new(redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => client.get_connection_manager().await.ok(),
                Err(_) => None,
            },
            None => None,
        };
        Self { redis, memory: Mutex::new(HashMap::new()) }
    }

    /// Runs `f` while holding the lock for `(chain_id, sender)`, serializing
    /// concurrent submissions from the same sender on the same chain.
    pub async fn with_lock<F, Fut, T>(&self, chain_id: u64, sender: Address, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = format!("nonce-lock:{chain_id}:{:#x}", sender);
        if let Some(manager) = &self.redis {
            let mut conn = manager.clone();
            loop {
                let acquired: redis::RedisResult<Option<String>> =
                    redis::cmd("SET").arg(&key).arg("1").arg("NX").arg("PX").arg(NONCE_LOCK_TTL_MS).query_async(&mut conn).await;
                match acquired {
                    Ok(Some(_)) => break,
                    Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                    Err(e) => {
                        warn!(error = %e, "executor: nonce-lock Redis call failed, proceeding without distributed lock");
                        break;
                    }
                }
            }
            let result = f().await;
            let _: redis::RedisResult<()> = redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
            result
        } else {
            let guard = {
                let mut table = self.memory.lock().await;
                table.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
            };
            let _permit = guard.lock().await;
            f().await
        }
    }
}

/// Builds call data, chooses inventory vs. flash mode, signs, and submits
/// (spec §4.I).
pub struct Executor {
    pool: Arc<ChainClientPool>,
    config: Arc<EngineConfig>,
    oracle: Arc<PriceCache>,
    balances: BalanceCache,
    nonce_lock: NonceLock,
    pub session_caps: Arc<SessionCaps>,
}

impl Executor {
    pub async fn new(pool: Arc<ChainClientPool>, config: Arc<EngineConfig>, oracle: Arc<PriceCache>, redis_url: Option<&str>, session_caps: Arc<SessionCaps>) -> Self {
        let balances = BalanceCache::new(pool.clone());
        let nonce_lock = NonceLock::new(redis_url).await;
        Self { pool, config, oracle, balances, nonce_lock, session_caps }
    }

    /// Runs the full submission pipeline (spec §4.I steps 1-4) for an
    /// approved plan. Returns `Ok(None)` when dry-run is enabled (no
    /// transaction is sent). Step 5 (nonce lock) wraps the actual send.
    pub async fn execute(&self, candidate: &Candidate, plan: &Plan, ctx: &CallContext, signer: &PrivateKeySigner, dry_run: bool) -> Result<ExecutionOutcome> {
        // Step 1: inventory mode.
        let inventory_mode = crate::config::EnvFlags::inventory_mode();
        let mode = if inventory_mode {
            match self.balances.balance_of(candidate.chain_id, candidate.debt.address, ctx.contract).await {
                Ok(balance) if balance >= plan.repay_amount => ExecutionMode::Funds,
                _ => ExecutionMode::Flash,
            }
        } else {
            ExecutionMode::Flash
        };

        // Step 2: pre-send sequencer re-check.
        let grace = crate::config::EnvFlags::sequencer_grace_secs();
        let stale = crate::config::EnvFlags::sequencer_stale_secs();
        if !self.oracle.sequencer_ok(candidate.chain_id, grace, stale).await {
            return Ok(ExecutionOutcome::Infra { message: "sequencer down at pre-send re-check".into() });
        }

        // Step 3: build call data.
        let quote = RouteQuote { option: plan.route, quoted_out: plan.amount_out_min, amount_out_min: plan.amount_out_min };
        let funds_mode = matches!(mode, ExecutionMode::Funds);
        let call_data = encode_liquidate_call(candidate, plan.repay_amount, plan.min_profit, &quote, ctx, funds_mode);

        if dry_run {
            info!(chain_id = candidate.chain_id, borrower = %candidate.borrower, mode = ?mode, "executor: dry-run, not submitting");
            return Ok(ExecutionOutcome::Infra { message: "dry_run".into() });
        }

        // Step 4 + 5: estimate gas once more, submit (private RPC when
        // configured), serialized by the per-sender nonce lock.
        let chain = self.config.chain(candidate.chain_id).context("unknown chain")?;
        let contract = ctx.contract;
        let chain_id = candidate.chain_id;
        let sender = signer.address();

        let rpc_url = chain.rpc_url.clone();
        let private_url = chain.private_submission_url.clone();
        let outcome = self
            .nonce_lock
            .with_lock(chain_id, sender, || async { self.submit(contract, &call_data, signer, &rpc_url, private_url.as_deref()).await })
            .await;

        match &outcome {
            ExecutionOutcome::Sent { .. } => {
                self.session_caps.record_execution(plan.repay_usd);
            }
            ExecutionOutcome::HealthFactorRecovered => {
                info!(chain_id, borrower = %candidate.borrower, "executor: liquidation reverted, borrower health factor recovered before send");
            }
            ExecutionOutcome::Reverted { message } => {
                error!(chain_id, borrower = %candidate.borrower, message, "executor: liquidation transaction reverted");
            }
            ExecutionOutcome::Infra { message } => {
                warn!(chain_id, borrower = %candidate.borrower, message, "executor: submission failed (infra)");
            }
        }

        Ok(outcome)
    }

    /// Re-estimates gas once more, then submits over the private relay URL
    /// when configured for the chain, else the public RPC (spec §4.I.4).
    /// Builds a one-shot wallet-filled provider rather than reusing the
    /// pool's plain HTTP client, since submission needs the signer attached
    /// as a filler.
    async fn submit(&self, to: Address, call_data: &Bytes, signer: &PrivateKeySigner, rpc_url: &str, private_url: Option<&str>) -> ExecutionOutcome {
        let url = private_url.unwrap_or(rpc_url);
        let parsed = match url.parse() {
            Ok(p) => p,
            Err(_) => return ExecutionOutcome::Infra { message: format!("invalid submission URL: {url}") },
        };
        let provider = alloy::providers::ProviderBuilder::new().wallet(signer.clone()).connect_http(parsed);
        let tx = alloy::rpc::types::TransactionRequest::default().to(to).input(call_data.clone().into());

        if let Err(e) = provider.estimate_gas(tx.clone()).await {
            return match classify_revert(&e.to_string()) {
                RevertClassification::HealthFactorRecovered => ExecutionOutcome::HealthFactorRecovered,
                RevertClassification::Other(msg) => ExecutionOutcome::Reverted { message: msg },
                RevertClassification::Infra(msg) => ExecutionOutcome::Infra { message: msg },
            };
        }

        match provider.send_transaction(tx).await {
            Ok(pending) => ExecutionOutcome::Sent { tx_hash: format!("{:#x}", pending.tx_hash()) },
            Err(e) => match classify_revert(&e.to_string()) {
                RevertClassification::HealthFactorRecovered => ExecutionOutcome::HealthFactorRecovered,
                RevertClassification::Other(msg) => ExecutionOutcome::Reverted { message: msg },
                RevertClassification::Infra(msg) => ExecutionOutcome::Infra { message: msg },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonce_lock_memory_path_serializes_access() {
        let lock = NonceLock::new(None).await;
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let sender = Address::with_last_byte(1);
        let c1 = counter.clone();
        let c2 = counter.clone();
        let (a, b) = tokio::join!(
            lock.with_lock(1, sender, || async move {
                let v = c1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                v
            }),
            lock.with_lock(1, sender, || async move {
                let v = c2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                v
            }),
        );
        assert_ne!(a, b);
    }
}
