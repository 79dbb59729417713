//! Oracle/Price Cache (spec §4.B).
//!
//! Chainlink-style `latestRoundData` reads (with legacy `latestAnswer`/
//! `latestTimestamp` fallback), ETH/BTC-denominated feed chaining, the
//! oracle↔DEX gap used by the Scorer, and the sequencer health gate.
//!
//! Caches are single-writer: a pending read is represented as a shared
//! future so concurrent callers for the same key coalesce onto the first
//! in-flight request instead of issuing duplicate RPC calls.

use crate::chain::ChainClientPool;
use crate::config::EngineConfig;
use crate::contracts::{IAggregatorV3, IQuoterV2};
use crate::types::FeedDenomination;
use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::Shared;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Per-feed price TTL (spec §4.B).
const PRICE_TTL: Duration = Duration::from_secs(15);
/// Per-route unit-in quote TTL (spec §4.B).
const QUOTE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct PriceReading {
    pub price: Option<f64>,
    pub updated_at: Option<i64>,
    pub stale: bool,
}

impl PriceReading {
    fn stale() -> Self {
        Self { price: None, updated_at: None, stale: true }
    }
}

type SharedPriceFuture = Shared<Pin<Box<dyn Future<Output = Result<PriceReading, String>> + Send>>>;
type SharedQuoteFuture = Shared<Pin<Box<dyn Future<Output = Result<U256, String>> + Send>>>;

enum CacheEntry<T> {
    Ready(T, Instant),
    Pending(T),
}

pub struct PriceCache {
    config: Arc<EngineConfig>,
    pool: Arc<ChainClientPool>,
    prices: DashMap<(u64, Address), (f64, i64, Instant)>,
    pending_prices: DashMap<(u64, Address), SharedPriceFuture>,
    price_locks: DashMap<(u64, Address), Arc<Mutex<()>>>,
    quotes: DashMap<(u64, Address, Address, u32), (U256, Instant)>,
    pending_quotes: DashMap<(u64, Address, Address, u32), SharedQuoteFuture>,
    last_sequencer_warn: Mutex<Option<Instant>>,
}

impl PriceCache {
    pub fn new(config: Arc<EngineConfig>, pool: Arc<ChainClientPool>) -> Self {
        Self {
            config,
            pool,
            prices: DashMap::new(),
            pending_prices: DashMap::new(),
            price_locks: DashMap::new(),
            quotes: DashMap::new(),
            pending_quotes: DashMap::new(),
            last_sequencer_warn: Mutex::new(None),
        }
    }

    /// Reads a Chainlink-style feed (or its legacy fallback), converting
    /// through ETH/BTC denomination when configured, with TTL caching and
    /// in-flight coalescing (spec §4.B).
    pub async fn price_usd(&self, chain_id: u64, token: &str) -> PriceReading {
        let Some(chain) = self.config.chain(chain_id) else { return PriceReading::stale() };
        let Some(info) = chain.token(token) else { return PriceReading::stale() };
        let Some(feed) = info.oracle_feed else { return PriceReading::stale() };

        let key = (chain_id, feed);
        if let Some(entry) = self.prices.get(&key) {
            let (price, updated_at, fetched_at) = *entry;
            if fetched_at.elapsed() < PRICE_TTL {
                return PriceReading { price: Some(price), updated_at: Some(updated_at), stale: false };
            }
        }

        if let Some(fut) = self.pending_prices.get(&key).map(|f| f.clone()) {
            return fut.await.unwrap_or_else(|_| PriceReading::stale());
        }

        let pool = self.pool.clone();
        let denom = info.feed_denomination;
        let config = self.config.clone();
        let key_clone = key;
        let fut: Pin<Box<dyn Future<Output = Result<PriceReading, String>> + Send>> = Box::pin(async move {
            read_feed_chained(&pool, &config, chain_id, feed, denom).await.map_err(|e| e.to_string())
        });
        let shared = fut.shared();
        self.pending_prices.insert(key, shared.clone());
        let result = shared.await;
        self.pending_prices.remove(&key_clone);

        match result {
            Ok(reading) if !reading.stale => {
                if let (Some(price), Some(updated_at)) = (reading.price, reading.updated_at) {
                    self.prices.insert(key, (price, updated_at, Instant::now()));
                }
                reading
            }
            Ok(reading) => reading,
            Err(_) => PriceReading::stale(),
        }
    }

    /// Compares the Chainlink-implied price against the best UniV3 quote at
    /// unit input, returning the absolute relative gap in bps. Returns 0
    /// (gate effectively disabled) when the oracle is unavailable.
    pub async fn oracle_dex_gap_bps(
        &self,
        chain_id: u64,
        collateral: &str,
        debt: &str,
        fee: u32,
        router: Option<Address>,
    ) -> i64 {
        let oracle_coll = self.price_usd(chain_id, collateral).await;
        let oracle_debt = self.price_usd(chain_id, debt).await;
        let (Some(p_coll), Some(p_debt)) = (oracle_coll.price, oracle_debt.price) else { return 0 };
        if p_coll <= 0.0 || p_debt <= 0.0 {
            return 0;
        }
        let oracle_price = p_coll / p_debt;

        let Some(chain) = self.config.chain(chain_id) else { return 0 };
        let Some(coll_info) = chain.token(collateral) else { return 0 };
        let Some(debt_info) = chain.token(debt) else { return 0 };
        let _ = router;

        let unit_in = U256::from(10u128).pow(U256::from(coll_info.decimals));
        let quote_key = (chain_id, coll_info.address, debt_info.address, fee);
        let quoted = self.unit_quote(chain_id, quote_key, coll_info.address, debt_info.address, fee, unit_in).await;
        let Ok(out) = quoted else { return 0 };
        if out.is_zero() {
            return 0;
        }
        let dex_price = u256_to_f64(out) / 10f64.powi(debt_info.decimals as i32);
        if oracle_price <= 0.0 {
            return 0;
        }
        (((dex_price / oracle_price) - 1.0).abs() * 10_000.0).round() as i64
    }

    async fn unit_quote(
        &self,
        chain_id: u64,
        key: (u64, Address, Address, u32),
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_in: U256,
    ) -> Result<U256> {
        if let Some(entry) = self.quotes.get(&key) {
            let (out, fetched_at) = *entry;
            if fetched_at.elapsed() < QUOTE_TTL {
                return Ok(out);
            }
        }
        if let Some(fut) = self.pending_quotes.get(&key).map(|f| f.clone()) {
            return fut.await.map_err(|e| anyhow::anyhow!(e));
        }

        let pool = self.pool.clone();
        let config = self.config.clone();
        let fut: Pin<Box<dyn Future<Output = Result<U256, String>> + Send>> = Box::pin(async move {
            quote_univ3(&pool, &config, chain_id, token_in, token_out, fee, amount_in).await.map_err(|e| e.to_string())
        });
        let shared = fut.shared();
        self.pending_quotes.insert(key, shared.clone());
        let result = shared.await;
        self.pending_quotes.remove(&key);

        match result {
            Ok(out) => {
                self.quotes.insert(key, (out, Instant::now()));
                Ok(out)
            }
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }

    /// Sequencer health: `ok = (answer == 0) AND (now - startedAt >= grace)`.
    /// Stale if `updatedAt` older than `SEQUENCER_STALE_SECS`.
    pub async fn sequencer_ok(&self, chain_id: u64, grace_secs: i64, stale_secs: i64) -> bool {
        let Some(chain) = self.config.chain(chain_id) else { return true };
        let Some(feed) = chain.sequencer_feed else { return true };
        let Ok(provider) = self.pool.get_client(chain_id).await else { return false };
        let contract = IAggregatorV3::new(feed, provider);
        match contract.latestRoundData().call().await {
            Ok(round) => {
                let now = Utc::now().timestamp();
                let started_at = round.startedAt.to::<u64>() as i64;
                let updated_at = round.updatedAt.to::<u64>() as i64;
                if now - updated_at > stale_secs {
                    self.warn_sequencer_once(chain_id).await;
                    return false;
                }
                round.answer.is_zero() && (now - started_at) >= grace_secs
            }
            Err(err) => {
                tracing::debug!(chain_id, error = %err, "sequencer feed read failed");
                false
            }
        }
    }

    async fn warn_sequencer_once(&self, chain_id: u64) {
        let mut guard = self.last_sequencer_warn.lock().await;
        let now = Instant::now();
        if guard.map(|t| now.duration_since(t) < Duration::from_secs(60)).unwrap_or(false) {
            return;
        }
        *guard = Some(now);
        tracing::warn!(chain_id, "sequencer feed is stale");
    }
}

async fn quote_univ3(
    pool: &ChainClientPool,
    config: &EngineConfig,
    chain_id: u64,
    token_in: Address,
    token_out: Address,
    fee: u32,
    amount_in: U256,
) -> Result<U256> {
    let chain = config.chain(chain_id).context("unknown chain")?;
    let provider = pool.get_client(chain_id).await?;
    let quoter = IQuoterV2::new(chain.univ3_quoter, provider);
    let params = crate::contracts::IQuoterV2::QuoteExactInputSingleParams {
        tokenIn: token_in,
        tokenOut: token_out,
        amountIn: amount_in,
        fee,
        sqrtPriceLimitX96: Default::default(),
    };
    let result = quoter.quoteExactInputSingle(params).call().await.context("quoteExactInputSingle failed")?;
    Ok(result.amountOut)
}

/// Reads `latestRoundData`, falling back to `latestAnswer`/`latestTimestamp`
/// on revert, then chains through ETH/BTC denomination if configured.
/// Stale when `answer <= 0`, `updatedAt == 0`, `answeredInRound < roundId`,
/// or `updatedAt` older than the 15s TTL.
async fn read_feed_chained(
    pool: &ChainClientPool,
    config: &EngineConfig,
    chain_id: u64,
    feed: Address,
    denom: Option<FeedDenomination>,
) -> Result<PriceReading> {
    let base = read_feed_raw(pool, chain_id, feed).await?;
    let Some(base_reading) = base else { return Ok(PriceReading::stale()) };

    match denom {
        None | Some(FeedDenomination::Usd) => Ok(base_reading),
        Some(FeedDenomination::Eth) | Some(FeedDenomination::Btc) => {
            let chain = config.chain(chain_id).context("unknown chain")?;
            let cross_symbol = match denom {
                Some(FeedDenomination::Eth) => "ETH",
                _ => "BTC",
            };
            let Some(cross_token) = chain.token(cross_symbol) else { return Ok(PriceReading::stale()) };
            let Some(cross_feed) = cross_token.oracle_feed else { return Ok(PriceReading::stale()) };
            let cross = read_feed_raw(pool, chain_id, cross_feed).await?;
            let Some(cross_reading) = cross else { return Ok(PriceReading::stale()) };
            let (Some(base_p), Some(cross_p)) = (base_reading.price, cross_reading.price) else {
                return Ok(PriceReading::stale());
            };
            Ok(PriceReading { price: Some(base_p * cross_p), updated_at: base_reading.updated_at, stale: false })
        }
    }
}

async fn read_feed_raw(pool: &ChainClientPool, chain_id: u64, feed: Address) -> Result<Option<PriceReading>> {
    let provider = pool.get_client(chain_id).await?;
    let contract = IAggregatorV3::new(feed, provider);
    let decimals = contract.decimals().call().await.unwrap_or(18);

    match contract.latestRoundData().call().await {
        Ok(round) => {
            let now = Utc::now().timestamp();
            let updated_at = round.updatedAt.to::<u64>() as i64;
            let stale = round.answer.is_negative()
                || round.answer.is_zero()
                || round.updatedAt.is_zero()
                || round.answeredInRound < round.roundId
                || (now - updated_at) > PRICE_TTL.as_secs() as i64;
            if stale {
                return Ok(Some(PriceReading::stale()));
            }
            let price = answer_to_f64(round.answer, decimals);
            Ok(Some(PriceReading { price: Some(price), updated_at: Some(updated_at), stale: false }))
        }
        Err(_) => {
            // Legacy aggregator fallback.
            let answer = contract.latestAnswer().call().await?;
            let updated_at_raw = contract.latestTimestamp().call().await?;
            let updated_at = updated_at_raw.to::<u64>() as i64;
            let now = Utc::now().timestamp();
            if answer.is_zero() || answer.is_negative() || updated_at == 0 || (now - updated_at) > PRICE_TTL.as_secs() as i64 {
                return Ok(Some(PriceReading::stale()));
            }
            Ok(Some(PriceReading { price: Some(answer_to_f64(answer, decimals)), updated_at: Some(updated_at), stale: false }))
        }
    }
}

fn answer_to_f64(answer: alloy::primitives::I256, decimals: u8) -> f64 {
    let (_, abs) = answer.into_sign_and_abs();
    u256_to_f64(abs) / 10f64.powi(decimals as i32)
}

fn u256_to_f64(value: U256) -> f64 {
    let limbs = value.as_limbs();
    let mut acc = 0f64;
    for limb in limbs.iter().rev() {
        acc = acc * 18_446_744_073_709_551_616.0 + (*limb as f64);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_to_f64_roundtrips_small_values() {
        assert_eq!(u256_to_f64(U256::from(12345u64)), 12345.0);
    }
}
