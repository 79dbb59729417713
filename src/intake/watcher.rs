//! Realtime candidate watcher (spec §4.C.2).
//!
//! Subscribes to `Pool` borrower-activity events and `AnswerUpdated` on
//! every configured price feed, debounces per-borrower (750 ms) and
//! globally for price moves (2 s), and re-queries the subgraph for the
//! affected borrower(s) rather than tracking reserve balances locally.
//!
//! Grounded directly on `mempool/monitor.rs`'s reconnect-loop shape: an
//! outer loop bounded by `MAX_RECONNECTS` wraps an inner function that
//! runs a `tokio::select!` over the subscription stream and drops signals
//! with a warning (never blocks) when the output queue is full.

use crate::chain::{ChainClientPool, ClientKind};
use crate::config::EnvFlags;
use crate::contracts::IAggregatorV3;
use crate::contracts::IPool;
use crate::error::{classify_rpc_error, EngineError};
use crate::intake::subgraph::SubgraphPoller;
use crate::intake::Dedup;
use crate::types::{ChainConfig, Candidate};
use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const MAX_RECONNECTS: u32 = 50;
const BORROWER_DEBOUNCE: Duration = Duration::from_millis(750);
const GLOBAL_DEBOUNCE: Duration = Duration::from_secs(2);

/// Realtime per-chain event watcher driving the same candidate stream as
/// [`SubgraphPoller`]. Owns its own debounce state and WS backoff; shares
/// the dedup table and output channel with the poller.
pub struct Watcher {
    chain_id: u64,
    pool_address: Address,
    feed_addresses: Vec<Address>,
    pool: Arc<ChainClientPool>,
    subgraph: Arc<SubgraphPoller>,
    dedup: Arc<Dedup>,
    last_borrower_check: DashMap<Address, Instant>,
    last_global_check: Mutex<Instant>,
}

impl Watcher {
    /// Resolves the live `Pool` address from `chain`'s `PoolAddressesProvider`
    /// before constructing the watcher, since Pool events are emitted by
    /// the proxy Aave governance can repoint, not the fixed provider.
    pub async fn new(chain: &ChainConfig, pool: Arc<ChainClientPool>, subgraph: Arc<SubgraphPoller>) -> Result<Self> {
        let provider = pool.get_client(chain.chain_id).await?;
        let addresses_provider = crate::contracts::IPoolAddressesProvider::new(chain.pool_addresses_provider, provider);
        let pool_address = addresses_provider.getPool().call().await.context("resolving Pool address from PoolAddressesProvider")?;
        let feed_addresses = chain.tokens.values().filter_map(|t| t.oracle_feed).collect();
        let dedup = subgraph.dedup();
        Ok(Self {
            chain_id: chain.chain_id,
            pool_address,
            feed_addresses,
            pool,
            subgraph,
            dedup,
            last_borrower_check: DashMap::new(),
            last_global_check: Mutex::new(Instant::now() - GLOBAL_DEBOUNCE),
        })
    }

    /// Runs the reconnect loop until `tx` closes or reconnects are
    /// exhausted (spec §4.C.2, grounded on `mempool/monitor.rs`).
    pub async fn run(self: Arc<Self>, tx: mpsc::Sender<Candidate>) -> Result<()> {
        if !EnvFlags::watch_realtime() {
            info!(chain_id = self.chain_id, "watcher: realtime watch disabled by WATCH_REALTIME=0, subgraph poller is sole producer");
            return Ok(());
        }

        let mut reconnects = 0u32;
        let mut backoff_ms = EnvFlags::watch_poll_ms();
        let mut rate_limit_backoff_ms = EnvFlags::watch_rate_limit_backoff_ms();

        loop {
            match self.run_inner(&tx, &mut backoff_ms, &mut rate_limit_backoff_ms).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    reconnects += 1;
                    if reconnects > MAX_RECONNECTS {
                        return Err(e);
                    }
                    warn!(chain_id = self.chain_id, error = %e, reconnects, "watcher: subscription dropped, reconnecting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }

    async fn run_inner(&self, tx: &mpsc::Sender<Candidate>, backoff_ms: &mut u64, rate_limit_backoff_ms: &mut u64) -> Result<()> {
        let client = self.pool.get_realtime_client(self.chain_id).await?;

        let mut addresses = vec![self.pool_address];
        addresses.extend(self.feed_addresses.iter().copied());

        let topics: Vec<B256> = vec![
            IPool::Borrow::SIGNATURE_HASH,
            IPool::Repay::SIGNATURE_HASH,
            IPool::Supply::SIGNATURE_HASH,
            IPool::Withdraw::SIGNATURE_HASH,
            IPool::LiquidationCall::SIGNATURE_HASH,
            IAggregatorV3::AnswerUpdated::SIGNATURE_HASH,
        ];

        let filter = Filter::new().address(addresses).event_signature(topics);

        let subscription = client.provider.subscribe_logs(&filter).await.context("subscribing to Pool/feed logs")?;
        let mut stream = subscription.into_stream();

        loop {
            match stream.next().await {
                Some(log) => {
                    if let Err(e) = self.handle_log(log, tx, backoff_ms, rate_limit_backoff_ms).await {
                        debug!(chain_id = self.chain_id, error = %e, "watcher: log handling failed, continuing");
                    }
                    // Successful event handling halves backoff toward the base (spec §4.C.2).
                    *backoff_ms = (*backoff_ms / 2).max(EnvFlags::watch_poll_ms());
                    *rate_limit_backoff_ms = (*rate_limit_backoff_ms / 2).max(EnvFlags::watch_rate_limit_backoff_ms());
                }
                None => {
                    if matches!(client.kind, ClientKind::Ws) {
                        self.pool.evict_ws(self.chain_id).await;
                        let disable_for = clamp_ws_disable(*backoff_ms);
                        self.pool.disable_ws_for(self.chain_id, disable_for).await;
                    }
                    anyhow::bail!("subscription stream ended");
                }
            }
        }
    }

    async fn handle_log(&self, log: Log, tx: &mpsc::Sender<Candidate>, backoff_ms: &mut u64, rate_limit_backoff_ms: &mut u64) -> Result<()> {
        let topic0 = log.topic0().copied();

        if topic0 == Some(IAggregatorV3::AnswerUpdated::SIGNATURE_HASH) {
            self.handle_feed_update(tx).await;
            return Ok(());
        }

        let borrower = extract_borrower(&log, topic0);
        let Some(borrower) = borrower else { return Ok(()) };

        let now = Instant::now();
        let debounced = self
            .last_borrower_check
            .get(&borrower)
            .map(|last| now.duration_since(*last) < BORROWER_DEBOUNCE)
            .unwrap_or(false);
        if debounced {
            return Ok(());
        }
        self.last_borrower_check.insert(borrower, now);

        match self.subgraph.poll_single_user(borrower).await {
            Ok(candidates) => self.emit_all(candidates, tx).await,
            Err(e) => {
                let classified = classify_rpc_error(&e.to_string());
                self.apply_error_backoff(&classified, backoff_ms, rate_limit_backoff_ms).await;
            }
        }
        Ok(())
    }

    async fn handle_feed_update(&self, tx: &mpsc::Sender<Candidate>) {
        let now = Instant::now();
        {
            let mut guard = self.last_global_check.lock().await;
            if now.duration_since(*guard) < GLOBAL_DEBOUNCE {
                return;
            }
            *guard = now;
        }
        match self.subgraph.poll_once().await {
            Ok(candidates) => self.emit_all(candidates, tx).await,
            Err(e) => warn!(chain_id = self.chain_id, error = %e, "watcher: feed-triggered revalidation failed"),
        }
    }

    async fn emit_all(&self, candidates: Vec<Candidate>, tx: &mpsc::Sender<Candidate>) {
        for candidate in candidates {
            match tx.try_send(candidate) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(chain_id = self.chain_id, "watcher: candidate queue full, dropping signal");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }

    /// Doubles the relevant backoff on rate-limit vs. other transient
    /// errors, clamped to the configured maxima (spec §4.C.2).
    async fn apply_error_backoff(&self, err: &EngineError, backoff_ms: &mut u64, rate_limit_backoff_ms: &mut u64) {
        match err {
            EngineError::RateLimited(msg) => {
                *rate_limit_backoff_ms = (*rate_limit_backoff_ms * 2).min(EnvFlags::watch_max_rate_limit_backoff_ms());
                warn!(chain_id = self.chain_id, msg, backoff_ms = *rate_limit_backoff_ms, "watcher: rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(*rate_limit_backoff_ms)).await;
            }
            _ => {
                *backoff_ms = (*backoff_ms * 2).min(EnvFlags::watch_max_poll_ms());
                tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
            }
        }
    }
}

/// Extracts the borrower address from a Pool event log by decoding the
/// event matching `topic0`; returns `None` for any event type this
/// watcher does not track per-borrower (spec §4.C.2 only cares about
/// `Borrow`/`Repay`/`Supply`/`Withdraw`/`LiquidationCall`).
fn extract_borrower(log: &Log, topic0: Option<B256>) -> Option<Address> {
    let inner = &log.inner;
    if topic0 == Some(IPool::Borrow::SIGNATURE_HASH) {
        return IPool::Borrow::decode_log(inner, true).ok().map(|e| e.data.onBehalfOf);
    }
    if topic0 == Some(IPool::Repay::SIGNATURE_HASH) {
        return IPool::Repay::decode_log(inner, true).ok().map(|e| e.data.user);
    }
    if topic0 == Some(IPool::Supply::SIGNATURE_HASH) {
        return IPool::Supply::decode_log(inner, true).ok().map(|e| e.data.onBehalfOf);
    }
    if topic0 == Some(IPool::Withdraw::SIGNATURE_HASH) {
        return IPool::Withdraw::decode_log(inner, true).ok().map(|e| e.data.user);
    }
    if topic0 == Some(IPool::LiquidationCall::SIGNATURE_HASH) {
        return IPool::LiquidationCall::decode_log(inner, true).ok().map(|e| e.data.user);
    }
    None
}

/// WS-disable cooldown after a dropped subscription: `clamp(3 * backoff,
/// 30s, 300s)` (spec §4.C.2).
fn clamp_ws_disable(backoff_ms: u64) -> Duration {
    let proposed = Duration::from_millis(backoff_ms.saturating_mul(3));
    proposed.clamp(Duration::from_secs(30), Duration::from_secs(300))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_ws_disable_respects_floor_and_ceiling() {
        assert_eq!(clamp_ws_disable(100), Duration::from_secs(30));
        assert_eq!(clamp_ws_disable(1_000_000), Duration::from_secs(300));
        assert_eq!(clamp_ws_disable(20_000), Duration::from_secs(60));
    }
}
