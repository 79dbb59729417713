//! Chain Client Pool (spec §4.A).
//!
//! Caches at most one HTTP and one WS provider per chain id. WS errors that
//! look like `"closed"` evict the cached client so the next request builds
//! a fresh one. A cooldown timer can force `getRealtimeClient` to fall back
//! to HTTP for a chain for a bounded window, independent of eviction.
//!
//! Construction errors (bad URL, connect failure) surface to the caller;
//! this pool never retries reads — that is each caller's concern.

use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Http,
    Ws,
}

pub struct RealtimeClient {
    pub provider: DynProvider,
    pub kind: ClientKind,
}

struct ChainEntry {
    http: Mutex<Option<DynProvider>>,
    ws: Mutex<Option<DynProvider>>,
    ws_disabled_until: Mutex<Option<Instant>>,
}

impl Default for ChainEntry {
    fn default() -> Self {
        Self { http: Mutex::new(None), ws: Mutex::new(None), ws_disabled_until: Mutex::new(None) }
    }
}

/// Per-chain cached provider pool. One instance is shared across intake,
/// oracle, simulator, and executor for a given chain id.
pub struct ChainClientPool {
    entries: DashMap<u64, Arc<ChainEntry>>,
    rpc_urls: DashMap<u64, String>,
    ws_urls: DashMap<u64, String>,
}

impl ChainClientPool {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), rpc_urls: DashMap::new(), ws_urls: DashMap::new() }
    }

    pub fn register(&self, chain_id: u64, rpc_url: String, ws_url: Option<String>) {
        self.rpc_urls.insert(chain_id, rpc_url);
        if let Some(ws) = ws_url {
            self.ws_urls.insert(chain_id, ws);
        }
        self.entries.entry(chain_id).or_default();
    }

    fn entry(&self, chain_id: u64) -> Arc<ChainEntry> {
        self.entries.entry(chain_id).or_default().clone()
    }

    /// Returns (creating if necessary) the cached HTTP client for `chain_id`.
    pub async fn get_client(&self, chain_id: u64) -> Result<DynProvider> {
        let entry = self.entry(chain_id);
        let mut guard = entry.http.lock().await;
        if let Some(provider) = guard.as_ref() {
            return Ok(provider.clone());
        }
        let url = self
            .rpc_urls
            .get(&chain_id)
            .map(|v| v.clone())
            .with_context(|| format!("no RPC URL registered for chain {chain_id}"))?;
        let provider = ProviderBuilder::new().connect_http(url.parse().with_context(|| format!("invalid RPC URL for chain {chain_id}"))?);
        let dynp = DynProvider::new(provider);
        *guard = Some(dynp.clone());
        Ok(dynp)
    }

    /// Returns the preferred realtime client: WS unless disabled by cooldown
    /// or unconfigured, else HTTP (spec §4.A).
    pub async fn get_realtime_client(&self, chain_id: u64) -> Result<RealtimeClient> {
        let entry = self.entry(chain_id);
        {
            let cooldown = entry.ws_disabled_until.lock().await;
            if let Some(until) = *cooldown {
                if Instant::now() < until {
                    let http = self.get_client(chain_id).await?;
                    return Ok(RealtimeClient { provider: http, kind: ClientKind::Http });
                }
            }
        }

        if !self.ws_urls.contains_key(&chain_id) {
            let http = self.get_client(chain_id).await?;
            return Ok(RealtimeClient { provider: http, kind: ClientKind::Http });
        }

        let mut guard = entry.ws.lock().await;
        if let Some(provider) = guard.as_ref() {
            return Ok(RealtimeClient { provider: provider.clone(), kind: ClientKind::Ws });
        }

        let ws_url = self.ws_urls.get(&chain_id).map(|v| v.clone()).expect("checked contains_key above");
        match ProviderBuilder::new().connect_ws(WsConnect::new(ws_url)).await {
            Ok(provider) => {
                let dynp = DynProvider::new(provider);
                *guard = Some(dynp.clone());
                Ok(RealtimeClient { provider: dynp, kind: ClientKind::Ws })
            }
            Err(err) => {
                tracing::warn!(chain_id, error = %err, "WS connect failed, falling back to HTTP");
                drop(guard);
                let http = self.get_client(chain_id).await?;
                Ok(RealtimeClient { provider: http, kind: ClientKind::Http })
            }
        }
    }

    /// Evicts the cached WS client on a `"closed"` style error so the next
    /// `get_realtime_client` call rebuilds it.
    pub async fn evict_ws(&self, chain_id: u64) {
        let entry = self.entry(chain_id);
        let mut guard = entry.ws.lock().await;
        *guard = None;
    }

    /// Disables WS for `chain_id` for `duration`; `get_realtime_client`
    /// returns HTTP until the cooldown elapses (spec §4.A, §4.C backoff).
    pub async fn disable_ws_for(&self, chain_id: u64, duration: Duration) {
        let entry = self.entry(chain_id);
        let mut guard = entry.ws_disabled_until.lock().await;
        *guard = Some(Instant::now() + duration);
    }

    pub fn has_ws(&self, chain_id: u64) -> bool {
        self.ws_urls.contains_key(&chain_id)
    }
}

impl Default for ChainClientPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_without_ws_has_no_ws() {
        let pool = ChainClientPool::new();
        pool.register(1, "http://localhost:8545".into(), None);
        assert!(!pool.has_ws(1));
    }

    #[test]
    fn register_with_ws_has_ws() {
        let pool = ChainClientPool::new();
        pool.register(1, "http://localhost:8545".into(), Some("ws://localhost:8546".into()));
        assert!(pool.has_ws(1));
    }
}
