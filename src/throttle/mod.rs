//! Throttle / Session Cap / Kill Switch (spec §4.H).
//!
//! Generalizes `arbitrage/cooldown.rs::RouteCooldown`'s escalating-backoff,
//! `HashMap`-keyed suppression shape into plain fixed-window rate limits
//! keyed per spec (`(chainId, borrower, 3600s)` for liquidations,
//! `(chainId, pairId, 300s)` for arbitrage edges), backed by Redis when
//! configured and an in-memory fallback when Redis is unavailable.

use redis::AsyncCommands;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// In-memory fixed-window counter, used directly when no Redis URL is
/// configured and as the fallback when Redis calls fail.
#[derive(Default)]
struct MemoryWindow {
    entries: HashMap<String, (u64, Instant)>,
}

impl MemoryWindow {
    fn increment(&mut self, key: &str, window: Duration) -> u64 {
        let now = Instant::now();
        let entry = self.entries.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= window {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0
    }
}

/// Sliding/fixed rate-limit window with a Redis-preferred, in-memory-
/// fallback backend (spec §4.H: borrower throttle and edge throttle share
/// this shape, differing only in key and window).
pub struct RateWindow {
    redis: Option<redis::aio::ConnectionManager>,
    memory: Mutex<MemoryWindow>,
}

impl RateWindow {
    pub async fn new(redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(manager) => Some(manager),
                    Err(e) => {
                        warn!(error = %e, "throttle: failed to connect to Redis, using in-memory fallback");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "throttle: invalid Redis URL, using in-memory fallback");
                    None
                }
            },
            None => None,
        };
        Self { redis, memory: Mutex::new(MemoryWindow::default()) }
    }

    /// Increments the counter for `key` within `window`, returning the new
    /// count. Uses `INCR` + `EXPIRE NX` against Redis when available,
    /// falling back to the in-memory window on any Redis error.
    pub async fn increment(&self, key: &str, window: Duration) -> u64 {
        if let Some(manager) = &self.redis {
            let mut conn = manager.clone();
            let result: redis::RedisResult<u64> = async {
                let count: u64 = conn.incr(key, 1u64).await?;
                let _: () = redis::cmd("EXPIRE").arg(key).arg(window.as_secs()).arg("NX").query_async(&mut conn).await?;
                Ok(count)
            }
            .await;
            match result {
                Ok(count) => return count,
                Err(e) => warn!(error = %e, key, "throttle: Redis increment failed, using in-memory fallback"),
            }
        }
        self.memory.lock().await.increment(key, window)
    }
}

/// Borrower throttle: `(chainId, borrower, 3600s)` sliding window, rejects
/// once the count reaches `maxAttemptsPerBorrowerHour`.
pub struct BorrowerThrottle {
    window: RateWindow,
}

impl BorrowerThrottle {
    pub async fn new(redis_url: Option<&str>) -> Self {
        Self { window: RateWindow::new(redis_url).await }
    }

    /// Records one scored attempt for `(chain_id, borrower)` and reports
    /// whether it is allowed to proceed (`count < max_per_hour`).
    pub async fn record_and_check(&self, chain_id: u64, borrower: alloy::primitives::Address, max_per_hour: u32) -> bool {
        let key = format!("throttle:borrower:{chain_id}:{borrower:#x}");
        let count = self.window.increment(&key, Duration::from_secs(3600)).await;
        count <= max_per_hour as u64
    }
}

/// Edge throttle (arbitrage): `(chainId, pairId, 300s)`, default limit 6.
pub struct EdgeThrottle {
    window: RateWindow,
    window_secs: u64,
    limit: u32,
}

impl EdgeThrottle {
    pub async fn new(redis_url: Option<&str>, limit: u32, window_secs: u64) -> Self {
        Self { window: RateWindow::new(redis_url).await, window_secs, limit }
    }

    pub async fn record_and_check(&self, chain_id: u64, pair_id: &str) -> bool {
        let key = format!("throttle:edge:{chain_id}:{pair_id}");
        let count = self.window.increment(&key, Duration::from_secs(self.window_secs)).await;
        count <= self.limit as u64
    }
}

/// Kill switch: a configured file path and/or env flag. Checked once per
/// candidate; once tripped, intake stops and the runner drains (spec
/// §4.H, §5 Cancellation & Shutdown).
pub struct KillSwitch {
    file: Option<PathBuf>,
    env_var: &'static str,
}

impl KillSwitch {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self { file, env_var: "KILL_SWITCH" }
    }

    /// True once the kill switch has tripped: the configured file exists,
    /// or the env flag is set to a truthy value.
    pub fn is_tripped(&self) -> bool {
        if let Some(path) = &self.file {
            if path.exists() {
                return true;
            }
        }
        matches!(std::env::var(self.env_var), Ok(v) if v == "1" || v.eq_ignore_ascii_case("true"))
    }
}

/// Session caps: cumulative sent executions and cumulative planned
/// notional USD. Once either bound is reached the runner drains
/// gracefully (spec §4.H).
pub struct SessionCaps {
    max_live_executions: u64,
    max_session_notional_usd: f64,
    executions_sent: AtomicU64,
    notional_usd_bits: AtomicU64,
}

impl SessionCaps {
    pub fn new(max_live_executions: u64, max_session_notional_usd: f64) -> Arc<Self> {
        Arc::new(Self {
            max_live_executions,
            max_session_notional_usd,
            executions_sent: AtomicU64::new(0),
            notional_usd_bits: AtomicU64::new(0f64.to_bits()),
        })
    }

    /// Returns true if recording one more execution of `notional_usd` would
    /// stay within both caps, without mutating state — used as a
    /// pre-submission gate.
    pub fn would_exceed(&self, notional_usd: f64) -> bool {
        let sent = self.executions_sent.load(Ordering::SeqCst);
        let current_notional = f64::from_bits(self.notional_usd_bits.load(Ordering::SeqCst));
        sent + 1 > self.max_live_executions || current_notional + notional_usd > self.max_session_notional_usd
    }

    /// Records one sent execution against the session caps.
    pub fn record_execution(&self, notional_usd: f64) {
        self.executions_sent.fetch_add(1, Ordering::SeqCst);
        loop {
            let current = self.notional_usd_bits.load(Ordering::SeqCst);
            let next = (f64::from_bits(current) + notional_usd).to_bits();
            if self.notional_usd_bits.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                break;
            }
        }
    }

    pub fn executions_sent(&self) -> u64 {
        self.executions_sent.load(Ordering::SeqCst)
    }

    pub fn notional_usd(&self) -> f64 {
        f64::from_bits(self.notional_usd_bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn borrower_throttle_rejects_after_limit() {
        let throttle = BorrowerThrottle::new(None).await;
        let borrower = alloy::primitives::Address::with_last_byte(7);
        assert!(throttle.record_and_check(1, borrower, 2).await);
        assert!(throttle.record_and_check(1, borrower, 2).await);
        assert!(!throttle.record_and_check(1, borrower, 2).await);
    }

    #[tokio::test]
    async fn borrower_throttle_independent_per_chain() {
        let throttle = BorrowerThrottle::new(None).await;
        let borrower = alloy::primitives::Address::with_last_byte(9);
        assert!(throttle.record_and_check(1, borrower, 1).await);
        assert!(!throttle.record_and_check(1, borrower, 1).await);
        assert!(throttle.record_and_check(2, borrower, 1).await);
    }

    #[tokio::test]
    async fn edge_throttle_default_limit_six() {
        let throttle = EdgeThrottle::new(None, 6, 300).await;
        for _ in 0..6 {
            assert!(throttle.record_and_check(10, "USDC/WETH").await);
        }
        assert!(!throttle.record_and_check(10, "USDC/WETH").await);
    }

    #[test]
    fn kill_switch_untripped_without_file_or_env() {
        std::env::remove_var("KILL_SWITCH");
        let switch = KillSwitch::new(None);
        assert!(!switch.is_tripped());
    }

    #[test]
    fn session_caps_reject_beyond_execution_count() {
        let caps = SessionCaps::new(1, 1_000_000.0);
        assert!(!caps.would_exceed(10.0));
        caps.record_execution(10.0);
        assert!(caps.would_exceed(10.0));
    }

    #[test]
    fn session_caps_reject_beyond_notional() {
        let caps = SessionCaps::new(100, 50.0);
        assert!(!caps.would_exceed(40.0));
        caps.record_execution(40.0);
        assert!(caps.would_exceed(40.0));
        assert!(!caps.would_exceed(5.0));
    }
}
