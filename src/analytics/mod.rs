//! Analytics Loop (spec §4.J).
//!
//! Streams `liquidation_attempts`/`laf_attempts` rows into per-`(chain,
//! pair)` buckets, derives the `hitRate`/`gapSkipRate`/`errorRate`/
//! `opportunityCostUsd`/`modelDrift` signal the Adaptive Thresholds
//! feedback overlay (spec §4.G) reads, and tracks the fail-rate breach
//! condition spec §4.I.6 hands off from the Executor.
//!
//! Re-targets `paper_trading/metrics.rs::TraderMetrics`/`MetricsAggregator`
//! (win-rate/avg-profit/missed-opportunity formulas, in-memory) at
//! DB-backed attempt rows instead of in-process simulated trades. The
//! versioned `AttemptDetails` enum (tagged by `kind`) is the "weakly-typed
//! `details: any`" re-architecture DESIGN.md's §9 notes call for.

use crate::adaptive::{AdaptiveThresholds, FeedbackSignal};
use crate::error::is_retryable_db_error;
use crate::types::AttemptStatus;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Maximum DB call attempts: the initial try plus 3 retries (spec §5
/// Timeouts: "retries with exponential backoff (3x, x1.5)").
const MAX_DB_ATTEMPTS: u32 = 4;
const DB_RETRY_BASE: Duration = Duration::from_millis(250);
const DB_RETRY_FACTOR: f64 = 1.5;

/// Fail-rate breach requires at least this many execution attempts before
/// the ratio is trusted (spec §4.I.6).
const FAIL_RATE_MIN_ATTEMPTS: u64 = 5;
/// Minimum spacing between fail-rate alerts (spec §4.I.6: "15 min since
/// last alert").
const FAIL_RATE_ALERT_COOLDOWN: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------
// Versioned attempt details (spec §9 "weakly-typed details: any" rework)
// ---------------------------------------------------------------------

/// Structured, forward-evolvable replacement for an untyped JSON blob.
/// Every variant that can represent a missed opportunity carries
/// `missed_value_usd` (defaults to 0 when the gate fired before a Plan
/// existed to size), feeding the Adaptive Thresholds `opportunityCostUsd`
/// signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptDetails {
    Throttled {
        pair: String,
    },
    GapSkip {
        pair: String,
        gap_bps: i64,
        cap_bps: u32,
        #[serde(default)]
        missed_value_usd: f64,
    },
    PolicySkip {
        pair: String,
        reason: String,
        #[serde(default)]
        missed_value_usd: f64,
    },
    DryRun {
        pair: String,
        net_usd: f64,
    },
    Sent {
        pair: String,
        net_usd: f64,
        gas_usd: f64,
        mode: String,
    },
    Success {
        pair: String,
        net_usd: f64,
    },
    Error {
        pair: String,
        message: String,
    },
}

impl AttemptDetails {
    pub fn pair(&self) -> &str {
        match self {
            AttemptDetails::Throttled { pair }
            | AttemptDetails::GapSkip { pair, .. }
            | AttemptDetails::PolicySkip { pair, .. }
            | AttemptDetails::DryRun { pair, .. }
            | AttemptDetails::Sent { pair, .. }
            | AttemptDetails::Success { pair, .. }
            | AttemptDetails::Error { pair, .. } => pair,
        }
    }

    fn missed_value_usd(&self) -> f64 {
        match self {
            AttemptDetails::GapSkip { missed_value_usd, .. } | AttemptDetails::PolicySkip { missed_value_usd, .. } => *missed_value_usd,
            _ => 0.0,
        }
    }

    fn net_usd(&self) -> Option<f64> {
        match self {
            AttemptDetails::Sent { net_usd, .. } | AttemptDetails::Success { net_usd, .. } | AttemptDetails::DryRun { net_usd, .. } => Some(*net_usd),
            _ => None,
        }
    }
}

/// One row ready to be appended to `liquidation_attempts`. `id`/`created_at`
/// are DB-assigned (spec §6).
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub chain_id: u64,
    pub borrower: String,
    pub status: AttemptStatus,
    pub reason: Option<String>,
    pub tx_hash: Option<String>,
    pub details: AttemptDetails,
}

/// One row ready to be appended to `laf_attempts` (arbitrage side, spec §6).
#[derive(Debug, Clone)]
pub struct NewArbAttempt {
    pub chain_id: u64,
    pub pair_id: String,
    pub source: String,
    pub status: AttemptStatus,
    pub tx_hash: Option<String>,
    pub net_usd: f64,
    pub metadata: serde_json::Value,
}

/// A `liquidation_attempts` row as read back for bucketing.
#[derive(Debug, Clone)]
struct StoredAttempt {
    id: i64,
    chain_id: u64,
    status: AttemptStatus,
    details: serde_json::Value,
}

/// Retries a fallible DB operation up to [`MAX_DB_ATTEMPTS`] with
/// `x1.5`-backoff starting at [`DB_RETRY_BASE`], matching spec §5's DB
/// timeout/retry policy. Logs "recovered" if a later attempt succeeds
/// after an earlier failure (spec §7 DatabaseError).
async fn with_db_retry<F, Fut, T>(op: &str, mut f: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    let mut delay = DB_RETRY_BASE;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(op, attempt, "database: recovered after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_DB_ATTEMPTS || !is_retryable_db_error(&e) {
                    return Err(e);
                }
                warn!(op, attempt, error = %e, "database: retrying after transient error");
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(DB_RETRY_FACTOR);
            }
        }
    }
}

/// Append-only Postgres-backed attempt store (spec §4.J, §6). Owns the
/// `liquidation_attempts`/`laf_attempts` tables; in-memory `AttemptRow`
/// values elsewhere are ephemeral snapshots, never the source of truth
/// (spec §3 Ownership).
pub struct AttemptStore {
    db: PgPool,
    last_seen_id: AtomicU64,
}

impl AttemptStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { db, last_seen_id: AtomicU64::new(0) })
    }

    pub async fn record(&self, row: NewAttempt) -> Result<i64, sqlx::Error> {
        let details = serde_json::to_value(&row.details).expect("AttemptDetails always serializes");
        with_db_retry("insert_liquidation_attempt", || {
            let details = details.clone();
            let row = row.clone();
            async move {
                let rec = sqlx::query_scalar::<_, i64>(
                    "INSERT INTO liquidation_attempts (chain_id, borrower, status, reason, tx_hash, details) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                )
                .bind(row.chain_id as i64)
                .bind(&row.borrower)
                .bind(row.status.to_string())
                .bind(&row.reason)
                .bind(&row.tx_hash)
                .bind(&details)
                .fetch_one(&self.db)
                .await?;
                Ok(rec)
            }
        })
        .await
    }

    pub async fn record_arb(&self, row: NewArbAttempt) -> Result<i64, sqlx::Error> {
        with_db_retry("insert_laf_attempt", || {
            let row = row.clone();
            async move {
                let rec = sqlx::query_scalar::<_, i64>(
                    "INSERT INTO laf_attempts (chain_id, pair_id, source, status, tx_hash, net_usd, metadata) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
                )
                .bind(row.chain_id as i64)
                .bind(&row.pair_id)
                .bind(&row.source)
                .bind(row.status.to_string())
                .bind(&row.tx_hash)
                .bind(row.net_usd)
                .bind(&row.metadata)
                .fetch_one(&self.db)
                .await?;
                Ok(rec)
            }
        })
        .await
    }

    /// Fetches rows with `id` strictly greater than the last cursor seen by
    /// this process, advancing the cursor. Used by [`AnalyticsLoop`]'s
    /// polling tick.
    async fn fetch_new(&self) -> Result<Vec<StoredAttempt>, sqlx::Error> {
        let cursor = self.last_seen_id.load(Ordering::SeqCst) as i64;
        let rows: Vec<(i64, i64, String, serde_json::Value)> = with_db_retry("fetch_new_attempts", || async {
            sqlx::query_as(
                "SELECT id, chain_id, status, COALESCE(details, 'null'::jsonb) FROM liquidation_attempts \
                 WHERE id > $1 ORDER BY id ASC LIMIT 1000",
            )
            .bind(cursor)
            .fetch_all(&self.db)
            .await
        })
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        let mut max_id = cursor;
        for (id, chain_id, status, details) in rows {
            max_id = max_id.max(id);
            let status = parse_status(&status);
            out.push(StoredAttempt { id, chain_id: chain_id as u64, status, details });
        }
        if max_id > cursor {
            self.last_seen_id.store(max_id as u64, Ordering::SeqCst);
        }
        Ok(out)
    }
}

fn parse_status(s: &str) -> AttemptStatus {
    match s {
        "throttled" => AttemptStatus::Throttled,
        "gap_skip" => AttemptStatus::GapSkip,
        "policy_skip" => AttemptStatus::PolicySkip,
        "dry_run" => AttemptStatus::DryRun,
        "sent" => AttemptStatus::Sent,
        "success" => AttemptStatus::Success,
        _ => AttemptStatus::Error,
    }
}

// ---------------------------------------------------------------------
// Per-(chain, pair) derived metrics
// ---------------------------------------------------------------------

/// EMA smoothing for the bucket's running profit signal, reused from the
/// Adaptive Thresholds EMA shape (spec §4.G) rather than a distinct
/// constant.
const PROFIT_EMA_ALPHA: f64 = 0.2;

/// Rolling counts and an EMA-tracked profit signal for one `(chain, pair)`
/// key, the precursor to a [`FeedbackSignal`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PairBucket {
    pub total: u64,
    pub sent: u64,
    pub success: u64,
    pub error: u64,
    pub gap_skip: u64,
    pub policy_skip: u64,
    pub throttled: u64,
    pub opportunity_cost_usd: f64,
    profit_ema: Option<f64>,
    baseline_profit_ema: Option<f64>,
}

impl PairBucket {
    pub fn record(&mut self, status: AttemptStatus, details: &AttemptDetails) {
        self.total += 1;
        match status {
            AttemptStatus::Sent => self.sent += 1,
            AttemptStatus::Success => self.success += 1,
            AttemptStatus::Error => self.error += 1,
            AttemptStatus::GapSkip => self.gap_skip += 1,
            AttemptStatus::PolicySkip => self.policy_skip += 1,
            AttemptStatus::Throttled => self.throttled += 1,
            AttemptStatus::DryRun => {}
        }
        self.opportunity_cost_usd += details.missed_value_usd();
        if let Some(net_usd) = details.net_usd() {
            let ema = self.profit_ema.unwrap_or(net_usd) + PROFIT_EMA_ALPHA * (net_usd - self.profit_ema.unwrap_or(net_usd));
            self.profit_ema = Some(ema);
            self.baseline_profit_ema.get_or_insert(net_usd);
        }
    }

    /// Fraction of evaluated candidates that were actually acted on
    /// (submitted or confirmed), vs. skipped/throttled/errored. Feeds the
    /// "missing opportunities" feedback signal (spec §4.G).
    pub fn hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.sent + self.success) as f64 / self.total as f64
        }
    }

    pub fn gap_skip_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.gap_skip as f64 / self.total as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.error as f64 / self.total as f64
        }
    }

    /// Sign/direction of the EMA-tracked profit signal relative to its
    /// first observed value: positive when recent attempts are trending
    /// more profitable than the bucket's baseline, negative when trending
    /// worse. Feeds the Adaptive Thresholds `modelDrift` nudge (spec §4.G).
    pub fn model_drift(&self) -> f64 {
        match (self.profit_ema, self.baseline_profit_ema) {
            (Some(current), Some(baseline)) => current - baseline,
            _ => 0.0,
        }
    }

    pub fn feedback_signal(&self) -> FeedbackSignal {
        FeedbackSignal {
            hit_rate: self.hit_rate(),
            gap_skip_rate: self.gap_skip_rate(),
            error_rate: self.error_rate(),
            opportunity_cost_usd: self.opportunity_cost_usd,
            model_drift: self.model_drift(),
        }
    }
}

// ---------------------------------------------------------------------
// Fail-rate breach tracking (spec §4.I.6, §7)
// ---------------------------------------------------------------------

/// Alerting is an external collaborator per spec §1 (Slack/PagerDuty
/// senders out of scope); this crate owns only the decision of *when* to
/// alert and hands the event to whatever [`AlertSink`] the binary wires
/// up. [`TracingAlertSink`] is the in-repo default — a structured log line
/// at `error` level.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, event: AlertEvent);
}

#[derive(Debug, Clone)]
pub enum AlertEvent {
    FailRateBreach { attempts: u64, errors: u64, ratio: f64 },
    SubgraphAuthFailure { chain_id: u64, endpoint: String },
}

pub struct TracingAlertSink;

#[async_trait::async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, event: AlertEvent) {
        error!(?event, "ALERT");
    }
}

/// Tracks execution attempts/errors across the whole process (not
/// per-pair) and rate-limits the fail-rate breach alert to one per 15
/// minutes once `attempts >= 5` and `errors/attempts > failRateCap` (spec
/// §4.I.6).
pub struct FailRateTracker {
    attempts: AtomicU64,
    errors: AtomicU64,
    last_alert: Mutex<Option<Instant>>,
}

impl FailRateTracker {
    pub fn new() -> Self {
        Self { attempts: AtomicU64::new(0), errors: AtomicU64::new(0), last_alert: Mutex::new(None) }
    }

    pub fn record(&self, status: AttemptStatus) {
        match status {
            AttemptStatus::Sent | AttemptStatus::Success => {
                self.attempts.fetch_add(1, Ordering::SeqCst);
            }
            AttemptStatus::Error => {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    /// Returns `Some` at most once per 15-minute window once the breach
    /// condition holds.
    pub async fn check(&self, fail_rate_cap: f64) -> Option<AlertEvent> {
        let attempts = self.attempts.load(Ordering::SeqCst);
        if attempts < FAIL_RATE_MIN_ATTEMPTS {
            return None;
        }
        let errors = self.errors.load(Ordering::SeqCst);
        let ratio = errors as f64 / attempts as f64;
        if ratio <= fail_rate_cap {
            return None;
        }
        let mut guard = self.last_alert.lock().await;
        let should_alert = guard.map(|t| t.elapsed() >= FAIL_RATE_ALERT_COOLDOWN).unwrap_or(true);
        if !should_alert {
            return None;
        }
        *guard = Some(Instant::now());
        Some(AlertEvent::FailRateBreach { attempts, errors, ratio })
    }
}

impl Default for FailRateTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Analytics Loop
// ---------------------------------------------------------------------

/// Periodic poller (spec §4.J): reads new attempt rows, folds them into
/// per-`(chain, pair)` buckets, pushes the derived [`FeedbackSignal`] into
/// [`AdaptiveThresholds`], and watches the process-wide fail rate.
pub struct AnalyticsLoop {
    store: Arc<AttemptStore>,
    adaptive: Arc<AdaptiveThresholds>,
    buckets: DashMap<(u64, String), PairBucket>,
    fail_rate: FailRateTracker,
    alert_sink: Arc<dyn AlertSink>,
    fail_rate_cap: f64,
    auto_stop: bool,
    pub should_stop: Arc<AtomicBool>,
}

impl AnalyticsLoop {
    pub fn new(store: Arc<AttemptStore>, adaptive: Arc<AdaptiveThresholds>, alert_sink: Arc<dyn AlertSink>, fail_rate_cap: f64, auto_stop: bool) -> Arc<Self> {
        Arc::new(Self {
            store,
            adaptive,
            buckets: DashMap::new(),
            fail_rate: FailRateTracker::new(),
            alert_sink,
            fail_rate_cap,
            auto_stop,
            should_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs until the process exits. `poll_interval` is clamped to at
    /// least 1 s (spec §5 "Periodic analytics loop ... period = max(pollInterval, 1s)").
    pub async fn run(self: Arc<Self>, poll_interval: Duration) {
        let period = poll_interval.max(Duration::from_secs(1));
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "analytics: tick failed");
            }
            tokio::time::sleep(period).await;
        }
    }

    async fn tick(&self) -> Result<(), sqlx::Error> {
        let rows = self.store.fetch_new().await?;
        for row in rows {
            let details: AttemptDetails = match serde_json::from_value(row.details) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let pair = details.pair().to_string();
            let key = (row.chain_id, pair.clone());
            let signal = {
                let mut bucket = self.buckets.entry(key).or_default();
                bucket.record(row.status, &details);
                bucket.feedback_signal()
            };
            self.adaptive.record_feedback(row.chain_id, &pair, signal).await;
            self.fail_rate.record(row.status);
        }

        if let Some(alert) = self.fail_rate.check(self.fail_rate_cap).await {
            self.alert_sink.raise(alert).await;
            if self.auto_stop {
                self.should_stop.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(pair: &str, net_usd: f64) -> AttemptDetails {
        AttemptDetails::Sent { pair: pair.into(), net_usd, gas_usd: 1.0, mode: "flash".into() }
    }

    #[test]
    fn attempt_details_round_trips_through_json() {
        let details = AttemptDetails::GapSkip { pair: "USDC/WETH".into(), gap_bps: 80, cap_bps: 60, missed_value_usd: 12.5 };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["kind"], "gap_skip");
        let back: AttemptDetails = serde_json::from_value(value).unwrap();
        assert_eq!(back.pair(), "USDC/WETH");
        assert_eq!(back.missed_value_usd(), 12.5);
    }

    #[test]
    fn pair_bucket_hit_rate_counts_sent_and_success() {
        let mut bucket = PairBucket::default();
        bucket.record(AttemptStatus::Sent, &sent("USDC/WETH", 10.0));
        bucket.record(AttemptStatus::GapSkip, &AttemptDetails::GapSkip { pair: "USDC/WETH".into(), gap_bps: 70, cap_bps: 60, missed_value_usd: 5.0 });
        bucket.record(AttemptStatus::Success, &sent("USDC/WETH", 12.0));
        assert_eq!(bucket.total, 3);
        assert!((bucket.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((bucket.gap_skip_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(bucket.opportunity_cost_usd, 5.0);
    }

    #[test]
    fn pair_bucket_model_drift_tracks_profit_trend() {
        let mut bucket = PairBucket::default();
        bucket.record(AttemptStatus::Sent, &sent("USDC/WETH", 10.0));
        for _ in 0..10 {
            bucket.record(AttemptStatus::Sent, &sent("USDC/WETH", 40.0));
        }
        assert!(bucket.model_drift() > 0.0);
    }

    #[tokio::test]
    async fn fail_rate_tracker_requires_minimum_attempts() {
        let tracker = FailRateTracker::new();
        for _ in 0..3 {
            tracker.record(AttemptStatus::Error);
        }
        assert!(tracker.check(0.1).await.is_none());
    }

    #[tokio::test]
    async fn fail_rate_tracker_alerts_once_until_cooldown() {
        let tracker = FailRateTracker::new();
        for _ in 0..4 {
            tracker.record(AttemptStatus::Error);
        }
        tracker.record(AttemptStatus::Sent);
        assert!(tracker.check(0.2).await.is_some());
        assert!(tracker.check(0.2).await.is_none());
    }

    #[tokio::test]
    async fn fail_rate_tracker_silent_under_cap() {
        let tracker = FailRateTracker::new();
        for _ in 0..10 {
            tracker.record(AttemptStatus::Sent);
        }
        assert!(tracker.check(0.2).await.is_none());
    }
}
