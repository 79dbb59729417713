//! Adaptive Thresholds (spec §4.G).
//!
//! EMA/volatility model of the observed oracle↔DEX gap per (chain, pair),
//! widening or tightening the health-factor ceiling and gap cap the Scorer
//! reads. Optionally delegates the threshold computation to a remote risk
//! model over HTTP, falling back to the local EMA model on failure —
//! generalizes the graceful webhook degradation in
//! `paper_trading/discord_alerts.rs::DiscordAlerter` (optional URL, log and
//! continue on send failure) from a fire-and-forget notification to a
//! request/response call with a computed fallback.

use crate::types::{AdaptiveResult, AdaptiveSample};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// EMA smoothing factor (spec §4.G).
const ALPHA: f64 = 0.2;

/// Minimum gap cap floor, regardless of EMA/feedback adjustments.
const GAP_CAP_FLOOR_BPS: u32 = 20;

#[derive(Debug, Clone, Copy, Default)]
struct EmaState {
    ema_gap: f64,
    ema_vol: f64,
}

/// Feedback overlay derived from the Analytics Loop's per-(chain, pair)
/// rolling metrics (spec §4.J -> §4.G).
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackSignal {
    pub hit_rate: f64,
    pub gap_skip_rate: f64,
    pub error_rate: f64,
    pub opportunity_cost_usd: f64,
    pub model_drift: f64,
}

/// Per-(chain, pair) EMA/volatility model with an optional remote override
/// and an Analytics feedback overlay.
pub struct AdaptiveThresholds {
    remote_url: Option<String>,
    http: reqwest::Client,
    states: RwLock<HashMap<(u64, String), EmaState>>,
    results: RwLock<HashMap<(u64, String), AdaptiveResult>>,
    feedback: RwLock<HashMap<(u64, String), FeedbackSignal>>,
    last_remote_warn: Mutex<Option<Instant>>,
}

impl AdaptiveThresholds {
    pub fn new(remote_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            remote_url,
            http: reqwest::Client::new(),
            states: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            feedback: RwLock::new(HashMap::new()),
            last_remote_warn: Mutex::new(None),
        })
    }

    /// Returns the thresholds currently in effect for `(chain_id, pair_key)`.
    /// Before any sample has been ingested this is exactly the configured
    /// base values (no adjustment).
    pub async fn current(&self, chain_id: u64, pair_key: &str, base_health_factor_max: f64, base_gap_cap_bps: u32) -> AdaptiveResult {
        let key = (chain_id, pair_key.to_string());
        if let Some(result) = self.results.read().await.get(&key) {
            return *result;
        }
        AdaptiveResult { health_factor_max: base_health_factor_max, gap_cap_bps: base_gap_cap_bps, volatility: 0.0 }
    }

    /// Ingests one observed oracle↔DEX gap sample for `(chain_id,
    /// pair_key)`, updates the EMA/volatility state, recomputes the
    /// clamped thresholds (optionally via the remote model), applies the
    /// Analytics feedback overlay, and returns the new result. Called by
    /// the Analytics Loop (spec §4.J) as it ingests attempt outcomes.
    pub async fn sample(&self, chain_id: u64, pair_key: &str, base_health_factor_max: f64, base_gap_cap_bps: u32, observed_gap_bps: i64) -> AdaptiveResult {
        let key = (chain_id, pair_key.to_string());
        let gap = observed_gap_bps.max(0) as f64;

        let state = {
            let mut states = self.states.write().await;
            let entry = states.entry(key.clone()).or_default();
            entry.ema_gap += ALPHA * (gap - entry.ema_gap);
            entry.ema_vol += ALPHA * ((gap - entry.ema_gap).abs() - entry.ema_vol);
            *entry
        };

        let local = local_thresholds(base_health_factor_max, base_gap_cap_bps, state.ema_vol);

        let mut result = if let Some(url) = &self.remote_url {
            let sample = AdaptiveSample { base_health_factor_max, base_gap_cap_bps, observed_gap_bps };
            match self.post_remote(url, chain_id, pair_key, sample).await {
                Ok(remote) => remote,
                Err(e) => {
                    self.warn_remote_once(&e).await;
                    local
                }
            }
        } else {
            local
        };

        if let Some(fb) = self.feedback.read().await.get(&key) {
            apply_feedback(&mut result, fb, base_health_factor_max, base_gap_cap_bps);
        }

        self.results.write().await.insert(key, result);
        result
    }

    /// Records the latest Analytics-derived feedback signal for a pair,
    /// taking effect on the next [`Self::sample`] call.
    pub async fn record_feedback(&self, chain_id: u64, pair_key: &str, signal: FeedbackSignal) {
        self.feedback.write().await.insert((chain_id, pair_key.to_string()), signal);
    }

    async fn post_remote(&self, url: &str, chain_id: u64, pair_key: &str, sample: AdaptiveSample) -> Result<AdaptiveResult, String> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            chain_id: u64,
            pair: &'a str,
            #[serde(flatten)]
            sample: AdaptiveSample,
        }
        let body = Request { chain_id, pair: pair_key, sample };
        let response = self.http.post(url).json(&body).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("remote risk model returned status {}", response.status()));
        }
        response.json::<AdaptiveResult>().await.map_err(|e| e.to_string())
    }

    async fn warn_remote_once(&self, error: &str) {
        let mut guard = self.last_remote_warn.lock().await;
        let should_warn = guard.map(|t| t.elapsed() >= Duration::from_secs(60)).unwrap_or(true);
        if should_warn {
            warn!(error, "adaptive thresholds: remote risk model unreachable, falling back to local EMA model");
            *guard = Some(Instant::now());
        }
    }
}

/// Pure local EMA-volatility -> clamped-thresholds computation (spec §4.G):
/// wide gaps/volatility tighten the ceiling and cap, calm markets relax them,
/// both clamped to spec-fixed bands around the configured base.
fn local_thresholds(base_health_factor_max: f64, base_gap_cap_bps: u32, ema_vol: f64) -> AdaptiveResult {
    let hf_low = 0.9 * base_health_factor_max;
    let hf_high = 1.05 * base_health_factor_max;
    let health_factor_max = if ema_vol > 500.0 {
        (base_health_factor_max - 0.02).clamp(hf_low, hf_high)
    } else if ema_vol < 150.0 {
        (base_health_factor_max + 0.01).clamp(hf_low, hf_high)
    } else {
        base_health_factor_max.clamp(hf_low, hf_high)
    };

    let gap_high = base_gap_cap_bps.saturating_add(100);
    let gap_cap_bps = if ema_vol > 500.0 {
        scale_bps(base_gap_cap_bps, 0.85).clamp(GAP_CAP_FLOOR_BPS, base_gap_cap_bps.max(GAP_CAP_FLOOR_BPS))
    } else if ema_vol < 150.0 {
        scale_bps(base_gap_cap_bps, 1.15).clamp(GAP_CAP_FLOOR_BPS, gap_high)
    } else {
        base_gap_cap_bps.clamp(GAP_CAP_FLOOR_BPS, gap_high)
    };

    AdaptiveResult { health_factor_max, gap_cap_bps, volatility: ema_vol }
}

fn scale_bps(bps: u32, factor: f64) -> u32 {
    ((bps as f64) * factor).round().max(0.0) as u32
}

/// Overlays Analytics-derived feedback (spec §4.J) onto a computed result:
/// missed opportunities / high gap-skip-rate widen the caps, elevated error
/// rates and negative model drift tighten them back down.
fn apply_feedback(result: &mut AdaptiveResult, signal: &FeedbackSignal, base_health_factor_max: f64, base_gap_cap_bps: u32) {
    let hf_low = 0.9 * base_health_factor_max;
    let hf_high = 1.05 * base_health_factor_max;
    let gap_high = base_gap_cap_bps.saturating_add(100);

    if signal.hit_rate < 0.5 && signal.opportunity_cost_usd > 50.0 {
        result.gap_cap_bps = result.gap_cap_bps.saturating_add((result.gap_cap_bps / 10).max(1)).clamp(GAP_CAP_FLOOR_BPS, gap_high);
        result.health_factor_max = (result.health_factor_max + 0.01).clamp(hf_low, hf_high);
    }

    if signal.gap_skip_rate > 0.3 && signal.opportunity_cost_usd > 25.0 {
        result.gap_cap_bps = result.gap_cap_bps.saturating_add((result.gap_cap_bps / 10).max(1)).clamp(GAP_CAP_FLOOR_BPS, gap_high);
    }

    if signal.error_rate > 0.2 {
        result.gap_cap_bps = result.gap_cap_bps.saturating_sub(result.gap_cap_bps / 10).clamp(GAP_CAP_FLOOR_BPS, gap_high);
        result.health_factor_max = (result.health_factor_max - 0.01).clamp(hf_low, hf_high);
    }

    if signal.model_drift > 0.0 {
        result.health_factor_max = (result.health_factor_max + 0.01).clamp(hf_low, hf_high);
    } else if signal.model_drift < 0.0 {
        result.health_factor_max = (result.health_factor_max - 0.01).clamp(hf_low, hf_high);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_without_samples_returns_base() {
        let adaptive = AdaptiveThresholds::new(None);
        let result = adaptive.current(1, "USDC/WETH", 1.0, 150).await;
        assert_eq!(result.health_factor_max, 1.0);
        assert_eq!(result.gap_cap_bps, 150);
        assert_eq!(result.volatility, 0.0);
    }

    #[tokio::test]
    async fn high_volatility_tightens_thresholds() {
        let adaptive = AdaptiveThresholds::new(None);
        let mut last = AdaptiveResult { health_factor_max: 1.0, gap_cap_bps: 150, volatility: 0.0 };
        for gap in [50, 900, 50, 900, 50, 900, 50, 900] {
            last = adaptive.sample(1, "USDC/WETH", 1.0, 150, gap).await;
        }
        assert!(last.volatility > 150.0);
        assert!(last.health_factor_max <= 1.0);
        assert!(last.gap_cap_bps <= 150);
        assert!(last.gap_cap_bps >= GAP_CAP_FLOOR_BPS);
    }

    #[tokio::test]
    async fn calm_market_relaxes_thresholds() {
        let adaptive = AdaptiveThresholds::new(None);
        let mut last = AdaptiveResult { health_factor_max: 1.0, gap_cap_bps: 150, volatility: 0.0 };
        for _ in 0..10 {
            last = adaptive.sample(1, "USDC/WETH", 1.0, 150, 10).await;
        }
        assert!(last.volatility < 150.0);
        assert!(last.health_factor_max >= 1.0);
        assert!(last.gap_cap_bps >= 150);
        assert!(last.gap_cap_bps <= 250);
    }

    #[tokio::test]
    async fn ema_is_monotonic_towards_constant_input() {
        let adaptive = AdaptiveThresholds::new(None);
        let mut prev_vol = f64::MAX;
        for _ in 0..20 {
            let result = adaptive.sample(7, "WBTC/USDC", 1.0, 150, 200).await;
            assert!(result.volatility <= prev_vol + 1e-9);
            prev_vol = result.volatility;
        }
    }

    #[tokio::test]
    async fn error_feedback_tightens_gap_cap() {
        let adaptive = AdaptiveThresholds::new(None);
        adaptive.sample(1, "USDC/WETH", 1.0, 150, 80).await;
        adaptive.record_feedback(1, "USDC/WETH", FeedbackSignal { error_rate: 0.5, ..Default::default() }).await;
        let tightened = adaptive.sample(1, "USDC/WETH", 1.0, 150, 80).await;
        let baseline = local_thresholds(1.0, 150, tightened.volatility);
        assert!(tightened.gap_cap_bps <= baseline.gap_cap_bps);
    }

    #[test]
    fn local_thresholds_never_below_floor() {
        let result = local_thresholds(1.0, 10, 900.0);
        assert!(result.gap_cap_bps >= GAP_CAP_FLOOR_BPS);
    }
}
