//! Saturation backoff for the Quoter Mesh (spec §4.K).
//!
//! Generalizes `arbitrage/cooldown.rs::RouteCooldown`'s escalating-backoff
//! state machine from block-counted, 5×-escalating, per-route keys to a
//! wall-clock, doubling, per-`(venue, direction)` key: "record_failure
//! escalates, record_success resets instantly" carries over unchanged: only
//! the key type and the escalation factor/unit change.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

struct Entry {
    until: Instant,
    current: Duration,
}

/// Tracks hard price-limit saturation per `(pairId, venueId, zeroForOne)`.
/// While a key is in backoff the Quoter Mesh returns `0` silently instead
/// of re-querying the venue (spec §4.K).
#[derive(Default)]
pub struct SaturationBackoff {
    entries: DashMap<(String, String, bool), Entry>,
}

impl SaturationBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_saturated(&self, pair_id: &str, venue_id: &str, zero_for_one: bool) -> bool {
        let key = (pair_id.to_string(), venue_id.to_string(), zero_for_one);
        self.entries.get(&key).map(|e| Instant::now() < e.until).unwrap_or(false)
    }

    /// Starts or doubles the backoff window for this key, capped at 5 s.
    pub fn record_saturation(&self, pair_id: &str, venue_id: &str, zero_for_one: bool) {
        let key = (pair_id.to_string(), venue_id.to_string(), zero_for_one);
        let mut entry = self.entries.entry(key).or_insert_with(|| Entry { until: Instant::now(), current: INITIAL_BACKOFF / 2 });
        entry.current = (entry.current * 2).min(MAX_BACKOFF);
        entry.until = Instant::now() + entry.current;
        debug!(pair_id, venue_id, zero_for_one, backoff_ms = entry.current.as_millis() as u64, "quoter mesh: price-limit saturation, backing off");
    }

    /// Instant reset on a successful quote (spec §4.K, same as
    /// `RouteCooldown::record_success`).
    pub fn record_success(&self, pair_id: &str, venue_id: &str, zero_for_one: bool) {
        let key = (pair_id.to_string(), venue_id.to_string(), zero_for_one);
        self.entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_saturation_uses_initial_backoff() {
        let b = SaturationBackoff::new();
        assert!(!b.is_saturated("p", "v", true));
        b.record_saturation("p", "v", true);
        assert!(b.is_saturated("p", "v", true));
    }

    #[test]
    fn repeated_saturation_doubles_up_to_cap() {
        let b = SaturationBackoff::new();
        b.record_saturation("p", "v", true);
        let first = b.entries.get(&("p".to_string(), "v".to_string(), true)).unwrap().current;
        b.record_saturation("p", "v", true);
        let second = b.entries.get(&("p".to_string(), "v".to_string(), true)).unwrap().current;
        assert_eq!(second, (first * 2).min(MAX_BACKOFF));
        for _ in 0..10 {
            b.record_saturation("p", "v", true);
        }
        let capped = b.entries.get(&("p".to_string(), "v".to_string(), true)).unwrap().current;
        assert_eq!(capped, MAX_BACKOFF);
    }

    #[test]
    fn success_resets_instantly() {
        let b = SaturationBackoff::new();
        b.record_saturation("p", "v", false);
        assert!(b.is_saturated("p", "v", false));
        b.record_success("p", "v", false);
        assert!(!b.is_saturated("p", "v", false));
    }

    #[test]
    fn distinct_direction_is_independent() {
        let b = SaturationBackoff::new();
        b.record_saturation("p", "v", true);
        assert!(!b.is_saturated("p", "v", false));
    }
}
