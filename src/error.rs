//! Error taxonomy for the opportunity engine.
//!
//! Kinds, not type names: each variant corresponds to a failure class in
//! the error handling design, not to a single call site. Callers match on
//! kind to decide retry/degrade/alert behavior; they should not need to
//! inspect `anyhow`-style chains to classify a failure.

use std::fmt;
use thiserror::Error;

/// Revert reason for a liquidation call, distinguished from a generic
/// on-chain revert because `HealthFactorNotBelowThreshold` means the
/// candidate simply recovered and should be demoted, not treated as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertKind {
    /// Selector `0x930bb771`, or a revert reason matching the error name.
    HealthFactorRecovered,
    /// Any other revert; short message plus optional raw return data.
    Other { short_message: String, data: Option<Vec<u8>> },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient RPC error: {0}")]
    TransientRpc(String),

    #[error("provider filter went stale, restarting watcher")]
    FilterStale,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("oracle price stale or unavailable for {token}")]
    OracleStale { token: String },

    #[error("sequencer down on chain {chain_id}")]
    SequencerDown { chain_id: u64 },

    #[error("policy rejected: {reason}")]
    PolicyReject { reason: RejectReason, detail: Option<String> },

    #[error("contract reverted: {0:?}")]
    ContractRevert(RevertKind),

    #[error("database error: {0}")]
    Database(String),

    #[error("kill switch tripped")]
    KillSwitchTripped,

    #[error("session cap reached: {0}")]
    SessionCapReached(String),
}

/// Tagged rejection reason produced by the Scorer / Policy Gate (spec §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AssetDenylist,
    GapExceedsCap,
    MissingMarket,
    MissingPolicy,
    MissingToken,
    PlanNull,
    HealthFactorAboveMax,
    SequencerDown,
    ContractRevert,
    MissingKeys,
    MissingContract,
    PlanPnlPerGas,
    MinProfitZero,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RejectReason {
    /// Stable string used in `AttemptRow.reason` and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AssetDenylist => "asset-denylist",
            RejectReason::GapExceedsCap => "gap-exceeds-cap",
            RejectReason::MissingMarket => "missing-market",
            RejectReason::MissingPolicy => "missing-policy",
            RejectReason::MissingToken => "missing-token",
            RejectReason::PlanNull => "plan-null",
            RejectReason::HealthFactorAboveMax => "health-factor-above-max",
            RejectReason::SequencerDown => "sequencer-down",
            RejectReason::ContractRevert => "contract-revert",
            RejectReason::MissingKeys => "missing-keys",
            RejectReason::MissingContract => "missing-contract",
            RejectReason::PlanPnlPerGas => "plan-pnl-per-gas",
            RejectReason::MinProfitZero => "min-profit-zero",
        }
    }
}

/// Classifies a raw RPC/HTTP error message into a retry path per spec §4.C
/// ("Error classification").
pub fn classify_rpc_error(msg: &str) -> EngineError {
    let lower = msg.to_lowercase();
    if lower.contains("429")
        || lower.contains("too many requests")
        || is_5xx(&lower)
        || lower.contains("rate limit")
    {
        return EngineError::RateLimited(msg.to_string());
    }
    if lower.contains("filter not found") {
        return EngineError::FilterStale;
    }
    EngineError::TransientRpc(msg.to_string())
}

fn is_5xx(lower: &str) -> bool {
    ["500", "502", "503", "504"].iter().any(|c| lower.contains(c))
}

/// Classifies a Postgres/sqlx error as retryable per spec §7/§5.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            matches!(
                db_err.code().as_deref(),
                Some("40001") // serialization_failure
                    | Some("40P01") // deadlock_detected
                    | Some("57P01") // admin_shutdown
                    | Some("53300") // too_many_connections
                    | Some("08006") // connection_failure
            )
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_as_rate_limited() {
        assert!(matches!(classify_rpc_error("HTTP 429 Too Many Requests"), EngineError::RateLimited(_)));
    }

    #[test]
    fn classifies_5xx_as_rate_limited() {
        assert!(matches!(classify_rpc_error("upstream error 503"), EngineError::RateLimited(_)));
    }

    #[test]
    fn classifies_stale_filter() {
        assert!(matches!(classify_rpc_error("filter not found"), EngineError::FilterStale));
    }

    #[test]
    fn classifies_generic_as_transient() {
        assert!(matches!(classify_rpc_error("connection reset by peer"), EngineError::TransientRpc(_)));
    }

    #[test]
    fn reject_reason_strings_are_stable() {
        assert_eq!(RejectReason::GapExceedsCap.as_str(), "gap-exceeds-cap");
        assert_eq!(RejectReason::MinProfitZero.as_str(), "min-profit-zero");
    }
}
