//! Liquidator pipeline entrypoint (spec §4, §5).
//!
//! Wires the Chain Client Pool, Oracle/Price Cache, Adaptive Thresholds,
//! Simulator, Policy Gate, Executor, Throttle/KillSwitch/SessionCaps, and
//! (when `DATABASE_URL` is set) the Analytics Loop together around a single
//! bounded MPSC candidate queue fed by per-chain subgraph pollers and
//! realtime watchers. One consumer task drains the queue; SIGINT/SIGTERM
//! trigger a cooperative drain rather than an abrupt exit (spec §5
//! Cancellation & shutdown).

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use futures::stream::StreamExt;
use liquidation_engine::adaptive::AdaptiveThresholds;
use liquidation_engine::analytics::{AnalyticsLoop, AttemptDetails, AttemptStore, NewAttempt, TracingAlertSink};
use liquidation_engine::chain::ChainClientPool;
use liquidation_engine::config::{Cli, EngineConfig, EnvFlags};
use liquidation_engine::executor::{ExecutionOutcome, Executor};
use liquidation_engine::intake::subgraph::SubgraphPoller;
use liquidation_engine::intake::watcher::Watcher;
use liquidation_engine::intake::Dedup;
use liquidation_engine::oracle::PriceCache;
use liquidation_engine::policy::PolicyGate;
use liquidation_engine::simulate::{CallContext, L1FeeModel, Simulator};
use liquidation_engine::throttle::{BorrowerThrottle, KillSwitch, SessionCaps};
use liquidation_engine::types::{AttemptStatus, Candidate};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::collections::HashMap;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Optimism, Base and their testnets share the OP-stack `GasPriceOracle`
/// predeploy address (spec §4.E.8, §6).
const OP_STACK_CHAIN_IDS: &[u64] = &[10, 8453, 11155420, 84532];
const OP_STACK_GAS_PRICE_ORACLE: &str = "0x420000000000000000000000000000000000000F";
/// Arbitrum One/Nova/Sepolia share the `ArbGasInfo` precompile address.
const ARBITRUM_CHAIN_IDS: &[u64] = &[42161, 42170, 421614];
const ARBITRUM_GAS_INFO: &str = "0x000000000000000000000000000000000000006C";

struct ChainRuntime {
    ctx_template: CallContext,
    signer: PrivateKeySigner,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    let config = match liquidation_engine::load_config(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "liquidator: config load failed");
            return ExitCode::FAILURE;
        }
    };
    let dry_run = cli.dry_run.unwrap_or(config.risk.dry_run);

    let pool = Arc::new(ChainClientPool::new());
    let mut chain_runtimes: HashMap<u64, ChainRuntime> = HashMap::new();
    for chain in &config.chains {
        if !chain.enabled {
            continue;
        }
        pool.register(chain.chain_id, chain.rpc_url.clone(), chain.ws_url.clone());

        let Some(contract) = config.liquidator(chain.chain_id) else {
            warn!(chain_id = chain.chain_id, "liquidator: no liquidator contract configured, chain disabled for this run");
            continue;
        };

        let signer = match EnvFlags::wallet_pk(chain.chain_id) {
            Some(pk) => match PrivateKeySigner::from_str(pk.trim()) {
                Ok(signer) => signer,
                Err(e) => {
                    error!(chain_id = chain.chain_id, error = %e, "liquidator: invalid WALLET_PK, chain disabled for this run");
                    continue;
                }
            },
            None => {
                if !dry_run {
                    warn!(chain_id = chain.chain_id, "liquidator: no WALLET_PK set for a non-dry-run chain, using an ephemeral signer (submissions will fail)");
                }
                PrivateKeySigner::random()
            }
        };

        chain_runtimes.insert(
            chain.chain_id,
            ChainRuntime {
                ctx_template: CallContext { contract, executor: signer.address(), beneficiary: config.beneficiary, borrower: Address::ZERO },
                signer,
            },
        );
    }

    let oracle = Arc::new(PriceCache::new(config.clone(), pool.clone()));
    let adaptive = AdaptiveThresholds::new(EnvFlags::risk_engine_url());
    let simulator = Arc::new(build_simulator(pool.clone(), config.clone()));
    let policy = Arc::new(PolicyGate::new(config.clone(), pool.clone(), oracle.clone(), simulator.clone(), adaptive.clone()));

    let session_caps = SessionCaps::new(config.risk.max_live_executions, config.risk.max_session_notional_usd);
    let executor = Arc::new(Executor::new(pool.clone(), config.clone(), oracle.clone(), EnvFlags::redis_url().as_deref(), session_caps.clone()).await);
    let borrower_throttle = Arc::new(BorrowerThrottle::new(EnvFlags::redis_url().as_deref()).await);
    let kill_switch = Arc::new(KillSwitch::new(EnvFlags::kill_switch_file().map(Into::into)));

    let handle = liquidation_engine::metrics::install_recorder();
    tokio::spawn(liquidation_engine::metrics::serve(handle, EnvFlags::prom_port()));

    let mut attempt_store: Option<Arc<AttemptStore>> = None;
    let mut analytics_loop: Option<Arc<AnalyticsLoop>> = None;
    if let Some(url) = EnvFlags::database_url() {
        match AttemptStore::connect(&url).await {
            Ok(store) => {
                let store = Arc::new(store);
                let analytics = AnalyticsLoop::new(
                    store.clone(),
                    adaptive.clone(),
                    Arc::new(TracingAlertSink),
                    config.risk.fail_rate_cap,
                    EnvFlags::fail_rate_auto_stop(),
                );
                tokio::spawn(analytics.clone().run(std::time::Duration::from_secs(config.analysis.poll_interval_secs)));
                attempt_store = Some(store);
                analytics_loop = Some(analytics);
            }
            Err(e) => {
                error!(error = %e, "liquidator: DATABASE_URL set but connect failed, running without analytics feedback");
            }
        }
    } else {
        warn!("liquidator: DATABASE_URL not set, running without analytics feedback or attempt persistence");
    }

    let (tx, mut rx) = mpsc::channel::<Candidate>(EnvFlags::intake_queue_capacity());
    let dedup = Arc::new(Dedup::new());

    for chain in &config.chains {
        if !chain_runtimes.contains_key(&chain.chain_id) {
            continue;
        }
        let Some(subgraph_url) = chain.subgraph_url.clone() else {
            warn!(chain_id = chain.chain_id, "liquidator: no subgraphUrl configured, chain has no candidate intake");
            continue;
        };
        let poller = Arc::new(SubgraphPoller::new(chain.chain_id, subgraph_url, dedup.clone()));

        let poller_tx = tx.clone();
        let poller_clone = poller.clone();
        tokio::spawn(async move { poller_clone.run(poller_tx).await });

        match Watcher::new(chain, pool.clone(), poller.clone()).await {
            Ok(watcher) => {
                let watcher = Arc::new(watcher);
                let watcher_tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = watcher.run(watcher_tx).await {
                        error!(chain_id = chain.chain_id, error = %e, "liquidator: realtime watcher exited");
                    }
                });
            }
            Err(e) => warn!(chain_id = chain.chain_id, error = %e, "liquidator: failed to resolve Pool address, realtime watcher disabled"),
        }
    }
    drop(tx);

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "liquidator: failed to install signal handler");
            return ExitCode::FAILURE;
        }
    };
    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let shutdown_signals = shutdown.clone();
    tokio::spawn(async move {
        if signals.next().await.is_some() {
            info!("liquidator: shutdown signal received, draining candidate queue");
            shutdown_signals.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    info!(chains = chain_runtimes.len(), dry_run, "liquidator: ready, consuming candidates");

    while let Some(candidate) = rx.recv().await {
        if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            info!("liquidator: draining, stopping intake consumption");
            break;
        }
        if kill_switch.is_tripped() {
            error!("liquidator: kill switch tripped, draining");
            break;
        }
        if let Some(stop) = &analytics_loop {
            if stop.should_stop.load(std::sync::atomic::Ordering::SeqCst) {
                error!("liquidator: analytics fail-rate breach tripped auto-stop, draining");
                break;
            }
        }

        let Some(runtime) = chain_runtimes.get(&candidate.chain_id) else { continue };
        let ctx = CallContext { borrower: candidate.borrower, ..runtime.ctx_template };

        let pair = format!("{}/{}", candidate.debt.symbol, candidate.collateral.symbol);
        match policy.evaluate(&candidate, &ctx).await {
            Ok(plan) => {
                let allowed = borrower_throttle.record_and_check(candidate.chain_id, candidate.borrower, config.risk.max_attempts_per_borrower_hour).await;
                if !allowed {
                    record_attempt(&attempt_store, &candidate, AttemptStatus::Throttled, None, None, AttemptDetails::Throttled { pair }).await;
                    continue;
                }
                if session_caps.would_exceed(plan.repay_usd) {
                    warn!(chain_id = candidate.chain_id, "liquidator: session cap would be exceeded, draining");
                    break;
                }

                match executor.execute(&candidate, &plan, &ctx, &runtime.signer, dry_run).await {
                    Ok(ExecutionOutcome::Sent { tx_hash }) => {
                        record_attempt(
                            &attempt_store,
                            &candidate,
                            AttemptStatus::Sent,
                            None,
                            Some(tx_hash),
                            AttemptDetails::Sent { pair, net_usd: plan.net_usd, gas_usd: plan.gas_usd, mode: format!("{:?}", plan.mode) },
                        )
                        .await;
                    }
                    Ok(ExecutionOutcome::HealthFactorRecovered) => {
                        record_attempt(
                            &attempt_store,
                            &candidate,
                            AttemptStatus::PolicySkip,
                            Some("hf-recovered".into()),
                            None,
                            AttemptDetails::PolicySkip { pair, reason: "hf-recovered".into(), missed_value_usd: plan.net_usd },
                        )
                        .await;
                    }
                    Ok(ExecutionOutcome::Reverted { message }) => {
                        record_attempt(&attempt_store, &candidate, AttemptStatus::Error, None, None, AttemptDetails::Error { pair, message }).await;
                    }
                    Ok(ExecutionOutcome::Infra { message }) if message == "dry_run" => {
                        record_attempt(&attempt_store, &candidate, AttemptStatus::DryRun, None, None, AttemptDetails::DryRun { pair, net_usd: plan.net_usd }).await;
                    }
                    Ok(ExecutionOutcome::Infra { message }) => {
                        record_attempt(&attempt_store, &candidate, AttemptStatus::Error, None, None, AttemptDetails::Error { pair, message }).await;
                    }
                    Err(e) => {
                        record_attempt(&attempt_store, &candidate, AttemptStatus::Error, None, None, AttemptDetails::Error { pair, message: e.to_string() }).await;
                    }
                }
            }
            Err(rejection) => {
                use liquidation_engine::error::RejectReason;
                let (status, reason) = match rejection.reason {
                    RejectReason::GapExceedsCap => (AttemptStatus::GapSkip, "gap-exceeds-cap"),
                    RejectReason::ContractRevert => (AttemptStatus::Error, "contract-revert"),
                    other => (AttemptStatus::PolicySkip, other.as_str()),
                };
                let details = match status {
                    AttemptStatus::GapSkip => {
                        let (gap_bps, cap_bps) = parse_gap_detail(rejection.detail.as_deref());
                        AttemptDetails::GapSkip { pair, gap_bps, cap_bps, missed_value_usd: 0.0 }
                    }
                    AttemptStatus::Error => AttemptDetails::Error { pair, message: rejection.detail.unwrap_or_else(|| reason.to_string()) },
                    _ => AttemptDetails::PolicySkip { pair, reason: reason.to_string(), missed_value_usd: 0.0 },
                };
                record_attempt(&attempt_store, &candidate, status, Some(reason.to_string()), None, details).await;
            }
        }
    }

    info!("liquidator: drained, shutting down");
    ExitCode::SUCCESS
}

fn build_simulator(pool: Arc<ChainClientPool>, config: Arc<EngineConfig>) -> Simulator {
    let simulator = Simulator::new(pool, config);
    let op_oracle: Address = OP_STACK_GAS_PRICE_ORACLE.parse().expect("OP-stack GasPriceOracle predeploy address is valid");
    let arb_oracle: Address = ARBITRUM_GAS_INFO.parse().expect("ArbGasInfo precompile address is valid");
    for chain_id in OP_STACK_CHAIN_IDS {
        simulator.set_l1_fee_model(*chain_id, L1FeeModel::OpStack(op_oracle));
    }
    for chain_id in ARBITRUM_CHAIN_IDS {
        simulator.set_l1_fee_model(*chain_id, L1FeeModel::Arbitrum(arb_oracle));
    }
    simulator
}

/// `"gap=123bps cap=150bps"` -> `(123, 150)`; defensive default `(0, 0)`
/// when the detail string (set only by the Policy Gate) is absent or
/// unparseable.
fn parse_gap_detail(detail: Option<&str>) -> (i64, u32) {
    let Some(detail) = detail else { return (0, 0) };
    let mut gap_bps = 0i64;
    let mut cap_bps = 0u32;
    for part in detail.split_whitespace() {
        if let Some(v) = part.strip_prefix("gap=").and_then(|v| v.strip_suffix("bps")) {
            gap_bps = v.parse().unwrap_or(0);
        } else if let Some(v) = part.strip_prefix("cap=").and_then(|v| v.strip_suffix("bps")) {
            cap_bps = v.parse().unwrap_or(0);
        }
    }
    (gap_bps, cap_bps)
}

async fn record_attempt(
    store: &Option<Arc<AttemptStore>>,
    candidate: &Candidate,
    status: AttemptStatus,
    reason: Option<String>,
    tx_hash: Option<String>,
    details: AttemptDetails,
) {
    info!(chain_id = candidate.chain_id, borrower = %candidate.borrower, status = %status, "liquidator: attempt");
    let Some(store) = store else { return };
    let row = NewAttempt { chain_id: candidate.chain_id, borrower: format!("{:#x}", candidate.borrower), status, reason, tx_hash, details };
    if let Err(e) = store.record(row).await {
        error!(error = %e, "liquidator: failed to persist attempt row");
    }
}
