//! Arbitrage Fabric entrypoint (spec §4.K).
//!
//! Wires the Pair Registry, Price Graph, Quoter Mesh, Single-Hop Solver,
//! Inventory Manager and Fabric Executor into a single per-chain timer loop
//! that samples depth, solves every resolved pair, throttles per `(chain,
//! pair)`, and submits the best surviving edge. Runs as a sibling binary to
//! `liquidator`, sharing its config file and Chain Client Pool shape but
//! with its own metrics port and attempt table (`laf_attempts`).

use alloy::providers::Provider;
use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use futures::stream::StreamExt;
use liquidation_engine::analytics::{AttemptStore, NewArbAttempt};
use liquidation_engine::arb::executor::{FabricExecutionOutcome, FabricExecutor};
use liquidation_engine::arb::inventory::InventoryManager;
use liquidation_engine::arb::price_graph::PriceGraph;
use liquidation_engine::arb::quoter_mesh::QuoterMesh;
use liquidation_engine::arb::registry::{PairRegistry, ResolvedPair};
use liquidation_engine::arb::solver::SingleHopSolver;
use liquidation_engine::chain::ChainClientPool;
use liquidation_engine::config::{Cli, EnvFlags, FabricConfig};
use liquidation_engine::executor::NonceLock;
use liquidation_engine::oracle::PriceCache;
use liquidation_engine::throttle::EdgeThrottle;
use liquidation_engine::types::AttemptStatus;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::collections::HashMap;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Gas units budgeted for a single-hop edge's two legs when pricing it in
/// USD (spec §4.K "gas_usd"); no per-chain gas-limit estimator exists yet
/// for the fabric, so this is a flat, conservative two-swap estimate.
const EDGE_GAS_UNITS: u64 = 300_000;

struct ChainRuntime {
    registry: Arc<PairRegistry>,
    price_graph: Arc<PriceGraph>,
    solver: Arc<SingleHopSolver>,
    executor: Arc<FabricExecutor>,
    signer: PrivateKeySigner,
    pool: Arc<ChainClientPool>,
    oracle: Arc<PriceCache>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    let config = match liquidation_engine::load_config(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "arb-fabric: config load failed");
            return ExitCode::FAILURE;
        }
    };
    let fabric = match config.fabric() {
        Ok(f) => f.clone(),
        Err(e) => {
            error!(error = %e, "arb-fabric: no [fabric] section configured, nothing to run");
            return ExitCode::FAILURE;
        }
    };
    let dry_run = cli.dry_run.unwrap_or(config.risk.dry_run);

    let pool = Arc::new(ChainClientPool::new());
    for chain in &config.chains {
        if chain.enabled {
            pool.register(chain.chain_id, chain.rpc_url.clone(), chain.ws_url.clone());
        }
    }

    let oracle = Arc::new(PriceCache::new(config.clone(), pool.clone()));
    let inventory = Arc::new(InventoryManager::new(pool.clone()));
    let nonce_lock = Arc::new(NonceLock::new(EnvFlags::redis_url().as_deref()).await);
    let edge_throttle = Arc::new(EdgeThrottle::new(EnvFlags::redis_url().as_deref(), EnvFlags::fabric_throttle_limit(), EnvFlags::fabric_throttle_window_sec()).await);

    let handle = liquidation_engine::metrics::install_recorder();
    tokio::spawn(liquidation_engine::metrics::serve(handle, EnvFlags::fabric_prom_port()));

    let attempt_store = match EnvFlags::database_url() {
        Some(url) => match AttemptStore::connect(&url).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                error!(error = %e, "arb-fabric: DATABASE_URL set but connect failed, running without attempt persistence");
                None
            }
        },
        None => {
            warn!("arb-fabric: DATABASE_URL not set, running without attempt persistence");
            None
        }
    };

    let chain_ids: Vec<u64> = config.chains.iter().filter(|c| c.enabled && fabric.pairs_for_chain(c.chain_id).next().is_some()).map(|c| c.chain_id).collect();
    if chain_ids.is_empty() {
        error!("arb-fabric: no enabled chain has any configured fabric pair, nothing to run");
        return ExitCode::FAILURE;
    }

    let mut runtimes: HashMap<u64, ChainRuntime> = HashMap::new();
    for &chain_id in &chain_ids {
        match build_runtime(chain_id, &pool, &fabric, &oracle, &nonce_lock).await {
            Ok(runtime) => {
                seed_inventory(&inventory, chain_id, &fabric, runtime.registry.pairs()).await;
                runtimes.insert(chain_id, runtime);
            }
            Err(e) => error!(chain_id, error = %e, "arb-fabric: failed to build pair registry, chain disabled for this run"),
        }
    }
    if runtimes.is_empty() {
        error!("arb-fabric: no chain produced a viable pair registry");
        return ExitCode::FAILURE;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "arb-fabric: failed to install signal handler");
            return ExitCode::FAILURE;
        }
    };
    let shutdown_signals = shutdown.clone();
    tokio::spawn(async move {
        if signals.next().await.is_some() {
            info!("arb-fabric: shutdown signal received, finishing in-flight tick");
            shutdown_signals.store(true, Ordering::SeqCst);
        }
    });

    let mut handles = Vec::with_capacity(runtimes.len());
    for (chain_id, runtime) in runtimes {
        let fabric = fabric.clone();
        let attempt_store = attempt_store.clone();
        let edge_throttle = edge_throttle.clone();
        let inventory = inventory.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            run_chain_loop(chain_id, runtime, fabric, attempt_store, edge_throttle, inventory, shutdown, dry_run).await;
        }));
    }

    info!(chains = handles.len(), dry_run, "arb-fabric: ready");
    for handle in handles {
        let _ = handle.await;
    }

    info!("arb-fabric: drained, shutting down");
    ExitCode::SUCCESS
}

async fn build_runtime(chain_id: u64, pool: &Arc<ChainClientPool>, fabric: &FabricConfig, oracle: &Arc<PriceCache>, nonce_lock: &Arc<NonceLock>) -> anyhow::Result<ChainRuntime> {
    let registry = Arc::new(PairRegistry::build(pool, fabric).await?);
    let quoter_mesh = Arc::new(QuoterMesh::new(pool.clone()));
    let price_graph = Arc::new(PriceGraph::new(quoter_mesh.clone()));
    let solver = Arc::new(SingleHopSolver::new(quoter_mesh, price_graph.clone(), oracle.clone()));
    let executor = Arc::new(FabricExecutor::new(pool.clone(), nonce_lock.clone()));

    let signer = match EnvFlags::wallet_pk(chain_id) {
        Some(pk) => PrivateKeySigner::from_str(pk.trim())?,
        None => {
            warn!(chain_id, "arb-fabric: no WALLET_PK set, using an ephemeral signer (submissions will fail)");
            PrivateKeySigner::random()
        }
    };

    Ok(ChainRuntime { registry, price_graph, solver, executor, signer, pool: pool.clone(), oracle: oracle.clone() })
}

/// Registers each pair's base/quote token as an inventory float anchor so
/// the Inventory Manager has a drain-ratio baseline from first tick (spec
/// §4.K). The float itself is the live balance observed on the first
/// `balance_of` call; this only primes the cache key.
async fn seed_inventory(inventory: &Arc<InventoryManager>, chain_id: u64, _fabric: &FabricConfig, pairs: &[ResolvedPair]) {
    for resolved in pairs {
        if let Ok(balance) = inventory.balance_of(chain_id, resolved.pair.base, alloy::primitives::Address::ZERO).await {
            inventory.set_float(chain_id, resolved.pair.base, balance);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_chain_loop(
    chain_id: u64,
    runtime: ChainRuntime,
    fabric: FabricConfig,
    attempt_store: Option<Arc<AttemptStore>>,
    edge_throttle: Arc<EdgeThrottle>,
    inventory: Arc<InventoryManager>,
    shutdown: Arc<AtomicBool>,
    dry_run: bool,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(fabric.quote_interval_ms));
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            info!(chain_id, "arb-fabric: shutdown, stopping tick loop");
            break;
        }

        runtime.price_graph.sample_all(&runtime.registry, &fabric).await;

        for resolved in runtime.registry.pairs() {
            let gas_usd = estimate_edge_gas_usd(chain_id, &runtime).await;
            let edges = runtime.solver.solve(resolved, &fabric, gas_usd).await;
            let Some(best) = edges.into_iter().max_by(|a, b| a.est_net_usd.total_cmp(&b.est_net_usd)) else { continue };

            if !edge_throttle.record_and_check(chain_id, &resolved.pair.id).await {
                record_arb_attempt(&attempt_store, chain_id, &resolved.pair.id, AttemptStatus::Throttled, None, 0.0, serde_json::json!({})).await;
                continue;
            }

            let first_leg = &best.legs[0];
            if let Ok(Some(intent)) = inventory.check(chain_id, first_leg.token_in, runtime.signer.address(), first_leg.amount_in).await {
                record_arb_attempt(
                    &attempt_store,
                    chain_id,
                    &resolved.pair.id,
                    AttemptStatus::PolicySkip,
                    None,
                    best.est_net_usd,
                    serde_json::json!({ "bridgeIntent": intent.reason, "priority": format!("{:?}", intent.priority) }),
                )
                .await;
                continue;
            }

            match runtime.executor.execute(resolved, &fabric, &best, &runtime.signer, dry_run).await {
                Ok(FabricExecutionOutcome::Sent { tx_hashes }) => {
                    record_arb_attempt(&attempt_store, chain_id, &resolved.pair.id, AttemptStatus::Sent, tx_hashes.into_iter().next(), best.est_net_usd, best.metadata.clone()).await;
                }
                Ok(FabricExecutionOutcome::Infra { message }) if message == "dry_run" => {
                    record_arb_attempt(&attempt_store, chain_id, &resolved.pair.id, AttemptStatus::DryRun, None, best.est_net_usd, best.metadata.clone()).await;
                }
                Ok(FabricExecutionOutcome::Infra { message }) | Ok(FabricExecutionOutcome::Reverted { message }) => {
                    record_arb_attempt(&attempt_store, chain_id, &resolved.pair.id, AttemptStatus::Error, None, 0.0, serde_json::json!({ "message": message })).await;
                }
                Err(e) => {
                    record_arb_attempt(&attempt_store, chain_id, &resolved.pair.id, AttemptStatus::Error, None, 0.0, serde_json::json!({ "message": e.to_string() })).await;
                }
            }
        }
    }
}

/// `gasPrice * EDGE_GAS_UNITS` priced against the pair's base-token oracle
/// feed as a stand-in native-gas-token price: every configured chain here
/// is an ETH-denominated L2, so the base WETH leg's Chainlink feed doubles
/// as the gas-token feed. A dedicated per-chain native feed would replace
/// this if a non-ETH-gas chain were ever onboarded.
async fn estimate_edge_gas_usd(chain_id: u64, runtime: &ChainRuntime) -> f64 {
    let Some(resolved) = runtime.registry.pairs().first() else { return 0.0 };
    let native_price = match runtime.oracle.price_usd(chain_id, &resolved.pair.base_symbol).await.price {
        Some(price) if price > 0.0 => price,
        _ => return 0.0,
    };
    let gas_price_wei = match runtime.pool.get_client(chain_id).await {
        Ok(provider) => provider.get_gas_price().await.unwrap_or(0),
        Err(_) => return 0.0,
    };
    (gas_price_wei as f64 / 1e18) * EDGE_GAS_UNITS as f64 * native_price
}

async fn record_arb_attempt(store: &Option<Arc<AttemptStore>>, chain_id: u64, pair_id: &str, status: AttemptStatus, tx_hash: Option<String>, net_usd: f64, metadata: serde_json::Value) {
    info!(chain_id, pair_id, status = %status, net_usd, "arb-fabric: attempt");
    let Some(store) = store else { return };
    let row = NewArbAttempt { chain_id, pair_id: pair_id.to_string(), source: "single_hop".into(), status, tx_hash, net_usd, metadata };
    if let Err(e) = store.record_arb(row).await {
        error!(error = %e, "arb-fabric: failed to persist attempt row");
    }
}
