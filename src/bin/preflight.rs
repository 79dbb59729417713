//! Preflight probe binary (spec §6): checks config load, per-chain RPC
//! reachability, Postgres reachability, and Redis reachability before an
//! operator brings the `liquidator`/`arb-fabric` binaries up. Exits 1 if
//! any probe fails (spec §6 exit codes).

use alloy::providers::{Provider, ProviderBuilder};
use clap::Parser;
use liquidation_engine::config::{Cli, EnvFlags};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    let mut ok = true;

    let config = match liquidation_engine::load_config(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config.display(), chains = cfg.chains.len(), "preflight: config loaded");
            cfg
        }
        Err(e) => {
            error!(error = %e, "preflight: config load failed");
            return ExitCode::FAILURE;
        }
    };

    for chain in &config.chains {
        if !chain.enabled {
            continue;
        }
        match probe_rpc(&chain.rpc_url).await {
            Ok(chain_id) => info!(configured = chain.chain_id, reported = chain_id, "preflight: RPC reachable"),
            Err(e) => {
                error!(chain_id = chain.chain_id, rpc_url = %chain.rpc_url, error = %e, "preflight: RPC unreachable");
                ok = false;
            }
        }
        if EnvFlags::wallet_pk(chain.chain_id).is_none() {
            warn!(chain_id = chain.chain_id, "preflight: no WALLET_PK_<chain> set, execution will fail on this chain");
        }
    }

    if let Some(database_url) = EnvFlags::database_url() {
        match liquidation_engine::analytics::AttemptStore::connect(&database_url).await {
            Ok(_) => info!("preflight: database reachable"),
            Err(e) => {
                error!(error = %e, "preflight: database unreachable");
                ok = false;
            }
        }
    } else {
        warn!("preflight: DATABASE_URL not set, analytics loop will not run");
    }

    if let Some(redis_url) = EnvFlags::redis_url() {
        match probe_redis(&redis_url).await {
            Ok(()) => info!("preflight: redis reachable"),
            Err(e) => {
                error!(error = %e, "preflight: redis unreachable, throttles/nonce-lock will use in-memory fallback");
                // Redis failure degrades rather than blocks (spec §5): does not flip `ok`.
            }
        }
    } else {
        warn!("preflight: REDIS_URL not set, throttles/nonce-lock will use in-memory fallback");
    }

    if ok {
        info!("preflight: all required probes passed");
        ExitCode::SUCCESS
    } else {
        error!("preflight: one or more required probes failed");
        ExitCode::FAILURE
    }
}

async fn probe_rpc(rpc_url: &str) -> anyhow::Result<u64> {
    let url = rpc_url.parse()?;
    let provider = ProviderBuilder::new().connect_http(url);
    let chain_id = provider.get_chain_id().await?;
    Ok(chain_id)
}

async fn probe_redis(redis_url: &str) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = client.get_connection_manager().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}
