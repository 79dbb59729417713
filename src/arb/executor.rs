//! Fabric Executor (spec §4.K).
//!
//! Generalizes `executor/mod.rs::Executor`'s build-call/estimate/submit
//! shape and reuses its [`NonceLock`] verbatim: the liquidation executor
//! submits one `liquidateWithFlash`/`liquidateWithFunds` call per plan, this
//! one submits one `ISwapRouter.exactInput` call per leg of a [`QuoteEdge`],
//! with an allowance check ahead of the first leg.

use crate::arb::registry::ResolvedPair;
use crate::chain::ChainClientPool;
use crate::config::{EnvFlags, FabricConfig};
use crate::contracts::{IERC20, ISwapRouter};
use crate::executor::NonceLock;
use crate::types::QuoteEdge;
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::Provider;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Outcome of submitting one edge's legs (spec §4.K, shared shape with
/// [`crate::executor::ExecutionOutcome`]).
#[derive(Debug, Clone)]
pub enum FabricExecutionOutcome {
    Sent { tx_hashes: Vec<String> },
    Reverted { message: String },
    Infra { message: String },
}

fn encode_single_hop_path(token_in: Address, fee: u32, token_out: Address) -> Bytes {
    let mut buf = Vec::with_capacity(20 + 3 + 20);
    buf.extend_from_slice(token_in.as_slice());
    buf.extend_from_slice(&fee.to_be_bytes()[1..]);
    buf.extend_from_slice(token_out.as_slice());
    Bytes::from(buf)
}

fn apply_slippage(amount_out: U256, slippage_bps: u32) -> U256 {
    let bps = U256::from(10_000u32.saturating_sub(slippage_bps));
    (amount_out * bps) / U256::from(10_000u64)
}

/// Submits a [`QuoteEdge`]'s legs in order against `ISwapRouter.exactInput`,
/// ensuring ERC20 allowance ahead of each leg (spec §4.K).
pub struct FabricExecutor {
    pool: Arc<ChainClientPool>,
    nonce_lock: Arc<NonceLock>,
}

impl FabricExecutor {
    pub fn new(pool: Arc<ChainClientPool>, nonce_lock: Arc<NonceLock>) -> Self {
        Self { pool, nonce_lock }
    }

    /// Submits every leg of `edge` for `resolved`'s chain, in order. Stops
    /// and reports the first failing leg rather than continuing — a
    /// single-hop arb is only profitable if both legs land.
    pub async fn execute(&self, resolved: &ResolvedPair, fabric: &FabricConfig, edge: &QuoteEdge, signer: &PrivateKeySigner, dry_run: bool) -> Result<FabricExecutionOutcome> {
        let chain_id = resolved.pair.chain_id;
        let sender = signer.address();
        let mut tx_hashes = Vec::with_capacity(edge.legs.len());

        for leg in &edge.legs {
            let venue = fabric.venue(&leg.venue).context("edge references an unknown venue id")?;
            let router = venue.router;
            let fee = venue.fee.unwrap_or(3_000);
            let min_out = apply_slippage(leg.amount_out, edge.risk.max_slippage_bps);

            if dry_run {
                info!(chain_id, venue = %leg.venue, "fabric executor: dry-run, not submitting leg");
                continue;
            }

            let outcome = self
                .nonce_lock
                .with_lock(chain_id, sender, || async {
                    self.submit_leg(chain_id, router, leg.token_in, leg.token_out, fee, leg.amount_in, min_out, sender, signer).await
                })
                .await;

            match outcome {
                Ok(hash) => tx_hashes.push(hash),
                Err(e) => {
                    error!(chain_id, venue = %leg.venue, error = %e, "fabric executor: leg submission failed");
                    return Ok(FabricExecutionOutcome::Reverted { message: e.to_string() });
                }
            }
        }

        if dry_run {
            return Ok(FabricExecutionOutcome::Infra { message: "dry_run".into() });
        }
        Ok(FabricExecutionOutcome::Sent { tx_hashes })
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_leg(&self, chain_id: u64, router: Address, token_in: Address, token_out: Address, fee: u32, amount_in: U256, min_out: U256, sender: Address, signer: &PrivateKeySigner) -> Result<String> {
        let read_provider = self.pool.get_client(chain_id).await?;
        let erc20 = IERC20::new(token_in, read_provider);
        let allowance = erc20.allowance(sender, router).call().await.context("allowance call failed")?;

        let rpc_url = EnvFlags::rpc_url(chain_id).context("no RPC URL configured for chain")?;
        let parsed = rpc_url.parse().context("invalid RPC URL")?;
        let write_provider = alloy::providers::ProviderBuilder::new().wallet(signer.clone()).connect_http(parsed);

        if allowance < amount_in {
            let erc20_write = IERC20::new(token_in, write_provider.clone());
            let approve_call = erc20_write.approve(router, U256::MAX);
            let pending = approve_call.send().await.context("approve send failed")?;
            pending.watch().await.context("approve confirmation failed")?;
        }

        let deadline = U256::from(SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() + 120);
        let path = encode_single_hop_path(token_in, fee, token_out);
        let router_contract = ISwapRouter::new(router, write_provider);
        let params = crate::contracts::ISwapRouter::ExactInputParams {
            path,
            recipient: sender,
            deadline,
            amountIn: amount_in,
            amountOutMinimum: min_out,
        };
        let pending = router_contract.exactInput(params).send().await.context("exactInput send failed")?;
        let hash = format!("{:#x}", pending.tx_hash());
        warn!(chain_id, tx_hash = %hash, "fabric executor: leg submitted");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_single_hop_path_is_43_bytes() {
        let path = encode_single_hop_path(Address::with_last_byte(1), 500, Address::with_last_byte(2));
        assert_eq!(path.len(), 43);
    }

    #[test]
    fn apply_slippage_reduces_amount_out() {
        let out = apply_slippage(U256::from(10_000u64), 50);
        assert_eq!(out, U256::from(9_950u64));
    }
}
