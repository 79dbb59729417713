//! Arbitrage Fabric (spec §4.K): single-hop DEX arbitrage across the
//! configured venues of a chain, run as a sibling pipeline to the
//! liquidation engine and sharing its chain/oracle/config plumbing.
//!
//! Pipeline: [`registry::PairRegistry`] resolves pools once at startup,
//! [`price_graph::PriceGraph`] samples depth on a timer, [`solver::SingleHopSolver`]
//! turns graph suggestions into live-quoted [`crate::types::QuoteEdge`]s via
//! [`quoter_mesh::QuoterMesh`] (itself backed by [`backoff::SaturationBackoff`]),
//! [`inventory::InventoryManager`] gates fills against on-chain balances, and
//! [`executor::FabricExecutor`] submits the winning edge's legs.

pub mod backoff;
pub mod executor;
pub mod inventory;
pub mod price_graph;
pub mod quoter_mesh;
pub mod registry;
pub mod solver;
