//! Aave-v3 liquidation opportunity engine, with a sibling single-hop DEX
//! arbitrage fabric sharing the same chain/oracle/config plumbing.
//!
//! The liquidation pipeline runs intake -> policy -> simulate -> throttle ->
//! executor, fed by the adaptive threshold loop in [`adaptive`] and the
//! analytics loop in [`analytics`]. [`arb`] is the independent arbitrage
//! fabric (spec §4.K): pair registry -> price graph -> solver -> executor.

pub mod adaptive;
pub mod analytics;
pub mod arb;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod executor;
pub mod intake;
pub mod metrics;
pub mod oracle;
pub mod policy;
pub mod routes;
pub mod simulate;
pub mod throttle;
pub mod types;

pub use config::{load_config, EngineConfig};
pub use error::EngineError;
