//! BitnunEco node simulator primitives.
//!
//! This crate models the *simulated* blockchain layer behind the BitnunEco
//! dashboards: a node façade over an in-memory ledger and entity registries,
//! a message-driven mining worker running a toy proof-of-work, a behavior
//! heuristic gating rewarded actions, a bot manager driving the node on
//! timers, and a sync loop mirroring node state into an external store.
//!
//! Nothing here is real cryptography or real consensus. Hashes are FNV-1a and
//! every "reward" is a number in a tally.

pub mod audit;
pub mod bots;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod events;
pub mod ledger;
pub mod node;
pub mod random;
pub mod registry;
pub mod rewards;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use crate::config::SimConfig;
pub use crate::node::{Node, NodeError};
pub use crate::session::Session;
