//! Simloom engine - the per-node turn engine and the branching tree
//!
//! A `Simulator` drives one node's world: it schedules agents through bounded
//! step loops and emits a structured event stream. A `SimTree` owns many such
//! snapshots as a rooted tree with copy-on-branch semantics and fans events
//! out to subscribers.

pub mod simulator;
pub mod tree;

pub use simulator::Simulator;
pub use tree::{Attach, NodeInfo, SimTree};
