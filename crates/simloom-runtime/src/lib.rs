//! Simloom runtime - process-wide services around the engine
//!
//! The registry caches one tree per simulation and rebuilds or rehydrates on
//! demand; the experiment runner branches variants from a base node and runs
//! them in parallel under a shared token budget. Persistence is a
//! collaborator behind narrow store traits; this crate ships in-memory
//! implementations.

pub mod builder;
pub mod experiment;
pub mod registry;
pub mod store;
pub mod usage;

pub use builder::build_tree;
pub use experiment::{ExperimentRunner, TaskQueue};
pub use registry::{AgentKnowledgePatch, SimTreeRegistry, TreeRecord};
pub use store::{
    AgentSlotConfig, Experiment, ExperimentStore, ExperimentVariant, ExperimentRun, MemoryStore,
    ProviderProfile, RunStatus, SimulationRecord, SimulationStatus, SimulationStore,
    SnapshotRecord,
};
pub use usage::{MemoryLedger, Reservation, UsageLedger, UsageRow};
