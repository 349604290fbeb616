//! Narrow persistence seam
//!
//! The relational store is a collaborator; the runtime reaches it only
//! through these traits. `MemoryStore` backs tests and single-process
//! deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use simloom_agent::{DocumentMap, KnowledgeItem};
use simloom_core::protocol::NodeId;
use simloom_core::{Error, Result};

/// Per-slot agent configuration, merged by position at build time and by
/// name on knowledge hot-patches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentSlotConfig {
    pub name: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub action_space: Vec<String>,
    #[serde(
        default,
        rename = "knowledgeBase",
        skip_serializing_if = "Option::is_none"
    )]
    pub knowledge_base: Option<Vec<KnowledgeItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<DocumentMap>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    Draft,
    Running,
    Finished,
    Archived,
}

/// The source of truth for rebuilding a tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationRecord {
    pub id: String,
    pub owner_id: u64,
    pub name: String,
    pub scene_type: String,
    #[serde(default)]
    pub scene_config: serde_json::Value,
    #[serde(default)]
    pub agents: Vec<AgentSlotConfig>,
    pub status: SimulationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_state: Option<serde_json::Value>,
}

/// A labeled whole-tree snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub simulation_id: String,
    pub label: String,
    pub state: serde_json::Value,
    pub turns: u64,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub simulation_id: String,
    pub base_node: NodeId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variants: Vec<ExperimentVariant>,
}

/// One branch of an experiment; maps 1:1 to a tree node once branched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub ops: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Finished,
    Error,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentRun {
    pub id: String,
    pub experiment_id: String,
    pub turns: u64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub result_meta: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ExperimentRun {
    pub fn queued(experiment_id: impl Into<String>, turns: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            experiment_id: experiment_id.into(),
            turns,
            status: RunStatus::Queued,
            task_id: None,
            result_meta: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Per-owner LLM provider settings relevant to the runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: u64,
    pub provider: String,
    pub model: String,
    /// Total token quota for this (owner, provider) pair.
    pub quota: u64,
    /// Tokens reserved per variant run.
    pub per_run_budget: u64,
}

#[async_trait]
pub trait SimulationStore: Send + Sync {
    async fn load_simulation(&self, id: &str) -> Result<SimulationRecord>;
    async fn save_latest_state(&self, id: &str, state: serde_json::Value) -> Result<()>;
    async fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<()>;
    async fn list_snapshots(&self, simulation_id: &str) -> Result<Vec<SnapshotRecord>>;
    /// Append one transition to the simulation's sync log.
    async fn append_sync_log(&self, simulation_id: &str, detail: serde_json::Value) -> Result<()>;
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn load_experiment(&self, id: &str) -> Result<Experiment>;
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()>;
    async fn create_run(&self, run: &ExperimentRun) -> Result<()>;
    async fn update_run(&self, run: &ExperimentRun) -> Result<()>;
    async fn load_run(&self, id: &str) -> Result<ExperimentRun>;
    async fn provider_for(&self, owner_id: u64) -> Result<Option<ProviderProfile>>;
}

/// In-memory store for tests and single-process use.
#[derive(Default)]
pub struct MemoryStore {
    simulations: DashMap<String, SimulationRecord>,
    snapshots: DashMap<String, Vec<SnapshotRecord>>,
    sync_logs: DashMap<String, Vec<serde_json::Value>>,
    experiments: DashMap<String, Experiment>,
    runs: DashMap<String, ExperimentRun>,
    providers: DashMap<u64, ProviderProfile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_simulation(&self, record: SimulationRecord) {
        self.simulations.insert(record.id.to_uppercase(), record);
    }

    pub fn insert_experiment(&self, experiment: Experiment) {
        self.experiments.insert(experiment.id.clone(), experiment);
    }

    pub fn set_provider(&self, owner_id: u64, profile: ProviderProfile) {
        self.providers.insert(owner_id, profile);
    }

    pub fn sync_log(&self, simulation_id: &str) -> Vec<serde_json::Value> {
        self.sync_logs
            .get(&simulation_id.to_uppercase())
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SimulationStore for MemoryStore {
    async fn load_simulation(&self, id: &str) -> Result<SimulationRecord> {
        self.simulations
            .get(&id.to_uppercase())
            .map(|r| r.clone())
            .ok_or_else(|| Error::SimulationNotFound(id.to_string()))
    }

    async fn save_latest_state(&self, id: &str, state: serde_json::Value) -> Result<()> {
        let mut record = self
            .simulations
            .get_mut(&id.to_uppercase())
            .ok_or_else(|| Error::SimulationNotFound(id.to_string()))?;
        record.latest_state = Some(state);
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<()> {
        self.snapshots
            .entry(snapshot.simulation_id.to_uppercase())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn list_snapshots(&self, simulation_id: &str) -> Result<Vec<SnapshotRecord>> {
        Ok(self
            .snapshots
            .get(&simulation_id.to_uppercase())
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn append_sync_log(&self, simulation_id: &str, detail: serde_json::Value) -> Result<()> {
        self.sync_logs
            .entry(simulation_id.to_uppercase())
            .or_default()
            .push(detail);
        Ok(())
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn load_experiment(&self, id: &str) -> Result<Experiment> {
        self.experiments
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::ExperimentNotFound(id.to_string()))
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.experiments
            .insert(experiment.id.clone(), experiment.clone());
        Ok(())
    }

    async fn create_run(&self, run: &ExperimentRun) -> Result<()> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &ExperimentRun) -> Result<()> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, id: &str) -> Result<ExperimentRun> {
        self.runs
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::RunNotFound(id.to_string()))
    }

    async fn provider_for(&self, owner_id: u64) -> Result<Option<ProviderProfile>> {
        Ok(self.providers.get(&owner_id).map(|p| p.clone()))
    }
}
