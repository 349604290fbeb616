//! Process-wide tree registry
//!
//! One cached `TreeRecord` per simulation id. The check-then-build race is
//! closed with an async lock; reads after publication are lock-free. Removal
//! drops the cache entry; the next lookup rebuilds from the persisted record.

use crate::builder::build_tree;
use crate::store::SimulationRecord;
use dashmap::DashMap;
use simloom_agent::{DocumentMap, GlobalKnowledge, KnowledgeItem};
use simloom_core::config::EngineConfig;
use simloom_core::Result;
use simloom_engine::SimTree;
use simloom_llm::ClientMap;
use simloom_scene::SceneRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct TreeRecord {
    pub tree: SimTree,
}

/// Merge-by-name knowledge patch: only agents named here change, and only
/// the fields that are present.
#[derive(Clone, Debug, Default)]
pub struct AgentKnowledgePatch {
    pub name: String,
    pub knowledge_base: Option<Vec<KnowledgeItem>>,
    pub documents: Option<DocumentMap>,
}

pub struct SimTreeRegistry {
    records: DashMap<String, Arc<TreeRecord>>,
    build_lock: Mutex<()>,
    scenes: SceneRegistry,
    engine: EngineConfig,
}

impl SimTreeRegistry {
    pub fn new(scenes: SceneRegistry, engine: EngineConfig) -> Self {
        Self {
            records: DashMap::new(),
            build_lock: Mutex::new(()),
            scenes,
            engine,
        }
    }

    fn key(simulation_id: &str) -> String {
        simulation_id.to_uppercase()
    }

    pub fn get(&self, simulation_id: &str) -> Option<Arc<TreeRecord>> {
        self.records.get(&Self::key(simulation_id)).map(|r| r.clone())
    }

    /// Return the cached record or build one: rehydrate from the persisted
    /// serialized tree when present, otherwise construct from config.
    pub async fn get_or_create(
        &self,
        record: &SimulationRecord,
        clients: ClientMap,
    ) -> Result<Arc<TreeRecord>> {
        let key = Self::key(&record.id);
        if let Some(cached) = self.records.get(&key) {
            return Ok(cached.clone());
        }

        let _guard = self.build_lock.lock().await;
        if let Some(cached) = self.records.get(&key) {
            return Ok(cached.clone());
        }

        let tree = match &record.latest_state {
            Some(state) => {
                debug!(simulation = %record.id, "rehydrating tree from persisted state");
                SimTree::deserialize(state, clients, &self.scenes, self.engine.clone())?
            }
            None => build_tree(record, clients, &self.scenes, self.engine.clone())?,
        };
        let cached = Arc::new(TreeRecord { tree });
        self.records.insert(key, cached.clone());
        Ok(cached)
    }

    /// Drop the cache entry. Subsequent lookups rebuild from persisted state.
    pub fn remove(&self, simulation_id: &str) {
        self.records.remove(&Self::key(simulation_id));
    }

    /// Hot-patch knowledge and documents across every node of a cached tree.
    /// Turn counters, memory, and plans are untouched; agents not named in
    /// the patch keep their state. Returns false when no tree is cached.
    pub async fn update_agent_knowledge(
        &self,
        simulation_id: &str,
        patches: &[AgentKnowledgePatch],
    ) -> Result<bool> {
        let Some(record) = self.get(simulation_id) else {
            return Ok(false);
        };
        let tree = &record.tree;
        let mut patched = 0usize;
        for node in tree.node_ids() {
            let sim = tree.sim(node)?;
            let mut sim = sim.lock().await;
            for patch in patches {
                let Some(agent) = sim.agent_mut(&patch.name) else {
                    continue;
                };
                if let Some(kb) = &patch.knowledge_base {
                    agent.knowledge_base = kb.clone();
                }
                if let Some(documents) = &patch.documents {
                    agent.documents = documents.clone();
                }
                patched += 1;
            }
        }
        info!(simulation = %simulation_id, patched, "agent knowledge hot-patched");
        Ok(true)
    }

    /// Replace the shared global-knowledge snapshot for every agent in every
    /// node of a cached tree.
    pub async fn update_global_knowledge(
        &self,
        simulation_id: &str,
        global: GlobalKnowledge,
    ) -> Result<bool> {
        let Some(record) = self.get(simulation_id) else {
            return Ok(false);
        };
        let shared = Arc::new(global);
        let tree = &record.tree;
        for node in tree.node_ids() {
            let sim = tree.sim(node)?;
            let mut sim = sim.lock().await;
            for agent in sim.agents_mut() {
                agent.set_global_knowledge(shared.clone());
            }
        }
        Ok(true)
    }
}
