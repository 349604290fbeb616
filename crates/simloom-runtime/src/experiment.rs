//! Experiment runner
//!
//! From a base node, branch one child per variant, reserve a shared token
//! budget, run the variants on a bounded worker pool, and aggregate per-node
//! summaries into the run record. A denied reservation does not fail the
//! run: variants execute with LLM calls disabled and the decision is
//! recorded in `result_meta`.

use crate::registry::SimTreeRegistry;
use crate::store::{ExperimentStore, ExperimentRun, RunStatus, SimulationStore};
use crate::usage::{Reservation, UsageLedger};
use serde_json::json;
use simloom_core::protocol::{event_types, NodeEvent, NodeId};
use simloom_core::{Error, Result};
use simloom_llm::ClientMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External task queue collaborator; revocation is best-effort.
pub trait TaskQueue: Send + Sync {
    fn revoke(&self, task_id: &str);
}

const DEFAULT_MAX_PARALLEL: usize = 8;

#[derive(Clone)]
pub struct ExperimentRunner {
    registry: Arc<SimTreeRegistry>,
    simulations: Arc<dyn SimulationStore>,
    store: Arc<dyn ExperimentStore>,
    usage: Arc<dyn UsageLedger>,
    tasks: Arc<dashmap::DashMap<String, CancellationToken>>,
    task_queue: Option<Arc<dyn TaskQueue>>,
    max_parallel: usize,
}

impl ExperimentRunner {
    pub fn new(
        registry: Arc<SimTreeRegistry>,
        simulations: Arc<dyn SimulationStore>,
        store: Arc<dyn ExperimentStore>,
        usage: Arc<dyn UsageLedger>,
    ) -> Self {
        Self {
            registry,
            simulations,
            store,
            usage,
            tasks: Arc::new(dashmap::DashMap::new()),
            task_queue: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_task_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.task_queue = Some(queue);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Create a queued run and execute it in the background. Returns the run
    /// id immediately.
    pub async fn start_run(
        &self,
        simulation_id: &str,
        experiment_id: &str,
        turns: u64,
    ) -> Result<String> {
        let run = self.prepare_run(simulation_id, experiment_id, turns).await?;
        let token = CancellationToken::new();
        self.tasks.insert(run.id.clone(), token.clone());

        let runner = self.clone();
        let simulation_id = simulation_id.to_string();
        let experiment_id = experiment_id.to_string();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            if let Err(e) = runner
                .execute_run(&simulation_id, &experiment_id, &run_id, turns, token)
                .await
            {
                warn!(run = %run_id, error = %e, "experiment run failed");
            }
            runner.tasks.remove(&run_id);
        });
        Ok(run.id)
    }

    /// Create a run and execute it inline. Used by workers that already run
    /// on their own task, and by tests.
    pub async fn run_to_completion(
        &self,
        simulation_id: &str,
        experiment_id: &str,
        turns: u64,
    ) -> Result<ExperimentRun> {
        let run = self.prepare_run(simulation_id, experiment_id, turns).await?;
        let token = CancellationToken::new();
        self.tasks.insert(run.id.clone(), token.clone());
        let result = self
            .execute_run(simulation_id, experiment_id, &run.id, turns, token)
            .await;
        self.tasks.remove(&run.id);
        result?;
        self.store.load_run(&run.id).await
    }

    /// Cancel a run: revoke the external task when one is known, otherwise
    /// cancel the in-process worker. In-flight variants finish their current
    /// run; queued variants never start.
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        let Ok(mut run) = self.store.load_run(run_id).await else {
            return Ok(false);
        };
        if let Some(task_id) = run.task_id.clone() {
            if let Some(queue) = &self.task_queue {
                queue.revoke(&task_id);
            }
            if let Some((_, token)) = self.tasks.remove(run_id) {
                token.cancel();
            }
            run.status = RunStatus::Cancelled;
            self.store.update_run(&run).await?;
            return Ok(true);
        }
        match self.tasks.get(run_id) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn prepare_run(
        &self,
        simulation_id: &str,
        experiment_id: &str,
        turns: u64,
    ) -> Result<ExperimentRun> {
        self.store.load_experiment(experiment_id).await?;
        let simulation = self.simulations.load_simulation(simulation_id).await?;
        let mut run = ExperimentRun::queued(experiment_id, turns);
        // provider/model recorded for reproducibility
        if let Some(provider) = self.store.provider_for(simulation.owner_id).await? {
            run.result_meta = json!({
                "provider": {
                    "id": provider.id,
                    "provider": provider.provider,
                    "model": provider.model,
                }
            });
        }
        self.store.create_run(&run).await?;
        Ok(run)
    }

    async fn execute_run(
        &self,
        simulation_id: &str,
        experiment_id: &str,
        run_id: &str,
        turns: u64,
        token: CancellationToken,
    ) -> Result<()> {
        let mut experiment = self.store.load_experiment(experiment_id).await?;
        let simulation = self.simulations.load_simulation(simulation_id).await?;
        let record = self
            .registry
            .get(simulation_id)
            .ok_or_else(|| Error::SimulationNotFound(simulation_id.to_string()))?;
        let tree = record.tree.clone();

        let mut run = self.store.load_run(run_id).await?;
        run.status = RunStatus::Running;

        // Reserve per_run_budget x |variants| under the owner's row. A denial
        // disables LLM clients for the variants instead of failing the run.
        let provider = self.store.provider_for(simulation.owner_id).await?;
        let mut reserved_tokens = 0u64;
        let mut quota_denied = false;
        if let Some(provider) = &provider {
            let needed = provider.per_run_budget * experiment.variants.len().max(1) as u64;
            match self
                .usage
                .reserve(simulation.owner_id, provider.id, provider.quota, needed)
                .await
            {
                Reservation::Granted => {
                    reserved_tokens = needed;
                    run.result_meta["quota"] = json!("reserved");
                    run.result_meta["reserved_tokens"] = json!(needed);
                }
                Reservation::Denied { needed, available } => {
                    quota_denied = true;
                    run.result_meta["quota"] = json!("denied");
                    run.result_meta["quota_detail"] =
                        json!({"needed": needed, "available": available});
                    info!(run = %run_id, needed, available, "quota denied, running without llm");
                }
            }
        }
        self.store.update_run(&run).await?;

        let worked: Result<Vec<NodeId>> = async {
            // Branch each variant from the base node, recording node ids.
            let mut node_ids = Vec::with_capacity(experiment.variants.len());
            for variant in &mut experiment.variants {
                let node_id = match variant.node_id {
                    Some(existing) if tree.contains(existing) => existing,
                    _ => tree.branch(experiment.base_node, variant.ops.clone()).await?,
                };
                variant.node_id = Some(node_id);
                node_ids.push(node_id);
                if quota_denied {
                    tree.sim(node_id)?.lock().await.set_clients(ClientMap::disabled());
                }
            }
            self.store.save_experiment(&experiment).await?;

            tree.announce(
                experiment.base_node,
                event_types::EXPERIMENT_RUN_START,
                json!({
                    "run_id": run_id,
                    "experiment_id": experiment_id,
                    "nodes": node_ids,
                    "turns": turns,
                }),
            );

            // Bounded worker pool; cancellation stops queued variants while
            // in-flight ones complete.
            let permits = Arc::new(Semaphore::new(self.max_parallel));
            let mut handles = Vec::with_capacity(node_ids.len());
            for node_id in node_ids.clone() {
                let tree = tree.clone();
                let permits = permits.clone();
                let token = token.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok()?;
                    if token.is_cancelled() {
                        return None;
                    }
                    tree.run_node(node_id, turns).await.ok()?;
                    Some(node_id)
                }));
            }
            let mut finished = Vec::new();
            for handle in handles {
                if let Ok(Some(node_id)) = handle.await {
                    finished.push(node_id);
                }
            }

            run.result_meta["finished_nodes"] = json!(finished);
            run.result_meta["summaries"] = self.summarize_nodes(&tree, &node_ids).await?;
            Ok(finished)
        }
        .await;

        match worked {
            Ok(finished) => {
                run.status = if token.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Finished
                };
                self.store.update_run(&run).await?;
                if reserved_tokens > 0 {
                    if let Some(provider) = &provider {
                        if run.status == RunStatus::Finished {
                            self.usage
                                .commit(simulation.owner_id, provider.id, reserved_tokens)
                                .await;
                        } else {
                            self.usage
                                .release(simulation.owner_id, provider.id, reserved_tokens)
                                .await;
                        }
                    }
                }
                tree.announce(
                    experiment.base_node,
                    event_types::EXPERIMENT_RUN_FINISH,
                    json!({
                        "run_id": run_id,
                        "experiment_id": experiment_id,
                        "finished": finished,
                        "status": run.status,
                    }),
                );
                Ok(())
            }
            Err(e) => {
                run.status = RunStatus::Error;
                run.result_meta["error"] = json!(e.to_string());
                self.store.update_run(&run).await?;
                if reserved_tokens > 0 {
                    if let Some(provider) = &provider {
                        self.usage
                            .release(simulation.owner_id, provider.id, reserved_tokens)
                            .await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Per-node end-state: turn counter, agent properties, a bounded tail of
    /// recent events, and lightweight metrics derived from them.
    async fn summarize_nodes(
        &self,
        tree: &simloom_engine::SimTree,
        node_ids: &[NodeId],
    ) -> Result<serde_json::Value> {
        let mut summaries = serde_json::Map::new();
        for node_id in node_ids {
            if !tree.contains(*node_id) {
                continue;
            }
            let (turns_done, agents) = {
                let sim = tree.sim(*node_id)?;
                let sim = sim.lock().await;
                let agents: serde_json::Map<String, serde_json::Value> = sim
                    .agents()
                    .iter()
                    .map(|a| (a.name.clone(), json!(a.properties)))
                    .collect();
                (sim.turns(), agents)
            };
            let logs = tree.logs(*node_id)?;
            let tail_start = logs.len().saturating_sub(200);
            let tail = &logs[tail_start..];
            summaries.insert(
                node_id.to_string(),
                json!({
                    "node_id": node_id,
                    "turns": turns_done,
                    "agents": agents,
                    "sample_events": tail,
                    "metrics": node_metrics(tail),
                }),
            );
        }
        Ok(serde_json::Value::Object(summaries))
    }
}

/// Voting distribution from successful `vote` actions and per-agent emotion
/// time series from `emotion_update` events.
fn node_metrics(events: &[NodeEvent]) -> serde_json::Value {
    let mut votes: BTreeMap<String, u64> = BTreeMap::new();
    let mut emotions: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    for event in events {
        match event.event_type.as_str() {
            event_types::ACTION_END => {
                let action = &event.data["action"];
                if action["name"] == "vote" && event.data["success"] == true {
                    let candidate = action["params"]["candidate"]
                        .as_str()
                        .or_else(|| event.data["meta"]["candidate"].as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    *votes.entry(candidate).or_insert(0) += 1;
                }
            }
            event_types::EMOTION_UPDATE => {
                if let (Some(agent), Some(emotion)) = (
                    event.data["agent"].as_str(),
                    event.data["emotion"].as_str(),
                ) {
                    emotions
                        .entry(agent.to_string())
                        .or_default()
                        .push(json!({"emotion": emotion}));
                }
            }
            _ => {}
        }
    }
    json!({"voting_distribution": votes, "emotion_series": emotions})
}
