//! The branching simulation tree
//!
//! Nodes are deep-independent snapshots; edges are the semantic operations
//! that produced a child from its parent. Attach is idempotent per
//! `(parent, ops)` via a fingerprint. Every simulator event is enriched with
//! its node id, appended to that node's log, and fanned out to node-scoped
//! and tree-scoped subscribers over bounded channels; a subscriber that
//! cannot keep up loses events rather than stalling the simulator.

use crate::simulator::Simulator;
use serde_json::json;
use sha2::{Digest, Sha256};
use simloom_core::config::EngineConfig;
use simloom_core::protocol::{event_types, EventBus, NodeEvent, NodeId, SimEvent};
use simloom_core::{Error, Result};
use simloom_llm::ClientMap;
use simloom_scene::SceneRegistry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

pub type TreeBroadcastFn = Arc<dyn Fn(NodeEvent) + Send + Sync>;

type LogBuffer = Arc<Mutex<VecDeque<NodeEvent>>>;

/// Outcome of an attach: either the prepared child was committed, or a
/// sibling with the same fingerprint already existed and wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attach {
    Created(NodeId),
    Existing(NodeId),
}

impl Attach {
    pub fn id(&self) -> NodeId {
        match self {
            Attach::Created(id) | Attach::Existing(id) => *id,
        }
    }
}

/// Structural facts about a node, without its snapshot.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub depth: Option<u32>,
    pub edge_type: String,
    pub ops: Vec<serde_json::Value>,
    pub fingerprint: Option<String>,
    pub meta: serde_json::Value,
}

struct Node {
    id: NodeId,
    parent: Option<NodeId>,
    depth: Option<u32>,
    edge_type: String,
    ops: Vec<serde_json::Value>,
    sim: Arc<tokio::sync::Mutex<Simulator>>,
    logs: LogBuffer,
    meta: serde_json::Value,
    fingerprint: Option<String>,
}

struct TreeState {
    nodes: HashMap<NodeId, Node>,
    children: HashMap<NodeId, Vec<NodeId>>,
    root: Option<NodeId>,
    next_id: NodeId,
}

struct Shared {
    config: EngineConfig,
    state: Mutex<TreeState>,
    subs: Mutex<Vec<mpsc::Sender<NodeEvent>>>,
    node_subs: Mutex<HashMap<NodeId, Vec<mpsc::Sender<SimEvent>>>>,
    running: Mutex<HashSet<NodeId>>,
    broadcast: Mutex<Option<TreeBroadcastFn>>,
}

impl Shared {
    /// Route one simulator event: node subscribers always see it; the
    /// tree-level fan-out only forwards events from running nodes.
    fn dispatch(&self, event: NodeEvent) {
        {
            let mut map = self.node_subs.lock().expect("node subs poisoned");
            if let Some(senders) = map.get_mut(&event.node) {
                senders.retain(|tx| deliver(tx, event.bare(), "node subscriber"));
            }
        }
        if !self
            .running
            .lock()
            .expect("running set poisoned")
            .contains(&event.node)
        {
            return;
        }
        self.fanout(event);
    }

    /// Unfiltered delivery to tree subscribers and the external broadcaster.
    fn fanout(&self, event: NodeEvent) {
        {
            let mut subs = self.subs.lock().expect("tree subs poisoned");
            subs.retain(|tx| deliver(tx, event.clone(), "tree subscriber"));
        }
        let callback = self.broadcast.lock().expect("broadcast poisoned").clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

/// Best-effort bounded send: drop the event when the queue is full, prune the
/// subscriber when its receiver is gone.
fn deliver<T>(tx: &mpsc::Sender<T>, item: T, target: &str) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("{target} queue full, dropping event");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[derive(Clone)]
pub struct SimTree {
    shared: Arc<Shared>,
}

impl SimTree {
    /// Create a tree whose root (id 0) owns the given snapshot.
    pub fn new(sim: Simulator, config: EngineConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(TreeState {
                nodes: HashMap::new(),
                children: HashMap::new(),
                root: None,
                next_id: 0,
            }),
            subs: Mutex::new(Vec::new()),
            node_subs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            broadcast: Mutex::new(None),
        });
        let tree = Self { shared };
        let root = tree.insert_node(None, sim);
        {
            let mut state = tree.shared.state.lock().expect("tree state poisoned");
            state.root = Some(root);
            let node = state.nodes.get_mut(&root).expect("root just inserted");
            node.depth = Some(0);
            node.edge_type = "root".to_string();
        }
        tree
    }

    fn insert_node(&self, parent: Option<NodeId>, mut sim: Simulator) -> NodeId {
        let logs: LogBuffer = Arc::new(Mutex::new(VecDeque::new()));
        let mut state = self.shared.state.lock().expect("tree state poisoned");
        let id = state.next_id;
        state.next_id += 1;
        Self::wire_bus(&self.shared, id, &logs, &mut sim);
        state.nodes.insert(
            id,
            Node {
                id,
                parent,
                depth: None,
                edge_type: String::new(),
                ops: Vec::new(),
                sim: Arc::new(tokio::sync::Mutex::new(sim)),
                logs,
                meta: json!({}),
                fingerprint: None,
            },
        );
        id
    }

    /// Point the snapshot's event bus at this node's log and the tree's
    /// fan-out. The closure holds the tree weakly; a dropped tree stops
    /// dispatching but a detached worker can still write its log buffer.
    fn wire_bus(shared: &Arc<Shared>, node_id: NodeId, logs: &LogBuffer, sim: &mut Simulator) {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let logs = logs.clone();
        let cap = shared.config.node_log_cap;
        sim.set_event_bus(EventBus::new(Arc::new(move |event: SimEvent| {
            let enriched = NodeEvent::new(event, node_id);
            {
                let mut logs = logs.lock().expect("node log poisoned");
                logs.push_back(enriched.clone());
                if let Some(cap) = cap {
                    while logs.len() > cap {
                        logs.pop_front();
                    }
                }
            }
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(enriched);
            }
        })));
    }

    // ----- Structure -----

    pub fn root(&self) -> Option<NodeId> {
        self.shared.state.lock().expect("tree state poisoned").root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.shared
            .state
            .lock()
            .expect("tree state poisoned")
            .nodes
            .contains_key(&id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .shared
            .state
            .lock()
            .expect("tree state poisoned")
            .nodes
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.shared
            .state
            .lock()
            .expect("tree state poisoned")
            .children
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_info(&self, id: NodeId) -> Result<NodeInfo> {
        let state = self.shared.state.lock().expect("tree state poisoned");
        let node = state.nodes.get(&id).ok_or(Error::NodeNotFound(id))?;
        Ok(NodeInfo {
            id: node.id,
            parent: node.parent,
            depth: node.depth,
            edge_type: node.edge_type.clone(),
            ops: node.ops.clone(),
            fingerprint: node.fingerprint.clone(),
            meta: node.meta.clone(),
        })
    }

    pub fn sim(&self, id: NodeId) -> Result<Arc<tokio::sync::Mutex<Simulator>>> {
        let state = self.shared.state.lock().expect("tree state poisoned");
        state
            .nodes
            .get(&id)
            .map(|n| n.sim.clone())
            .ok_or(Error::NodeNotFound(id))
    }

    pub fn logs(&self, id: NodeId) -> Result<Vec<NodeEvent>> {
        let logs = {
            let state = self.shared.state.lock().expect("tree state poisoned");
            state
                .nodes
                .get(&id)
                .map(|n| n.logs.clone())
                .ok_or(Error::NodeNotFound(id))?
        };
        let logs = logs.lock().expect("node log poisoned");
        Ok(logs.iter().cloned().collect())
    }

    /// Deep-clone a node's snapshot into a fresh, unattached allocation.
    /// The copy's pending queue is reset; commit it with `attach`.
    pub async fn copy_sim(&self, parent: NodeId) -> Result<NodeId> {
        let sim = self.sim(parent)?;
        let copy = sim.lock().await.clone_for_branch();
        Ok(self.insert_node(Some(parent), copy))
    }

    /// Commit a prepared child under its parent. Duplicate `(parent, ops)`
    /// fingerprints are no-ops that hand back the existing child's id.
    pub fn attach(&self, parent: NodeId, ops: Vec<serde_json::Value>, child: NodeId) -> Result<Attach> {
        let (event_node, event_data) = {
            let mut state = self.shared.state.lock().expect("tree state poisoned");
            let parent_depth = {
                let parent_node = state.nodes.get(&parent).ok_or(Error::NodeNotFound(parent))?;
                parent_node.depth.ok_or(Error::NodeNotAttached(parent))?
            };
            {
                let child_node = state.nodes.get(&child).ok_or(Error::NodeNotFound(child))?;
                if child_node.depth.is_some() {
                    return Err(Error::Internal(format!("node {child} is already attached")));
                }
                if child_node.parent != Some(parent) {
                    return Err(Error::Internal(format!(
                        "node {child} was not allocated under parent {parent}"
                    )));
                }
            }

            let fingerprint = fingerprint_of(parent, &ops);
            if let Some(siblings) = state.children.get(&parent) {
                for sibling in siblings {
                    if state
                        .nodes
                        .get(sibling)
                        .and_then(|n| n.fingerprint.as_deref())
                        == Some(fingerprint.as_str())
                    {
                        return Ok(Attach::Existing(*sibling));
                    }
                }
            }

            let edge_type = edge_type_of(&ops);
            let node = state.nodes.get_mut(&child).expect("checked above");
            node.depth = Some(parent_depth + 1);
            node.edge_type = edge_type.clone();
            node.ops = ops.clone();
            node.fingerprint = Some(fingerprint);
            state.children.entry(parent).or_default().push(child);
            (
                child,
                json!({"parent": parent, "child": child, "ops": ops, "edge_type": edge_type}),
            )
        };
        self.shared.fanout(NodeEvent::new(
            SimEvent::new(event_types::ATTACHED, event_data),
            event_node,
        ));
        Ok(Attach::Created(child))
    }

    /// `copy_sim` + `attach` in one step. A duplicate fingerprint discards
    /// the fresh copy and returns the existing child.
    pub async fn branch(&self, parent: NodeId, ops: Vec<serde_json::Value>) -> Result<NodeId> {
        let child = self.copy_sim(parent).await?;
        match self.attach(parent, ops, child)? {
            Attach::Created(id) => Ok(id),
            Attach::Existing(id) => {
                let mut state = self.shared.state.lock().expect("tree state poisoned");
                state.nodes.remove(&child);
                Ok(id)
            }
        }
    }

    /// Remove a node and every transitive descendant. Running descendants
    /// lose their tree-level fan-out immediately; their in-flight step loops
    /// are not interrupted.
    pub fn delete_subtree(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let removed = {
            let mut state = self.shared.state.lock().expect("tree state poisoned");
            if !state.nodes.contains_key(&node) {
                return Err(Error::NodeNotFound(node));
            }
            if state.root == Some(node) {
                return Err(Error::RootDeletion);
            }

            let mut removed = Vec::new();
            let mut queue = VecDeque::from([node]);
            while let Some(id) = queue.pop_front() {
                removed.push(id);
                if let Some(children) = state.children.remove(&id) {
                    queue.extend(children);
                }
            }
            for id in &removed {
                if let Some(n) = state.nodes.remove(id) {
                    if let Some(parent) = n.parent {
                        if let Some(siblings) = state.children.get_mut(&parent) {
                            siblings.retain(|c| c != id);
                        }
                    }
                }
            }
            removed
        };

        {
            let mut node_subs = self.shared.node_subs.lock().expect("node subs poisoned");
            let mut running = self.shared.running.lock().expect("running set poisoned");
            for id in &removed {
                node_subs.remove(id);
                running.remove(id);
            }
        }

        self.shared.fanout(NodeEvent::new(
            SimEvent::new(event_types::DELETED, json!({"nodes": removed})),
            node,
        ));
        Ok(removed)
    }

    /// Attached leaves; `only_max_depth` restricts them to the deepest rank.
    pub fn frontier(&self, only_max_depth: bool) -> Vec<NodeId> {
        let state = self.shared.state.lock().expect("tree state poisoned");
        let mut leaves: Vec<(NodeId, u32)> = state
            .nodes
            .values()
            .filter_map(|n| n.depth.map(|d| (n.id, d)))
            .filter(|(id, _)| {
                state
                    .children
                    .get(id)
                    .map(|c| c.is_empty())
                    .unwrap_or(true)
            })
            .collect();
        if only_max_depth {
            let max_depth = leaves.iter().map(|(_, d)| *d).max().unwrap_or(0);
            leaves.retain(|(_, d)| *d == max_depth);
        }
        leaves.sort_unstable();
        leaves.into_iter().map(|(id, _)| id).collect()
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.frontier(false)
    }

    // ----- Running set and execution -----

    pub fn mark_running(&self, id: NodeId) {
        self.shared
            .running
            .lock()
            .expect("running set poisoned")
            .insert(id);
    }

    pub fn clear_running(&self, id: NodeId) {
        self.shared
            .running
            .lock()
            .expect("running set poisoned")
            .remove(&id);
    }

    pub fn running(&self) -> HashSet<NodeId> {
        self.shared
            .running
            .lock()
            .expect("running set poisoned")
            .clone()
    }

    /// Drive one node's snapshot for `turns` turns. The node is in `running`
    /// for the duration, so its events reach tree-level subscribers.
    pub async fn run_node(&self, id: NodeId, turns: u64) -> Result<()> {
        let sim = self.sim(id)?;
        self.mark_running(id);
        self.emit_node_event(id, event_types::RUN_START, json!({"turns": turns}));
        {
            let mut sim = sim.lock().await;
            sim.run(turns).await;
        }
        self.emit_node_event(id, event_types::RUN_FINISH, json!({"turns": turns}));
        self.clear_running(id);
        Ok(())
    }

    /// Deliver a notice to tree subscribers regardless of the running
    /// filter, like the attach/delete notices.
    pub fn announce(&self, node: NodeId, event_type: &str, data: serde_json::Value) {
        self.shared
            .fanout(NodeEvent::new(SimEvent::new(event_type, data), node));
    }

    /// Emit an engine-level event through a node's log and fan-out path.
    pub fn emit_node_event(&self, id: NodeId, event_type: &str, data: serde_json::Value) {
        let logs = {
            let state = self.shared.state.lock().expect("tree state poisoned");
            state.nodes.get(&id).map(|n| n.logs.clone())
        };
        let event = NodeEvent::new(SimEvent::new(event_type, data), id);
        if let Some(logs) = logs {
            let mut logs = logs.lock().expect("node log poisoned");
            logs.push_back(event.clone());
            if let Some(cap) = self.shared.config.node_log_cap {
                while logs.len() > cap {
                    logs.pop_front();
                }
            }
        }
        self.shared.dispatch(event);
    }

    // ----- Subscriptions -----

    /// Tree-level subscription: structural events plus every running node's
    /// stream, envelope included.
    pub fn subscribe_tree(&self) -> mpsc::Receiver<NodeEvent> {
        let (tx, rx) = mpsc::channel(self.shared.config.subscriber_queue_size);
        self.shared
            .subs
            .lock()
            .expect("tree subs poisoned")
            .push(tx);
        rx
    }

    /// Node-scoped subscription: that node's bare events, running or not.
    pub fn subscribe_node(&self, id: NodeId) -> Result<mpsc::Receiver<SimEvent>> {
        if !self.contains(id) {
            return Err(Error::NodeNotFound(id));
        }
        let (tx, rx) = mpsc::channel(self.shared.config.subscriber_queue_size);
        self.shared
            .node_subs
            .lock()
            .expect("node subs poisoned")
            .entry(id)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    /// Install an external fan-out hook. It sees the same running-filtered
    /// stream as tree subscribers.
    pub fn set_tree_broadcast(&self, callback: TreeBroadcastFn) {
        *self.shared.broadcast.lock().expect("broadcast poisoned") = Some(callback);
    }

    // ----- Persistence -----

    pub async fn serialize(&self) -> serde_json::Value {
        let (ids, root, next_id, children) = {
            let state = self.shared.state.lock().expect("tree state poisoned");
            let mut ids: Vec<NodeId> = state.nodes.keys().copied().collect();
            ids.sort_unstable();
            let children: serde_json::Map<String, serde_json::Value> = state
                .children
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect();
            (ids, state.root, state.next_id, children)
        };

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let (info, sim_arc, logs) = {
                let state = self.shared.state.lock().expect("tree state poisoned");
                let Some(node) = state.nodes.get(&id) else {
                    continue;
                };
                (
                    (
                        node.parent,
                        node.depth,
                        node.edge_type.clone(),
                        node.ops.clone(),
                        node.meta.clone(),
                        node.fingerprint.clone(),
                    ),
                    node.sim.clone(),
                    node.logs.clone(),
                )
            };
            let sim_value = sim_arc.lock().await.serialize();
            let log_values: Vec<NodeEvent> = {
                let logs = logs.lock().expect("node log poisoned");
                logs.iter().cloned().collect()
            };
            nodes.push(json!({
                "id": id,
                "parent": info.0,
                "depth": info.1,
                "edge_type": info.2,
                "ops": info.3,
                "sim": sim_value,
                "logs": log_values,
                "meta": info.4,
                "fingerprint": info.5,
            }));
        }

        json!({
            "root": root,
            "next_id": next_id,
            "nodes": nodes,
            "children": children,
        })
    }

    /// Rebuild a tree from its serialized form. Clients are injected into
    /// every snapshot; subscriber wiring starts empty.
    pub fn deserialize(
        value: &serde_json::Value,
        clients: ClientMap,
        registry: &SceneRegistry,
        config: EngineConfig,
    ) -> Result<SimTree> {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(TreeState {
                nodes: HashMap::new(),
                children: HashMap::new(),
                root: value.get("root").and_then(|v| v.as_u64()),
                next_id: value.get("next_id").and_then(|v| v.as_u64()).unwrap_or(0),
            }),
            subs: Mutex::new(Vec::new()),
            node_subs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            broadcast: Mutex::new(None),
        });
        let tree = SimTree { shared };

        let nodes = value
            .get("nodes")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::snapshot_error("tree snapshot missing nodes"))?;
        for node_value in nodes {
            let id = node_value
                .get("id")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::snapshot_error("node snapshot missing id"))?;
            let sim_value = node_value
                .get("sim")
                .ok_or_else(|| Error::snapshot_error("node snapshot missing sim"))?;
            let mut sim = Simulator::deserialize(sim_value, clients.clone(), registry)?;

            let logs: VecDeque<NodeEvent> = node_value
                .get("logs")
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()?
                .unwrap_or_default();
            let logs: LogBuffer = Arc::new(Mutex::new(logs));
            SimTree::wire_bus(&tree.shared, id, &logs, &mut sim);

            let node = Node {
                id,
                parent: node_value.get("parent").and_then(|v| v.as_u64()),
                depth: node_value
                    .get("depth")
                    .and_then(|v| v.as_u64())
                    .map(|d| d as u32),
                edge_type: node_value
                    .get("edge_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ops: node_value
                    .get("ops")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default(),
                sim: Arc::new(tokio::sync::Mutex::new(sim)),
                logs,
                meta: node_value.get("meta").cloned().unwrap_or(json!({})),
                fingerprint: node_value
                    .get("fingerprint")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            };
            tree.shared
                .state
                .lock()
                .expect("tree state poisoned")
                .nodes
                .insert(id, node);
        }

        if let Some(children) = value.get("children").and_then(|v| v.as_object()) {
            let mut state = tree.shared.state.lock().expect("tree state poisoned");
            for (parent, kids) in children {
                let parent: NodeId = parent
                    .parse()
                    .map_err(|_| Error::snapshot_error("bad children key"))?;
                let kids: Vec<NodeId> = kids
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_u64()).collect())
                    .unwrap_or_default();
                state.children.insert(parent, kids);
            }
        }

        Ok(tree)
    }
}

fn fingerprint_of(parent: NodeId, ops: &[serde_json::Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.to_le_bytes());
    hasher.update(
        serde_json::to_string(ops)
            .expect("ops are plain json")
            .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}

fn edge_type_of(ops: &[serde_json::Value]) -> String {
    match ops {
        [] => "manual".to_string(),
        [first, ..] => first
            .get("op")
            .and_then(|v| v.as_str())
            .unwrap_or("custom")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_parent_and_ops() {
        let ops_a = vec![json!({"op": "advance", "turns": 1})];
        let ops_b = vec![json!({"op": "advance", "turns": 2})];
        assert_eq!(fingerprint_of(0, &ops_a), fingerprint_of(0, &ops_a));
        assert_ne!(fingerprint_of(0, &ops_a), fingerprint_of(0, &ops_b));
        assert_ne!(fingerprint_of(0, &ops_a), fingerprint_of(1, &ops_a));
    }

    #[test]
    fn edge_type_derives_from_first_op() {
        assert_eq!(edge_type_of(&[]), "manual");
        assert_eq!(edge_type_of(&[json!({"op": "advance"})]), "advance");
        assert_eq!(edge_type_of(&[json!({"weird": true})]), "custom");
    }
}
