//! Wire envelope for the event stream
//!
//! Every simulator event is a `{type, data}` pair; the tree enriches it with
//! the originating node id before fan-out. The type names below are frozen:
//! external subscribers match on them.

use serde::{Deserialize, Serialize};

/// Node identifier inside a tree. The root is always 0.
pub type NodeId = u64;

/// A simulator-level event, before node enrichment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl SimEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// A tree-level event: the simulator event plus the node that emitted it.
/// Node-scoped subscribers receive the bare `SimEvent`; tree-level
/// subscribers receive this envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub node: NodeId,
}

impl NodeEvent {
    pub fn new(event: SimEvent, node: NodeId) -> Self {
        Self {
            event_type: event.event_type,
            data: event.data,
            node,
        }
    }

    pub fn bare(&self) -> SimEvent {
        SimEvent {
            event_type: self.event_type.clone(),
            data: self.data.clone(),
        }
    }
}

/// The outlet every emitter writes to. The tree installs one sink per node;
/// detached components use `EventBus::null()`.
///
/// An `agent_error` with `kind == "offline"` additionally derives a
/// `system_log` warning so timelines can flag the dropout without scanning
/// agent errors.
#[derive(Clone)]
pub struct EventBus {
    sink: std::sync::Arc<dyn Fn(SimEvent) + Send + Sync>,
}

impl EventBus {
    pub fn new(sink: std::sync::Arc<dyn Fn(SimEvent) + Send + Sync>) -> Self {
        Self { sink }
    }

    /// A bus that swallows everything.
    pub fn null() -> Self {
        Self {
            sink: std::sync::Arc::new(|_| {}),
        }
    }

    /// A bus that appends into a shared buffer. Intended for tests.
    pub fn capturing(buffer: std::sync::Arc<std::sync::Mutex<Vec<SimEvent>>>) -> Self {
        Self {
            sink: std::sync::Arc::new(move |ev| {
                buffer.lock().expect("event buffer poisoned").push(ev);
            }),
        }
    }

    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) {
        let event = SimEvent::new(event_type, data);
        let offline_agent = if event.event_type == event_types::AGENT_ERROR
            && event.data.get("kind").and_then(|k| k.as_str()) == Some("offline")
        {
            Some(
                event
                    .data
                    .get("agent")
                    .and_then(|a| a.as_str())
                    .unwrap_or("(unknown)")
                    .to_string(),
            )
        } else {
            None
        };
        (self.sink)(event);
        if let Some(agent) = offline_agent {
            (self.sink)(SimEvent::new(
                event_types::SYSTEM_LOG,
                serde_json::json!({
                    "source": "simulator",
                    "level": "warning",
                    "agent": agent,
                    "message": format!("Agent {agent} went offline; downstream turns may not respond."),
                }),
            ));
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventBus")
    }
}

/// Canonical event type names. Non-exhaustive: scenes may emit their own,
/// but these are contract-frozen.
pub mod event_types {
    pub const ATTACHED: &str = "attached";
    pub const DELETED: &str = "deleted";
    pub const RUN_START: &str = "run_start";
    pub const RUN_FINISH: &str = "run_finish";
    pub const SYSTEM_BROADCAST: &str = "system_broadcast";
    pub const AGENT_CTX_DELTA: &str = "agent_ctx_delta";
    pub const AGENT_PROCESS_START: &str = "agent_process_start";
    pub const AGENT_PROCESS_END: &str = "agent_process_end";
    pub const ACTION_START: &str = "action_start";
    pub const ACTION_END: &str = "action_end";
    pub const EMOTION_UPDATE: &str = "emotion_update";
    pub const PLAN_UPDATE: &str = "plan_update";
    pub const AGENT_ERROR: &str = "agent_error";
    pub const SYSTEM_LOG: &str = "system_log";
    pub const ERROR: &str = "error";
    pub const EXPERIMENT_RUN_START: &str = "experiment_run_start";
    pub const EXPERIMENT_RUN_FINISH: &str = "experiment_run_finish";
    pub const EXPERIMENT_ACTION: &str = "experiment_action";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_agent_error_derives_system_log() {
        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let bus = EventBus::capturing(buffer.clone());
        bus.emit(
            event_types::AGENT_ERROR,
            serde_json::json!({"agent": "Bob", "kind": "offline"}),
        );
        let events = buffer.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, event_types::AGENT_ERROR);
        assert_eq!(events[1].event_type, event_types::SYSTEM_LOG);
        assert_eq!(events[1].data["level"], "warning");
        assert_eq!(events[1].data["agent"], "Bob");
    }

    #[test]
    fn non_offline_agent_error_stays_single() {
        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let bus = EventBus::capturing(buffer.clone());
        bus.emit(
            event_types::AGENT_ERROR,
            serde_json::json!({"agent": "Bob", "kind": "parse"}),
        );
        assert_eq!(buffer.lock().unwrap().len(), 1);
    }

    #[test]
    fn envelope_serializes_with_type_key() {
        let ev = NodeEvent::new(
            SimEvent::new("action_end", serde_json::json!({"agent": "Alice"})),
            3,
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "action_end");
        assert_eq!(v["node"], 3);
        assert_eq!(v["data"]["agent"], "Alice");
    }
}
