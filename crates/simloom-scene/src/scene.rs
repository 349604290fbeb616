//! The Scene contract and turn context

use serde::{Deserialize, Serialize};
use simloom_agent::{ActionData, Agent, SceneBrief};
use simloom_core::event::Event;
use simloom_core::protocol::EventBus;
use simloom_core::Result;
use simloom_llm::ClientMap;
use std::collections::VecDeque;

use crate::action::ActionOutcome;
use crate::ordering::{Ordering, SequentialOrdering};

/// Scene-owned state. Common keys are typed; mechanic-specific keys live in
/// `extra`. Deep-copied wholesale on branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneState {
    /// Scene clock in minutes since midnight.
    pub time_minutes: u32,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub social_network: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for SceneState {
    fn default() -> Self {
        Self {
            time_minutes: 8 * 60,
            complete: false,
            social_network: serde_json::Map::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl SceneState {
    pub fn clock(&self) -> String {
        let h = (self.time_minutes / 60) % 24;
        let m = self.time_minutes % 60;
        format!("{h:02}:{m:02}")
    }

    pub fn advance_clock(&mut self, minutes: u32) {
        self.time_minutes = self.time_minutes.wrapping_add(minutes);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.extra.insert(key.into(), value);
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.extra.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// Work deferred to the next quiescence point of the turn engine. Broadcast
/// delivery mutates every recipient, so it cannot happen while one agent is
/// exclusively borrowed mid-action.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum PendingItem {
    Event {
        event_type: String,
        data: serde_json::Value,
    },
    Broadcast {
        event: Event,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receivers: Option<Vec<String>>,
    },
}

/// What a scene may touch while handling one actor's turn. The actor itself
/// is passed alongside; everything here is the rest of the world.
pub struct TurnCtx<'a> {
    /// All agent names in scheduling order, including the actor.
    pub names: Vec<String>,
    pub bus: &'a EventBus,
    pub pending: &'a mut VecDeque<PendingItem>,
    pub clients: &'a ClientMap,
    pub turns: u64,
}

impl TurnCtx<'_> {
    /// Emit immediately onto the node's event stream.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.bus.emit(event_type, data);
    }

    /// Emit at the next quiescence point.
    pub fn emit_later(&mut self, event_type: impl Into<String>, data: serde_json::Value) {
        self.pending.push_back(PendingItem::Event {
            event_type: event_type.into(),
            data,
        });
    }

    /// Queue a broadcast for delivery at the next quiescence point. The
    /// sender never receives its own event; `receivers` restricts delivery.
    pub fn broadcast(&mut self, event: Event, receivers: Option<Vec<String>>) {
        self.pending.push_back(PendingItem::Broadcast { event, receivers });
    }
}

/// Game-agnostic rules contract. Scenes must be deep-copy safe: cloning the
/// scene clones the entire mechanic state.
pub trait Scene: Send {
    /// Registry discriminator, also stored in serialized form.
    fn scene_type(&self) -> &'static str;

    fn name(&self) -> &str;

    fn state(&self) -> &SceneState;

    fn state_mut(&mut self) -> &mut SceneState;

    /// The event broadcast once when a fresh simulation starts.
    fn initial_event(&self) -> Event;

    /// Description, guidelines, and examples injected into agent prompts.
    fn brief(&self) -> SceneBrief;

    /// Seed per-agent properties expected by this scene.
    fn initialize_agent(&self, _agent: &mut Agent) {}

    /// Capability entries to merge into an agent's catalog on attachment.
    fn scene_actions(&self, agent: &Agent) -> Vec<simloom_agent::ActionEntry>;

    /// The rule-engine entry point. A returned error aborts the current turn
    /// and surfaces as a structured `error` event; it never tears down a run.
    fn parse_and_handle_action(
        &mut self,
        action: &ActionData,
        agent: &mut Agent,
        ctx: &mut TurnCtx<'_>,
    ) -> Result<ActionOutcome>;

    /// Scene may declare an actor inert this turn.
    fn should_skip_turn(&self, _agent: &Agent) -> bool {
        false
    }

    /// Advance the scene clock, evaluate completion, optionally broadcast.
    fn post_turn(&mut self, agent: &mut Agent, ctx: &mut TurnCtx<'_>) -> Result<()>;

    fn is_complete(&self) -> bool {
        self.state().complete
    }

    /// Next actor for controlled orderings. `None` skips the slot.
    fn controlled_next(&self, _names: &[String]) -> Option<String> {
        None
    }

    /// Optional status message fed to the actor before its turn.
    fn agent_status_prompt(&self, _agent: &Agent) -> Option<String> {
        None
    }

    /// The ordering this scene wants when the operator does not pick one.
    fn default_ordering(&self, _names: &[String]) -> Box<dyn Ordering> {
        Box::new(SequentialOrdering::new())
    }

    /// Plain-data form; `SceneRegistry` restores it by `scene_type`.
    fn serialize(&self) -> serde_json::Value;

    fn clone_box(&self) -> Box<dyn Scene>;
}

impl Clone for Box<dyn Scene> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
