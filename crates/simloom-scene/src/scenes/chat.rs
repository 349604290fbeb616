//! Open chat room

use crate::action::ActionOutcome;
use crate::actions::default_catalog;
use crate::scene::{Scene, SceneState, TurnCtx};
use simloom_agent::{ActionData, ActionEntry, Agent, SceneBrief};
use simloom_core::event::Event;
use simloom_core::Result;

pub const BASIC_ACTIONS: &[&str] = &["send_message", "yield"];
pub const ALLOWED_ACTIONS: &[&str] = &["talk_to", "query_knowledge", "list_knowledge"];

/// Agents converse freely; no completion condition of its own.
#[derive(Clone, Debug)]
pub struct ChatScene {
    name: String,
    initial: String,
    state: SceneState,
}

impl ChatScene {
    pub fn new(name: impl Into<String>, initial: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial: initial.into(),
            state: SceneState::default(),
        }
    }

    pub fn restore(value: &serde_json::Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("chat")
            .to_string();
        let initial = value
            .get("initial_event")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let state = match value.get("state") {
            Some(v) => serde_json::from_value(v.clone())?,
            None => SceneState::default(),
        };
        Ok(Self {
            name,
            initial,
            state,
        })
    }
}

impl Scene for ChatScene {
    fn scene_type(&self) -> &'static str {
        "simple_chat"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &SceneState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SceneState {
        &mut self.state
    }

    fn initial_event(&self) -> Event {
        Event::public(self.initial.clone()).with_code("initial_event")
    }

    fn brief(&self) -> SceneBrief {
        SceneBrief {
            description: format!(
                "You are in an open chat room called \"{}\". Everyone present hears \
                 everything said with send_message; talk_to reaches one person only.",
                self.name
            ),
            guidelines: "Speak naturally and react to what others say. Yield your turn \
                         when you have nothing to add."
                .to_string(),
            examples: String::new(),
        }
    }

    fn scene_actions(&self, _agent: &Agent) -> Vec<ActionEntry> {
        default_catalog().entries_for(BASIC_ACTIONS)
    }

    fn parse_and_handle_action(
        &mut self,
        action: &ActionData,
        agent: &mut Agent,
        ctx: &mut TurnCtx<'_>,
    ) -> Result<ActionOutcome> {
        Ok(default_catalog().dispatch(action, agent, &mut self.state, ctx))
    }

    fn post_turn(&mut self, _agent: &mut Agent, _ctx: &mut TurnCtx<'_>) -> Result<()> {
        self.state.advance_clock(1);
        Ok(())
    }

    fn serialize(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.scene_type(),
            "name": self.name,
            "initial_event": self.initial,
            "state": self.state,
        })
    }

    fn clone_box(&self) -> Box<dyn Scene> {
        Box::new(self.clone())
    }
}
