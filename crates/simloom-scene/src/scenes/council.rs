//! Council chamber: debate a draft, vote on it, adjourn

use crate::action::ActionOutcome;
use crate::actions::council::{DRAFT, MEETING_FINISHED, VOTES, VOTING_OPEN};
use crate::actions::default_catalog;
use crate::scene::{Scene, SceneState, TurnCtx};
use simloom_agent::{ActionData, ActionEntry, Agent, SceneBrief};
use simloom_core::event::Event;
use simloom_core::Result;

pub const BASIC_ACTIONS: &[&str] = &["send_message", "voting_status", "yield"];
pub const ALLOWED_ACTIONS: &[&str] = &[
    "start_voting",
    "vote",
    "finish_meeting",
    "request_brief",
    "query_knowledge",
    "list_knowledge",
];

#[derive(Clone, Debug)]
pub struct CouncilScene {
    name: String,
    initial: String,
    state: SceneState,
}

impl CouncilScene {
    pub fn new(
        name: impl Into<String>,
        initial: impl Into<String>,
        draft: impl Into<String>,
    ) -> Self {
        let mut state = SceneState::default();
        state.set(DRAFT, serde_json::json!(draft.into()));
        state.set(VOTING_OPEN, serde_json::json!(false));
        state.set(VOTES, serde_json::json!({}));
        state.set(MEETING_FINISHED, serde_json::json!(false));
        Self {
            name: name.into(),
            initial: initial.into(),
            state,
        }
    }

    pub fn restore(value: &serde_json::Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("council")
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

    fn has_voted(&self, name: &str) -> bool {
        self.state
            .get(VOTES)
            .and_then(|v| v.as_object())
            .map(|votes| votes.contains_key(name))
            .unwrap_or(false)
    }
}

impl Scene for CouncilScene {
    fn scene_type(&self) -> &'static str {
        "council"
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
        let draft = self.state.get_str(DRAFT).unwrap_or_default();
        SceneBrief {
            description: format!(
                "You sit in the council chamber \"{}\". The chamber is considering the \
                 following draft:\n{draft}",
                self.name
            ),
            guidelines: "Debate the draft on its merits. Any member may open a voting \
                         round; cast your vote while it is open. Adjourning the meeting \
                         closes the session for good."
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
        self.state.advance_clock(2);
        Ok(())
    }

    fn agent_status_prompt(&self, agent: &Agent) -> Option<String> {
        if self.state.get_bool(VOTING_OPEN) && !self.has_voted(&agent.name) {
            Some("A voting round is open and you have not voted yet. Cast your vote with the vote action.".to_string())
        } else {
            None
        }
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
