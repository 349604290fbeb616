//! Conversation actions

use crate::action::{Action, ActionOutcome};
use crate::scene::{SceneState, TurnCtx};
use simloom_agent::{ActionData, Agent};
use simloom_core::event::Event;

/// Say something to everyone present.
pub struct SendMessageAction;

impl Action for SendMessageAction {
    fn name(&self) -> &'static str {
        "send_message"
    }

    fn description(&self) -> &'static str {
        "Say something to everyone in the scene."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"send_message\"><message>what you want to say</message></Action>\n"
    }

    fn validate_params(&self, action: &ActionData) -> Result<(), String> {
        match action.param("message") {
            Some(m) if !m.trim().is_empty() => Ok(()),
            _ => Err("send_message requires a non-empty <message>".to_string()),
        }
    }

    fn handle(
        &self,
        action: &ActionData,
        agent: &mut Agent,
        _state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let message = action.param("message").unwrap_or_default().to_string();
        ctx.broadcast(Event::message(agent.name.clone(), message.clone()), None);
        ActionOutcome::ok("message sent", serde_json::json!({"message": message}))
    }
}

/// Say something to one named agent.
pub struct TalkToAction;

impl Action for TalkToAction {
    fn name(&self) -> &'static str {
        "talk_to"
    }

    fn description(&self) -> &'static str {
        "Say something to one specific agent."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"talk_to\"><target>agent name</target><message>what you want to say</message></Action>\n"
    }

    fn validate_params(&self, action: &ActionData) -> Result<(), String> {
        if action.param("target").map_or(true, str::is_empty) {
            return Err("talk_to requires a <target>".to_string());
        }
        if action.param("message").map_or(true, str::is_empty) {
            return Err("talk_to requires a <message>".to_string());
        }
        Ok(())
    }

    fn handle(
        &self,
        action: &ActionData,
        agent: &mut Agent,
        _state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let target = action.param("target").unwrap_or_default().to_string();
        if !ctx.names.iter().any(|n| n == &target) {
            let message = format!("There is no one called {target} here.");
            agent.add_env_feedback(message.clone(), Default::default(), ctx.bus);
            return ActionOutcome::fail("action rejected", message);
        }
        let message = action.param("message").unwrap_or_default().to_string();
        ctx.broadcast(
            Event::message(agent.name.clone(), message.clone()),
            Some(vec![target.clone()]),
        );
        ActionOutcome::ok(
            format!("spoke to {target}"),
            serde_json::json!({"target": target, "message": message}),
        )
    }
}

/// End the turn without further actions.
pub struct YieldAction;

impl Action for YieldAction {
    fn name(&self) -> &'static str {
        "yield"
    }

    fn description(&self) -> &'static str {
        "End your turn when you have nothing further to do."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"yield\"/>\n"
    }

    fn handle(
        &self,
        _action: &ActionData,
        _agent: &mut Agent,
        _state: &mut SceneState,
        _ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        ActionOutcome::ok("yielded the turn", serde_json::json!({})).yielding()
    }
}
