//! Action capabilities and the declarative validation framework
//!
//! Actions are stateless behaviors shared by reference across agents and
//! nodes. Validation is declared per action and checked by the dispatcher in
//! a fixed order - roles, then state guard, then parameters - before `handle`
//! ever runs.

use simloom_agent::{ActionData, ActionEntry, Agent};
use simloom_core::event::Media;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::scene::{SceneState, TurnCtx};

/// Who may use an action. `Any` admits every non-host role.
#[derive(Clone, Debug)]
pub enum RoleFilter {
    Any,
    Roles(&'static [&'static str]),
}

const HOST_ROLES: &[&str] = &["host", "moderator"];

impl RoleFilter {
    pub fn permits(&self, role: &str) -> bool {
        match self {
            RoleFilter::Any => !HOST_ROLES.contains(&role),
            RoleFilter::Roles(roles) => roles.contains(&role),
        }
    }
}

/// The outcome of one handled action.
#[derive(Clone, Debug)]
pub struct ActionOutcome {
    pub success: bool,
    pub result: serde_json::Value,
    pub summary: String,
    pub meta: serde_json::Value,
    /// The actor yields its turn to the ordering.
    pub pass_control: bool,
}

impl ActionOutcome {
    pub fn ok(summary: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            success: true,
            result,
            summary: summary.into(),
            meta: serde_json::json!({}),
            pass_control: false,
        }
    }

    pub fn fail(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: serde_json::json!({"error": error.into()}),
            summary: summary.into(),
            meta: serde_json::json!({}),
            pass_control: false,
        }
    }

    pub fn yielding(mut self) -> Self {
        self.pass_control = true;
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// A stateless capability. Implementations must hold no per-run state.
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Usage fragment for the agent prompt, XML element included.
    fn instruction(&self) -> &'static str {
        ""
    }

    fn allowed_roles(&self) -> RoleFilter {
        RoleFilter::Any
    }

    /// Scene-state precondition with its error message on rejection.
    fn validate_state(&self, _state: &SceneState) -> Result<(), String> {
        Ok(())
    }

    fn validate_params(&self, _action: &ActionData) -> Result<(), String> {
        Ok(())
    }

    fn handle(
        &self,
        action: &ActionData,
        agent: &mut Agent,
        state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome;

    fn entry(&self) -> ActionEntry {
        ActionEntry {
            name: self.name().to_string(),
            description: self.description().to_string(),
            instruction: self.instruction().to_string(),
        }
    }
}

/// Name-keyed set of shared action behaviors.
#[derive(Clone, Default)]
pub struct ActionCatalog {
    actions: HashMap<&'static str, Arc<dyn Action>>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Action + 'static) {
        self.actions.insert(action.name(), Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.actions.keys().copied().collect()
    }

    /// Catalog entries for the given names, skipping unknown ones.
    pub fn entries_for(&self, names: &[&str]) -> Vec<ActionEntry> {
        names
            .iter()
            .filter_map(|n| self.get(n))
            .map(|a| a.entry())
            .collect()
    }

    /// Run the full dispatch: permission, validation chain, then `handle`.
    /// Rejections come back as failed outcomes with the reason delivered to
    /// the agent as environment feedback so it can correct itself next step.
    pub fn dispatch(
        &self,
        action: &ActionData,
        agent: &mut Agent,
        state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let Some(behavior) = self.get(&action.name).filter(|_| agent.has_action(&action.name))
        else {
            debug!(agent = %agent.name, action = %action.name, "unknown or unavailable action");
            let message = format!("Unknown or unavailable action: {}", action.name);
            agent.add_env_feedback(message.clone(), Media::default(), ctx.bus);
            return ActionOutcome::fail("action rejected", message);
        };

        if !behavior.allowed_roles().permits(&agent.role) {
            let message = format!("Your role may not use {}.", action.name);
            agent.add_env_feedback(message.clone(), Media::default(), ctx.bus);
            return ActionOutcome::fail("action rejected", message);
        }
        if let Err(message) = behavior.validate_state(state) {
            agent.add_env_feedback(message.clone(), Media::default(), ctx.bus);
            return ActionOutcome::fail("action rejected", message);
        }
        if let Err(message) = behavior.validate_params(action) {
            agent.add_env_feedback(message.clone(), Media::default(), ctx.bus);
            return ActionOutcome::fail("action rejected", message);
        }

        behavior.handle(action, agent, state, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simloom_core::protocol::EventBus;
    use simloom_llm::ClientMap;
    use std::collections::VecDeque;

    struct ProbeAction;

    impl Action for ProbeAction {
        fn name(&self) -> &'static str {
            "probe"
        }
        fn description(&self) -> &'static str {
            "probe the machinery"
        }
        fn allowed_roles(&self) -> RoleFilter {
            RoleFilter::Roles(&["engineer"])
        }
        fn validate_state(&self, state: &SceneState) -> Result<(), String> {
            if state.get_bool("sealed") {
                Err("The chamber is sealed.".to_string())
            } else {
                Ok(())
            }
        }
        fn validate_params(&self, action: &ActionData) -> Result<(), String> {
            action
                .param("target")
                .map(|_| ())
                .ok_or_else(|| "probe requires a <target>".to_string())
        }
        fn handle(
            &self,
            action: &ActionData,
            _agent: &mut Agent,
            _state: &mut SceneState,
            _ctx: &mut TurnCtx<'_>,
        ) -> ActionOutcome {
            ActionOutcome::ok(
                format!("probed {}", action.param("target").unwrap_or("?")),
                serde_json::json!({}),
            )
        }
    }

    fn ctx_parts() -> (EventBus, VecDeque<crate::scene::PendingItem>, ClientMap) {
        (EventBus::null(), VecDeque::new(), ClientMap::new())
    }

    fn dispatch_with(agent: &mut Agent, state: &mut SceneState, action: &ActionData) -> ActionOutcome {
        let mut catalog = ActionCatalog::new();
        catalog.register(ProbeAction);
        let (bus, mut pending, clients) = ctx_parts();
        let mut ctx = TurnCtx {
            names: vec![agent.name.clone()],
            bus: &bus,
            pending: &mut pending,
            clients: &clients,
            turns: 0,
        };
        catalog.dispatch(action, agent, state, &mut ctx)
    }

    fn engineer() -> Agent {
        let mut agent = Agent::new("Eve").with_role("engineer");
        agent.extend_actions([ActionEntry {
            name: "probe".into(),
            description: String::new(),
            instruction: String::new(),
        }]);
        agent
    }

    #[test]
    fn validation_order_role_first() {
        let mut agent = engineer();
        agent.role = "visitor".into();
        let mut state = SceneState::default();
        state.set("sealed", serde_json::json!(true)); // would also fail the guard
        let outcome = dispatch_with(
            &mut agent,
            &mut state,
            &ActionData::new("probe"),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.result["error"], "Your role may not use probe.");
    }

    #[test]
    fn state_guard_before_params() {
        let mut agent = engineer();
        let mut state = SceneState::default();
        state.set("sealed", serde_json::json!(true));
        let outcome = dispatch_with(&mut agent, &mut state, &ActionData::new("probe"));
        assert_eq!(outcome.result["error"], "The chamber is sealed.");
    }

    #[test]
    fn param_validation_then_handle() {
        let mut agent = engineer();
        let mut state = SceneState::default();
        let missing = dispatch_with(&mut agent, &mut state, &ActionData::new("probe"));
        assert_eq!(missing.result["error"], "probe requires a <target>");

        let ok = dispatch_with(
            &mut agent,
            &mut state,
            &ActionData::new("probe").with_param("target", "valve"),
        );
        assert!(ok.success);
        assert_eq!(ok.summary, "probed valve");
    }

    #[test]
    fn rejection_feeds_back_to_agent() {
        let mut agent = engineer();
        let mut state = SceneState::default();
        let before = agent.short_memory.len();
        dispatch_with(&mut agent, &mut state, &ActionData::new("probe"));
        assert_eq!(agent.short_memory.len(), before + 1);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let mut agent = engineer();
        let mut state = SceneState::default();
        let outcome = dispatch_with(&mut agent, &mut state, &ActionData::new("teleport"));
        assert!(!outcome.success);
        assert!(!outcome.pass_control);
    }

    #[test]
    fn any_filter_excludes_hosts() {
        assert!(RoleFilter::Any.permits(""));
        assert!(RoleFilter::Any.permits("villager"));
        assert!(!RoleFilter::Any.permits("moderator"));
        assert!(!RoleFilter::Any.permits("host"));
    }
}
