//! Knowledge-base retrieval actions

use crate::action::{Action, ActionOutcome};
use crate::scene::{SceneState, TurnCtx};
use simloom_agent::knowledge;
use simloom_agent::{ActionData, Agent};
use simloom_core::event::Media;

/// Search the agent's own knowledge base by keyword.
pub struct QueryKnowledgeAction;

impl Action for QueryKnowledgeAction {
    fn name(&self) -> &'static str {
        "query_knowledge"
    }

    fn description(&self) -> &'static str {
        "Search your personal knowledge base."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"query_knowledge\"><query>what to look up</query></Action>\n"
    }

    fn validate_params(&self, action: &ActionData) -> Result<(), String> {
        match action.param("query") {
            Some(q) if !q.trim().is_empty() => Ok(()),
            _ => Err("query_knowledge requires a <query>".to_string()),
        }
    }

    fn handle(
        &self,
        action: &ActionData,
        agent: &mut Agent,
        _state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let query = action.param("query").unwrap_or_default();
        let hits = knowledge::query_knowledge(&agent.knowledge_base, query, 3);
        let feedback = if hits.is_empty() {
            format!("No knowledge found for '{query}'.")
        } else {
            let lines: Vec<String> = hits
                .iter()
                .map(|item| format!("- {}: {}", item.title, item.content))
                .collect();
            format!("Knowledge results for '{query}':\n{}", lines.join("\n"))
        };
        let count = hits.len();
        agent.add_env_feedback(feedback, Media::default(), ctx.bus);
        ActionOutcome::ok(
            format!("retrieved {count} knowledge item(s)"),
            serde_json::json!({"matches": count}),
        )
    }
}

/// List what the agent knows about.
pub struct ListKnowledgeAction;

impl Action for ListKnowledgeAction {
    fn name(&self) -> &'static str {
        "list_knowledge"
    }

    fn description(&self) -> &'static str {
        "List the titles in your knowledge base."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"list_knowledge\"/>\n"
    }

    fn handle(
        &self,
        _action: &ActionData,
        agent: &mut Agent,
        _state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let items = knowledge::enabled_knowledge(&agent.knowledge_base);
        let feedback = if items.is_empty() {
            "Your knowledge base is empty.".to_string()
        } else {
            let lines: Vec<String> = items
                .iter()
                .map(|item| format!("- [{}] {}", item.id, item.title))
                .collect();
            format!("Knowledge base entries:\n{}", lines.join("\n"))
        };
        let count = items.len();
        agent.add_env_feedback(feedback, Media::default(), ctx.bus);
        ActionOutcome::ok(
            format!("listed {count} knowledge item(s)"),
            serde_json::json!({"count": count}),
        )
    }
}
