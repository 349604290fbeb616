//! Agent plan state
//!
//! Plans persist across turns and are replaced wholesale by a parsed
//! `Plan Update` block.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub id: u32,
    pub desc: String,
    /// At most one goal carries the current marker.
    #[serde(default)]
    pub current: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    pub id: u32,
    pub desc: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanState {
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub notes: String,
}

impl PlanState {
    /// Empty plans prompt the agent to initialize one on its next turn.
    pub fn is_empty(&self) -> bool {
        self.goals.is_empty() && self.milestones.is_empty()
    }

    /// Prompt block rendering.
    pub fn render(&self) -> String {
        let goals = if self.goals.is_empty() {
            "(none)".to_string()
        } else {
            self.goals
                .iter()
                .map(|g| {
                    let marker = if g.current { " [CURRENT]" } else { "" };
                    format!("- [{}]{} {}", g.id, marker, g.desc)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let milestones = if self.milestones.is_empty() {
            "(none)".to_string()
        } else {
            self.milestones
                .iter()
                .map(|m| {
                    let marker = if m.done { " [DONE]" } else { "" };
                    format!("- [{}]{} {}", m.id, marker, m.desc)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Internal Goals:\n{goals}\n\nInternal Milestones:\n{milestones}\n\nInternal Strategy:\n{}\n\nInternal Notes:\n{}",
            self.strategy, self.notes
        )
    }
}
