//! The autonomous agent
//!
//! `Agent::process` runs one decision step: build the system prompt, send the
//! perceived history to the chat client, parse the labeled response, and
//! return at most one action. LLM and parse failures are retried up to
//! `max_repeat` extra attempts; repeated failures trip the offline latch.

use crate::knowledge::{self, DocumentMap, GlobalKnowledge, KnowledgeItem};
use crate::memory::ShortTermMemory;
use crate::parsing::{self, ActionData};
use crate::plan::PlanState;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use simloom_core::event::Media;
use simloom_core::protocol::{event_types, EventBus};
use simloom_llm::{ChatMessage, ClientMap, LlmError, Role};
use std::sync::Arc;
use tracing::{debug, warn};

/// One capability in an agent's action catalog. The behavior itself lives in
/// the scene layer's catalog and is shared by reference; the entry carries
/// only what prompting and serialization need.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActionEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instruction: String,
}

/// What the agent needs to know about its scene when prompting.
#[derive(Clone, Debug, Default)]
pub struct SceneBrief {
    pub description: String,
    pub guidelines: String,
    pub examples: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub initial_instruction: String,
    #[serde(default)]
    pub action_space: Vec<ActionEntry>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub short_memory: ShortTermMemory,
    #[serde(default)]
    pub last_history_length: usize,
    #[serde(default)]
    pub plan_state: PlanState,

    #[serde(default = "default_emotion")]
    pub emotion: String,
    #[serde(default)]
    pub emotion_enabled: bool,

    #[serde(default)]
    pub knowledge_base: Vec<KnowledgeItem>,
    #[serde(default)]
    pub documents: DocumentMap,
    /// Shared simulation-wide knowledge snapshot. Re-injected after
    /// deserialization; never persisted with the agent.
    #[serde(skip)]
    pub global_knowledge: Option<Arc<GlobalKnowledge>>,
    #[serde(default)]
    pub auto_rag: bool,

    #[serde(default = "default_max_repeat")]
    pub max_repeat: u32,
    #[serde(default)]
    pub consecutive_llm_errors: u32,
    #[serde(default = "default_max_errors")]
    pub max_consecutive_llm_errors: u32,
    /// Latched after repeated failures; round-trips through serialization.
    #[serde(default)]
    pub is_offline: bool,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_emotion() -> String {
    "neutral".to_string()
}

fn default_max_repeat() -> u32 {
    2
}

fn default_max_errors() -> u32 {
    3
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            profile: String::new(),
            style: String::new(),
            role: String::new(),
            language: default_language(),
            initial_instruction: String::new(),
            action_space: Vec::new(),
            properties: serde_json::Map::new(),
            short_memory: ShortTermMemory::new(),
            last_history_length: 0,
            plan_state: PlanState::default(),
            emotion: default_emotion(),
            emotion_enabled: false,
            knowledge_base: Vec::new(),
            documents: DocumentMap::new(),
            global_knowledge: None,
            auto_rag: false,
            max_repeat: default_max_repeat(),
            consecutive_llm_errors: 0,
            max_consecutive_llm_errors: default_max_errors(),
            is_offline: false,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.action_space.iter().any(|a| a.name == name)
    }

    /// Merge capabilities into the catalog, first occurrence wins.
    pub fn extend_actions(&mut self, entries: impl IntoIterator<Item = ActionEntry>) {
        for entry in entries {
            if !self.has_action(&entry.name) {
                self.action_space.push(entry);
            }
        }
    }

    pub fn set_global_knowledge(&mut self, global: Arc<GlobalKnowledge>) {
        self.global_knowledge = Some(global);
    }

    /// Deliver environment feedback into memory and onto the timeline.
    pub fn add_env_feedback(&mut self, content: impl Into<String>, media: Media, bus: &EventBus) {
        let content = content.into();
        self.short_memory
            .append(Role::User, content.clone(), media.clone());
        bus.emit(
            event_types::AGENT_CTX_DELTA,
            serde_json::json!({
                "agent": self.name,
                "role": "user",
                "content": content,
                "images": media.images,
                "audio": media.audio,
                "video": media.video,
            }),
        );
    }

    /// One decision step. Returns the parsed actions for this step, or an
    /// empty list when the agent is offline, has seen nothing new, or
    /// exhausted its retries.
    pub async fn process(
        &mut self,
        clients: &ClientMap,
        initiative: bool,
        scene: &SceneBrief,
        bus: &EventBus,
    ) -> Vec<ActionData> {
        if self.is_offline {
            return Vec::new();
        }
        if self.short_memory.len() == self.last_history_length && !initiative {
            // Nothing new perceived, no reaction.
            return Vec::new();
        }

        let mut system = self.system_prompt(scene);
        if self.auto_rag {
            if let Some(context) = knowledge::auto_rag_context(
                &self.knowledge_base,
                &self.documents,
                self.global_knowledge.as_ref(),
                &self.short_memory,
                5,
            ) {
                system.push_str("\n\n");
                system.push_str(&context);
                system.push_str("\nUse the above context to inform your responses when relevant.");
            }
        }

        let mut ctx = vec![ChatMessage::system(system)];
        ctx.extend(self.short_memory.to_messages());

        // Make it explicit that a new step is expected.
        let last_is_assistant = self
            .short_memory
            .last()
            .map(|e| e.role == Role::Assistant)
            .unwrap_or(false);
        if initiative || last_is_assistant {
            let hint = "Continue.";
            self.short_memory.append(Role::User, hint, Media::default());
            ctx.push(ChatMessage::user(hint));
        }

        let attempts = self.max_repeat + 1;
        let mut outcome = None;
        for attempt in 1..=attempts {
            let final_attempt = attempt == attempts;
            let output = match clients.chat("chat", &ctx).await {
                Ok(output) => output,
                Err(e) => {
                    self.record_llm_error("llm_call", &e.to_string(), attempt, final_attempt, bus);
                    if self.is_offline {
                        break;
                    }
                    continue;
                }
            };
            match parsing::parse_full_response(&output) {
                Ok(parsed) => {
                    self.consecutive_llm_errors = 0;
                    outcome = Some((output, parsed));
                    break;
                }
                Err(e) => {
                    debug!(agent = %self.name, attempt, error = %e, "response parse failed");
                    self.record_llm_error("parse", &e.to_string(), attempt, final_attempt, bus);
                    if self.is_offline {
                        break;
                    }
                }
            }
        }

        let Some((output, parsed)) = outcome else {
            return Vec::new();
        };

        if let Some(emotion) = parsed.emotion {
            if self.emotion_enabled && emotion != self.emotion {
                self.emotion = emotion.clone();
                bus.emit(
                    event_types::EMOTION_UPDATE,
                    serde_json::json!({"agent": self.name, "emotion": emotion}),
                );
            }
        }
        if let Some(plan) = parsed.plan_update {
            self.plan_state = plan;
            bus.emit(
                event_types::PLAN_UPDATE,
                serde_json::json!({
                    "agent": self.name,
                    "kind": "replace",
                    "plan": self.plan_state,
                }),
            );
        }

        self.short_memory
            .append(Role::Assistant, output.clone(), Media::default());
        bus.emit(
            event_types::AGENT_CTX_DELTA,
            serde_json::json!({"agent": self.name, "role": "assistant", "content": output}),
        );
        self.last_history_length = self.short_memory.len();

        parsed.actions
    }

    fn record_llm_error(
        &mut self,
        kind: &str,
        error: &str,
        attempt: u32,
        final_attempt: bool,
        bus: &EventBus,
    ) {
        self.consecutive_llm_errors += 1;
        warn!(
            agent = %self.name,
            kind,
            attempt,
            consecutive = self.consecutive_llm_errors,
            "llm step failed: {error}"
        );
        bus.emit(
            event_types::AGENT_ERROR,
            serde_json::json!({
                "agent": self.name,
                "kind": kind,
                "error": error,
                "attempt": attempt,
                "consecutive_errors": self.consecutive_llm_errors,
                "final_attempt": final_attempt,
            }),
        );
        if self.consecutive_llm_errors >= self.max_consecutive_llm_errors && !self.is_offline {
            self.is_offline = true;
            bus.emit(
                event_types::AGENT_ERROR,
                serde_json::json!({
                    "agent": self.name,
                    "kind": "offline",
                    "reason": "too_many_llm_errors",
                    "consecutive_errors": self.consecutive_llm_errors,
                }),
            );
        }
    }

    /// Collapse the whole history into a single summary entry.
    pub async fn summarize_history(&mut self, clients: &ClientMap) -> Result<(), LlmError> {
        static SUMMARY_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?s)Summary:\s*(.*)").expect("summary regex"));

        let history: String = self
            .short_memory
            .iter()
            .map(|e| format!("[{}] {}", e.role.as_str(), e.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize the following conversation history from {}'s perspective. \
             Be concise but capture key points, opinions, ongoing topics, and important events. \
             Output ONLY as 'Summary: [your summary text]'.\n\nHistory:\n{history}",
            self.name
        );
        let output = clients.chat("chat", &[ChatMessage::user(prompt)]).await?;
        let summary = SUMMARY_RE
            .captures(&output)
            .map(|caps| caps[1].trim().to_string())
            .unwrap_or(output);
        self.short_memory.clear();
        self.short_memory
            .append(Role::User, format!("Summary: {summary}"), Media::default());
        self.last_history_length = self.short_memory.len();
        Ok(())
    }

    pub fn system_prompt(&self, scene: &SceneBrief) -> String {
        let mut identity = vec![self.name.clone()];
        if !self.role.is_empty() {
            identity.push(self.role.clone());
        }
        if !self.style.is_empty() && self.style != "neutral" {
            identity.push(format!("({})", self.style));
        }
        let identity_line = identity.join(" - ");

        let profile = if self.profile.chars().count() > 200 {
            let cut: String = self.profile.chars().take(200).collect();
            format!("{cut}...")
        } else {
            self.profile.clone()
        };

        let mut plan_block = format!("Internal Plan State:\n{}", self.plan_state.render());
        if self.plan_state.is_empty() {
            plan_block.push_str(
                "\n\nPlan State is empty. In this turn, include a plan update block to \
                 initialize numbered Goals and Milestones.",
            );
        }

        let knowledge_block = self.knowledge_preview();

        let catalog: String = self
            .action_space
            .iter()
            .map(|a| format!("- {}: {}", a.name, a.description))
            .collect::<Vec<_>>()
            .join("\n");
        let usage: String = self
            .action_space
            .iter()
            .map(|a| a.instruction.as_str())
            .filter(|i| !i.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let emotion_line = if self.emotion_enabled {
            format!("Your current emotion is {}.\n\n", self.emotion)
        } else {
            String::new()
        };

        let examples_block = if scene.examples.is_empty() {
            String::new()
        } else {
            format!("Here are some examples:\n{}\n\n", scene.examples)
        };

        format!(
            "{identity_line}\n\n{profile}\n\n{knowledge_block}{plan_block}\n\n\
             Language: {lang}. Action XML in English; content in {lang}.\n\n\
             {emotion_line}{description}\n\n{guidelines}\n\n\
             Action Space:\n{catalog}\n\nUsage:\n{usage}\n\n\
             {examples_block}{format_spec}\n\n{initial}",
            lang = self.language,
            description = scene.description,
            guidelines = scene.guidelines,
            format_spec = self.output_format(),
            initial = self.initial_instruction,
        )
    }

    fn knowledge_preview(&self) -> String {
        let enabled = knowledge::enabled_knowledge(&self.knowledge_base);
        if enabled.is_empty() {
            return String::new();
        }
        let mut lines = Vec::new();
        for (i, item) in enabled.iter().take(5).enumerate() {
            let mut preview: String = item.content.chars().take(80).collect();
            if item.content.chars().count() > 80 {
                preview.push_str("...");
            }
            lines.push(format!("  [{}] {}: {}", i + 1, item.title, preview));
        }
        let mut block = format!(
            "Knowledge Base:\nYou have a personal knowledge base with {} item(s):\n{}\n",
            enabled.len(),
            lines.join("\n")
        );
        if enabled.len() > 5 {
            block.push_str(&format!("  ... and {} more items\n", enabled.len() - 5));
        }
        block.push_str(
            "Use the query_knowledge action to search for specific information when needed.\n\n",
        );
        block
    }

    fn output_format(&self) -> String {
        let mut spec = String::from(
            "--- Thoughts ---\n[What you're thinking right now - brief]\n\n\
             --- Plan ---\nGoals: [your goals]\nMilestones: [completed and pending]\n\n\
             --- Action ---\n<Action name=\"[action_name]\">\n  [params if needed]\n</Action>\n",
        );
        if self.emotion_enabled {
            spec.push_str(
                "\n--- Emotion Update ---\n\
                 Output your emotion after each turn using Plutchik emotions: \
                 Joy, Trust, Fear, Surprise, Sadness, Disgust, Anger, Anticipation.\n\
                 <Emotion>[emotion]</Emotion>\n",
            );
        }
        spec
    }

    pub fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("agent state is always serializable")
    }

    pub fn deserialize(value: serde_json::Value) -> simloom_core::Result<Agent> {
        Ok(serde_json::from_value(value)?)
    }
}
