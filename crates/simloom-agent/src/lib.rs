//! Simloom agent - autonomous simulation participants
//!
//! An agent owns its identity, short-term memory, plan state, knowledge, and
//! error latch. Each step it runs one LLM round-trip and yields at most one
//! parsed action for the scene to interpret.

pub mod agent;
pub mod knowledge;
pub mod memory;
pub mod parsing;
pub mod plan;

pub use agent::{ActionEntry, Agent, SceneBrief};
pub use knowledge::{DocumentChunks, DocumentMap, GlobalKnowledge, KnowledgeItem};
pub use memory::{MemoryEntry, ShortTermMemory};
pub use parsing::{ActionData, ParseError, ParsedResponse};
pub use plan::{Goal, Milestone, PlanState};
