//! Per-agent short-term conversation memory
//!
//! Insertion order is significant and there is no deduplication; the memory
//! is the exact transcript the agent has perceived.

use serde::{Deserialize, Serialize};
use simloom_core::event::Media;
use simloom_llm::{ChatMessage, Role};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Media::is_empty")]
    pub media: Media,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShortTermMemory {
    entries: Vec<MemoryEntry>,
}

impl ShortTermMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>, media: Media) {
        self.entries.push(MemoryEntry {
            role,
            content: content.into(),
            media,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&MemoryEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Chat-formatted history for an LLM round-trip.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .map(|e| ChatMessage {
                role: e.role,
                content: e.content.clone(),
                media: e.media.clone(),
            })
            .collect()
    }

    /// The most recent `count` entries, oldest first.
    pub fn tail(&self, count: usize) -> &[MemoryEntry] {
        let start = self.entries.len().saturating_sub(count);
        &self.entries[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order() {
        let mut mem = ShortTermMemory::new();
        mem.append(Role::User, "first", Media::default());
        mem.append(Role::Assistant, "second", Media::default());
        mem.append(Role::User, "first", Media::default()); // duplicates kept
        assert_eq!(mem.len(), 3);
        let contents: Vec<_> = mem.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "first"]);
    }

    #[test]
    fn tail_returns_most_recent() {
        let mut mem = ShortTermMemory::new();
        for i in 0..5 {
            mem.append(Role::User, format!("m{i}"), Media::default());
        }
        let tail = mem.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(tail[1].content, "m4");
    }
}
