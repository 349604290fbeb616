//! Deterministic mock clients for testing
//!
//! `MockChatClient` pops one scripted reply per call; when the script is
//! exhausted it serves a default. Failure replies surface as `RequestFailed`
//! so retry and offline paths can be exercised without a network.

use crate::client::{ChatClient, ChatMessage, LlmError, LlmResult, SearchClient, SearchResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Return the text verbatim.
    Text(String),
    /// Fail the call with the given message.
    Fail(String),
}

pub struct MockChatClient {
    script: Mutex<VecDeque<MockReply>>,
    default_reply: MockReply,
    calls: AtomicUsize,
}

impl MockChatClient {
    /// Always return the same text.
    pub fn constant(text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: MockReply::Text(text.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Serve scripted replies in order, then fall back to a plain yield reply.
    pub fn sequence(replies: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            default_reply: MockReply::Text(canned_reply("yield", &[])),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails. Drives the retry and offline-latch paths.
    pub fn always_failing(message: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: MockReply::Fail(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChatClient for MockChatClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, _messages: &[ChatMessage]) -> LlmResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = {
            let mut script = self.script.lock().await;
            script.pop_front().unwrap_or_else(|| self.default_reply.clone())
        };
        match reply {
            MockReply::Text(text) => Ok(text),
            MockReply::Fail(message) => Err(LlmError::RequestFailed(message)),
        }
    }
}

pub struct MockSearchClient {
    results: Vec<SearchResult>,
}

impl MockSearchClient {
    pub fn with_results(results: Vec<SearchResult>) -> Self {
        Self { results }
    }
}

#[async_trait::async_trait]
impl SearchClient for MockSearchClient {
    async fn search(&self, _query: &str, max_results: usize) -> LlmResult<Vec<SearchResult>> {
        Ok(self.results.iter().take(max_results).cloned().collect())
    }
}

/// Build a well-formed agent reply carrying a single action element.
/// `children` become child parameter tags.
pub fn canned_reply(action: &str, children: &[(&str, &str)]) -> String {
    let action_xml = if children.is_empty() {
        format!("<Action name=\"{action}\"/>")
    } else {
        let params: String = children
            .iter()
            .map(|(k, v)| format!("  <{k}>{v}</{k}>\n"))
            .collect();
        format!("<Action name=\"{action}\">\n{params}</Action>")
    };
    format!(
        "--- Thoughts ---\nProceeding.\n\n--- Plan ---\nGoals: keep the conversation moving\nMilestones: none\n\n--- Action ---\n{action_xml}\n"
    )
}
