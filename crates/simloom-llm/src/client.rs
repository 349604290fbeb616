//! Chat and search client seams
//!
//! Providers live outside the runtime; the engine consumes them through these
//! traits. `RetryClient` adds the outbound limits every deployment wants:
//! per-call timeout, bounded retries with exponential backoff, and a
//! concurrency semaphore.

use serde::{Deserialize, Serialize};
use simloom_core::config::ClientConfig;
use simloom_core::event::Media;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Result type for client operations
pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("cancelled")]
    Cancelled,
}

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A chat-formatted message with its media references. Non-multimodal clients
/// receive the media as `[image: url]` placeholder lines appended to the text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Media::is_empty")]
    pub media: Media,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            media: Media::default(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            media: Media::default(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            media: Media::default(),
        }
    }

    /// Text rendition for clients without media support.
    pub fn degraded_content(&self) -> String {
        if self.media.images.is_empty() {
            return self.content.clone();
        }
        let mut out = self.content.clone();
        for url in &self.media.images {
            out.push_str(&format!("\n[image: {url}]"));
        }
        out
    }
}

/// An opaque `chat(messages) -> text` capability.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    fn name(&self) -> &str;

    /// Whether image references can be passed through as-is.
    fn supports_media(&self) -> bool {
        false
    }

    async fn chat(&self, messages: &[ChatMessage]) -> LlmResult<String>;
}

/// An opaque `search(query) -> results` capability.
#[async_trait::async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> LlmResult<Vec<SearchResult>>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// The injected client set. Keyed by purpose (`chat`, `default`, ...); the
/// optional search client rides alongside. Cheap to clone, never serialized.
#[derive(Clone, Default)]
pub struct ClientMap {
    chat: HashMap<String, Arc<dyn ChatClient>>,
    search: Option<Arc<dyn SearchClient>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chat(mut self, key: impl Into<String>, client: Arc<dyn ChatClient>) -> Self {
        self.chat.insert(key.into(), client);
        self
    }

    pub fn with_search(mut self, client: Arc<dyn SearchClient>) -> Self {
        self.search = Some(client);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ChatClient>> {
        self.chat.get(key).cloned()
    }

    pub fn search_client(&self) -> Option<Arc<dyn SearchClient>> {
        self.search.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.chat.is_empty()
    }

    /// A map with every capability removed; used when a quota reservation is
    /// denied and a run must proceed without LLM calls.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Dispatch to the named client, degrading media for clients that cannot
    /// consume it.
    pub async fn chat(&self, key: &str, messages: &[ChatMessage]) -> LlmResult<String> {
        let client = self
            .chat
            .get(key)
            .ok_or_else(|| LlmError::ClientNotFound(key.to_string()))?;
        if client.supports_media() || messages.iter().all(|m| m.media.is_empty()) {
            return client.chat(messages).await;
        }
        let degraded: Vec<ChatMessage> = messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.degraded_content(),
                media: Media::default(),
            })
            .collect();
        client.chat(&degraded).await
    }
}

impl std::fmt::Debug for ClientMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMap")
            .field("chat", &self.chat.keys().collect::<Vec<_>>())
            .field("search", &self.search.is_some())
            .finish()
    }
}

/// Wraps a provider with timeout, retry, and concurrency limits.
pub struct RetryClient {
    inner: Arc<dyn ChatClient>,
    config: ClientConfig,
    permits: Semaphore,
}

impl RetryClient {
    pub fn new(inner: Arc<dyn ChatClient>, config: ClientConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrency);
        Self {
            inner,
            config,
            permits,
        }
    }
}

#[async_trait::async_trait]
impl ChatClient for RetryClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports_media(&self) -> bool {
        self.inner.supports_media()
    }

    async fn chat(&self, messages: &[ChatMessage]) -> LlmResult<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Cancelled)?;

        let attempts = self.config.max_retries + 1;
        let mut last_err = LlmError::RequestFailed("no attempts made".into());
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.backoff(attempt - 1);
                debug!(client = self.inner.name(), attempt, ?delay, "retrying chat call");
                tokio::time::sleep(delay).await;
            }
            match tokio::time::timeout(self.config.timeout(), self.inner.chat(messages)).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => {
                    warn!(client = self.inner.name(), attempt, error = %e, "chat call failed");
                    last_err = e;
                }
                Err(_) => {
                    warn!(client = self.inner.name(), attempt, "chat call timed out");
                    last_err = LlmError::Timeout(self.config.timeout());
                }
            }
        }
        Err(last_err)
    }
}
