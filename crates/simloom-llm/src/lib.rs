//! Simloom LLM - chat/search client seams with retry, timeout, and mocks

pub mod client;
pub mod mock;

pub use client::{
    ChatClient, ChatMessage, ClientMap, LlmError, LlmResult, RetryClient, Role, SearchClient,
    SearchResult,
};
pub use mock::{MockChatClient, MockReply, MockSearchClient};
