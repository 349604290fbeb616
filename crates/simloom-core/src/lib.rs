//! Simloom core - shared types, event protocol, and error handling

pub mod config;
pub mod error;
pub mod event;
pub mod protocol;

pub use config::{ClientConfig, EngineConfig, SuggestionConfig};
pub use error::{Error, Result};
pub use event::{Event, EventKind, Media};
pub use protocol::*;
