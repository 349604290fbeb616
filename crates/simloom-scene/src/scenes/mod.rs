//! Built-in rule sets

pub mod chat;
pub mod council;

pub use chat::ChatScene;
pub use council::CouncilScene;
