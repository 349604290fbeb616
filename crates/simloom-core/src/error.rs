//! Error types for simloom

use crate::protocol::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node {0} is not attached")]
    NodeNotAttached(NodeId),

    #[error("the root node cannot be deleted")]
    RootDeletion,

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("unknown scene type: {0}")]
    UnknownSceneType(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown ordering: {0}")]
    UnknownOrdering(String),

    #[error("scene error: {scene} - {message}")]
    SceneError { scene: String, message: String },

    #[error("llm error: {client} - {message}")]
    LlmError { client: String, message: String },

    #[error("simulation not found: {0}")]
    SimulationNotFound(String),

    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("quota denied: needed {needed} tokens, {available} available")]
    QuotaDenied { needed: u64, available: u64 },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("snapshot error: {0}")]
    SnapshotError(String),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable short name for structured error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NodeNotFound(_) => "node_not_found",
            Error::NodeNotAttached(_) => "node_not_attached",
            Error::RootDeletion => "root_deletion",
            Error::AgentNotFound(_) => "agent_not_found",
            Error::UnknownSceneType(_) => "unknown_scene_type",
            Error::UnknownAction(_) => "unknown_action",
            Error::UnknownOrdering(_) => "unknown_ordering",
            Error::SceneError { .. } => "scene_error",
            Error::LlmError { .. } => "llm_error",
            Error::SimulationNotFound(_) => "simulation_not_found",
            Error::ExperimentNotFound(_) => "experiment_not_found",
            Error::RunNotFound(_) => "run_not_found",
            Error::QuotaDenied { .. } => "quota_denied",
            Error::ConfigError(_) => "config_error",
            Error::SnapshotError(_) => "snapshot_error",
            Error::JsonError(_) => "json_error",
            Error::Internal(_) => "internal",
        }
    }

    pub fn scene_error(scene: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SceneError {
            scene: scene.into(),
            message: message.into(),
        }
    }

    pub fn llm_error(client: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmError {
            client: client.into(),
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn snapshot_error(message: impl Into<String>) -> Self {
        Self::SnapshotError(message.into())
    }
}
