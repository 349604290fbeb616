//! Engine and environment knobs
//!
//! Defaults mirror production settings; every knob can be overridden from the
//! environment so deployments tune behavior without code changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Turn-engine configuration carried by every simulator snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Intra-turn step bound: one agent may act at most this many times per turn.
    #[serde(default = "default_max_steps")]
    pub max_steps_per_turn: u32,
    /// Per-node log retention. `None` keeps everything; a value turns the
    /// node log into a ring of that many entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_log_cap: Option<usize>,
    /// Bounded size of each subscriber queue.
    #[serde(default = "default_queue_size")]
    pub subscriber_queue_size: usize,
}

fn default_max_steps() -> u32 {
    5
}

fn default_queue_size() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_turn: default_max_steps(),
            node_log_cap: None,
            subscriber_queue_size: default_queue_size(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("SIMLOOM_MAX_STEPS_PER_TURN") {
            cfg.max_steps_per_turn = v;
        }
        if let Some(v) = env_parse("SIMLOOM_NODE_LOG_CAP") {
            cfg.node_log_cap = Some(v);
        }
        if let Some(v) = env_parse("SIMLOOM_SUBSCRIBER_QUEUE_SIZE") {
            cfg.subscriber_queue_size = v;
        }
        cfg
    }
}

/// Outbound LLM client limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hard bound on a single chat round-trip.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt, with exponential backoff.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay; doubles per retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
    /// Concurrent in-flight requests per client.
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_concurrency() -> usize {
    4
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_ms(),
            max_concurrency: default_concurrency(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("SIMLOOM_LLM_TIMEOUT_SECS") {
            cfg.timeout_secs = v;
        }
        if let Some(v) = env_parse("SIMLOOM_LLM_MAX_RETRIES") {
            cfg.max_retries = v;
        }
        if let Some(v) = env_parse("SIMLOOM_LLM_BACKOFF_MS") {
            cfg.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("SIMLOOM_LLM_CONCURRENCY") {
            cfg.max_concurrency = v;
        }
        cfg
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << attempt.min(10)))
    }
}

/// Turn-interval gating for environment suggestions shown to operators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuggestionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_turn_interval")]
    pub turn_interval: u32,
}

fn default_turn_interval() -> u32 {
    5
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            turn_interval: default_turn_interval(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = ClientConfig {
            backoff_base_ms: 100,
            ..Default::default()
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn engine_config_round_trip() {
        let cfg = EngineConfig {
            max_steps_per_turn: 3,
            node_log_cap: Some(1000),
            subscriber_queue_size: 64,
        };
        let v = serde_json::to_value(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back.max_steps_per_turn, 3);
        assert_eq!(back.node_log_cap, Some(1000));
    }
}
