//! Scene registry
//!
//! Maps a scene type to its factory, its restore function, and the action
//! names agents get by default (`basic`) or may opt into (`allowed`).

use crate::scene::Scene;
use crate::scenes::{chat, council, ChatScene, CouncilScene};
use once_cell::sync::Lazy;
use simloom_core::{Error, Result};
use std::collections::HashMap;

type BuildFn = fn(name: &str, config: &serde_json::Value) -> Result<Box<dyn Scene>>;
type RestoreFn = fn(&serde_json::Value) -> Result<Box<dyn Scene>>;

#[derive(Clone)]
pub struct SceneSpec {
    pub scene_type: &'static str,
    pub description: &'static str,
    pub basic_actions: &'static [&'static str],
    pub allowed_actions: &'static [&'static str],
    pub build: BuildFn,
    pub restore: RestoreFn,
}

#[derive(Clone, Default)]
pub struct SceneRegistry {
    specs: HashMap<&'static str, SceneSpec>,
}

impl SceneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SceneSpec {
            scene_type: "simple_chat",
            description: "Open chat room; agents converse naturally.",
            basic_actions: chat::BASIC_ACTIONS,
            allowed_actions: chat::ALLOWED_ACTIONS,
            build: build_chat,
            restore: restore_chat,
        });
        registry.register(SceneSpec {
            scene_type: "council",
            description: "Council debate and voting around a draft text.",
            basic_actions: council::BASIC_ACTIONS,
            allowed_actions: council::ALLOWED_ACTIONS,
            build: build_council,
            restore: restore_council,
        });
        registry
    }

    pub fn register(&mut self, spec: SceneSpec) {
        self.specs.insert(spec.scene_type, spec);
    }

    pub fn get(&self, scene_type: &str) -> Result<&SceneSpec> {
        self.specs
            .get(scene_type)
            .ok_or_else(|| Error::UnknownSceneType(scene_type.to_string()))
    }

    pub fn build(
        &self,
        scene_type: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Scene>> {
        (self.get(scene_type)?.build)(name, config)
    }

    /// Restore from a serialized scene; dispatches on the `type` field.
    pub fn restore(&self, value: &serde_json::Value) -> Result<Box<dyn Scene>> {
        let scene_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::snapshot_error("scene snapshot missing type"))?;
        (self.get(scene_type)?.restore)(value)
    }

    pub fn scene_types(&self) -> Vec<&'static str> {
        self.specs.keys().copied().collect()
    }
}

fn build_chat(name: &str, config: &serde_json::Value) -> Result<Box<dyn Scene>> {
    let initial = config
        .get("initial_event")
        .and_then(|v| v.as_str())
        .unwrap_or("Welcome to the chat.");
    Ok(Box::new(ChatScene::new(name, initial)))
}

fn restore_chat(value: &serde_json::Value) -> Result<Box<dyn Scene>> {
    Ok(Box::new(ChatScene::restore(value)?))
}

fn build_council(name: &str, config: &serde_json::Value) -> Result<Box<dyn Scene>> {
    let initial = config
        .get("initial_event")
        .and_then(|v| v.as_str())
        .unwrap_or("The council is in session.");
    let draft = config
        .get("draft_text")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Ok(Box::new(CouncilScene::new(name, initial, draft)))
}

fn restore_council(value: &serde_json::Value) -> Result<Box<dyn Scene>> {
    Ok(Box::new(CouncilScene::restore(value)?))
}

static DEFAULT_REGISTRY: Lazy<SceneRegistry> = Lazy::new(SceneRegistry::with_builtins);

pub fn default_registry() -> &'static SceneRegistry {
    &DEFAULT_REGISTRY
}
