//! Build a tree from its simulation record
//!
//! Applies the scene config (mechanic knobs, social network), the per-slot
//! agent config (names, profiles, action selection, knowledge, documents),
//! picks the ordering, broadcasts configured initial events, and wraps the
//! result in a fresh `SimTree`.

use crate::store::SimulationRecord;
use serde_json::json;
use simloom_agent::{Agent, GlobalKnowledge, KnowledgeItem};
use simloom_core::config::EngineConfig;
use simloom_core::event::Event;
use simloom_core::Result;
use simloom_engine::{SimTree, Simulator};
use simloom_llm::ClientMap;
use simloom_scene::{default_catalog, CycledOrdering, Ordering, SceneRegistry, SequentialOrdering};
use simloom_scene::ControlledOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub fn build_tree(
    record: &SimulationRecord,
    clients: ClientMap,
    scenes: &SceneRegistry,
    engine: EngineConfig,
) -> Result<SimTree> {
    let spec = scenes.get(&record.scene_type)?;
    let config = &record.scene_config;
    let mut scene = scenes.build(&record.scene_type, &record.name, config)?;

    if let Some(network) = config.get("social_network").and_then(|v| v.as_object()) {
        scene.state_mut().social_network = network.clone();
    }

    let default_language = config
        .get("language")
        .and_then(|v| v.as_str())
        .map(String::from);
    let emotion_enabled = config
        .get("emotion_enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let auto_rag = config
        .get("auto_rag")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let catalog = default_catalog();
    let mut agents = Vec::with_capacity(record.agents.len());
    for slot in &record.agents {
        let name = if slot.name.trim().is_empty() {
            "Agent".to_string()
        } else {
            slot.name.trim().to_string()
        };
        let mut agent = Agent::new(name).with_profile(slot.profile.clone());
        if let Some(language) = slot.language.as_deref().or(default_language.as_deref()) {
            agent.language = language.to_string();
        }
        agent.properties = slot.properties.clone();
        agent.emotion_enabled = slot
            .properties
            .get("emotion_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(emotion_enabled);
        agent.auto_rag = auto_rag;
        if let Some(role) = slot.properties.get("role").and_then(|v| v.as_str()) {
            agent.role = role.to_string();
        }
        if let Some(kb) = &slot.knowledge_base {
            agent.knowledge_base = kb.clone();
        }
        if let Some(documents) = &slot.documents {
            agent.documents = documents.clone();
        }

        // scene basics first, then the operator's selection, deduplicated
        let mut names: Vec<&str> = spec.basic_actions.to_vec();
        for selected in &slot.action_space {
            if !names.contains(&selected.as_str()) {
                names.push(selected);
            }
        }
        agent.extend_actions(catalog.entries_for(&names));
        agents.push(agent);
    }

    let names: Vec<String> = agents.iter().map(|a| a.name.clone()).collect();
    let ordering = ordering_from_config(config, &names)
        .unwrap_or_else(|| scene.default_ordering(&names));

    let mut sim = Simulator::new(agents, scene, clients, ordering, engine.clone());

    if let Some(global) = config.get("global_knowledge") {
        let map = parse_global_knowledge(global);
        if !map.is_empty() {
            let shared = Arc::new(map);
            for agent in sim.agents_mut() {
                agent.set_global_knowledge(shared.clone());
            }
        }
    }

    broadcast_initial_events(&mut sim, record);

    info!(
        simulation = %record.id,
        scene = %record.scene_type,
        agents = sim.agents().len(),
        "built simulation tree"
    );
    Ok(SimTree::new(sim, engine))
}

fn ordering_from_config(
    config: &serde_json::Value,
    names: &[String],
) -> Option<Box<dyn Ordering>> {
    match config.get("ordering").and_then(|v| v.as_str())? {
        "sequential" => Some(Box::new(SequentialOrdering::new())),
        "controlled" => Some(Box::new(ControlledOrdering::new())),
        "cycled" => {
            let schedule: Vec<String> = config
                .get("schedule")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_else(|| names.to_vec());
            Some(Box::new(CycledOrdering::new(schedule)))
        }
        _ => None,
    }
}

fn broadcast_initial_events(sim: &mut Simulator, record: &SimulationRecord) {
    let config = &record.scene_config;
    let language = config
        .get("language")
        .and_then(|v| v.as_str())
        .unwrap_or("en");

    if let Some(events) = config.get("initial_events").and_then(|v| v.as_array()) {
        for text in events.iter().filter_map(|v| v.as_str()) {
            if text.trim().is_empty() {
                continue;
            }
            let event = Event::public(text)
                .with_code("initial_event")
                .with_params(json!({"content": text, "lang": language}));
            sim.broadcast(event, None);
        }
    }

    // the council announces its draft as part of the opening record
    if record.scene_type == "council" {
        if let Some(draft) = config
            .get("draft_text")
            .and_then(|v| v.as_str())
            .filter(|d| !d.trim().is_empty())
        {
            let text = format!(
                "The chamber will now consider the following draft for debate and vote:\n{draft}"
            );
            let event = Event::public(text)
                .with_code("council_draft")
                .with_params(json!({"draft": draft, "lang": language}));
            sim.broadcast(event, None);
        }
    }
}

/// Parse the raw `global_knowledge` config shape into the shared map form.
pub fn parse_global_knowledge(value: &serde_json::Value) -> GlobalKnowledge {
    let mut map = HashMap::new();
    if let Some(object) = value.as_object() {
        for (id, item) in object {
            if let Ok(item) = serde_json::from_value::<KnowledgeItem>(item.clone()) {
                map.insert(id.clone(), item);
            }
        }
    }
    map
}
