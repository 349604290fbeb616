//! The per-node turn engine
//!
//! `run` advances one snapshot turn by turn: pick an actor, optionally feed
//! it a status line, drive a bounded intra-turn step loop, dispatch actions
//! against the scene, and flush buffered events at quiescence points so
//! subscribers see a coherent interleaving. Failures become events; `run`
//! never propagates an error to its caller.

use serde_json::json;
use simloom_agent::Agent;
use simloom_core::config::{EngineConfig, SuggestionConfig};
use simloom_core::event::{Event, Media};
use simloom_core::protocol::{event_types, EventBus};
use simloom_core::{Error, Result};
use simloom_llm::ClientMap;
use simloom_scene::{ordering_from, Ordering, PendingItem, Scene, SceneRegistry, TurnCtx};
use std::collections::VecDeque;
use tracing::debug;

pub struct Simulator {
    agents: Vec<Agent>,
    scene: Box<dyn Scene>,
    ordering: Box<dyn Ordering>,
    clients: ClientMap,
    bus: EventBus,
    pending: VecDeque<PendingItem>,
    turns: u64,
    engine: EngineConfig,
    suggestions: SuggestionConfig,
    suggestions_viewed_turn: Option<u64>,
}

impl Simulator {
    /// Build a fresh simulation: agents are initialized for the scene, scene
    /// capabilities are merged into their catalogs, and the scene's initial
    /// event is broadcast.
    pub fn new(
        agents: Vec<Agent>,
        scene: Box<dyn Scene>,
        clients: ClientMap,
        ordering: Box<dyn Ordering>,
        engine: EngineConfig,
    ) -> Self {
        let mut sim = Self {
            agents,
            scene,
            ordering,
            clients,
            bus: EventBus::null(),
            pending: VecDeque::new(),
            turns: 0,
            engine,
            suggestions: SuggestionConfig::default(),
            suggestions_viewed_turn: None,
        };
        for agent in &mut sim.agents {
            sim.scene.initialize_agent(agent);
            let entries = sim.scene.scene_actions(agent);
            agent.extend_actions(entries);
        }
        let initial = sim.scene.initial_event();
        sim.broadcast(initial, None);
        sim
    }

    pub fn with_suggestions(mut self, config: SuggestionConfig) -> Self {
        self.suggestions = config;
        self
    }

    pub fn set_event_bus(&mut self, bus: EventBus) {
        self.bus = bus;
    }

    pub fn set_clients(&mut self, clients: ClientMap) {
        self.clients = clients;
    }

    pub fn clients(&self) -> &ClientMap {
        &self.clients
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn scene(&self) -> &dyn Scene {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> &mut dyn Scene {
        self.scene.as_mut()
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut [Agent] {
        &mut self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.name == name)
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    // ----- Event plumbing -----

    /// Unified event outlet: the node sink first, then the ordering's tap so
    /// scheduling-aware variants can react.
    fn emit_event(&mut self, event_type: &str, data: serde_json::Value) {
        self.bus.emit(event_type, data.clone());
        self.ordering.on_event(event_type, &data);
    }

    pub fn emit_event_later(&mut self, event_type: impl Into<String>, data: serde_json::Value) {
        self.pending.push_back(PendingItem::Event {
            event_type: event_type.into(),
            data,
        });
    }

    /// Drain the pending queue at a quiescence point.
    pub fn flush_pending(&mut self) {
        while let Some(item) = self.pending.pop_front() {
            match item {
                PendingItem::Event { event_type, data } => self.emit_event(&event_type, data),
                PendingItem::Broadcast { event, receivers } => {
                    let payload = self.deliver(&event, receivers.as_deref());
                    self.emit_event(event_types::SYSTEM_BROADCAST, payload);
                }
            }
        }
    }

    /// Deliver an event into recipient memories now; the timeline
    /// notification is queued like the prototype does, so it surfaces at the
    /// next flush.
    pub fn broadcast(&mut self, event: Event, receivers: Option<Vec<String>>) {
        let payload = self.deliver(&event, receivers.as_deref());
        self.emit_event_later(event_types::SYSTEM_BROADCAST, payload);
    }

    fn deliver(&mut self, event: &Event, receivers: Option<&[String]>) -> serde_json::Value {
        let time = self.scene.state().clock();
        let formatted = event.to_display(Some(&time));
        let mut enriched = formatted;
        for line in event.media.placeholder_lines() {
            enriched.push('\n');
            enriched.push_str(&line);
        }

        let bus = self.bus.clone();
        let mut recipients = Vec::new();
        for agent in &mut self.agents {
            if event.sender.as_deref() == Some(agent.name.as_str()) {
                continue;
            }
            if let Some(receivers) = receivers {
                if !receivers.iter().any(|r| r == &agent.name) {
                    continue;
                }
            }
            agent.add_env_feedback(enriched.clone(), event.media.clone(), &bus);
            recipients.push(agent.name.clone());
        }

        let mut payload = json!({
            "time": time,
            "type": event.kind.as_str(),
            "sender": event.sender,
            "recipients": recipients,
            "text": event.to_display(None),
            "images": event.media.images,
            "audio": event.media.audio,
            "video": event.media.video,
        });
        if let Some(code) = &event.code {
            payload["code"] = json!(code);
        }
        if let Some(params) = &event.params {
            payload["params"] = params.clone();
        }
        payload
    }

    fn emit_error(&mut self, error: &Error, agent: Option<&str>, step: Option<u32>) {
        let mut detail = error.to_string();
        let mut source = std::error::Error::source(error);
        while let Some(inner) = source {
            detail.push_str("\ncaused by: ");
            detail.push_str(&inner.to_string());
            source = std::error::Error::source(inner);
        }
        if detail.len() > 4000 {
            let mut cut = 4000;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
            detail.push_str("...(truncated)");
        }
        let data = json!({
            "error": error.to_string(),
            "error_type": error.kind(),
            "traceback": detail,
            "agent": agent,
            "step": step,
            "turn": self.turns,
            "scene_type": self.scene.scene_type(),
            "ordering": self.ordering.name(),
        });
        self.emit_event(event_types::ERROR, data);
    }

    // ----- The turn engine -----

    pub async fn run(&mut self, max_turns: u64) {
        debug!(max_turns, scene = self.scene.scene_type(), "running simulation");
        for _ in 0..max_turns {
            if self.scene.is_complete() {
                debug!(turns = self.turns, "scene complete, simulation ends");
                break;
            }

            let names = self.agent_names();
            let Some(actor) = self.ordering.next_actor(&names, self.scene.as_ref()) else {
                continue;
            };
            let Some(idx) = self.agents.iter().position(|a| a.name == actor) else {
                continue;
            };

            if self.scene.should_skip_turn(&self.agents[idx]) {
                debug!(agent = %actor, "turn skipped by scene rule");
                self.finish_turn(idx, &actor);
                continue;
            }

            if let Some(status) = self.scene.agent_status_prompt(&self.agents[idx]) {
                let time = self.scene.state().clock();
                let text = Event::status(status).to_display(Some(&time));
                let bus = self.bus.clone();
                self.agents[idx].add_env_feedback(text, Media::default(), &bus);
            }

            let mut steps: u32 = 0;
            let mut continue_turn = true;
            self.flush_pending();

            while continue_turn && steps < self.engine.max_steps_per_turn {
                self.emit_event(
                    event_types::AGENT_PROCESS_START,
                    json!({"agent": actor, "step": steps + 1}),
                );
                let brief = self.scene.brief();
                let bus = self.bus.clone();
                let actions = self.agents[idx]
                    .process(&self.clients, false, &brief, &bus)
                    .await;
                self.emit_event(
                    event_types::AGENT_PROCESS_END,
                    json!({"agent": actor, "step": steps + 1, "actions": actions}),
                );
                if actions.is_empty() {
                    break;
                }

                let mut yielded = false;
                let mut aborted = false;
                for action in &actions {
                    self.emit_event(
                        event_types::ACTION_START,
                        json!({"agent": actor, "action": action}),
                    );
                    let outcome = {
                        let Simulator {
                            scene,
                            agents,
                            pending,
                            bus,
                            clients,
                            turns,
                            ..
                        } = self;
                        let mut ctx = TurnCtx {
                            names: names.clone(),
                            bus: &*bus,
                            pending,
                            clients: &*clients,
                            turns: *turns,
                        };
                        scene.parse_and_handle_action(action, &mut agents[idx], &mut ctx)
                    };
                    match outcome {
                        Ok(outcome) => {
                            self.emit_event(
                                event_types::ACTION_END,
                                json!({
                                    "agent": actor,
                                    "action": action,
                                    "success": outcome.success,
                                    "result": outcome.result,
                                    "summary": outcome.summary,
                                    "meta": outcome.meta,
                                    "pass_control": outcome.pass_control,
                                }),
                            );
                            self.flush_pending();
                            if outcome.pass_control {
                                yielded = true;
                                break;
                            }
                        }
                        Err(e) => {
                            self.emit_error(&e, Some(&actor), Some(steps + 1));
                            aborted = true;
                            break;
                        }
                    }
                }
                if aborted {
                    break;
                }
                steps += 1;
                if yielded {
                    continue_turn = false;
                }
            }

            self.finish_turn(idx, &actor);
        }
    }

    /// Post-turn hooks shared by the normal and skip paths. Scene failures
    /// here surface as error events, same as mid-step failures.
    fn finish_turn(&mut self, idx: usize, actor: &str) {
        let names = self.agent_names();
        let result = {
            let Simulator {
                scene,
                agents,
                pending,
                bus,
                clients,
                turns,
                ..
            } = self;
            let mut ctx = TurnCtx {
                names,
                bus: &*bus,
                pending,
                clients: &*clients,
                turns: *turns,
            };
            scene.post_turn(&mut agents[idx], &mut ctx)
        };
        if let Err(e) = result {
            self.emit_error(&e, Some(actor), None);
        }
        self.flush_pending();
        self.ordering.post_turn(actor);
        self.turns += 1;
    }

    // ----- Environment suggestions -----

    /// Suggestions open at each turn interval and stay available until the
    /// operator dismisses them for that interval.
    pub fn suggestions_available(&self) -> bool {
        if !self.suggestions.enabled || self.turns == 0 {
            return false;
        }
        let interval = u64::from(self.suggestions.turn_interval.max(1));
        let current = (self.turns / interval) * interval;
        if self.suggestions_viewed_turn == Some(current) {
            return false;
        }
        self.turns >= interval
    }

    pub fn dismiss_suggestions(&mut self) {
        let interval = u64::from(self.suggestions.turn_interval.max(1));
        self.suggestions_viewed_turn = Some((self.turns / interval) * interval);
    }

    // ----- Snapshots -----

    /// Deep-independent copy for a new branch. The pending queue is reset and
    /// the event bus detached; the tree re-attaches one per node.
    pub fn clone_for_branch(&self) -> Simulator {
        Simulator {
            agents: self.agents.clone(),
            scene: self.scene.clone(),
            ordering: self.ordering.clone(),
            clients: self.clients.clone(),
            bus: EventBus::null(),
            pending: VecDeque::new(),
            turns: self.turns,
            engine: self.engine.clone(),
            suggestions: self.suggestions.clone(),
            suggestions_viewed_turn: self.suggestions_viewed_turn,
        }
    }

    pub fn serialize(&self) -> serde_json::Value {
        json!({
            "agents": self.agents.iter().map(|a| a.serialize()).collect::<Vec<_>>(),
            "scene": self.scene.serialize(),
            "ordering": self.ordering.name(),
            "ordering_state": self.ordering.serialize_state(),
            "pending": self.pending,
            "turns": self.turns,
            "engine": self.engine,
            "suggestions": self.suggestions,
            "suggestions_viewed_turn": self.suggestions_viewed_turn,
        })
    }

    /// Rebuild from a snapshot. Clients are injected, never persisted; the
    /// scene is reconstructed by its `type` through the registry.
    pub fn deserialize(
        value: &serde_json::Value,
        clients: ClientMap,
        registry: &SceneRegistry,
    ) -> Result<Simulator> {
        let scene = registry.restore(
            value
                .get("scene")
                .ok_or_else(|| Error::snapshot_error("simulator snapshot missing scene"))?,
        )?;
        let agents = value
            .get("agents")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::snapshot_error("simulator snapshot missing agents"))?
            .iter()
            .map(|a| Agent::deserialize(a.clone()))
            .collect::<Result<Vec<_>>>()?;
        let ordering_name = value
            .get("ordering")
            .and_then(|v| v.as_str())
            .unwrap_or("sequential");
        let ordering_state = value
            .get("ordering_state")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let ordering = ordering_from(ordering_name, &ordering_state)?;
        let pending: VecDeque<PendingItem> = value
            .get("pending")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();
        let engine: EngineConfig = value
            .get("engine")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();
        let suggestions: SuggestionConfig = value
            .get("suggestions")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();

        Ok(Simulator {
            agents,
            scene,
            ordering,
            clients,
            bus: EventBus::null(),
            pending,
            turns: value.get("turns").and_then(|v| v.as_u64()).unwrap_or(0),
            engine,
            suggestions,
            suggestions_viewed_turn: value
                .get("suggestions_viewed_turn")
                .and_then(|v| v.as_u64()),
        })
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("agents", &self.agent_names())
            .field("scene", &self.scene.scene_type())
            .field("ordering", &self.ordering.name())
            .field("turns", &self.turns)
            .finish()
    }
}
