//! Tests for the turn engine: scheduling, step bounds, failure policy

use serde_json::json;
use simloom_agent::{ActionData, Agent, KnowledgeItem, SceneBrief};
use simloom_core::config::{EngineConfig, SuggestionConfig};
use simloom_core::event::Event;
use simloom_core::protocol::{event_types, EventBus, SimEvent};
use simloom_engine::{SimTree, Simulator};
use simloom_llm::mock::canned_reply;
use simloom_llm::{ClientMap, MockChatClient};
use simloom_scene::{
    default_registry, ActionOutcome, Scene, SceneState, SequentialOrdering, TurnCtx,
};
use std::sync::{Arc, Mutex};

fn clients_replying(reply: String) -> ClientMap {
    ClientMap::new().with_chat("chat", Arc::new(MockChatClient::constant(reply)))
}

fn chat_sim(clients: ClientMap, engine: EngineConfig) -> Simulator {
    let scene = default_registry()
        .build("simple_chat", "room", &json!({"initial_event": "Welcome."}))
        .unwrap();
    Simulator::new(
        vec![Agent::new("Alice"), Agent::new("Bob")],
        scene,
        clients,
        Box::new(SequentialOrdering::new()),
        engine,
    )
}

fn capture(sim: &mut Simulator) -> Arc<Mutex<Vec<SimEvent>>> {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    sim.set_event_bus(EventBus::capturing(buffer.clone()));
    buffer
}

fn count(buffer: &Arc<Mutex<Vec<SimEvent>>>, event_type: &str) -> usize {
    buffer
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

// ===========================================================================
// Scheduling and events
// ===========================================================================

#[tokio::test]
async fn one_turn_emits_the_expected_event_sequence() {
    let mut sim = chat_sim(
        clients_replying(canned_reply("send_message", &[("message", "hi all")])),
        EngineConfig::default(),
    );
    let buffer = capture(&mut sim);

    sim.run(1).await;

    assert_eq!(sim.turns(), 1);
    let events = buffer.lock().unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    // initial broadcast flushes first, then the step loop runs
    let first_broadcast = types
        .iter()
        .position(|t| *t == event_types::SYSTEM_BROADCAST)
        .unwrap();
    let first_process = types
        .iter()
        .position(|t| *t == event_types::AGENT_PROCESS_START)
        .unwrap();
    assert!(first_broadcast < first_process);
    assert!(types.contains(&event_types::ACTION_START));
    assert!(types.contains(&event_types::ACTION_END));

    let action_end = events
        .iter()
        .find(|e| e.event_type == event_types::ACTION_END)
        .unwrap();
    assert_eq!(action_end.data["agent"], "Alice");
    assert_eq!(action_end.data["success"], true);
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let mut sim = chat_sim(
        clients_replying(canned_reply("send_message", &[("message", "hi all")])),
        EngineConfig::default(),
    );
    capture(&mut sim);

    sim.run(1).await; // Alice speaks

    let bob = sim.agent("Bob").unwrap();
    assert!(bob
        .short_memory
        .iter()
        .any(|e| e.content.contains("Alice: hi all")));
    let alice = sim.agent("Alice").unwrap();
    assert!(!alice
        .short_memory
        .iter()
        .any(|e| e.content.contains("Alice: hi all")));
}

#[tokio::test]
async fn sequential_ordering_alternates_actors() {
    let mut sim = chat_sim(
        clients_replying(canned_reply("send_message", &[("message", "turn talk")])),
        EngineConfig::default(),
    );
    let buffer = capture(&mut sim);

    sim.run(2).await;

    let actors: Vec<String> = buffer
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_types::AGENT_PROCESS_START)
        .map(|e| e.data["agent"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(actors.first().map(String::as_str), Some("Alice"));
    assert!(actors.contains(&"Bob".to_string()));
}

#[tokio::test]
async fn step_loop_is_bounded_by_max_steps_per_turn() {
    // query_knowledge feeds results back into memory, so the agent keeps
    // perceiving new input and the step loop only stops at the bound.
    let clients = clients_replying(canned_reply("query_knowledge", &[("query", "harvest")]));
    let mut engine = EngineConfig::default();
    engine.max_steps_per_turn = 3;

    let scene = default_registry()
        .build("simple_chat", "room", &json!({}))
        .unwrap();
    let mut agent = Agent::new("Alice");
    agent.knowledge_base.push(KnowledgeItem {
        id: "k1".into(),
        title: "Harvest".into(),
        content: "The harvest is in autumn.".into(),
        enabled: true,
        extra: Default::default(),
    });
    agent.extend_actions(
        simloom_scene::default_catalog().entries_for(&["query_knowledge"]),
    );
    let mut sim = Simulator::new(
        vec![agent],
        scene,
        clients,
        Box::new(SequentialOrdering::new()),
        engine,
    );
    let buffer = capture(&mut sim);

    sim.run(1).await;

    assert_eq!(count(&buffer, event_types::AGENT_PROCESS_START), 3);
}

#[tokio::test]
async fn yield_ends_the_turn_immediately() {
    let mut sim = chat_sim(clients_replying(canned_reply("yield", &[])), EngineConfig::default());
    let buffer = capture(&mut sim);

    sim.run(1).await;

    assert_eq!(count(&buffer, event_types::AGENT_PROCESS_START), 1);
    let action_end = buffer
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.event_type == event_types::ACTION_END)
        .unwrap()
        .clone();
    assert_eq!(action_end.data["pass_control"], true);
}

// ===========================================================================
// Failure policy
// ===========================================================================

/// A scene whose rule engine always fails; used to prove `run` survives.
#[derive(Clone, Debug)]
struct FaultyScene {
    state: SceneState,
}

impl Scene for FaultyScene {
    fn scene_type(&self) -> &'static str {
        "faulty"
    }
    fn name(&self) -> &str {
        "faulty"
    }
    fn state(&self) -> &SceneState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut SceneState {
        &mut self.state
    }
    fn initial_event(&self) -> Event {
        Event::public("Entering the faulty room.")
    }
    fn brief(&self) -> SceneBrief {
        SceneBrief::default()
    }
    fn scene_actions(&self, _agent: &Agent) -> Vec<simloom_agent::ActionEntry> {
        simloom_scene::default_catalog().entries_for(&["send_message", "yield"])
    }
    fn parse_and_handle_action(
        &mut self,
        _action: &ActionData,
        _agent: &mut Agent,
        _ctx: &mut TurnCtx<'_>,
    ) -> simloom_core::Result<ActionOutcome> {
        Err(simloom_core::Error::scene_error(
            "faulty",
            "the rule table is on fire",
        ))
    }
    fn post_turn(&mut self, _agent: &mut Agent, _ctx: &mut TurnCtx<'_>) -> simloom_core::Result<()> {
        Ok(())
    }
    fn serialize(&self) -> serde_json::Value {
        json!({"type": "faulty", "state": self.state})
    }
    fn clone_box(&self) -> Box<dyn Scene> {
        Box::new(self.clone())
    }
}

#[tokio::test]
async fn scene_errors_become_events_and_end_the_turn() {
    let mut sim = Simulator::new(
        vec![Agent::new("Alice")],
        Box::new(FaultyScene {
            state: SceneState::default(),
        }),
        clients_replying(canned_reply("send_message", &[("message", "hi")])),
        Box::new(SequentialOrdering::new()),
        EngineConfig::default(),
    );
    let buffer = capture(&mut sim);

    sim.run(2).await; // must not panic or abort

    // turn 1 hits the rule engine and fails; turn 2 sees nothing new and
    // yields no actions, so exactly one error surfaces
    assert_eq!(sim.turns(), 2);
    assert_eq!(count(&buffer, event_types::ERROR), 1);
    let error = buffer
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.event_type == event_types::ERROR)
        .unwrap()
        .clone();
    assert_eq!(error.data["error_type"], "scene_error");
    assert_eq!(error.data["agent"], "Alice");
    assert_eq!(error.data["step"], 1);
    assert_eq!(error.data["scene_type"], "faulty");
    assert_eq!(error.data["ordering"], "sequential");
}

#[tokio::test]
async fn run_survives_a_disabled_client_map() {
    let mut sim = chat_sim(ClientMap::disabled(), EngineConfig::default());
    let buffer = capture(&mut sim);

    sim.run(4).await;

    // every step failed, agents latched offline, but turns still advanced
    assert_eq!(sim.turns(), 4);
    assert!(sim.agents().iter().all(|a| a.is_offline));
    let offline_events = buffer
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_types::AGENT_ERROR && e.data["kind"] == "offline")
        .count();
    assert_eq!(offline_events, 2);
}

#[tokio::test]
async fn offline_latch_survives_tree_resume() {
    let scene = default_registry()
        .build("simple_chat", "room", &json!({}))
        .unwrap();
    let mut agent = Agent::new("Alice");
    agent.max_consecutive_llm_errors = 1;
    let failing = ClientMap::new().with_chat(
        "chat",
        Arc::new(MockChatClient::always_failing("provider down")),
    );
    let sim = Simulator::new(
        vec![agent],
        scene,
        failing.clone(),
        Box::new(SequentialOrdering::new()),
        EngineConfig::default(),
    );
    let tree = SimTree::new(sim, EngineConfig::default());

    tree.run_node(0, 1).await.unwrap();
    let offline_before = tree
        .logs(0)
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_types::AGENT_ERROR && e.data["kind"] == "offline")
        .count();
    assert_eq!(offline_before, 1);

    let snapshot = tree.serialize().await;
    let restored = SimTree::deserialize(
        &snapshot,
        failing,
        default_registry(),
        EngineConfig::default(),
    )
    .unwrap();
    restored.run_node(0, 2).await.unwrap();

    // still offline: no further attempts, no second offline event
    let offline_after = restored
        .logs(0)
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_types::AGENT_ERROR && e.data["kind"] == "offline")
        .count();
    assert_eq!(offline_after, 1);
    let sim = restored.sim(0).unwrap();
    let sim = sim.lock().await;
    assert!(sim.agent("Alice").unwrap().is_offline);
    assert_eq!(sim.turns(), 3);
}

// ===========================================================================
// Suggestions
// ===========================================================================

#[tokio::test]
async fn suggestion_windows_follow_turn_intervals() {
    let mut sim = chat_sim(clients_replying(canned_reply("yield", &[])), EngineConfig::default())
        .with_suggestions(SuggestionConfig {
            enabled: true,
            turn_interval: 2,
        });
    capture(&mut sim);

    assert!(!sim.suggestions_available());
    sim.run(2).await;
    assert!(sim.suggestions_available());

    sim.dismiss_suggestions();
    assert!(!sim.suggestions_available());

    sim.run(2).await;
    assert!(sim.suggestions_available());
}
