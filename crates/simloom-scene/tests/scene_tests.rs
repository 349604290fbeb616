//! Tests for simloom-scene: council mechanics, registry, serialization

use simloom_agent::{ActionData, Agent};
use simloom_core::protocol::EventBus;
use simloom_llm::ClientMap;
use simloom_scene::{
    default_registry, CouncilScene, PendingItem, Scene, SceneRegistry, TurnCtx,
};
use std::collections::VecDeque;

fn councillor(name: &str, scene: &dyn Scene) -> Agent {
    let mut agent = Agent::new(name);
    scene.initialize_agent(&mut agent);
    agent.extend_actions(scene.scene_actions(&agent));
    agent.extend_actions(
        simloom_scene::default_catalog()
            .entries_for(&["start_voting", "vote", "finish_meeting", "request_brief"]),
    );
    agent
}

fn run_action(
    scene: &mut dyn Scene,
    agent: &mut Agent,
    action: ActionData,
    pending: &mut VecDeque<PendingItem>,
    names: Vec<String>,
) -> simloom_scene::ActionOutcome {
    let bus = EventBus::null();
    let clients = ClientMap::new();
    let mut ctx = TurnCtx {
        names,
        bus: &bus,
        pending,
        clients: &clients,
        turns: 0,
    };
    scene.parse_and_handle_action(&action, agent, &mut ctx).unwrap()
}

// ===========================================================================
// Council voting flow
// ===========================================================================

#[test]
fn council_voting_round_trip() {
    let mut scene = CouncilScene::new("chamber", "Session open.", "Tax the harbor.");
    let names = vec!["Alice".to_string(), "Bob".to_string()];
    let mut alice = councillor("Alice", &scene);
    let mut bob = councillor("Bob", &scene);
    let mut pending = VecDeque::new();

    // Voting is not open yet: a vote is rejected by the state guard.
    let premature = run_action(
        &mut scene,
        &mut alice,
        ActionData::new("vote").with_param("candidate", "aye"),
        &mut pending,
        names.clone(),
    );
    assert!(!premature.success);
    assert_eq!(premature.result["error"], "No voting round is open.");

    let opened = run_action(
        &mut scene,
        &mut alice,
        ActionData::new("start_voting"),
        &mut pending,
        names.clone(),
    );
    assert!(opened.success);

    // Status prompt nudges agents who have not voted.
    assert!(scene.agent_status_prompt(&bob).is_some());

    let vote = run_action(
        &mut scene,
        &mut bob,
        ActionData::new("vote").with_param("candidate", "aye"),
        &mut pending,
        names.clone(),
    );
    assert!(vote.success);
    assert!(vote.pass_control, "voting yields the turn");
    assert!(scene.agent_status_prompt(&bob).is_none());

    let finished = run_action(
        &mut scene,
        &mut alice,
        ActionData::new("finish_meeting"),
        &mut pending,
        names.clone(),
    );
    assert!(finished.success);
    assert_eq!(finished.result["tally"]["aye"], 1);
    assert!(scene.is_complete());

    // Completed meetings reject further rounds.
    let reopened = run_action(
        &mut scene,
        &mut alice,
        ActionData::new("start_voting"),
        &mut pending,
        names,
    );
    assert!(!reopened.success);
}

#[test]
fn council_broadcasts_are_deferred_to_pending() {
    let mut scene = CouncilScene::new("chamber", "Session open.", "Draft.");
    let mut alice = councillor("Alice", &scene);
    let mut pending = VecDeque::new();
    run_action(
        &mut scene,
        &mut alice,
        ActionData::new("start_voting"),
        &mut pending,
        vec!["Alice".to_string()],
    );
    assert_eq!(pending.len(), 1);
    match pending.pop_front().unwrap() {
        PendingItem::Broadcast { event, receivers } => {
            assert!(event.content.contains("opened voting"));
            assert!(receivers.is_none());
        }
        other => panic!("expected a broadcast, got {other:?}"),
    }
}

#[test]
fn request_brief_feeds_draft_back_to_actor_only() {
    let mut scene = CouncilScene::new("chamber", "Session open.", "Tax the harbor.");
    let mut alice = councillor("Alice", &scene);
    let mut pending = VecDeque::new();
    let outcome = run_action(
        &mut scene,
        &mut alice,
        ActionData::new("request_brief"),
        &mut pending,
        vec!["Alice".to_string()],
    );
    assert!(outcome.success);
    assert!(pending.is_empty());
    let last = alice.short_memory.last().unwrap();
    assert!(last.content.contains("Tax the harbor."));
}

// ===========================================================================
// Registry and serialization
// ===========================================================================

#[test]
fn registry_builds_and_restores_scenes() {
    let registry = default_registry();
    let scene = registry
        .build(
            "council",
            "budget session",
            &serde_json::json!({"draft_text": "Motion 7", "initial_event": "Order!"}),
        )
        .unwrap();
    assert_eq!(scene.scene_type(), "council");
    assert_eq!(scene.name(), "budget session");

    let snapshot = scene.serialize();
    let restored = registry.restore(&snapshot).unwrap();
    assert_eq!(restored.serialize(), snapshot);
}

#[test]
fn registry_rejects_unknown_scene_type() {
    let registry = SceneRegistry::with_builtins();
    assert!(registry.build("poker_night", "x", &serde_json::json!({})).is_err());
    assert!(registry
        .restore(&serde_json::json!({"type": "poker_night"}))
        .is_err());
}

#[test]
fn scene_clone_is_deep() {
    let mut scene = CouncilScene::new("chamber", "hi", "Draft.");
    let copied = scene.clone_box();
    scene.state_mut().set("voting_open", serde_json::json!(true));
    scene.state_mut().complete = true;

    assert!(!copied.state().get_bool("voting_open"));
    assert!(!copied.is_complete());
}

#[test]
fn basic_and_allowed_action_names_resolve_in_catalog() {
    let registry = default_registry();
    let catalog = simloom_scene::default_catalog();
    for scene_type in registry.scene_types() {
        let spec = registry.get(scene_type).unwrap();
        for name in spec.basic_actions.iter().chain(spec.allowed_actions) {
            assert!(catalog.contains(name), "{scene_type}: missing action {name}");
        }
    }
}
