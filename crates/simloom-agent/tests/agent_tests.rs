//! Tests for simloom-agent: process loop, retry/offline latch, serialization

use simloom_agent::{ActionEntry, Agent, SceneBrief};
use simloom_core::event::Media;
use simloom_core::protocol::{event_types, EventBus, SimEvent};
use simloom_llm::mock::canned_reply;
use simloom_llm::{ClientMap, MockChatClient, MockReply};
use std::sync::{Arc, Mutex};

fn capture() -> (EventBus, Arc<Mutex<Vec<SimEvent>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    (EventBus::capturing(buffer.clone()), buffer)
}

fn clients_with(mock: MockChatClient) -> ClientMap {
    ClientMap::new().with_chat("chat", Arc::new(mock))
}

fn chatty_agent(name: &str) -> Agent {
    let mut agent = Agent::new(name).with_profile("a test participant");
    agent.extend_actions([ActionEntry {
        name: "send_message".into(),
        description: "say something".into(),
        instruction: String::new(),
    }]);
    agent
}

fn count_events(buffer: &Arc<Mutex<Vec<SimEvent>>>, event_type: &str) -> usize {
    buffer
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

// ===========================================================================
// Process - happy path
// ===========================================================================

#[tokio::test]
async fn process_returns_parsed_action_and_appends_memory() {
    let clients = clients_with(MockChatClient::constant(canned_reply(
        "send_message",
        &[("message", "hello there")],
    )));
    let (bus, buffer) = capture();
    let mut agent = chatty_agent("Alice");
    agent.add_env_feedback("Bob: hi", Media::default(), &bus);

    let actions = agent
        .process(&clients, false, &SceneBrief::default(), &bus)
        .await;

    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].name, "send_message");
    assert_eq!(actions[0].param("message"), Some("hello there"));
    // feedback + assistant reply
    assert_eq!(agent.short_memory.len(), 2);
    assert_eq!(agent.last_history_length, 2);
    assert_eq!(count_events(&buffer, event_types::AGENT_CTX_DELTA), 2);
}

#[tokio::test]
async fn process_short_circuits_when_nothing_new() {
    let mock = MockChatClient::constant(canned_reply("yield", &[]));
    let (bus, _) = capture();
    let mut agent = chatty_agent("Alice");
    agent.add_env_feedback("Bob: hi", Media::default(), &bus);

    let clients = clients_with(mock);
    let first = agent
        .process(&clients, false, &SceneBrief::default(), &bus)
        .await;
    assert_eq!(first.len(), 1);

    // No new memory since the last call, no initiative: no LLM round-trip.
    let second = agent
        .process(&clients, false, &SceneBrief::default(), &bus)
        .await;
    assert!(second.is_empty());
}

#[tokio::test]
async fn initiative_adds_continuation_hint_and_overrides_gate() {
    let mock = MockChatClient::constant(canned_reply("yield", &[]));
    let (bus, _) = capture();
    let mut agent = chatty_agent("Alice");

    let clients = clients_with(mock);
    let actions = agent
        .process(&clients, true, &SceneBrief::default(), &bus)
        .await;
    assert_eq!(actions.len(), 1);
    // hint + assistant reply
    let contents: Vec<_> = agent.short_memory.iter().map(|e| e.content.clone()).collect();
    assert_eq!(contents[0], "Continue.");
    assert_eq!(contents.len(), 2);
}

// ===========================================================================
// Retry and offline latch
// ===========================================================================

#[tokio::test]
async fn retry_after_failure_resets_error_counter() {
    let mock = MockChatClient::sequence(vec![
        MockReply::Fail("connection reset".into()),
        MockReply::Text(canned_reply("yield", &[])),
    ]);
    let (bus, buffer) = capture();
    let mut agent = chatty_agent("Alice");
    agent.max_repeat = 2;
    agent.add_env_feedback("Bob: hi", Media::default(), &bus);

    let actions = agent
        .process(&clients_with(mock), false, &SceneBrief::default(), &bus)
        .await;

    assert_eq!(actions.len(), 1);
    assert_eq!(agent.consecutive_llm_errors, 0);
    assert!(!agent.is_offline);
    assert_eq!(count_events(&buffer, event_types::AGENT_ERROR), 1);
}

#[tokio::test]
async fn parse_failures_are_retried_and_surface_as_agent_errors() {
    let mock = MockChatClient::sequence(vec![
        MockReply::Text("complete gibberish".into()),
        MockReply::Text(canned_reply("yield", &[])),
    ]);
    let (bus, buffer) = capture();
    let mut agent = chatty_agent("Alice");
    agent.add_env_feedback("Bob: hi", Media::default(), &bus);

    let actions = agent
        .process(&clients_with(mock), false, &SceneBrief::default(), &bus)
        .await;

    assert_eq!(actions.len(), 1);
    let events = buffer.lock().unwrap();
    let parse_errors: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == event_types::AGENT_ERROR)
        .collect();
    assert_eq!(parse_errors.len(), 1);
    assert_eq!(parse_errors[0].data["kind"], "parse");
}

#[tokio::test]
async fn exhausted_retries_return_no_actions() {
    let mock = MockChatClient::always_failing("no route to host");
    let (bus, buffer) = capture();
    let mut agent = chatty_agent("Alice");
    agent.max_repeat = 1;
    agent.max_consecutive_llm_errors = 10;
    agent.add_env_feedback("Bob: hi", Media::default(), &bus);

    let actions = agent
        .process(&clients_with(mock), false, &SceneBrief::default(), &bus)
        .await;

    assert!(actions.is_empty());
    assert_eq!(agent.consecutive_llm_errors, 2); // max_repeat + 1 attempts
    assert!(!agent.is_offline);
    assert_eq!(count_events(&buffer, event_types::AGENT_ERROR), 2);
}

#[tokio::test]
async fn offline_latch_trips_once_and_sticks() {
    let (bus, buffer) = capture();
    let mut agent = chatty_agent("Alice");
    agent.max_consecutive_llm_errors = 1;
    agent.add_env_feedback("Bob: hi", Media::default(), &bus);

    let clients = clients_with(MockChatClient::always_failing("boom"));
    let actions = agent
        .process(&clients, false, &SceneBrief::default(), &bus)
        .await;
    assert!(actions.is_empty());
    assert!(agent.is_offline);

    let events = buffer.lock().unwrap();
    let offline: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == event_types::AGENT_ERROR && e.data["kind"] == "offline")
        .collect();
    assert_eq!(offline.len(), 1);
    // the bus derives a warning system_log from the offline error
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == event_types::SYSTEM_LOG)
            .count(),
        1
    );
    drop(events);

    // Latched: later steps never call the client again.
    let before = buffer.lock().unwrap().len();
    agent.add_env_feedback("Bob: anyone there?", Media::default(), &bus);
    let again = agent
        .process(&clients, true, &SceneBrief::default(), &bus)
        .await;
    assert!(again.is_empty());
    // only the ctx delta from add_env_feedback was emitted
    assert_eq!(buffer.lock().unwrap().len(), before + 1);
}

// ===========================================================================
// Plan and emotion updates
// ===========================================================================

#[tokio::test]
async fn plan_update_replaces_plan_and_emits_event() {
    let reply = format!(
        "{}\n--- Plan Update ---\nGoals:\n1. [CURRENT] win the debate\nMilestones:\n1. opening done\nStrategy: stay factual\nNotes:\n",
        canned_reply("yield", &[])
    );
    let (bus, buffer) = capture();
    let mut agent = chatty_agent("Alice");
    agent.add_env_feedback("moderator: begin", Media::default(), &bus);

    agent
        .process(
            &clients_with(MockChatClient::constant(reply)),
            false,
            &SceneBrief::default(),
            &bus,
        )
        .await;

    assert_eq!(agent.plan_state.goals.len(), 1);
    assert!(agent.plan_state.goals[0].current);
    assert_eq!(agent.plan_state.strategy, "stay factual");
    assert_eq!(count_events(&buffer, event_types::PLAN_UPDATE), 1);
}

#[tokio::test]
async fn emotion_update_only_when_enabled() {
    let reply = format!(
        "{}\n--- Emotion Update ---\n<Emotion>Joy</Emotion>\n",
        canned_reply("yield", &[])
    );
    let (bus, buffer) = capture();

    let mut stoic = chatty_agent("Stoic");
    stoic.add_env_feedback("hello", Media::default(), &bus);
    stoic
        .process(
            &clients_with(MockChatClient::constant(reply.clone())),
            false,
            &SceneBrief::default(),
            &bus,
        )
        .await;
    assert_eq!(stoic.emotion, "neutral");
    assert_eq!(count_events(&buffer, event_types::EMOTION_UPDATE), 0);

    let mut feeling = chatty_agent("Feeling");
    feeling.emotion_enabled = true;
    feeling.add_env_feedback("hello", Media::default(), &bus);
    feeling
        .process(
            &clients_with(MockChatClient::constant(reply)),
            false,
            &SceneBrief::default(),
            &bus,
        )
        .await;
    assert_eq!(feeling.emotion, "Joy");
    assert_eq!(count_events(&buffer, event_types::EMOTION_UPDATE), 1);
}

// ===========================================================================
// Serialization
// ===========================================================================

#[tokio::test]
async fn serialization_round_trips_state_and_latch() {
    let (bus, _) = capture();
    let mut agent = chatty_agent("Alice");
    agent.max_consecutive_llm_errors = 1;
    agent.emotion_enabled = true;
    agent.add_env_feedback("Bob: hi", Media::default(), &bus);
    agent
        .process(
            &clients_with(MockChatClient::always_failing("down")),
            false,
            &SceneBrief::default(),
            &bus,
        )
        .await;
    assert!(agent.is_offline);

    let value = agent.serialize();
    let restored = Agent::deserialize(value).unwrap();

    assert_eq!(restored.name, "Alice");
    assert!(restored.is_offline);
    assert_eq!(restored.short_memory.len(), agent.short_memory.len());
    assert_eq!(restored.action_space, agent.action_space);
    assert!(restored.global_knowledge.is_none());

    // The latch survives the round-trip: no new actions, no new attempts.
    let mut restored = restored;
    let mock = MockChatClient::always_failing("still down");
    let actions = restored
        .process(&clients_with(mock), true, &SceneBrief::default(), &bus)
        .await;
    assert!(actions.is_empty());
}

#[tokio::test]
async fn summarize_history_collapses_memory_into_one_entry() {
    let (bus, _) = capture();
    let mut agent = chatty_agent("Alice");
    agent.add_env_feedback("Bob: the harvest is late", Media::default(), &bus);
    agent.add_env_feedback("Cara: prices are rising", Media::default(), &bus);

    let clients = clients_with(MockChatClient::constant(
        "Summary: harvest delays are driving prices up".to_string(),
    ));
    agent.summarize_history(&clients).await.unwrap();

    assert_eq!(agent.short_memory.len(), 1);
    let entry = agent.short_memory.last().unwrap();
    assert_eq!(
        entry.content,
        "Summary: harvest delays are driving prices up"
    );
    assert_eq!(agent.last_history_length, 1);
}

#[test]
fn system_prompt_mentions_catalog_and_empty_plan() {
    let agent = chatty_agent("Alice");
    let prompt = agent.system_prompt(&SceneBrief {
        description: "A quiet chat room.".into(),
        guidelines: "Be civil.".into(),
        examples: String::new(),
    });
    assert!(prompt.contains("- send_message: say something"));
    assert!(prompt.contains("Plan State is empty"));
    assert!(prompt.contains("A quiet chat room."));
    assert!(prompt.contains("--- Action ---"));
}
