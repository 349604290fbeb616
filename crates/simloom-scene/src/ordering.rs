//! Ordering strategies - who moves next
//!
//! An ordering is a pluggable iterator over agent names with a `post_turn`
//! hook and an event tap for scheduling-aware variants. Orderings hold only
//! primitive state and serialize as `{name, state}`.

use crate::scene::Scene;
use simloom_core::{Error, Result};

pub trait Ordering: Send {
    /// Serialization discriminator.
    fn name(&self) -> &'static str;

    /// Pick the next actor. `None` skips this scheduling slot.
    fn next_actor(&mut self, names: &[String], scene: &dyn Scene) -> Option<String>;

    fn post_turn(&mut self, _name: &str) {}

    /// Orderings may react to events to reschedule.
    fn on_event(&mut self, _event_type: &str, _data: &serde_json::Value) {}

    fn serialize_state(&self) -> serde_json::Value;

    fn restore_state(&mut self, _state: &serde_json::Value) {}

    fn clone_box(&self) -> Box<dyn Ordering>;
}

impl Clone for Box<dyn Ordering> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Fixed order over the current agent set, wrapping forever.
#[derive(Clone, Debug, Default)]
pub struct SequentialOrdering {
    index: usize,
}

impl SequentialOrdering {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ordering for SequentialOrdering {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn next_actor(&mut self, names: &[String], _scene: &dyn Scene) -> Option<String> {
        if names.is_empty() {
            return None;
        }
        let picked = names[self.index % names.len()].clone();
        self.index = (self.index + 1) % names.len();
        Some(picked)
    }

    fn serialize_state(&self) -> serde_json::Value {
        serde_json::json!({"index": self.index})
    }

    fn restore_state(&mut self, state: &serde_json::Value) {
        if let Some(index) = state.get("index").and_then(|v| v.as_u64()) {
            self.index = index as usize;
        }
    }

    fn clone_box(&self) -> Box<dyn Ordering> {
        Box::new(self.clone())
    }
}

/// Explicit schedule, advanced one slot per turn. Names absent from the
/// agent set are skipped by the turn engine, not by the schedule.
#[derive(Clone, Debug, Default)]
pub struct CycledOrdering {
    schedule: Vec<String>,
    index: usize,
}

impl CycledOrdering {
    pub fn new(schedule: Vec<String>) -> Self {
        Self { schedule, index: 0 }
    }
}

impl Ordering for CycledOrdering {
    fn name(&self) -> &'static str {
        "cycled"
    }

    fn next_actor(&mut self, _names: &[String], _scene: &dyn Scene) -> Option<String> {
        if self.schedule.is_empty() {
            return None;
        }
        let picked = self.schedule[self.index % self.schedule.len()].clone();
        self.index = (self.index + 1) % self.schedule.len();
        Some(picked)
    }

    fn serialize_state(&self) -> serde_json::Value {
        serde_json::json!({"names": self.schedule, "index": self.index})
    }

    fn restore_state(&mut self, state: &serde_json::Value) {
        if let Some(names) = state.get("names").and_then(|v| v.as_array()) {
            self.schedule = names
                .iter()
                .filter_map(|n| n.as_str().map(String::from))
                .collect();
        }
        if let Some(index) = state.get("index").and_then(|v| v.as_u64()) {
            self.index = index as usize;
        }
    }

    fn clone_box(&self) -> Box<dyn Ordering> {
        Box::new(self.clone())
    }
}

/// Delegates every slot to the scene, for phase-based rule sets. Holds no
/// state of its own, so deserialization needs no rebind step.
#[derive(Clone, Debug, Default)]
pub struct ControlledOrdering;

impl ControlledOrdering {
    pub fn new() -> Self {
        Self
    }
}

impl Ordering for ControlledOrdering {
    fn name(&self) -> &'static str {
        "controlled"
    }

    fn next_actor(&mut self, names: &[String], scene: &dyn Scene) -> Option<String> {
        scene.controlled_next(names)
    }

    fn serialize_state(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn clone_box(&self) -> Box<dyn Ordering> {
        Box::new(self.clone())
    }
}

/// Reconstruct an ordering from its serialized `{name, state}` form.
pub fn ordering_from(name: &str, state: &serde_json::Value) -> Result<Box<dyn Ordering>> {
    let mut ordering: Box<dyn Ordering> = match name {
        "sequential" => Box::new(SequentialOrdering::new()),
        "cycled" => Box::new(CycledOrdering::default()),
        "controlled" => Box::new(ControlledOrdering::new()),
        other => return Err(Error::UnknownOrdering(other.to_string())),
    };
    ordering.restore_state(state);
    Ok(ordering)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenes::ChatScene;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sequential_wraps_over_agent_set() {
        let scene = ChatScene::new("room", "hi");
        let mut ord = SequentialOrdering::new();
        let ns = names(&["Alice", "Bob"]);
        assert_eq!(ord.next_actor(&ns, &scene).as_deref(), Some("Alice"));
        assert_eq!(ord.next_actor(&ns, &scene).as_deref(), Some("Bob"));
        assert_eq!(ord.next_actor(&ns, &scene).as_deref(), Some("Alice"));
    }

    #[test]
    fn cycled_follows_schedule_not_agent_set() {
        let scene = ChatScene::new("room", "hi");
        let mut ord = CycledOrdering::new(names(&["Bob", "Bob", "Alice"]));
        let ns = names(&["Alice", "Bob"]);
        assert_eq!(ord.next_actor(&ns, &scene).as_deref(), Some("Bob"));
        assert_eq!(ord.next_actor(&ns, &scene).as_deref(), Some("Bob"));
        assert_eq!(ord.next_actor(&ns, &scene).as_deref(), Some("Alice"));
        assert_eq!(ord.next_actor(&ns, &scene).as_deref(), Some("Bob"));
    }

    #[test]
    fn round_trip_preserves_position() {
        let scene = ChatScene::new("room", "hi");
        let ns = names(&["Alice", "Bob", "Cara"]);
        let mut ord = SequentialOrdering::new();
        ord.next_actor(&ns, &scene);

        let state = ord.serialize_state();
        let mut restored = ordering_from("sequential", &state).unwrap();
        assert_eq!(restored.next_actor(&ns, &scene).as_deref(), Some("Bob"));
    }

    #[test]
    fn unknown_ordering_is_an_error() {
        assert!(ordering_from("fancy", &serde_json::json!({})).is_err());
    }
}
