//! Simloom scene - game-agnostic rules contract and built-in rule sets
//!
//! A scene owns the mechanic state, advertises the actions agents may use,
//! interprets parsed actions, and decides when an actor is skipped or the
//! scenario is complete. Concrete rule sets are plug-ins behind the `Scene`
//! trait; this crate ships a chat room and a council chamber.

pub mod action;
pub mod actions;
pub mod ordering;
pub mod registry;
pub mod scene;
pub mod scenes;

pub use action::{Action, ActionCatalog, ActionOutcome, RoleFilter};
pub use actions::default_catalog;
pub use ordering::{
    ordering_from, ControlledOrdering, CycledOrdering, Ordering, SequentialOrdering,
};
pub use registry::{default_registry, SceneRegistry, SceneSpec};
pub use scene::{PendingItem, Scene, SceneState, TurnCtx};
pub use scenes::{ChatScene, CouncilScene};
