//! Built-in action set
//!
//! Each module holds one family of capabilities. New actions register in
//! `default_catalog`.

pub mod chat;
pub mod council;
pub mod knowledge;

use crate::action::ActionCatalog;
use once_cell::sync::Lazy;

pub use chat::{SendMessageAction, TalkToAction, YieldAction};
pub use council::{
    FinishMeetingAction, RequestBriefAction, StartVotingAction, VoteAction, VotingStatusAction,
};
pub use knowledge::{ListKnowledgeAction, QueryKnowledgeAction};

static DEFAULT_CATALOG: Lazy<ActionCatalog> = Lazy::new(|| {
    let mut catalog = ActionCatalog::new();
    catalog.register(SendMessageAction);
    catalog.register(TalkToAction);
    catalog.register(YieldAction);
    catalog.register(StartVotingAction);
    catalog.register(VoteAction);
    catalog.register(VotingStatusAction);
    catalog.register(FinishMeetingAction);
    catalog.register(RequestBriefAction);
    catalog.register(QueryKnowledgeAction);
    catalog.register(ListKnowledgeAction);
    catalog
});

/// The shared behavior catalog. Actions are stateless, so one instance serves
/// every agent in every node.
pub fn default_catalog() -> &'static ActionCatalog {
    &DEFAULT_CATALOG
}
