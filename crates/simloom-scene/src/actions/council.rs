//! Council chamber actions: debate around a draft, then vote

use crate::action::{Action, ActionOutcome};
use crate::scene::{SceneState, TurnCtx};
use simloom_agent::{ActionData, Agent};
use simloom_core::event::{Event, Media};
use std::collections::BTreeMap;

pub(crate) const VOTING_OPEN: &str = "voting_open";
pub(crate) const VOTES: &str = "votes";
pub(crate) const MEETING_FINISHED: &str = "meeting_finished";
pub(crate) const DRAFT: &str = "draft";

fn votes_of(state: &SceneState) -> BTreeMap<String, String> {
    state
        .get(VOTES)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

pub(crate) fn tally(state: &SceneState) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for choice in votes_of(state).values() {
        *counts.entry(choice.clone()).or_insert(0) += 1;
    }
    counts
}

/// Open a voting round on the current draft.
pub struct StartVotingAction;

impl Action for StartVotingAction {
    fn name(&self) -> &'static str {
        "start_voting"
    }

    fn description(&self) -> &'static str {
        "Open a voting round on the draft under discussion."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"start_voting\"/>\n"
    }

    fn validate_state(&self, state: &SceneState) -> Result<(), String> {
        if state.get_bool(MEETING_FINISHED) {
            return Err("The meeting has been adjourned.".to_string());
        }
        if state.get_bool(VOTING_OPEN) {
            return Err("Voting is already open.".to_string());
        }
        Ok(())
    }

    fn handle(
        &self,
        _action: &ActionData,
        agent: &mut Agent,
        state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        state.set(VOTING_OPEN, serde_json::json!(true));
        state.set(VOTES, serde_json::json!({}));
        ctx.broadcast(
            Event::public(format!(
                "{} has opened voting. Cast your vote with the vote action.",
                agent.name
            ))
            .with_code("voting_opened"),
            None,
        );
        ActionOutcome::ok("voting opened", serde_json::json!({}))
    }
}

/// Cast or change a vote while a round is open.
pub struct VoteAction;

impl Action for VoteAction {
    fn name(&self) -> &'static str {
        "vote"
    }

    fn description(&self) -> &'static str {
        "Cast your vote in the open round."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"vote\"><candidate>aye | nay | abstain</candidate></Action>\n"
    }

    fn validate_state(&self, state: &SceneState) -> Result<(), String> {
        if !state.get_bool(VOTING_OPEN) {
            return Err("No voting round is open.".to_string());
        }
        Ok(())
    }

    fn validate_params(&self, action: &ActionData) -> Result<(), String> {
        match action.param("candidate") {
            Some(c) if !c.trim().is_empty() => Ok(()),
            _ => Err("vote requires a <candidate>".to_string()),
        }
    }

    fn handle(
        &self,
        action: &ActionData,
        agent: &mut Agent,
        state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let candidate = action.param("candidate").unwrap_or_default().to_string();
        let mut votes = votes_of(state);
        votes.insert(agent.name.clone(), candidate.clone());
        let total = votes.len();
        state.set(VOTES, serde_json::json!(votes));
        ctx.emit_later(
            "experiment_action",
            serde_json::json!({"agent": agent.name, "action": "vote"}),
        );
        ActionOutcome::ok(
            format!("voted {candidate}"),
            serde_json::json!({"candidate": candidate, "votes_cast": total}),
        )
        .with_meta(serde_json::json!({"candidate": candidate}))
        .yielding()
    }
}

/// Report the current tally to the asking agent only.
pub struct VotingStatusAction;

impl Action for VotingStatusAction {
    fn name(&self) -> &'static str {
        "voting_status"
    }

    fn description(&self) -> &'static str {
        "Check how the open voting round stands."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"voting_status\"/>\n"
    }

    fn handle(
        &self,
        _action: &ActionData,
        agent: &mut Agent,
        state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let report = if !state.get_bool(VOTING_OPEN) {
            "No voting round is open.".to_string()
        } else {
            let counts = tally(state);
            if counts.is_empty() {
                "Voting is open; no votes cast yet.".to_string()
            } else {
                let lines: Vec<String> =
                    counts.iter().map(|(c, n)| format!("{c}: {n}")).collect();
                format!("Current tally - {}", lines.join(", "))
            }
        };
        agent.add_env_feedback(report.clone(), Media::default(), ctx.bus);
        ActionOutcome::ok("voting status", serde_json::json!({"report": report}))
    }
}

/// Close the round (if open) and adjourn the meeting.
pub struct FinishMeetingAction;

impl Action for FinishMeetingAction {
    fn name(&self) -> &'static str {
        "finish_meeting"
    }

    fn description(&self) -> &'static str {
        "Close any open voting round and adjourn the meeting."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"finish_meeting\"/>\n"
    }

    fn validate_state(&self, state: &SceneState) -> Result<(), String> {
        if state.get_bool(MEETING_FINISHED) {
            return Err("The meeting has already been adjourned.".to_string());
        }
        Ok(())
    }

    fn handle(
        &self,
        _action: &ActionData,
        agent: &mut Agent,
        state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let mut result = serde_json::json!({});
        if state.get_bool(VOTING_OPEN) {
            let counts = tally(state);
            state.set(VOTING_OPEN, serde_json::json!(false));
            ctx.broadcast(
                Event::public(format!(
                    "Voting is closed. Result: {}",
                    serde_json::to_string(&counts).unwrap_or_default()
                ))
                .with_code("voting_closed")
                .with_params(serde_json::json!({"tally": counts})),
                None,
            );
            result = serde_json::json!({"tally": counts});
        }
        state.set(MEETING_FINISHED, serde_json::json!(true));
        state.complete = true;
        ctx.broadcast(
            Event::public(format!("{} adjourned the meeting.", agent.name)),
            None,
        );
        ActionOutcome::ok("meeting adjourned", result).yielding()
    }
}

/// Re-read the draft under discussion.
pub struct RequestBriefAction;

impl Action for RequestBriefAction {
    fn name(&self) -> &'static str {
        "request_brief"
    }

    fn description(&self) -> &'static str {
        "Ask the clerk to repeat the draft text."
    }

    fn instruction(&self) -> &'static str {
        "<Action name=\"request_brief\"/>\n"
    }

    fn handle(
        &self,
        _action: &ActionData,
        agent: &mut Agent,
        state: &mut SceneState,
        ctx: &mut TurnCtx<'_>,
    ) -> ActionOutcome {
        let draft = state.get_str(DRAFT).unwrap_or("(no draft on record)");
        agent.add_env_feedback(
            format!("Draft under consideration:\n{draft}"),
            Media::default(),
            ctx.bus,
        );
        ActionOutcome::ok("brief delivered", serde_json::json!({}))
    }
}
