//! LLM response parsing
//!
//! Responses are plain text with labeled sections:
//!
//! ```text
//! --- Thoughts ---
//! --- Plan ---
//! --- Action ---
//! <Action name="send_message"><message>hi</message></Action>
//! --- Plan Update ---     (optional, full replacement or "no change")
//! --- Emotion Update ---  (optional, <Emotion>Joy</Emotion>)
//! ```
//!
//! The action grammar is a single XML element whose child elements become
//! parameters. This wire format predates the runtime and is kept for
//! compatibility with existing prompt templates.

use crate::plan::{Goal, Milestone, PlanState};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("missing required section: {0}")]
    MissingSection(&'static str),

    #[error("action section must contain exactly one element, found {0}")]
    ActionCount(usize),

    #[error("malformed plan update: {0}")]
    BadPlanUpdate(String),
}

/// One parsed action: name plus flat string parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionData {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl ActionData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParsedResponse {
    pub thoughts: String,
    pub plan: String,
    pub actions: Vec<ActionData>,
    pub plan_update: Option<PlanState>,
    pub emotion: Option<String>,
}

static SECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^---\s*(Thoughts|Plan|Action|Plan Update|Emotion Update)\s*---\s*$")
        .expect("section regex")
});

static ACTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<Action\s+name="([^"]+)"\s*(?:/>|>(.*?)</Action>)"#).expect("action regex")
});

static CHILD_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([A-Za-z_][\w-]*)>").expect("child regex"));

static EMOTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<Emotion>\s*(.*?)\s*</Emotion>").expect("emotion regex"));

static PLAN_ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\.\s*(\[CURRENT\]|\[DONE\])?\s*(.+)$").expect("plan item regex")
});

/// Split the raw output into labeled sections and parse each one.
pub fn parse_full_response(text: &str) -> Result<ParsedResponse, ParseError> {
    let sections = split_sections(text);

    let action_block = sections.get("Action").copied();
    if action_block.is_none() && !ACTION_RE.is_match(text) {
        return Err(ParseError::MissingSection("Action"));
    }

    // Prefer the labeled block; fall back to the whole output when the model
    // put the element outside its section.
    let actions = match action_block {
        Some(block) => {
            let parsed = parse_actions(block)?;
            if parsed.is_empty() {
                parse_actions_lenient(text)
            } else {
                parsed
            }
        }
        None => parse_actions(text)?,
    };

    let plan_update = match sections.get("Plan Update") {
        Some(block) => parse_plan_update(block)?,
        None => None,
    };

    let emotion = sections
        .get("Emotion Update")
        .and_then(|block| parse_emotion_update(block));

    Ok(ParsedResponse {
        thoughts: sections.get("Thoughts").unwrap_or(&"").trim().to_string(),
        plan: sections.get("Plan").unwrap_or(&"").trim().to_string(),
        actions,
        plan_update,
        emotion,
    })
}

fn split_sections(text: &str) -> BTreeMap<&str, &str> {
    let mut headers: Vec<(&str, usize, usize)> = Vec::new();
    for caps in SECTION_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let name = caps.get(1).expect("name");
        headers.push((
            &text[name.start()..name.end()],
            whole.start(),
            whole.end(),
        ));
    }
    let mut sections = BTreeMap::new();
    for (i, (name, _, body_start)) in headers.iter().enumerate() {
        let body_end = headers
            .get(i + 1)
            .map(|(_, next_start, _)| *next_start)
            .unwrap_or(text.len());
        // Last occurrence wins when the model repeats a header.
        sections.insert(*name, &text[*body_start..body_end]);
    }
    sections
}

/// Parse the action block: exactly one element, or none at all.
pub fn parse_actions(block: &str) -> Result<Vec<ActionData>, ParseError> {
    let matches: Vec<_> = ACTION_RE.captures_iter(block).collect();
    match matches.len() {
        0 => Ok(Vec::new()),
        1 => Ok(vec![action_from_captures(&matches[0])]),
        n => Err(ParseError::ActionCount(n)),
    }
}

/// Like `parse_actions` but takes the first element when several appear;
/// used only for the whole-output fallback.
fn parse_actions_lenient(text: &str) -> Vec<ActionData> {
    ACTION_RE
        .captures_iter(text)
        .next()
        .map(|caps| vec![action_from_captures(&caps)])
        .unwrap_or_default()
}

fn action_from_captures(caps: &regex::Captures<'_>) -> ActionData {
    let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let inner = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    ActionData {
        name: name.to_string(),
        params: parse_children(inner),
    }
}

/// Child elements become flat string parameters.
fn parse_children(inner: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for caps in CHILD_OPEN_RE.captures_iter(inner) {
        let tag = caps.get(1).expect("tag").as_str();
        let value_start = caps.get(0).expect("open").end();
        let close = format!("</{tag}>");
        if let Some(rel) = inner[value_start..].find(&close) {
            let value = inner[value_start..value_start + rel].trim();
            params.insert(tag.to_string(), value.to_string());
        }
    }
    params
}

/// Strict full-replacement plan update. `no change` keeps the current plan.
pub fn parse_plan_update(block: &str) -> Result<Option<PlanState>, ParseError> {
    let body = block.trim();
    if body.is_empty() || body.eq_ignore_ascii_case("no change") {
        return Ok(None);
    }

    let mut plan = PlanState::default();
    let mut current_label: Option<&str> = None;
    let mut saw_current_goal = false;

    for raw_line in body.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("Goals:") {
            current_label = Some("goals");
            if !rest.trim().is_empty() {
                return Err(ParseError::BadPlanUpdate(
                    "goals must be a numbered list on following lines".into(),
                ));
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("Milestones:") {
            current_label = Some("milestones");
            if !rest.trim().is_empty() {
                return Err(ParseError::BadPlanUpdate(
                    "milestones must be a numbered list on following lines".into(),
                ));
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("Strategy:") {
            current_label = Some("strategy");
            plan.strategy = rest.trim().to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("Notes:") {
            current_label = Some("notes");
            plan.notes = rest.trim().to_string();
            continue;
        }

        match current_label {
            Some("goals") => {
                let caps = PLAN_ITEM_RE
                    .captures(line)
                    .ok_or_else(|| ParseError::BadPlanUpdate(format!("not a numbered goal: {line}")))?;
                let marker = caps.get(2).map(|m| m.as_str());
                if marker == Some("[DONE]") {
                    return Err(ParseError::BadPlanUpdate(
                        "goals may not carry [DONE]".into(),
                    ));
                }
                let current = marker == Some("[CURRENT]");
                if current && saw_current_goal {
                    return Err(ParseError::BadPlanUpdate(
                        "more than one [CURRENT] goal".into(),
                    ));
                }
                saw_current_goal |= current;
                plan.goals.push(Goal {
                    id: caps[1].parse().unwrap_or(0),
                    desc: caps[3].trim().to_string(),
                    current,
                });
            }
            Some("milestones") => {
                let caps = PLAN_ITEM_RE.captures(line).ok_or_else(|| {
                    ParseError::BadPlanUpdate(format!("not a numbered milestone: {line}"))
                })?;
                let marker = caps.get(2).map(|m| m.as_str());
                if marker == Some("[CURRENT]") {
                    return Err(ParseError::BadPlanUpdate(
                        "milestones may not carry [CURRENT]".into(),
                    ));
                }
                plan.milestones.push(Milestone {
                    id: caps[1].parse().unwrap_or(0),
                    desc: caps[3].trim().to_string(),
                    done: marker == Some("[DONE]"),
                });
            }
            Some("strategy") => {
                if !plan.strategy.is_empty() {
                    plan.strategy.push('\n');
                }
                plan.strategy.push_str(line);
            }
            Some("notes") => {
                if !plan.notes.is_empty() {
                    plan.notes.push('\n');
                }
                plan.notes.push_str(line);
            }
            _ => {
                return Err(ParseError::BadPlanUpdate(format!(
                    "content before any label: {line}"
                )))
            }
        }
    }

    Ok(Some(plan))
}

pub fn parse_emotion_update(block: &str) -> Option<String> {
    EMOTION_RE
        .captures(block)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "--- Thoughts ---\nTime to speak up.\n\n--- Plan ---\nGoals: convince the room\n\n--- Action ---\n<Action name=\"send_message\">\n  <message>I support the draft.</message>\n</Action>\n";

    #[test]
    fn parses_labeled_sections() {
        let parsed = parse_full_response(FULL).unwrap();
        assert_eq!(parsed.thoughts, "Time to speak up.");
        assert_eq!(parsed.actions.len(), 1);
        let action = &parsed.actions[0];
        assert_eq!(action.name, "send_message");
        assert_eq!(action.param("message"), Some("I support the draft."));
    }

    #[test]
    fn self_closing_action() {
        let text = "--- Thoughts ---\nDone here.\n--- Action ---\n<Action name=\"yield\"/>\n";
        let parsed = parse_full_response(text).unwrap();
        assert_eq!(parsed.actions[0].name, "yield");
        assert!(parsed.actions[0].params.is_empty());
    }

    #[test]
    fn missing_action_section_is_error() {
        let err = parse_full_response("--- Thoughts ---\njust musing\n").unwrap_err();
        assert!(matches!(err, ParseError::MissingSection("Action")));
    }

    #[test]
    fn two_elements_in_action_section_is_error() {
        let text = "--- Action ---\n<Action name=\"a\"/>\n<Action name=\"b\"/>\n";
        let err = parse_full_response(text).unwrap_err();
        assert!(matches!(err, ParseError::ActionCount(2)));
    }

    #[test]
    fn action_outside_section_is_recovered() {
        let text = "--- Thoughts ---\nhm\n--- Action ---\n(see below)\n\n<Action name=\"rest\"/>";
        let parsed = parse_full_response(text).unwrap();
        assert_eq!(parsed.actions[0].name, "rest");
    }

    #[test]
    fn empty_action_section_yields_no_actions() {
        let text = "--- Thoughts ---\nNothing to add.\n--- Action ---\n";
        let parsed = parse_full_response(text).unwrap();
        assert!(parsed.actions.is_empty());
    }

    #[test]
    fn plan_update_no_change() {
        assert!(parse_plan_update("no change").unwrap().is_none());
        assert!(parse_plan_update("  No Change  ").unwrap().is_none());
    }

    #[test]
    fn plan_update_full_replacement() {
        let block = "Goals:\n1. [CURRENT] pass the bill\n2. keep allies close\nMilestones:\n1. [DONE] opening speech\n2. floor vote\nStrategy: build consensus early\nNotes: watch the chair";
        let plan = parse_plan_update(block).unwrap().unwrap();
        assert_eq!(plan.goals.len(), 2);
        assert!(plan.goals[0].current);
        assert!(!plan.goals[1].current);
        assert!(plan.milestones[0].done);
        assert_eq!(plan.strategy, "build consensus early");
        assert_eq!(plan.notes, "watch the chair");
    }

    #[test]
    fn plan_update_rejects_two_current_goals() {
        let block = "Goals:\n1. [CURRENT] a\n2. [CURRENT] b";
        assert!(parse_plan_update(block).is_err());
    }

    #[test]
    fn plan_update_rejects_unnumbered_items() {
        let block = "Goals:\n- not numbered";
        assert!(parse_plan_update(block).is_err());
    }

    #[test]
    fn emotion_update_extracts_tag() {
        assert_eq!(
            parse_emotion_update("<Emotion>Joy</Emotion>"),
            Some("Joy".to_string())
        );
        assert_eq!(parse_emotion_update("nothing here"), None);
    }

    #[test]
    fn full_response_with_updates() {
        let text = format!(
            "{FULL}\n--- Plan Update ---\nGoals:\n1. [CURRENT] new goal\nMilestones:\n1. first step\nStrategy: direct\nNotes:\n\n--- Emotion Update ---\n<Emotion>Trust</Emotion>\n"
        );
        let parsed = parse_full_response(&text).unwrap();
        assert!(parsed.plan_update.is_some());
        assert_eq!(parsed.emotion.as_deref(), Some("Trust"));
    }
}
