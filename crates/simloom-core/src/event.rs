//! Event value objects
//!
//! Events are immutable records delivered into agent memories and onto the
//! timeline. Rendering is clock-stamped by the scene at delivery time, not at
//! construction.

use serde::{Deserialize, Serialize};

/// Event kind - the coarse delivery class of an event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Visible to every agent in the scene.
    Public,
    /// Directed at specific recipients.
    Message,
    /// A per-agent status line injected at the start of a turn.
    Status,
    /// Operational notice from the engine itself.
    SystemLog,
    /// A failure surfaced onto the timeline.
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Public => "public",
            EventKind::Message => "message",
            EventKind::Status => "status",
            EventKind::SystemLog => "system_log",
            EventKind::Error => "error",
        }
    }
}

/// Media references attached to an event. The formatted text travels together
/// with these lists so multimodal clients can consume them; non-multimodal
/// clients get textual placeholders substituted by the client layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Media {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video: Vec<String>,
}

impl Media {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.audio.is_empty() && self.video.is_empty()
    }

    /// Placeholder lines for attachments that only multimodal clients could
    /// otherwise perceive. Images are handled by the client layer; audio and
    /// video always degrade to text.
    pub fn placeholder_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.audio.is_empty() {
            lines.push(format!("[audio: {}]", self.audio.join(", ")));
        }
        if !self.video.is_empty() {
            lines.push(format!("[video: {}]", self.video.join(", ")));
        }
        lines
    }
}

/// An immutable event record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Media::is_empty")]
    pub media: Media,
    /// Machine-interpretable tag, e.g. "initial_event".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Structured parameters accompanying `code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Event {
    pub fn public(content: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Public,
            sender: None,
            content: content.into(),
            media: Media::default(),
            code: None,
            params: None,
        }
    }

    pub fn message(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Message,
            sender: Some(sender.into()),
            content: content.into(),
            media: Media::default(),
            code: None,
            params: None,
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Status,
            sender: None,
            content: content.into(),
            media: Media::default(),
            code: None,
            params: None,
        }
    }

    pub fn system_log(content: impl Into<String>) -> Self {
        Self {
            kind: EventKind::SystemLog,
            sender: None,
            content: content.into(),
            media: Media::default(),
            code: None,
            params: None,
        }
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = media;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Render for delivery. `time` is the scene clock ("hh:mm") when known.
    pub fn to_display(&self, time: Option<&str>) -> String {
        let stamp = time.map(|t| format!("[{t}] ")).unwrap_or_default();
        match (&self.kind, &self.sender) {
            (EventKind::Status, _) => format!("{stamp}(status) {}", self.content),
            (EventKind::SystemLog, _) => format!("{stamp}(system) {}", self.content),
            (_, Some(sender)) => format!("{stamp}{sender}: {}", self.content),
            (_, None) => format!("{stamp}{}", self.content),
        }
    }
}
