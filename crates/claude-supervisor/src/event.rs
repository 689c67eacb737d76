use serde::{Deserialize, Serialize};

use crate::error::CodecError;

// ─── Typed events ─────────────────────────────────────────────────────────

/// One decoded stdout line. `raw` keeps the line exactly as the agent wrote
/// it, for pass-through and debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SessionStart {
        session_id: String,
    },
    AssistantText {
        text: String,
    },
    AssistantToolUse {
        tool_name: String,
        tool_id: String,
        /// Tool input as sent by the agent; its shape depends on the tool.
        args: serde_json::Value,
    },
    Result(ResultEvent),
}

/// `type = "result"`: the terminal message of every response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEvent {
    pub text: String,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    /// Authoritative cumulative cost of the subprocess session.
    pub total_cost_usd: Option<f64>,
    pub is_error: bool,
}

impl Event {
    /// Wire `type` of the event, used as a metrics label.
    pub fn type_label(&self) -> &'static str {
        match self.kind {
            EventKind::SessionStart { .. } => "system",
            EventKind::AssistantText { .. } | EventKind::AssistantToolUse { .. } => "assistant",
            EventKind::Result(_) => "result",
        }
    }

    pub fn as_result(&self) -> Option<&ResultEvent> {
        if let EventKind::Result(r) = &self.kind {
            Some(r)
        } else {
            None
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self.kind, EventKind::Result(_))
    }

    /// The original line as JSON.
    pub fn raw_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.raw).unwrap_or_else(|_| serde_json::Value::String(self.raw.clone()))
    }
}

// ─── Wire format ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    System {
        #[serde(default)]
        session_id: String,
    },
    Assistant(WireAssistant),
    Result(WireResult),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum WireAssistant {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        tool_id: String,
        #[serde(default)]
        tool_args: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    result: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    is_error: bool,
}

const KNOWN_TYPES: [&str; 3] = ["system", "assistant", "result"];

/// Decode one raw stdout frame, as read up to and including `\n`.
///
/// Bytes that are not UTF-8 are a recoverable [`CodecError::NotUtf8`].
pub fn decode_frame(frame: &[u8]) -> Result<Option<Event>, CodecError> {
    match std::str::from_utf8(frame) {
        Ok(line) => decode_line(line),
        Err(_) => Err(CodecError::NotUtf8 {
            line: String::from_utf8_lossy(frame).trim_end().to_owned(),
        }),
    }
}

/// Decode one stdout line.
///
/// Returns `Ok(None)` for blank lines. Every error is recoverable: the
/// caller logs it and keeps reading.
pub fn decode_line(line: &str) -> Result<Option<Event>, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let wire = match serde_json::from_str::<WireMessage>(trimmed) {
        Ok(wire) => wire,
        Err(source) => {
            if let Some(kind) = unknown_message_type(trimmed) {
                return Err(CodecError::UnknownType { kind });
            }
            return Err(CodecError::Malformed {
                line: trimmed.to_owned(),
                source,
            });
        }
    };

    let kind = match wire {
        WireMessage::System { session_id } => EventKind::SessionStart { session_id },
        WireMessage::Assistant(WireAssistant::Text { text }) => EventKind::AssistantText { text },
        WireMessage::Assistant(WireAssistant::ToolUse {
            tool_name,
            tool_id,
            tool_args,
        }) => EventKind::AssistantToolUse {
            tool_name,
            tool_id,
            args: tool_args,
        },
        WireMessage::Result(r) => EventKind::Result(ResultEvent {
            text: r.result,
            duration_ms: r.duration_ms,
            cost_usd: r.cost_usd,
            total_cost_usd: r.total_cost_usd,
            is_error: r.is_error,
        }),
    };

    Ok(Some(Event {
        kind,
        raw: trimmed.to_owned(),
    }))
}

/// `Some(type)` if the line is valid JSON whose `"type"` we don't recognise
/// (e.g. `rate_limit_event`). Anything else is a genuine parse error.
fn unknown_message_type(line: &str) -> Option<String> {
    let v = serde_json::from_str::<serde_json::Value>(line).ok()?;
    let kind = v.get("type")?.as_str()?;
    if KNOWN_TYPES.contains(&kind) {
        None
    } else {
        Some(kind.to_owned())
    }
}

// ─── Text helpers ─────────────────────────────────────────────────────────

/// Final answer for a run: the last `result` text if non-empty, otherwise
/// every assistant text chunk concatenated in arrival order.
pub fn extract_text(events: &[Event]) -> String {
    let last_result = events.iter().rev().find_map(Event::as_result);
    if let Some(r) = last_result {
        if !r.text.is_empty() {
            return r.text.clone();
        }
    }

    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::AssistantText { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Keep at most `max_chars` characters, appending `"..."` when anything was cut.
/// Never splits a multi-byte character.
pub fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_owned(),
        Some((byte_idx, _)) => format!("{}...", &s[..byte_idx]),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
