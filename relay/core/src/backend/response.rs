//! Response Normalization
//!
//! Backends disagree on where the answer lives and what shape it takes. This
//! module parses a response into an explicit [`BackendReply`] and reduces it
//! to plain text.
//!
//! Final answers are trimmed. Streaming deltas are not: trimming a delta
//! would glue words together at token boundaries.

use serde_json::Value;

use super::traits::Completion;

/// One text-bearing field of a backend response
#[derive(Clone, Debug, PartialEq)]
pub enum ReplyText {
    /// Field missing or null
    Absent,
    /// Plain string
    Text(String),
    /// Ordered list of parts
    Parts(Vec<Value>),
    /// Any other JSON value
    Other(Value),
}

impl ReplyText {
    /// Classify an optional JSON value
    #[must_use]
    pub fn parse(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::String(text)) => Self::Text(text.clone()),
            Some(Value::Array(parts)) => Self::Parts(parts.clone()),
            Some(other) => Self::Other(other.clone()),
        }
    }

    /// Reduce to text; parts are joined with single spaces
    #[must_use]
    pub fn to_text(&self, trim: bool) -> String {
        let text = match self {
            Self::Absent => String::new(),
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts.iter().map(part_text).collect::<Vec<_>>().join(" "),
            Self::Other(value) => value.to_string(),
        };
        if trim {
            text.trim().to_string()
        } else {
            text
        }
    }
}

/// Normalize any JSON value to text
#[must_use]
pub fn normalize(value: Option<&Value>, trim: bool) -> String {
    ReplyText::parse(value).to_text(trim)
}

/// A parsed single-shot backend response
#[derive(Clone, Debug, PartialEq)]
pub enum BackendReply {
    /// `{ "message": { "content": .. }, "response"?: .. }`
    Chat {
        /// `message.content`
        content: ReplyText,
        /// Top-level `response`, used when `content` is empty
        response: ReplyText,
    },
    /// `{ "response": .. }`
    Generate {
        /// Top-level `response`
        response: ReplyText,
    },
    /// A bare list of parts
    Parts(Vec<Value>),
    /// Any other JSON value
    Scalar(Value),
}

impl BackendReply {
    /// Parse a response body
    #[must_use]
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::Object(map) if map.contains_key("message") => Self::Chat {
                content: ReplyText::parse(map.get("message").and_then(|m| m.get("content"))),
                response: ReplyText::parse(map.get("response")),
            },
            Value::Object(map) => Self::Generate {
                response: ReplyText::parse(map.get("response")),
            },
            Value::Array(parts) => Self::Parts(parts.clone()),
            other => Self::Scalar(other.clone()),
        }
    }

    /// Trimmed answer text; empty when nothing usable was returned
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Chat { content, response } => {
                let primary = content.to_text(true);
                if primary.is_empty() {
                    response.to_text(true)
                } else {
                    primary
                }
            }
            Self::Generate { response } => response.to_text(true),
            Self::Parts(parts) => ReplyText::Parts(parts.clone()).to_text(true),
            Self::Scalar(value) => ReplyText::parse(Some(value)).to_text(true),
        }
    }

    /// The answer as a [`Completion`]
    #[must_use]
    pub fn completion(&self) -> Completion {
        Completion::from_text(self.text())
    }
}

/// Untrimmed delta carried by one streaming event
///
/// Reads `message.content`, falling back to a top-level `delta`.
#[must_use]
pub fn stream_delta(event: &Value) -> String {
    let content = normalize(event.get("message").and_then(|m| m.get("content")), false);
    if content.is_empty() {
        normalize(event.get("delta"), false)
    } else {
        content
    }
}

fn part_text(part: &Value) -> String {
    match part {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(text)) => text.clone(),
            _ => part.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
