//! Relay Messages
//!
//! The message vocabulary shared by the session store, the orchestrators and
//! the backend clients.
//!
//! A [`ConversationMessage`] is created once (by the request builder or by an
//! orchestrator when a turn completes) and never edited after it lands in a
//! session's history.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session used when an inbound request does not name one
pub const DEFAULT_SESSION: &str = "default";

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Fixed instruction prefacing every conversation
    System,
    /// User input
    User,
    /// Backend answer
    Assistant,
}

impl MessageRole {
    /// Wire name used by the backend dialect
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolve an optional client-supplied ID, falling back to [`DEFAULT_SESSION`]
    ///
    /// Blank IDs are treated as absent.
    #[must_use]
    pub fn from_optional(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::default(),
        }
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(DEFAULT_SESSION.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message in the conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// Bare base64 image payload attached to this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ConversationMessage {
    /// Create a new message without an image
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image: None,
        }
    }

    /// Create the system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Attach an image payload
    #[must_use]
    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_optional() {
        assert_eq!(SessionId::from_optional(None).as_str(), DEFAULT_SESSION);
        assert_eq!(SessionId::from_optional(Some("   ")).as_str(), DEFAULT_SESSION);
        assert_eq!(SessionId::from_optional(Some(" desk ")).as_str(), "desk");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        assert_eq!(MessageRole::System.to_string(), "system");
    }

    #[test]
    fn test_message_image_skipped_when_absent() {
        let msg = ConversationMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("image").is_none());

        let msg = ConversationMessage::user("hi").with_image(Some("Zm9v".to_string()));
        assert_eq!(msg.image.as_deref(), Some("Zm9v"));
    }
}
