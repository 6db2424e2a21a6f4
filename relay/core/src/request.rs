//! Request Building
//!
//! Turns raw user input into the canonical user entry sent to the backend.
//! Nothing here rejects input: odd image payloads are forwarded as-is and the
//! backend gets to decide.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::messages::ConversationMessage;

/// Prompt used when the user sends an image without text
pub const DEFAULT_PROMPT: &str = "Describe this screenshot briefly.";

/// Raw input for one relay request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInput {
    /// User text (may be empty)
    #[serde(default)]
    pub message: Option<String>,
    /// Raw base64 or data-URL image
    #[serde(default)]
    pub image: Option<String>,
}

impl RelayInput {
    /// Create input from text only
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            image: None,
        }
    }

    /// Attach an image (raw base64 or data URL)
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Build the user entry for `input`, substituting [`DEFAULT_PROMPT`] for empty text
#[must_use]
pub fn build_user_entry(input: &RelayInput) -> ConversationMessage {
    build_user_entry_with_default(input, DEFAULT_PROMPT)
}

/// Build the user entry for `input` with a custom default prompt
#[must_use]
pub fn build_user_entry_with_default(
    input: &RelayInput,
    default_prompt: &str,
) -> ConversationMessage {
    let text = input
        .message
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(default_prompt);

    let image = input.image.as_deref().and_then(extract_image_payload);

    ConversationMessage::user(text.trim()).with_image(image)
}

/// Strip any data-URL prefix, returning the bare base64 payload
///
/// Everything up to and including the last comma is discarded; the rest is
/// forwarded verbatim. Blank input yields `None`.
#[must_use]
pub fn extract_image_payload(raw: &str) -> Option<String> {
    let payload = match raw.rfind(',') {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    };
    if payload.trim().is_empty() {
        return None;
    }

    if base64::engine::general_purpose::STANDARD
        .decode(payload)
        .is_err()
    {
        tracing::debug!(
            len = payload.len(),
            "Image payload is not valid base64, forwarding as-is"
        );
    }

    Some(payload.to_string())
}
