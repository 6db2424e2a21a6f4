//! Relay Backend Traits
//!
//! Trait definitions for inference backends. The orchestrators only talk to a
//! [`RelayBackend`], so tests can swap in a scripted backend and other
//! providers can be added without touching the fallback logic.
//!
//! # Design Philosophy
//!
//! A backend offers three calls:
//! - a single-shot conversational call over the full history
//! - the same call streamed, as a channel of [`StreamingToken`]s
//! - a single-turn completion used as the fallback path
//!
//! An empty answer is a [`Completion::NoResponse`], never an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{RelayError, RelayResult};
use crate::messages::ConversationMessage;

/// Marker text for an answer the backend left empty
pub const NO_RESPONSE: &str = "(no response)";

/// Outcome of a backend call that reached the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Non-empty answer text
    Text(String),
    /// The backend answered, but with nothing usable
    NoResponse,
}

impl Completion {
    /// Wrap `text`, mapping empty text to [`Completion::NoResponse`]
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            Self::NoResponse
        } else {
            Self::Text(text)
        }
    }

    /// Whether this is the "no response" outcome
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoResponse)
    }

    /// Borrow the answer text, if any
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::NoResponse => None,
        }
    }

    /// The answer text, or [`NO_RESPONSE`]
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::NoResponse => NO_RESPONSE.to_string(),
        }
    }
}

/// Token stream events from a streaming backend call
#[derive(Clone, Debug)]
pub enum StreamingToken {
    /// A delta from the response, untrimmed
    Token(String),
    /// The stream ended normally
    Complete {
        /// Accumulated answer (trimmed), or `NoResponse` if nothing arrived
        completion: Completion,
    },
    /// The stream failed; no further events follow
    Error(RelayError),
}

/// Sampling options forwarded with every backend request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingOptions {
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling cutoff
    pub top_p: f32,
    /// Maximum tokens to generate (-1 = unbounded)
    pub num_predict: i32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.9,
            num_predict: -1,
        }
    }
}

/// Relay backend trait
///
/// Implement this trait to relay through a different inference provider.
#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Address the backend is reached at, for diagnostics
    fn address(&self) -> &str;

    /// Model identifier requests are sent with
    fn model(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Conversational completion over `messages`, waiting for the whole answer
    async fn chat(&self, messages: &[ConversationMessage]) -> RelayResult<Completion>;

    /// Conversational completion over `messages`, streamed
    ///
    /// Fails if the stream cannot be opened. Once open, every outcome
    /// (including read failures) arrives on the channel, terminated by
    /// exactly one `Complete` or `Error`. Dropping the receiver stops the read.
    async fn chat_streaming(
        &self,
        messages: &[ConversationMessage],
    ) -> RelayResult<mpsc::Receiver<StreamingToken>>;

    /// Single-turn completion of `system` + `prompt` with an optional image
    ///
    /// Used as the fallback path; never touches session history.
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        image: Option<&str>,
    ) -> RelayResult<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_from_text() {
        assert_eq!(Completion::from_text(""), Completion::NoResponse);
        assert_eq!(
            Completion::from_text("hi"),
            Completion::Text("hi".to_string())
        );
        assert!(Completion::NoResponse.is_empty());
        assert_eq!(Completion::NoResponse.as_text(), None);
        assert_eq!(Completion::NoResponse.into_text(), NO_RESPONSE);
    }

    #[test]
    fn test_sampling_defaults() {
        let options = SamplingOptions::default();
        assert!((options.temperature - 0.6).abs() < f32::EPSILON);
        assert!((options.top_p - 0.9).abs() < f32::EPSILON);
        assert_eq!(options.num_predict, -1);

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["num_predict"], -1);
    }
}
