//! Inference Backend Integration
//!
//! This module provides abstracted access to the inference backend through a
//! common trait interface, plus the response-shape and stream decoding that
//! backend implementations share.
//!
//! # Available Backends
//!
//! - **Ollama**: Local multimodal server (default)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{OllamaBackend, RelayBackend};
//! use relay_core::messages::ConversationMessage;
//!
//! let backend = OllamaBackend::new("http://127.0.0.1:11434", "llava")?;
//! let messages = [ConversationMessage::system("Be brief."), ConversationMessage::user("Hi")];
//! let rx = backend.chat_streaming(&messages).await?;
//! ```

mod ollama;
pub mod response;
pub mod stream;
mod traits;

pub use ollama::{OllamaBackend, DEFAULT_OLLAMA_HOST};
pub use response::{normalize, BackendReply, ReplyText};
pub use stream::{StreamEvent, StreamState};
pub use traits::{Completion, RelayBackend, SamplingOptions, StreamingToken, NO_RESPONSE};
