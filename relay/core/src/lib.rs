//! Relay Core - Conversational screenshot relay for local multimodal models
//!
//! This crate relays a user's screenshot and question to a local Ollama
//! server and returns the model's answer, keeping a bounded per-session
//! conversation history. It has no HTTP server of its own; `relay-daemon`
//! wraps it, and tests drive it directly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Callers (daemon, tests)                    │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ RelayInput + SessionId
//! ┌──────────────────────────────┼───────────────────────────────┐
//! │                         RELAY CORE                           │
//! │  ┌───────────────────────────┴──────────────────────────────┐ │
//! │  │                         Relay                            │ │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │ │
//! │  │  │   Request    │  │   Session    │  │    Backend     │  │ │
//! │  │  │   building   │  │   Registry   │  │ (Ollama, NDJSON│  │ │
//! │  │  │              │  │ (bounded)    │  │   streaming)   │  │ │
//! │  │  └──────────────┘  └──────────────┘  └────────────────┘  │ │
//! │  └──────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{load_config, OllamaBackend, Relay, RelayInput, SessionId};
//!
//! let config = load_config()?;
//! let relay = Relay::from_config(OllamaBackend::from_config(&config)?, &config);
//!
//! let input = RelayInput::text("What is this?").with_image(screenshot_b64);
//! let answer = relay.relay(&SessionId::default(), input).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Backend trait, Ollama client, response and stream decoding
//! - [`config`]: Layered configuration (defaults, TOML file, environment, CLI)
//! - [`error`]: Relay error type
//! - [`messages`]: Conversation entries, roles and session IDs
//! - [`relay`]: Single-shot and streaming orchestration with fallback
//! - [`request`]: User entry building and image payload extraction
//! - [`session`]: Bounded session history and the session registry

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod messages;
pub mod relay;
pub mod request;
pub mod session;

// Re-exports for convenience
pub use backend::{
    Completion, OllamaBackend, RelayBackend, SamplingOptions, StreamingToken, NO_RESPONSE,
};
pub use error::{RelayError, RelayResult};
pub use messages::{ConversationMessage, MessageRole, SessionId, DEFAULT_SESSION};
pub use relay::Relay;
pub use request::{build_user_entry, extract_image_payload, RelayInput, DEFAULT_PROMPT};
pub use session::{
    Session, SessionMetadata, SessionRegistry, SharedSession, DEFAULT_MAX_SESSIONS,
    DEFAULT_MAX_TURNS, DEFAULT_SESSION_IDLE,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig, RelayToml,
};
