//! Relay Orchestration
//!
//! The [`Relay`] ties the pieces together for one inbound request:
//!
//! ```text
//! RelayInput ──► build_user_entry ──► history snapshot + entry
//!                                            │
//!                       ┌────────────────────┴────────────────────┐
//!                  relay()                                  relay_streaming()
//!                       │                                         │
//!                chat (single-shot)                      chat_streaming ──► tokens to caller
//!                       │ empty?                                  │ empty or ANY failure?
//!                       ▼                                         ▼
//!                   generate                               generate ──► one terminal chunk
//!                       │                                         │
//!                       └──────────► record_turn (once) ◄─────────┘
//! ```
//!
//! The session lock is held from snapshot to append, so concurrent requests on
//! one session are strictly ordered.
//!
//! In the single-shot path only an empty primary answer triggers fallback;
//! transport and HTTP failures propagate. In the streaming path every failure
//! falls back, because a half-written response has no other way to report it.
//! Tokens already relayed before a streaming failure are not retracted.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::{Completion, RelayBackend, StreamingToken};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::messages::{ConversationMessage, SessionId};
use crate::request::{build_user_entry_with_default, RelayInput, DEFAULT_PROMPT};
use crate::session::{Session, SessionRegistry};

/// Orchestrates relay requests against a backend
pub struct Relay<B: RelayBackend> {
    /// Inference backend
    backend: Arc<B>,
    /// Per-session histories
    sessions: Arc<SessionRegistry>,
    /// Prompt substituted for empty user text
    default_prompt: String,
}

impl<B: RelayBackend> Relay<B> {
    /// Create a relay over `backend` and `sessions`
    pub fn new(backend: B, sessions: SessionRegistry) -> Self {
        Self {
            backend: Arc::new(backend),
            sessions: Arc::new(sessions),
            default_prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    /// Create a relay with sessions and prompts taken from configuration
    pub fn from_config(backend: B, config: &RelayConfig) -> Self {
        Self::new(backend, SessionRegistry::from_config(config))
            .with_default_prompt(config.default_prompt.clone())
    }

    /// Set the prompt used when the user sends no text
    #[must_use]
    pub fn with_default_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_prompt = prompt.into();
        self
    }

    /// The backend requests are relayed to
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The session registry
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Relay one request and wait for the whole answer
    ///
    /// # Errors
    ///
    /// Returns the primary call's transport/HTTP error, or the fallback
    /// call's error if the primary answer was empty and fallback failed.
    pub async fn relay(&self, session_id: &SessionId, input: RelayInput) -> RelayResult<String> {
        let shared = self.sessions.get_or_create(session_id);
        let mut session = shared.lock().await;

        let entry = build_user_entry_with_default(&input, &self.default_prompt);
        let outbound = outbound_messages(&session, &entry);

        tracing::info!(
            session = %session_id,
            history = session.len(),
            has_image = entry.image.is_some(),
            "Relaying request"
        );

        let completion = match self.backend.chat(&outbound).await? {
            Completion::NoResponse => {
                tracing::warn!(session = %session_id, "Empty chat answer, falling back to generate");
                self.fallback(&session, &entry).await?
            }
            completion => completion,
        };

        Ok(finish_turn(&mut session, session_id, entry, completion))
    }

    /// Relay one request, writing answer text to `out` as it arrives
    ///
    /// Returns the final answer once the turn is recorded. Dropping the
    /// receiving end of `out` aborts the request without touching history.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Aborted`] if the consumer went away, or the
    /// fallback call's error if streaming failed and fallback failed too.
    pub async fn relay_streaming(
        &self,
        session_id: &SessionId,
        input: RelayInput,
        out: &mpsc::Sender<String>,
    ) -> RelayResult<String> {
        let shared = self.sessions.get_or_create(session_id);
        let mut session = shared.lock().await;

        let entry = build_user_entry_with_default(&input, &self.default_prompt);
        let outbound = outbound_messages(&session, &entry);

        tracing::info!(
            session = %session_id,
            history = session.len(),
            has_image = entry.image.is_some(),
            "Relaying streaming request"
        );

        let completion = match self.stream_primary(&outbound, out).await {
            Ok(Completion::NoResponse) => {
                tracing::warn!(session = %session_id, "Empty stream, falling back to generate");
                self.fallback_to_chunk(&session, &entry, out).await?
            }
            Ok(completion) => completion,
            Err(RelayError::Aborted) => {
                tracing::info!(session = %session_id, "Client went away mid-stream");
                return Err(RelayError::Aborted);
            }
            Err(e) => {
                tracing::warn!(
                    session = %session_id,
                    error = %e,
                    "Stream failed, falling back to generate"
                );
                self.fallback_to_chunk(&session, &entry, out).await?
            }
        };

        Ok(finish_turn(&mut session, session_id, entry, completion))
    }

    /// Consume the primary stream, relaying each token to `out`
    async fn stream_primary(
        &self,
        outbound: &[ConversationMessage],
        out: &mpsc::Sender<String>,
    ) -> RelayResult<Completion> {
        let mut rx = self.backend.chat_streaming(outbound).await?;
        let mut relayed = 0_u32;

        while let Some(token) = rx.recv().await {
            match token {
                StreamingToken::Token(text) => {
                    out.send(text).await.map_err(|_| RelayError::Aborted)?;
                    relayed += 1;
                }
                StreamingToken::Complete { completion } => {
                    tracing::debug!(tokens = relayed, "Stream complete");
                    return Ok(completion);
                }
                StreamingToken::Error(e) => return Err(e),
            }
        }

        Err(RelayError::Transport(
            "stream closed without completing".to_string(),
        ))
    }

    /// Fallback for the streaming path: the whole answer goes out as one chunk
    async fn fallback_to_chunk(
        &self,
        session: &Session,
        entry: &ConversationMessage,
        out: &mpsc::Sender<String>,
    ) -> RelayResult<Completion> {
        let completion = self.fallback(session, entry).await?;
        let chunk = completion.clone().into_text();
        out.send(chunk).await.map_err(|_| RelayError::Aborted)?;
        Ok(completion)
    }

    async fn fallback(
        &self,
        session: &Session,
        entry: &ConversationMessage,
    ) -> RelayResult<Completion> {
        self.backend
            .generate(session.system_prompt(), &entry.content, entry.image.as_deref())
            .await
    }
}

/// History snapshot followed by the new user entry; the session is untouched
fn outbound_messages(session: &Session, entry: &ConversationMessage) -> Vec<ConversationMessage> {
    let mut outbound = session.snapshot();
    outbound.push(entry.clone());
    outbound
}

/// Record the turn and return the answer text
///
/// A turn where both primary and fallback came back empty is not recorded.
fn finish_turn(
    session: &mut Session,
    session_id: &SessionId,
    entry: ConversationMessage,
    completion: Completion,
) -> String {
    match completion {
        Completion::Text(answer) => {
            session.record_turn(entry, answer.clone());
            tracing::debug!(session = %session_id, history = session.len(), "Turn recorded");
            answer
        }
        Completion::NoResponse => {
            tracing::warn!(
                session = %session_id,
                "Primary and fallback both empty, turn not recorded"
            );
            Completion::NoResponse.into_text()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::backend::NO_RESPONSE;
    use crate::messages::MessageRole;

    /// Scripted stream behaviour
    #[derive(Clone)]
    enum StreamScript {
        Tokens(Vec<&'static str>),
        FailAfter(Vec<&'static str>),
        OpenError,
    }

    // Mock backend for testing
    struct MockBackend {
        chat: RelayResult<Completion>,
        stream: StreamScript,
        generate: RelayResult<Completion>,
        chat_calls: Mutex<Vec<Vec<ConversationMessage>>>,
        generate_calls: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl MockBackend {
        fn new(chat: &str, generate: &str) -> Self {
            Self {
                chat: Ok(Completion::from_text(chat)),
                stream: StreamScript::Tokens(vec![]),
                generate: Ok(Completion::from_text(generate)),
                chat_calls: Mutex::new(Vec::new()),
                generate_calls: Mutex::new(Vec::new()),
            }
        }

        fn with_stream(mut self, stream: StreamScript) -> Self {
            self.stream = stream;
            self
        }

        fn with_chat_error(mut self, error: RelayError) -> Self {
            self.chat = Err(error);
            self
        }

        fn with_generate_error(mut self, error: RelayError) -> Self {
            self.generate = Err(error);
            self
        }

        fn generate_count(&self) -> usize {
            self.generate_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RelayBackend for MockBackend {
        fn name(&self) -> &str {
            "Mock"
        }

        fn address(&self) -> &str {
            "mock://"
        }

        fn model(&self) -> &str {
            "mock"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn chat(&self, messages: &[ConversationMessage]) -> RelayResult<Completion> {
            self.chat_calls.lock().unwrap().push(messages.to_vec());
            self.chat.clone()
        }

        async fn chat_streaming(
            &self,
            messages: &[ConversationMessage],
        ) -> RelayResult<mpsc::Receiver<StreamingToken>> {
            self.chat_calls.lock().unwrap().push(messages.to_vec());
            let (tx, rx) = mpsc::channel(10);
            let (tokens, fail) = match self.stream.clone() {
                StreamScript::OpenError => {
                    return Err(RelayError::BackendHttp {
                        status: 500,
                        body: "boom".to_string(),
                    })
                }
                StreamScript::Tokens(tokens) => (tokens, false),
                StreamScript::FailAfter(tokens) => (tokens, true),
            };
            tokio::spawn(async move {
                let mut answer = String::new();
                for token in tokens {
                    answer.push_str(token);
                    let _ = tx.send(StreamingToken::Token(token.to_string())).await;
                }
                let last = if fail {
                    StreamingToken::Error(RelayError::Transport("connection reset".to_string()))
                } else {
                    StreamingToken::Complete {
                        completion: Completion::from_text(answer.trim()),
                    }
                };
                let _ = tx.send(last).await;
            });
            Ok(rx)
        }

        async fn generate(
            &self,
            system: &str,
            prompt: &str,
            image: Option<&str>,
        ) -> RelayResult<Completion> {
            self.generate_calls.lock().unwrap().push((
                system.to_string(),
                prompt.to_string(),
                image.map(str::to_string),
            ));
            self.generate.clone()
        }
    }

    fn relay(backend: MockBackend) -> Relay<MockBackend> {
        Relay::new(backend, SessionRegistry::new("sys", 3))
    }

    async fn history(relay: &Relay<MockBackend>, id: &SessionId) -> Vec<ConversationMessage> {
        relay
            .sessions()
            .get(id)
            .unwrap()
            .lock()
            .await
            .snapshot()
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_relay_records_turn() {
        let relay = relay(MockBackend::new("A screenshot.", "unused"));
        let id = SessionId::default();
        let input = RelayInput::text("what is this").with_image("data:image/png;base64,Zm9v");

        let answer = relay.relay(&id, input).await.unwrap();
        assert_eq!(answer, "A screenshot.");

        let history = history(&relay, &id).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, "what is this");
        assert_eq!(history[1].image.as_deref(), Some("Zm9v"));
        assert_eq!(history[2], ConversationMessage::assistant("A screenshot."));
        assert_eq!(relay.backend().generate_count(), 0);
    }

    #[tokio::test]
    async fn test_outbound_includes_history_and_new_entry() {
        let relay = relay(MockBackend::new("ok", "unused"));
        let id = SessionId::default();
        relay.relay(&id, RelayInput::text("first")).await.unwrap();
        relay.relay(&id, RelayInput::text("second")).await.unwrap();

        let calls = relay.backend().chat_calls.lock().unwrap();
        let roles: Vec<_> = calls[1].iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User
            ]
        );
        assert_eq!(calls[1][3].content, "second");
    }

    #[tokio::test]
    async fn test_empty_chat_falls_back() {
        let relay = relay(MockBackend::new("", "Fallback answer."));
        let id = SessionId::default();
        let input = RelayInput::text("what is this").with_image("data:image/png;base64,Zm9v");

        let answer = relay.relay(&id, input).await.unwrap();
        assert_eq!(answer, "Fallback answer.");

        let history = history(&relay, &id).await;
        assert_eq!(history[2].content, "Fallback answer.");

        let calls = relay.backend().generate_calls.lock().unwrap();
        assert_eq!(
            calls[0],
            (
                "sys".to_string(),
                "what is this".to_string(),
                Some("Zm9v".to_string())
            )
        );
    }

    #[tokio::test]
    async fn test_chat_error_propagates_without_fallback() {
        let backend = MockBackend::new("", "unused").with_chat_error(RelayError::BackendHttp {
            status: 500,
            body: "oops".to_string(),
        });
        let relay = relay(backend);
        let id = SessionId::default();

        let err = relay.relay(&id, RelayInput::text("hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::BackendHttp { status: 500, .. }));
        assert_eq!(relay.backend().generate_count(), 0);
        assert_eq!(history(&relay, &id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_both_empty_returns_marker_without_recording() {
        let relay = relay(MockBackend::new("", ""));
        let id = SessionId::default();

        let answer = relay.relay(&id, RelayInput::text("hi")).await.unwrap();
        assert_eq!(answer, NO_RESPONSE);
        assert_eq!(history(&relay, &id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_history_stays_bounded() {
        let relay = relay(MockBackend::new("ok", "unused"));
        let id = SessionId::default();
        for n in 1..=8 {
            relay.relay(&id, RelayInput::text(format!("q{n}"))).await.unwrap();
            let history = history(&relay, &id).await;
            assert!(history.len() <= 1 + 2 * n.min(3));
            assert_eq!(history[0].role, MessageRole::System);
        }
    }

    #[tokio::test]
    async fn test_streaming_relays_tokens() {
        let backend = MockBackend::new("unused", "unused")
            .with_stream(StreamScript::Tokens(vec!["A ", "screen", "shot."]));
        let relay = relay(backend);
        let id = SessionId::default();
        let (tx, rx) = mpsc::channel(16);

        let answer = relay
            .relay_streaming(&id, RelayInput::text("what is this"), &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(answer, "A screenshot.");
        assert_eq!(collect(rx).await, vec!["A ", "screen", "shot."]);
        assert_eq!(history(&relay, &id).await[2].content, "A screenshot.");
    }

    #[tokio::test]
    async fn test_streaming_matches_single_shot() {
        let tokens = vec!["The ", "window ", "shows ", "a chart."];
        let streaming = relay(
            MockBackend::new("unused", "unused").with_stream(StreamScript::Tokens(tokens.clone())),
        );
        let single = relay(MockBackend::new("The window shows a chart.", "unused"));
        let id = SessionId::default();

        let (tx, rx) = mpsc::channel(16);
        streaming
            .relay_streaming(&id, RelayInput::text("?"), &tx)
            .await
            .unwrap();
        drop(tx);
        let streamed: String = collect(rx).await.concat();

        let answer = single.relay(&id, RelayInput::text("?")).await.unwrap();
        assert_eq!(streamed, answer);
    }

    #[tokio::test]
    async fn test_streaming_failure_falls_back_after_partial_tokens() {
        let backend = MockBackend::new("unused", "Full fallback.")
            .with_stream(StreamScript::FailAfter(vec!["Par", "tial"]));
        let relay = relay(backend);
        let id = SessionId::default();
        let (tx, rx) = mpsc::channel(16);

        let answer = relay
            .relay_streaming(&id, RelayInput::text("hi"), &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(answer, "Full fallback.");
        assert_eq!(collect(rx).await, vec!["Par", "tial", "Full fallback."]);
        let history = history(&relay, &id).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, "Full fallback.");
    }

    #[tokio::test]
    async fn test_streaming_open_error_falls_back() {
        let backend =
            MockBackend::new("unused", "Recovered.").with_stream(StreamScript::OpenError);
        let relay = relay(backend);
        let (tx, rx) = mpsc::channel(16);

        let answer = relay
            .relay_streaming(&SessionId::default(), RelayInput::default(), &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(answer, "Recovered.");
        assert_eq!(collect(rx).await, vec!["Recovered."]);

        let calls = relay.backend().generate_calls.lock().unwrap();
        assert_eq!(calls[0].1, DEFAULT_PROMPT);
    }

    #[tokio::test]
    async fn test_streaming_empty_falls_back() {
        let backend = MockBackend::new("unused", "From generate.")
            .with_stream(StreamScript::Tokens(vec!["  "]));
        let relay = relay(backend);
        let (tx, rx) = mpsc::channel(16);

        let answer = relay
            .relay_streaming(&SessionId::default(), RelayInput::text("hi"), &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(answer, "From generate.");
        assert_eq!(collect(rx).await, vec!["  ", "From generate."]);
    }

    #[tokio::test]
    async fn test_streaming_fallback_error_propagates() {
        let backend = MockBackend::new("unused", "unused")
            .with_stream(StreamScript::OpenError)
            .with_generate_error(RelayError::Timeout {
                address: "mock://".to_string(),
            });
        let relay = relay(backend);
        let id = SessionId::default();
        let (tx, _rx) = mpsc::channel(16);

        let err = relay
            .relay_streaming(&id, RelayInput::text("hi"), &tx)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(history(&relay, &id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_consumer_gone_aborts() {
        let backend = MockBackend::new("unused", "unused")
            .with_stream(StreamScript::Tokens(vec!["a", "b"]));
        let relay = relay(backend);
        let id = SessionId::default();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let err = relay
            .relay_streaming(&id, RelayInput::text("hi"), &tx)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Aborted);
        assert_eq!(history(&relay, &id).await.len(), 1);
        assert_eq!(relay.backend().generate_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_one_session_are_serialized() {
        let relay = Arc::new(relay(MockBackend::new("ok", "unused")));
        let id = SessionId::new("shared");

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let relay = Arc::clone(&relay);
                let id = id.clone();
                tokio::spawn(async move {
                    relay.relay(&id, RelayInput::text(format!("q{i}"))).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = history(&relay, &id).await;
        assert_eq!(history.len(), 7);
        for (idx, msg) in history.iter().enumerate().skip(1) {
            let expected = if idx % 2 == 1 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            assert_eq!(msg.role, expected);
        }
    }
}
