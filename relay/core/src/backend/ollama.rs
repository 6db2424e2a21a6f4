//! Ollama Backend Implementation
//!
//! Relay backend for Ollama (local multimodal inference server).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history (streaming or batch)
//! - `/api/generate` - Single-prompt completions, used for fallback
//! - `/api/tags` - List available models (health check)

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use super::response::BackendReply;
use super::stream::{StreamEvent, StreamState};
use super::traits::{Completion, RelayBackend, SamplingOptions, StreamingToken};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::messages::{ConversationMessage, MessageRole};

/// Default Ollama address
pub const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";

/// Chat message in the Ollama wire format
#[derive(Serialize)]
struct WireMessage<'a> {
    role: MessageRole,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<[&'a str; 1]>,
}

impl<'a> From<&'a ConversationMessage> for WireMessage<'a> {
    fn from(msg: &'a ConversationMessage) -> Self {
        Self {
            role: msg.role,
            content: &msg.content,
            images: msg.image.as_deref().map(|image| [image]),
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: &'a SamplingOptions,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: String,
    images: Vec<&'a str>,
    stream: bool,
    options: &'a SamplingOptions,
}

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Base URL, scheme included, no trailing slash
    host: String,
    /// Model identifier
    model: String,
    /// Sampling options sent with every request
    options: SamplingOptions,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// `host` may omit the scheme (`localhost:11434`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(host: impl AsRef<str>, model: impl Into<String>) -> RelayResult<Self> {
        Self::with_timeout(host, model, Duration::from_secs(120))
    }

    /// Create a new Ollama backend with a request timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_timeout(
        host: impl AsRef<str>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> RelayResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            host: normalize_host(host.as_ref()),
            model: model.into(),
            options: SamplingOptions::default(),
            http_client,
        })
    }

    /// Create from relay configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &RelayConfig) -> RelayResult<Self> {
        Ok(
            Self::with_timeout(&config.ollama_host, config.model.clone(), config.request_timeout)?
                .with_options(config.sampling.clone()),
        )
    }

    /// Replace the sampling options
    #[must_use]
    pub fn with_options(mut self, options: SamplingOptions) -> Self {
        self.options = options;
        self
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.host)
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.host)
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.host)
    }

    /// Build the single-turn prompt: system instruction, then the user text
    fn build_prompt(system: &str, prompt: &str) -> String {
        let mut full_prompt = String::new();
        if !system.is_empty() {
            full_prompt.push_str(system);
            full_prompt.push_str("\n\n");
        }
        full_prompt.push_str("User: ");
        full_prompt.push_str(prompt);
        full_prompt
    }

    fn chat_body<'a>(&'a self, messages: &'a [ConversationMessage], stream: bool) -> ChatBody<'a> {
        ChatBody {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            stream,
            options: &self.options,
        }
    }

    /// POST `body` to `url`, mapping transport failures and non-success statuses
    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> RelayResult<reqwest::Response> {
        let response = self
            .http_client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::from_reqwest(&e, &self.host))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::BackendHttp { status, body });
        }

        Ok(response)
    }

    /// Read a single-shot JSON response into a completion
    async fn read_completion(&self, response: reqwest::Response) -> RelayResult<Completion> {
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::from_reqwest(&e, &self.host))?;
        let data: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| RelayError::Decode(e.to_string()))?;
        Ok(BackendReply::parse(&data).completion())
    }
}

#[async_trait]
impl RelayBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    fn address(&self) -> &str {
        &self.host
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn chat(&self, messages: &[ConversationMessage]) -> RelayResult<Completion> {
        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            "Sending chat request"
        );
        let response = self
            .post(&self.chat_url(), &self.chat_body(messages, false))
            .await?;
        self.read_completion(response).await
    }

    async fn chat_streaming(
        &self,
        messages: &[ConversationMessage],
    ) -> RelayResult<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(100);

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            "Opening chat stream"
        );
        let response = self
            .post(&self.chat_url(), &self.chat_body(messages, true))
            .await?;

        let mut stream = response.bytes_stream();
        let host = self.host.clone();

        // Spawn task to process stream
        tokio::spawn(async move {
            let mut state = StreamState::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(StreamingToken::Error(RelayError::from_reqwest(&e, &host)))
                            .await;
                        return;
                    }
                };

                for event in state.push_bytes(&bytes) {
                    if !forward(&tx, event).await {
                        return;
                    }
                }
                if state.is_done() {
                    break;
                }
            }

            for event in state.finish() {
                if !forward(&tx, event).await {
                    return;
                }
            }

            let _ = tx
                .send(StreamingToken::Complete {
                    completion: state.into_completion(),
                })
                .await;
        });

        Ok(rx)
    }

    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        image: Option<&str>,
    ) -> RelayResult<Completion> {
        let body = GenerateBody {
            model: &self.model,
            prompt: Self::build_prompt(system, prompt),
            images: image.into_iter().collect(),
            stream: false,
            options: &self.options,
        };

        tracing::debug!(
            model = %self.model,
            has_image = image.is_some(),
            "Sending generate request"
        );
        let response = self.post(&self.generate_url(), &body).await?;
        self.read_completion(response).await
    }
}

/// Forward one decoded event; returns `false` when streaming should stop
async fn forward(tx: &mpsc::Sender<StreamingToken>, event: StreamEvent) -> bool {
    match event {
        StreamEvent::Delta(text) => {
            tracing::trace!(token = %text, "Stream token");
            // Receiver dropped, stop streaming
            tx.send(StreamingToken::Token(text)).await.is_ok()
        }
        StreamEvent::Failed(error) => {
            let _ = tx
                .send(StreamingToken::Error(RelayError::BackendReported(error)))
                .await;
            false
        }
        StreamEvent::Done => true,
    }
}

/// Ensure a scheme and strip trailing slashes
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}
