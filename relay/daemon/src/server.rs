//! HTTP Server
//!
//! Routes:
//!
//! | Method   | Path                 | Response                                  |
//! |----------|----------------------|-------------------------------------------|
//! | `POST`   | `/api/relay`         | `{ "feedback": "..." }`                   |
//! | `POST`   | `/api/relay/stream`  | chunked `text/plain`, raw answer text     |
//! | `GET`    | `/api/health`        | `{ "status", "backend", "model" }`        |
//! | `DELETE` | `/api/sessions/:id`  | `204`, or `404` for an unknown session    |
//!
//! Failures are `{ "error": "..." }` with `504` for timeouts and aborts,
//! otherwise `500`. A streaming failure after the first byte cannot change the
//! status any more; the body just ends.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use relay_core::{Relay, RelayBackend, RelayError, RelayInput, SessionId};

/// Chunks buffered between the relay task and the response body
const STREAM_BUFFER: usize = 64;

/// Inbound relay request body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    /// User text
    #[serde(default)]
    pub message: Option<String>,
    /// Raw base64 or data-URL screenshot
    #[serde(default)]
    pub image_base64: Option<String>,
    /// Conversation to continue; absent means the default session
    #[serde(default)]
    pub session_id: Option<String>,
}

impl RelayRequest {
    fn into_parts(self) -> (SessionId, RelayInput) {
        let session_id = SessionId::from_optional(self.session_id.as_deref());
        let input = RelayInput {
            message: self.message,
            image: self.image_base64,
        };
        (session_id, input)
    }
}

#[derive(Debug, Serialize)]
struct FeedbackBody {
    feedback: String,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    backend: bool,
    model: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Relay failure mapped onto the HTTP error contract
#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Shared handler state
pub struct AppState<B: RelayBackend> {
    relay: Arc<Relay<B>>,
}

// Manual impl: `B` itself need not be `Clone`
impl<B: RelayBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            relay: Arc::clone(&self.relay),
        }
    }
}

/// Build the daemon router
pub fn router<B: RelayBackend + 'static>(relay: Arc<Relay<B>>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/relay", post(relay_once::<B>))
        .route("/api/relay/stream", post(relay_stream::<B>))
        .route("/api/health", get(health::<B>))
        .route("/api/sessions/:id", delete(reset_session::<B>))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(AppState { relay })
}

async fn relay_once<B: RelayBackend + 'static>(
    State(state): State<AppState<B>>,
    Json(request): Json<RelayRequest>,
) -> Result<Json<FeedbackBody>, ApiError> {
    let (session_id, input) = request.into_parts();
    let feedback = state.relay.relay(&session_id, input).await.map_err(|e| {
        tracing::warn!(session = %session_id, error = %e, "Relay failed");
        ApiError(e)
    })?;
    Ok(Json(FeedbackBody { feedback }))
}

async fn relay_stream<B: RelayBackend + 'static>(
    State(state): State<AppState<B>>,
    Json(request): Json<RelayRequest>,
) -> Response {
    let (session_id, input) = request.into_parts();
    let (tx, mut rx) = mpsc::channel::<String>(STREAM_BUFFER);
    let (result_tx, result_rx) = oneshot::channel();

    let relay = Arc::clone(&state.relay);
    tokio::spawn(async move {
        let result = relay.relay_streaming(&session_id, input, &tx).await;
        if let Err(e) = &result {
            tracing::warn!(session = %session_id, error = %e, "Streaming relay failed");
        }
        // Close the body before reporting, so the handler sees end-of-stream first
        drop(tx);
        let _ = result_tx.send(result);
    });

    // Status and headers are decided by whether anything arrives at all
    let Some(first) = rx.recv().await else {
        return match result_rx.await {
            Ok(Err(e)) => ApiError(e).into_response(),
            Ok(Ok(_)) => text_response(Body::empty()),
            Err(_) => ApiError(RelayError::Aborted).into_response(),
        };
    };

    let chunks = tokio_stream::once(first)
        .chain(ReceiverStream::new(rx))
        .map(Ok::<_, Infallible>);
    text_response(Body::from_stream(chunks))
}

fn text_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn health<B: RelayBackend + 'static>(State(state): State<AppState<B>>) -> Json<HealthBody> {
    let backend = state.relay.backend();
    let reachable = backend.health_check().await;
    if !reachable {
        tracing::warn!(address = backend.address(), "Backend health check failed");
    }
    Json(HealthBody {
        status: "ok",
        backend: reachable,
        model: backend.model().to_string(),
    })
}

async fn reset_session<B: RelayBackend + 'static>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
) -> StatusCode {
    let session_id = SessionId::from_optional(Some(id.as_str()));
    if state.relay.sessions().reset(&session_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
