//! Session Management
//!
//! Each session owns a bounded conversation history: the system message at
//! index 0, followed by user/assistant turns in strict alternation. Only the
//! most recent `max_turns` turns are retained.
//!
//! # Concurrency
//!
//! Sessions live in a [`SessionRegistry`] keyed by [`SessionId`]. Each session
//! sits behind its own async mutex; an orchestrator holds that lock for the
//! whole snapshot → backend call → append cycle, so requests on the same
//! session are strictly ordered and requests on different sessions never
//! contend.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::RelayConfig;
use crate::messages::{ConversationMessage, MessageRole, SessionId};

/// Default number of user/assistant turns kept per session
pub const DEFAULT_MAX_TURNS: usize = 12;

/// Session activity, read by the registry's eviction sweep
#[derive(Clone, Debug)]
pub struct SessionMetadata {
    /// When the session last changed (Unix timestamp ms)
    pub last_active_at: u64,
    /// Turns completed over the lifetime of the session, including pruned ones
    pub turns_completed: u64,
}

impl SessionMetadata {
    fn new() -> Self {
        Self {
            last_active_at: now_ms(),
            turns_completed: 0,
        }
    }

    fn touch(&mut self) {
        self.last_active_at = now_ms();
    }

    /// Milliseconds since the last change, as of `now`
    #[must_use]
    pub fn idle_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_active_at)
    }
}

/// A bounded conversation history
#[derive(Clone, Debug)]
pub struct Session {
    /// Unique session ID
    id: SessionId,
    /// System message followed by alternating user/assistant messages
    messages: Vec<ConversationMessage>,
    /// Maximum retained user/assistant pairs
    max_turns: usize,
    /// Session metadata
    metadata: SessionMetadata,
}

impl Session {
    /// Create a new session seeded with the system instruction
    pub fn new(id: SessionId, system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            id,
            messages: vec![ConversationMessage::system(system_prompt)],
            max_turns,
            metadata: SessionMetadata::new(),
        }
    }

    /// Session ID
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Session metadata
    #[must_use]
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Append a message at the tail, then prune back to the bound
    ///
    /// Pruning happens before this call returns, so no caller can observe a
    /// history longer than [`Session::max_len`].
    pub fn append(&mut self, entry: ConversationMessage) {
        if entry.role == MessageRole::Assistant {
            self.metadata.turns_completed += 1;
        }
        self.messages.push(entry);
        self.metadata.touch();
        self.prune_if_needed();
    }

    /// Record a completed turn: the user entry, then the assistant reply
    pub fn record_turn(&mut self, user: ConversationMessage, answer: impl Into<String>) {
        self.append(user);
        self.append(ConversationMessage::assistant(answer));
    }

    /// Copy of the current history for a single backend call
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConversationMessage> {
        self.messages.clone()
    }

    /// Borrow the current history
    #[must_use]
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// The system message (always index 0)
    #[must_use]
    pub fn system_message(&self) -> &ConversationMessage {
        &self.messages[0]
    }

    /// The system instruction text
    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.messages[0].content
    }

    /// Current message count, including the system message
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the session has no turns yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.len() <= 1
    }

    /// Retained turn limit
    #[must_use]
    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Maximum history length: the system message plus `max_turns` pairs
    #[must_use]
    pub fn max_len(&self) -> usize {
        1 + 2 * self.max_turns
    }

    /// Drop every turn, keeping the system message
    pub fn clear_history(&mut self) {
        self.messages.truncate(1);
        self.metadata.touch();
    }

    /// Remove the oldest pairs from just after the system message
    fn prune_if_needed(&mut self) {
        let max_len = self.max_len();
        if self.messages.len() <= max_len {
            return;
        }

        // Whole pairs only; a dangling user entry counts as a pair.
        let excess = self.messages.len() - max_len;
        let to_remove = (excess.div_ceil(2) * 2).min(self.messages.len() - 1);
        self.messages.drain(1..=to_remove);

        tracing::debug!(
            session = %self.id,
            removed = to_remove,
            remaining = self.messages.len(),
            "Pruned session history"
        );
    }
}

/// Shared handle to one session's serialized state
pub type SharedSession = Arc<Mutex<Session>>;

/// Default idle time after which a session may be evicted
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

/// Default cap on live sessions
pub const DEFAULT_MAX_SESSIONS: usize = 256;

/// All live sessions, keyed by ID
///
/// Sessions are evicted once idle longer than the configured TTL, and the
/// least recently active ones make room when `max_sessions` is reached. A
/// session whose lock is held is in use and never evicted.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SharedSession>,
    system_prompt: String,
    max_turns: usize,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create an empty registry; new sessions get `system_prompt` and `max_turns`
    pub fn new(system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            system_prompt: system_prompt.into(),
            max_turns,
            idle_ttl: DEFAULT_SESSION_IDLE,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// Create a registry from relay configuration
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.system_prompt.clone(), config.max_turns)
            .with_limits(config.session_idle, config.max_sessions)
    }

    /// Set the idle TTL and the live-session cap
    #[must_use]
    pub fn with_limits(mut self, idle_ttl: Duration, max_sessions: usize) -> Self {
        self.idle_ttl = idle_ttl;
        self.max_sessions = max_sessions.max(1);
        self
    }

    /// Get a session, creating it on first use
    pub fn get_or_create(&self, id: &SessionId) -> SharedSession {
        if let Some(existing) = self.get(id) {
            return existing;
        }
        self.make_room();

        self.sessions
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!(session = %id, "Created session");
                Arc::new(Mutex::new(Session::new(
                    id.clone(),
                    self.system_prompt.clone(),
                    self.max_turns,
                )))
            })
            .clone()
    }

    /// Get an existing session
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<SharedSession> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Clear a session's turns; returns `false` if it does not exist
    ///
    /// Waits for any in-flight request on the session to finish first.
    pub async fn reset(&self, id: &SessionId) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        session.lock().await.clear_history();
        tracing::info!(session = %id, "Session history cleared");
        true
    }

    /// Forget a session entirely
    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Drop every session idle longer than the TTL; returns how many went
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(now_ms())
    }

    fn evict_idle_at(&self, now: u64) -> usize {
        let ttl_ms = u64::try_from(self.idle_ttl.as_millis()).unwrap_or(u64::MAX);
        let before = self.sessions.len();

        self.sessions.retain(|id, session| {
            // Locked means a request is in flight
            let Ok(session) = session.try_lock() else {
                return true;
            };
            let metadata = session.metadata();
            let idle = metadata.idle_ms(now) >= ttl_ms;
            if idle {
                tracing::info!(
                    session = %id,
                    turns = metadata.turns_completed,
                    idle_ms = metadata.idle_ms(now),
                    "Evicting idle session"
                );
            }
            !idle
        });

        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = self.sessions.len(),
                "Cleaned up idle sessions"
            );
        }
        removed
    }

    /// Ensure a new session fits under the cap
    fn make_room(&self) {
        if self.sessions.len() < self.max_sessions {
            return;
        }
        self.evict_idle();

        while self.sessions.len() >= self.max_sessions {
            let Some(oldest) = self.least_recently_active() else {
                tracing::warn!(
                    live = self.sessions.len(),
                    "Session cap reached with every session busy"
                );
                break;
            };
            tracing::info!(session = %oldest, "Evicting least recently active session");
            self.remove(&oldest);
        }
    }

    /// The unlocked session with the oldest activity
    fn least_recently_active(&self) -> Option<SessionId> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let last_active = entry.value().try_lock().ok()?.metadata().last_active_at;
                Some((last_active, entry.key().clone()))
            })
            .min_by_key(|(last_active, _)| *last_active)
            .map(|(_, id)| id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Turn limit applied to new sessions
    #[must_use]
    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}

/// Get current timestamp in milliseconds
fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
