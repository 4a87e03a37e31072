//! Collaborator interfaces consumed by the engine: the external message
//! store, the identity provider, and a reference in-memory store.
//!
//! The engine only requires that `upsert` apply a partial patch keyed by
//! assistant message id and that patches be idempotent under repeated
//! application.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Lifecycle status of an assistant message bubble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Done,
    Errored,
}

impl MessageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Streaming => "streaming",
            MessageStatus::Done => "done",
            MessageStatus::Errored => "errored",
        }
    }
}

/// A partial update to one assistant message. `None` fields are left
/// untouched by the store; `text` always carries the full accumulated reply
/// so that re-applying a patch is a no-op.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessagePatch {
    pub assistant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_finish_reason: Option<String>,
}

/// External message store mutation API.
pub trait MessageStore: Send + Sync {
    /// Apply a partial patch keyed by assistant message id. Must be
    /// idempotent under repeated application.
    fn upsert(&self, patch: MessagePatch);

    /// Remove a message entirely; used when a superseded or torn-down turn
    /// must leave no partial bubble behind.
    fn remove(&self, assistant_id: &str);
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity attached to outbound requests as headers.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub guest_id: Option<String>,
}

/// Session/identity token provider, external to the engine.
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

/// Fixed identity, for the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Identity);

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> Identity {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Reference store
// ---------------------------------------------------------------------------

/// One materialized message inside [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct StoredMessage {
    pub client_id: Option<String>,
    pub text: String,
    pub status: Option<MessageStatus>,
    pub streaming: bool,
    pub interaction_id: Option<String>,
    pub message_id: Option<String>,
    pub created_at: Option<u64>,
    pub latency_ms: Option<u64>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub client_finish_reason: Option<String>,
}

impl StoredMessage {
    fn apply(&mut self, patch: MessagePatch) {
        if let Some(client_id) = patch.client_id {
            self.client_id = Some(client_id);
        }
        if let Some(text) = patch.text {
            self.text = text;
        }
        if let Some(status) = patch.status {
            self.status = Some(status);
        }
        if let Some(streaming) = patch.streaming {
            self.streaming = streaming;
        }
        if let Some(interaction_id) = patch.interaction_id {
            self.interaction_id = Some(interaction_id);
        }
        if let Some(message_id) = patch.message_id {
            self.message_id = Some(message_id);
        }
        // created_at is write-once: the first non-empty value sticks.
        if self.created_at.is_none() {
            self.created_at = patch.created_at;
        }
        if let Some(latency_ms) = patch.latency_ms {
            self.latency_ms = Some(latency_ms);
        }
        if let Some(model) = patch.model {
            self.model = Some(model);
        }
        if let Some(finish_reason) = patch.finish_reason {
            self.finish_reason = Some(finish_reason);
        }
        if let Some(client_finish_reason) = patch.client_finish_reason {
            self.client_finish_reason = Some(client_finish_reason);
        }
    }
}

/// In-memory [`MessageStore`] used by the CLI driver and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<FxHashMap<String, StoredMessage>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, assistant_id: &str) -> Option<StoredMessage> {
        self.messages.lock().get(assistant_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Snapshot of all messages, for assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, StoredMessage)> {
        self.messages
            .lock()
            .iter()
            .map(|(id, message)| (id.clone(), message.clone()))
            .collect()
    }
}

impl MessageStore for MemoryStore {
    fn upsert(&self, patch: MessagePatch) {
        let mut messages = self.messages.lock();
        let entry = messages.entry(patch.assistant_id.clone()).or_default();
        entry.apply(patch);
    }

    fn remove(&self, assistant_id: &str) {
        self.messages.lock().remove(assistant_id);
    }
}
