//! Message tracking store: the bidirectional map between a client-generated
//! turn id and the server-assigned assistant message id, plus the
//! accumulated-text ledger and the pending-metadata staging area.
//!
//! Owned by the engine and passed explicitly into every handler; there is no
//! process-wide singleton.

use rustc_hash::FxHashMap;

use crate::record::{self, keys, EventEnvelope};

/// Per-assistant-message reply ledger.
///
/// `chunk_index_max` starts at -1; chunks apply in strictly increasing index
/// order and anything at or below the watermark is a duplicate.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub text: String,
    pub chunk_index_max: i64,
}

impl Default for LedgerEntry {
    fn default() -> Self {
        Self {
            text: String::new(),
            chunk_index_max: -1,
        }
    }
}

/// Metadata seen on events before (or while) the assistant message exists.
/// Merging only fills `None` fields, which gives write-once semantics for
/// values like `created_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingMeta {
    pub interaction_id: Option<String>,
    pub message_id: Option<String>,
    pub created_at: Option<u64>,
}

impl PendingMeta {
    pub fn merge_from(&mut self, other: &PendingMeta) {
        if self.interaction_id.is_none() {
            self.interaction_id = other.interaction_id.clone();
        }
        if self.message_id.is_none() {
            self.message_id = other.message_id.clone();
        }
        if self.created_at.is_none() {
            self.created_at = other.created_at;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interaction_id.is_none() && self.message_id.is_none() && self.created_at.is_none()
    }
}

/// Id-like fields extracted from one event, in alias priority order:
/// explicit target id, then client message id variants, then server message
/// id variants.
#[derive(Debug, Clone, Default)]
pub struct EventMeta {
    pub target_id: Option<String>,
    pub client_alias: Option<String>,
    pub message_id: Option<String>,
    pub pending: PendingMeta,
}

impl EventMeta {
    #[must_use]
    pub fn from_envelope(env: &EventEnvelope) -> Self {
        let candidates = env.candidates();
        let target_id = record::pick_str(&candidates, keys::TARGET_ID).map(str::to_string);
        let client_alias = record::pick_str(&candidates, keys::CLIENT_ID).map(str::to_string);
        let message_id = record::pick_str(&candidates, keys::MESSAGE_ID).map(str::to_string);
        let pending = PendingMeta {
            interaction_id: record::pick_str(&candidates, keys::INTERACTION_ID)
                .map(str::to_string),
            message_id: message_id.clone(),
            created_at: record::pick_u64(&candidates, keys::CREATED_AT),
        };
        Self {
            target_id,
            client_alias,
            message_id,
            pending,
        }
    }

    /// Alias keys in resolution priority order, skipping empties.
    fn alias_keys<'a>(&'a self, client_id: &'a str) -> impl Iterator<Item = &'a str> {
        [
            self.target_id.as_deref(),
            Some(client_id),
            self.client_alias.as_deref(),
            self.message_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|key| !key.is_empty())
    }
}

/// Outcome of [`MessageTracker::ensure_assistant_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensure {
    /// A mapping already existed; new metadata was merged in.
    Existing(String),
    /// A new assistant message was allocated with status streaming.
    Created(String),
    /// No message exists and creation was not allowed; metadata was staged.
    /// This is an explicit state distinct from "no message yet".
    NoMessage,
}

impl Ensure {
    #[must_use]
    pub fn assistant_id(&self) -> Option<&str> {
        match self {
            Ensure::Existing(id) | Ensure::Created(id) => Some(id),
            Ensure::NoMessage => None,
        }
    }
}

/// Tracks client↔assistant id mappings, ledgers, and staged metadata for the
/// lifetime of a conversation.
#[derive(Debug, Default)]
pub struct MessageTracker {
    alias_to_assistant: FxHashMap<String, String>,
    assistant_to_client: FxHashMap<String, String>,
    ledgers: FxHashMap<String, LedgerEntry>,
    meta: FxHashMap<String, PendingMeta>,
    canonical_keys: FxHashMap<String, String>,
    pending: FxHashMap<String, PendingMeta>,
    pending_aliases: FxHashMap<String, String>,
    last_user_input: FxHashMap<String, String>,
}

impl MessageTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve or create the assistant message for `client_id`.
    ///
    /// See [`Ensure`] for the three outcomes. When creating, all alias keys
    /// derivable from the event are registered, the ledger entry is seeded
    /// empty, and any metadata staged earlier for this client id is merged.
    pub fn ensure_assistant_message(
        &mut self,
        client_id: &str,
        meta: &EventMeta,
        allow_create: bool,
    ) -> Ensure {
        if let Some(assistant_id) = self.resolve(client_id, meta) {
            self.register_aliases(client_id, meta, &assistant_id);
            if let Some(stored) = self.meta.get_mut(&assistant_id) {
                stored.merge_from(&meta.pending);
            }
            return Ensure::Existing(assistant_id);
        }

        if !allow_create {
            self.stage_pending(client_id, meta);
            return Ensure::NoMessage;
        }

        let assistant_id = format!("am-{}", uuid::Uuid::new_v4().simple());
        // Tie-break: the first non-empty alias in priority order becomes the
        // canonical key for write-once fields.
        let canonical = meta
            .alias_keys(client_id)
            .next()
            .unwrap_or(client_id)
            .to_string();

        let mut merged = self.take_staged(client_id, meta);
        merged.merge_from(&meta.pending);

        self.register_aliases(client_id, meta, &assistant_id);
        self.assistant_to_client
            .insert(assistant_id.clone(), client_id.to_string());
        self.ledgers
            .insert(assistant_id.clone(), LedgerEntry::default());
        self.meta.insert(assistant_id.clone(), merged);
        self.canonical_keys.insert(assistant_id.clone(), canonical);
        Ensure::Created(assistant_id)
    }

    /// Delete the ledger entry and every alias mapping pointing to
    /// `assistant_id`, so no stale partial message survives a teardown.
    pub fn remove_entry(&mut self, assistant_id: &str) {
        self.ledgers.remove(assistant_id);
        self.meta.remove(assistant_id);
        self.canonical_keys.remove(assistant_id);
        if let Some(client_id) = self.assistant_to_client.remove(assistant_id) {
            self.pending.remove(&client_id);
        }
        self.alias_to_assistant
            .retain(|_, mapped| mapped != assistant_id);
    }

    /// Purge everything this turn staged or mapped, whether it finalized
    /// cleanly or was torn down.
    pub fn purge_turn(&mut self, client_id: &str) {
        if let Some(assistant_id) = self.alias_to_assistant.get(client_id).cloned() {
            self.remove_entry(&assistant_id);
        }
        self.pending.remove(client_id);
        self.pending_aliases
            .retain(|_, mapped| mapped != client_id);
        self.last_user_input.remove(client_id);
    }

    #[must_use]
    pub fn assistant_for(&self, key: &str) -> Option<&str> {
        self.alias_to_assistant.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn has_message(&self, client_id: &str) -> bool {
        self.alias_to_assistant.contains_key(client_id)
    }

    #[must_use]
    pub fn ledger(&self, assistant_id: &str) -> Option<&LedgerEntry> {
        self.ledgers.get(assistant_id)
    }

    pub fn ledger_mut(&mut self, assistant_id: &str) -> Option<&mut LedgerEntry> {
        self.ledgers.get_mut(assistant_id)
    }

    #[must_use]
    pub fn meta(&self, assistant_id: &str) -> Option<&PendingMeta> {
        self.meta.get(assistant_id)
    }

    #[must_use]
    pub fn canonical_key(&self, assistant_id: &str) -> Option<&str> {
        self.canonical_keys.get(assistant_id).map(String::as_str)
    }

    /// Record the user utterance that started this turn; echo suppression
    /// compares the first chunk against it.
    pub fn record_user_input(&mut self, client_id: &str, text: &str) {
        self.last_user_input
            .insert(client_id.to_string(), text.to_string());
    }

    #[must_use]
    pub fn last_user_input(&self, client_id: &str) -> Option<&str> {
        self.last_user_input.get(client_id).map(String::as_str)
    }

    fn resolve(&self, client_id: &str, meta: &EventMeta) -> Option<String> {
        meta.alias_keys(client_id)
            .find_map(|key| self.alias_to_assistant.get(key))
            .cloned()
    }

    fn register_aliases(&mut self, client_id: &str, meta: &EventMeta, assistant_id: &str) {
        let keys: Vec<String> = meta.alias_keys(client_id).map(str::to_string).collect();
        for key in keys {
            self.alias_to_assistant
                .entry(key)
                .or_insert_with(|| assistant_id.to_string());
        }
    }

    fn stage_pending(&mut self, client_id: &str, meta: &EventMeta) {
        // Stage under the original client key even when this event referenced
        // the turn through a different alias.
        let staging_key = if self.pending.contains_key(client_id) {
            client_id.to_string()
        } else {
            meta.alias_keys(client_id)
                .find_map(|key| self.pending_aliases.get(key))
                .cloned()
                .unwrap_or_else(|| client_id.to_string())
        };

        for key in [meta.target_id.as_deref(), meta.message_id.as_deref()]
            .into_iter()
            .flatten()
        {
            self.pending_aliases
                .entry(key.to_string())
                .or_insert_with(|| staging_key.clone());
        }

        self.pending
            .entry(staging_key)
            .or_default()
            .merge_from(&meta.pending);
    }

    fn take_staged(&mut self, client_id: &str, meta: &EventMeta) -> PendingMeta {
        if let Some(staged) = self.pending.remove(client_id) {
            return staged;
        }
        let via_alias = meta
            .alias_keys(client_id)
            .find_map(|key| self.pending_aliases.get(key))
            .cloned();
        if let Some(key) = via_alias {
            if let Some(staged) = self.pending.remove(&key) {
                return staged;
            }
        }
        PendingMeta::default()
    }
}
