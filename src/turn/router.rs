//! Event router and turn state machine.
//!
//! Interprets each parsed frame by kind and drives the tracker, the text
//! assembly, the watchdogs, and the external message store. Owns the phase
//! transitions `started → (prompt_ready)? → streaming → done | aborted |
//! errored` and the idempotent terminal `done`.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::record::{keys, EventEnvelope, Record};
use crate::store::{MessagePatch, MessageStatus, MessageStore};
use crate::stream::Frame;
use crate::turn::assembly::{self, ChunkEvent, ChunkOutcome};
use crate::turn::tracker::{EventMeta, MessageTracker};
use crate::turn::watchdog::Watchdogs;

/// Inline notice appended when the server reports a recognized transient
/// internal error instead of finishing the reply.
const TRANSIENT_NOTICE: &str =
    "Desculpe, tivemos um problema temporário. Tente novamente em instantes.";

// ---------------------------------------------------------------------------
// Event classification
// ---------------------------------------------------------------------------

/// Recognized inbound event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PromptReady,
    Chunk,
    Meta,
    Done,
    Error,
    Unknown,
}

/// Classify a frame by its declared event name, falling back to payload
/// shape for unnamed data frames.
#[must_use]
pub fn classify(frame: &Frame, env: &EventEnvelope) -> EventKind {
    let name = frame
        .event
        .as_deref()
        .or_else(|| env.str_field(&["event", "type"]));
    match name {
        Some("prompt_ready" | "promptReady") => EventKind::PromptReady,
        Some("chunk" | "message" | "delta") => EventKind::Chunk,
        Some("done" | "complete") => EventKind::Done,
        Some("error") => EventKind::Error,
        Some("control") => match env.str_field(keys::CONTROL_NAME) {
            Some("done" | "complete") => EventKind::Done,
            Some("meta" | "metadata") => EventKind::Meta,
            _ => EventKind::Unknown,
        },
        Some(_) => EventKind::Unknown,
        None => {
            // Unnamed data frame: infer from the payload.
            if env.i64_field(keys::INDEX).is_some() || env.str_field(keys::TEXT).is_some() {
                EventKind::Chunk
            } else if env.str_field(keys::FINISH_REASON).is_some() || !env.response.is_empty() {
                EventKind::Done
            } else {
                EventKind::Unknown
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Finish reasons and run stats
// ---------------------------------------------------------------------------

/// Client-assigned finish reason, distinct from the server's: set when this
/// side decided how the turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFinishReason {
    StreamAborted,
    NoChunksEmitted,
    NoTextBeforeDone,
    FirstTokenTimeout,
    HeartbeatTimeout,
    GuardFallback,
    TransientServerError,
    StreamClosed,
}

impl ClientFinishReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ClientFinishReason::StreamAborted => "stream_aborted",
            ClientFinishReason::NoChunksEmitted => "no_chunks_emitted",
            ClientFinishReason::NoTextBeforeDone => "no_text_before_done",
            ClientFinishReason::FirstTokenTimeout => "first_token_timeout",
            ClientFinishReason::HeartbeatTimeout => "heartbeat_timeout",
            ClientFinishReason::GuardFallback => "guard_fallback",
            ClientFinishReason::TransientServerError => "transient_server_error",
            ClientFinishReason::StreamClosed => "stream_closed",
        }
    }
}

/// Ephemeral per-turn stats, attached to the finalized message and logged.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub aggregated_len: usize,
    pub chunk_seen: bool,
    pub last_meta: Option<Record>,
    pub finish_reason: Option<String>,
    pub client_finish_reason: Option<ClientFinishReason>,
    pub model: Option<String>,
    pub fallback_attempts: u32,
    pub prompt_ready_latency: Option<Duration>,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Started,
    PromptReady,
    Streaming,
    Done,
    Aborted,
    Errored,
}

impl TurnPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnPhase::Done | TurnPhase::Aborted | TurnPhase::Errored
        )
    }
}

/// What the read loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterAction {
    Continue,
    Finished,
}

/// Per-turn router. Collaborators (tracker, store, watchdogs) are passed into
/// every call; the router itself owns only the phase and the run stats.
pub struct TurnRouter {
    client_id: String,
    phase: TurnPhase,
    stats: RunStats,
    fatal: Option<StreamError>,
    final_assistant_id: Option<String>,
    final_text: String,
}

impl TurnRouter {
    #[must_use]
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            phase: TurnPhase::Started,
            stats: RunStats::default(),
            fatal: None,
            final_assistant_id: None,
            final_text: String::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    #[must_use]
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// A fatal error captured inside the read loop, surfaced only after the
    /// loop unwinds.
    pub fn take_fatal(&mut self) -> Option<StreamError> {
        self.fatal.take()
    }

    /// Assistant message id the turn ended with, surviving the tracker purge.
    #[must_use]
    pub fn final_assistant_id(&self) -> Option<&str> {
        self.final_assistant_id.as_deref()
    }

    #[must_use]
    pub fn final_text(&self) -> &str {
        &self.final_text
    }

    pub fn handle_frame(
        &mut self,
        tracker: &mut MessageTracker,
        store: &dyn MessageStore,
        dogs: &mut Watchdogs,
        frame: &Frame,
    ) -> RouterAction {
        if self.phase.is_terminal() {
            // Stale frames after a terminal transition are ignored.
            return RouterAction::Finished;
        }

        // Malformed payloads parse to an empty envelope; classification and
        // the handlers degrade gracefully, so the frame is never fatal.
        let env = EventEnvelope::parse(&frame.data);
        dogs.note_activity();

        match classify(frame, &env) {
            EventKind::PromptReady => {
                let meta = EventMeta::from_envelope(&env);
                tracker.ensure_assistant_message(&self.client_id, &meta, false);
                dogs.note_prompt_ready();
                self.stats.prompt_ready_latency = dogs.prompt_ready_latency();
                if self.phase == TurnPhase::Started {
                    self.phase = TurnPhase::PromptReady;
                }
                debug!(client_id = %self.client_id, "prompt acknowledged");
                RouterAction::Continue
            }
            EventKind::Chunk => {
                let chunk = ChunkEvent::from_envelope(&env);
                match assembly::apply_chunk(tracker, &self.client_id, &chunk) {
                    ChunkOutcome::Applied {
                        assistant_id,
                        patch,
                        created,
                    } => {
                        if let Some(text) = patch.text.as_deref() {
                            self.stats.aggregated_len = text.len();
                        }
                        self.stats.chunk_seen = true;
                        store.upsert(patch);
                        dogs.note_first_token();
                        self.phase = TurnPhase::Streaming;
                        debug!(
                            client_id = %self.client_id,
                            assistant_id = %assistant_id,
                            created,
                            index = chunk.index,
                            "chunk applied"
                        );
                    }
                    ChunkOutcome::Suppressed(reason) => {
                        debug!(
                            client_id = %self.client_id,
                            index = chunk.index,
                            ?reason,
                            "chunk suppressed"
                        );
                    }
                }
                RouterAction::Continue
            }
            EventKind::Meta => {
                self.merge_meta(&env);
                RouterAction::Continue
            }
            EventKind::Done => {
                self.finalize(tracker, store, dogs, Some(&env), None);
                RouterAction::Finished
            }
            EventKind::Error => self.handle_error(tracker, store, dogs, &env),
            EventKind::Unknown => {
                debug!(client_id = %self.client_id, event = ?frame.event, "unrecognized event");
                RouterAction::Continue
            }
        }
    }

    fn merge_meta(&mut self, env: &EventEnvelope) {
        if let Some(reason) = env.str_field(keys::FINISH_REASON) {
            self.stats.finish_reason = Some(reason.to_string());
        }
        if let Some(model) = env.str_field(keys::MODEL) {
            self.stats.model = Some(model.to_string());
        }
        if !env.metadata.is_empty() {
            self.stats.last_meta = Some(env.metadata.clone());
        }
    }

    fn handle_error(
        &mut self,
        tracker: &mut MessageTracker,
        store: &dyn MessageStore,
        dogs: &mut Watchdogs,
        env: &EventEnvelope,
    ) -> RouterAction {
        let reason = env.str_field(keys::ERROR_REASON).unwrap_or_default();
        let message = env
            .str_field(keys::ERROR_MESSAGE)
            .unwrap_or("stream error")
            .to_string();

        if is_transient_server_error(reason) {
            warn!(
                client_id = %self.client_id,
                reason,
                "transient server error, completing with inline notice"
            );
            let meta = EventMeta::from_envelope(env);
            if let Some(assistant_id) = tracker
                .ensure_assistant_message(&self.client_id, &meta, true)
                .assistant_id()
                .map(str::to_string)
            {
                if let Some(ledger) = tracker.ledger_mut(&assistant_id) {
                    if !ledger.text.is_empty() {
                        ledger.text.push_str("\n\n");
                    }
                    ledger.text.push_str(TRANSIENT_NOTICE);
                }
            }
            self.finalize(
                tracker,
                store,
                dogs,
                None,
                Some(ClientFinishReason::TransientServerError),
            );
            return RouterAction::Finished;
        }

        // Fatal: captured here, surfaced after the read loop unwinds.
        self.fatal = Some(StreamError::ServerReported(if reason.is_empty() {
            message
        } else {
            format!("{reason}: {message}")
        }));
        RouterAction::Finished
    }

    /// Terminal `done` transition. Idempotent: a second call for the same
    /// turn is a no-op and returns `false`.
    ///
    /// Reconciles the ledger's accumulated text with the optional
    /// authoritative payload on the `done` frame, writes the final patch
    /// (`streaming = false`, terminal status, resolved metadata), and purges
    /// the turn's tracking state.
    pub fn finalize(
        &mut self,
        tracker: &mut MessageTracker,
        store: &dyn MessageStore,
        dogs: &Watchdogs,
        payload: Option<&EventEnvelope>,
        client_reason: Option<ClientFinishReason>,
    ) -> bool {
        if self.phase.is_terminal() {
            return false;
        }

        if let Some(env) = payload {
            self.merge_meta(env);
        }
        let payload_text = payload
            .and_then(|env| env.str_field(keys::TEXT))
            .map(str::to_string);

        // Latest ledger snapshot, never a stale capture.
        let ledger_text = tracker
            .assistant_for(&self.client_id)
            .and_then(|id| tracker.ledger(id))
            .map(|entry| entry.text.clone())
            .unwrap_or_default();
        let final_text =
            authoritative_text(&ledger_text, payload_text.as_deref()).to_string();

        let mut reason = client_reason.or(self.stats.client_finish_reason);
        if final_text.is_empty() && self.stats.prompt_ready_latency.is_some() && reason.is_none() {
            // The server engaged but the turn ended with zero content:
            // diagnostic finish reason, not a user-facing error.
            reason = Some(if self.stats.chunk_seen {
                ClientFinishReason::NoTextBeforeDone
            } else {
                ClientFinishReason::NoChunksEmitted
            });
        }
        self.stats.client_finish_reason = reason;
        self.stats.aggregated_len = final_text.len();

        let meta = payload.map(EventMeta::from_envelope).unwrap_or_default();
        let assistant_id = if tracker.has_message(&self.client_id) {
            tracker.assistant_for(&self.client_id).map(str::to_string)
        } else if final_text.is_empty() {
            None
        } else {
            tracker
                .ensure_assistant_message(&self.client_id, &meta, true)
                .assistant_id()
                .map(str::to_string)
        };

        if let Some(assistant_id) = &assistant_id {
            let stored_meta = tracker.meta(assistant_id).cloned().unwrap_or_default();
            let latency = dogs
                .first_token_latency()
                .unwrap_or_else(|| dogs.elapsed());
            store.upsert(MessagePatch {
                assistant_id: assistant_id.clone(),
                client_id: Some(self.client_id.clone()),
                text: Some(final_text.clone()),
                status: Some(MessageStatus::Done),
                streaming: Some(false),
                interaction_id: stored_meta
                    .interaction_id
                    .or(meta.pending.interaction_id),
                message_id: stored_meta.message_id.or(meta.pending.message_id),
                created_at: stored_meta.created_at.or(meta.pending.created_at),
                latency_ms: Some(latency.as_millis() as u64),
                model: self.stats.model.clone(),
                finish_reason: self.stats.finish_reason.clone(),
                client_finish_reason: reason.map(|r| r.as_str().to_string()),
            });
        }

        info!(
            client_id = %self.client_id,
            assistant_id = assistant_id.as_deref(),
            text_len = final_text.len(),
            chunk_seen = self.stats.chunk_seen,
            finish_reason = self.stats.finish_reason.as_deref(),
            client_finish_reason = reason.map(ClientFinishReason::as_str),
            fallback_attempts = self.stats.fallback_attempts,
            prompt_ready_ms = self.stats.prompt_ready_latency.map(|d| d.as_millis() as u64),
            last_meta = ?self.stats.last_meta,
            "turn finalized"
        );

        self.final_assistant_id = assistant_id;
        self.final_text = final_text;
        tracker.purge_turn(&self.client_id);
        self.phase = TurnPhase::Done;
        true
    }

    /// Finalize from a fallback JSON response: the body is treated as an
    /// authoritative `done` payload.
    pub fn finalize_from_fallback(
        &mut self,
        tracker: &mut MessageTracker,
        store: &dyn MessageStore,
        dogs: &Watchdogs,
        body: &EventEnvelope,
    ) -> bool {
        self.stats.fallback_attempts += 1;
        self.finalize(
            tracker,
            store,
            dogs,
            Some(body),
            Some(ClientFinishReason::GuardFallback),
        )
    }

    /// Tear the turn down because a newer turn superseded it or the caller
    /// cancelled. No error is surfaced; if the turn never produced visible
    /// content its assistant message is removed entirely.
    pub fn abort(
        &mut self,
        tracker: &mut MessageTracker,
        store: &dyn MessageStore,
        reason: ClientFinishReason,
    ) {
        if self.phase.is_terminal() {
            return;
        }
        if let Some(assistant_id) = tracker.assistant_for(&self.client_id).map(str::to_string) {
            let text = tracker
                .ledger(&assistant_id)
                .map(|entry| entry.text.clone())
                .unwrap_or_default();
            if text.is_empty() {
                // An empty placeholder bubble must not linger.
                store.remove(&assistant_id);
            } else {
                store.upsert(MessagePatch {
                    assistant_id: assistant_id.clone(),
                    status: Some(MessageStatus::Done),
                    streaming: Some(false),
                    client_finish_reason: Some(reason.as_str().to_string()),
                    ..MessagePatch::default()
                });
                self.final_assistant_id = Some(assistant_id);
                self.final_text = text;
            }
        }
        tracker.purge_turn(&self.client_id);
        self.stats.client_finish_reason = Some(reason);
        self.phase = TurnPhase::Aborted;
        info!(client_id = %self.client_id, reason = reason.as_str(), "turn aborted");
    }

    /// Tear the turn down on a fatal error. Partial content is marked
    /// errored rather than removed; an empty placeholder is removed.
    pub fn fail(&mut self, tracker: &mut MessageTracker, store: &dyn MessageStore) {
        if self.phase.is_terminal() {
            return;
        }
        if let Some(assistant_id) = tracker.assistant_for(&self.client_id).map(str::to_string) {
            let visible = tracker
                .ledger(&assistant_id)
                .is_some_and(|entry| !entry.text.is_empty());
            if visible {
                store.upsert(MessagePatch {
                    assistant_id: assistant_id.clone(),
                    status: Some(MessageStatus::Errored),
                    streaming: Some(false),
                    ..MessagePatch::default()
                });
            } else {
                store.remove(&assistant_id);
            }
        }
        tracker.purge_turn(&self.client_id);
        self.phase = TurnPhase::Errored;
    }
}

// ---------------------------------------------------------------------------
// Finalization policy
// ---------------------------------------------------------------------------

/// Pick the final text: the authoritative payload wins when it is non-empty
/// and differs from the ledger after whitespace normalization; otherwise the
/// ledger stands.
#[must_use]
pub fn authoritative_text<'a>(ledger: &'a str, payload: Option<&'a str>) -> &'a str {
    match payload {
        Some(payload)
            if !payload.is_empty()
                && assembly::sanitize(payload) != assembly::sanitize(ledger) =>
        {
            payload
        }
        _ => ledger,
    }
}

fn is_transient_server_error(reason: &str) -> bool {
    let normalized: String = reason
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_");
    normalized.contains("internal_error")
}
