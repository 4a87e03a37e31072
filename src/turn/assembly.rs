//! Text assembly: applies incoming fragments to the reply ledger, enforcing
//! monotonic ordering, echo suppression, and glue-spacing rules, and produces
//! the partial-state patch pushed into the message store.

use crate::record::{self, keys, EventEnvelope, Record};
use crate::store::{MessagePatch, MessageStatus};
use crate::turn::tracker::{Ensure, EventMeta, MessageTracker};

const FIRST_FLAG_KEYS: &[&str] = &["first", "is_first", "isFirst"];
const PATCH_SOURCE_STREAM_INIT: &str = "stream_init";

/// One incremental fragment, decoded from a `chunk`/`message` event.
#[derive(Debug, Clone, Default)]
pub struct ChunkEvent {
    pub index: Option<i64>,
    pub text: Option<String>,
    pub patch_text: Option<String>,
    pub patch_source: Option<String>,
    pub explicit_first: bool,
    pub meta: EventMeta,
}

impl ChunkEvent {
    #[must_use]
    pub fn from_envelope(env: &EventEnvelope) -> Self {
        let candidates = env.candidates();
        let patch: Option<Record> = env.body.child("patch").or_else(|| env.outer.child("patch"));
        let (patch_text, patch_source) = match &patch {
            Some(patch) => (
                record::pick_str(&[patch], &["text", "content"]).map(str::to_string),
                record::pick_str(&[patch], &["source"]).map(str::to_string),
            ),
            None => (None, None),
        };
        Self {
            index: env.i64_field(keys::INDEX),
            text: env.str_field(keys::TEXT).map(str::to_string),
            patch_text,
            patch_source,
            explicit_first: record::pick_bool(&candidates, FIRST_FLAG_KEYS).unwrap_or(false),
            meta: EventMeta::from_envelope(env),
        }
    }
}

/// Why a chunk did not append to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// No numeric index on the chunk.
    MissingIndex,
    /// Index at or below the ledger watermark.
    Duplicate,
    /// `source == stream_init` patch with no text.
    InitArtifact,
    /// First chunk equals the user's own prompt.
    Echo,
    /// No assistant message yet and this chunk may not create one.
    NotReady,
    /// Nothing renderable to append.
    EmptyText,
}

/// Result of applying one chunk.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    Applied {
        assistant_id: String,
        patch: MessagePatch,
        created: bool,
    },
    Suppressed(SuppressReason),
}

enum Extracted {
    Text(String),
    InitArtifact,
    None,
}

fn extract_text(chunk: &ChunkEvent) -> Extracted {
    if let Some(text) = chunk.text.as_deref() {
        if !text.is_empty() {
            return Extracted::Text(text.to_string());
        }
    }
    match chunk.patch_text.as_deref() {
        Some(text) if !text.is_empty() => Extracted::Text(text.to_string()),
        _ => {
            if chunk.patch_source.as_deref() == Some(PATCH_SOURCE_STREAM_INIT) {
                Extracted::InitArtifact
            } else {
                Extracted::None
            }
        }
    }
}

/// Collapse whitespace runs and trim, for echo comparison.
#[must_use]
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Whether a single glue space must separate the ledger tail from the new
/// fragment: ledger ends in an alphanumeric, the fragment begins with a
/// letter or quote, and neither side already carries a boundary space.
#[must_use]
pub fn needs_glue_space(ledger: &str, fragment: &str) -> bool {
    let Some(last) = ledger.chars().last() else {
        return false;
    };
    let Some(first) = fragment.chars().next() else {
        return false;
    };
    last.is_alphanumeric()
        && (first.is_alphabetic() || matches!(first, '"' | '\'' | '“' | '‘' | '«'))
}

/// Apply one chunk to the ledger for `client_id`.
///
/// Creation of the assistant message is allowed only when the chunk carries
/// renderable text and is index 0, is explicitly flagged first, or no
/// assistant message exists yet for this client id; otherwise the router is
/// still waiting and must not synthesize a bubble from a non-informative
/// event.
pub fn apply_chunk(
    tracker: &mut MessageTracker,
    client_id: &str,
    chunk: &ChunkEvent,
) -> ChunkOutcome {
    let Some(index) = chunk.index else {
        return ChunkOutcome::Suppressed(SuppressReason::MissingIndex);
    };

    let extracted = extract_text(chunk);
    if matches!(extracted, Extracted::InitArtifact) {
        return ChunkOutcome::Suppressed(SuppressReason::InitArtifact);
    }
    let has_text = matches!(&extracted, Extracted::Text(_));

    let allow_create =
        has_text && (index == 0 || chunk.explicit_first || !tracker.has_message(client_id));
    let ensure = tracker.ensure_assistant_message(client_id, &chunk.meta, allow_create);
    let created = matches!(ensure, Ensure::Created(_));
    let Some(assistant_id) = ensure.assistant_id().map(str::to_string) else {
        return ChunkOutcome::Suppressed(SuppressReason::NotReady);
    };

    let user_input = tracker
        .last_user_input(client_id)
        .map(sanitize)
        .unwrap_or_default();
    let Some(ledger) = tracker.ledger_mut(&assistant_id) else {
        return ChunkOutcome::Suppressed(SuppressReason::NotReady);
    };

    if index <= ledger.chunk_index_max {
        return ChunkOutcome::Suppressed(SuppressReason::Duplicate);
    }

    let Extracted::Text(fragment) = extracted else {
        return ChunkOutcome::Suppressed(SuppressReason::EmptyText);
    };

    let first_chunk = ledger.chunk_index_max < 0;
    if first_chunk && !user_input.is_empty() && sanitize(&fragment) == user_input {
        // Server echoed the prompt back instead of replying; consume the
        // index so a redelivery cannot re-apply it.
        ledger.chunk_index_max = index;
        if created {
            let patch = build_patch(tracker, client_id, &assistant_id, created);
            return ChunkOutcome::Applied {
                assistant_id,
                patch,
                created,
            };
        }
        return ChunkOutcome::Suppressed(SuppressReason::Echo);
    }

    if needs_glue_space(&ledger.text, &fragment) {
        ledger.text.push(' ');
    }
    ledger.text.push_str(&fragment);
    ledger.chunk_index_max = index;

    let patch = build_patch(tracker, client_id, &assistant_id, created);
    ChunkOutcome::Applied {
        assistant_id,
        patch,
        created,
    }
}

fn build_patch(
    tracker: &MessageTracker,
    client_id: &str,
    assistant_id: &str,
    created: bool,
) -> MessagePatch {
    let ledger_text = tracker
        .ledger(assistant_id)
        .map(|entry| entry.text.clone())
        .unwrap_or_default();
    let meta = tracker.meta(assistant_id);
    MessagePatch {
        assistant_id: assistant_id.to_string(),
        client_id: Some(client_id.to_string()),
        text: Some(ledger_text),
        status: created.then_some(MessageStatus::Streaming),
        streaming: Some(true),
        interaction_id: meta.and_then(|m| m.interaction_id.clone()),
        message_id: meta.and_then(|m| m.message_id.clone()),
        created_at: meta.and_then(|m| m.created_at),
        ..MessagePatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: i64, text: &str) -> ChunkEvent {
        ChunkEvent {
            index: Some(index),
            text: Some(text.to_string()),
            ..ChunkEvent::default()
        }
    }

    fn applied_text(outcome: &ChunkOutcome) -> Option<String> {
        match outcome {
            ChunkOutcome::Applied { patch, .. } => patch.text.clone(),
            ChunkOutcome::Suppressed(_) => None,
        }
    }

    #[test]
    fn chunks_without_index_are_rejected() {
        let mut tracker = MessageTracker::new();
        let event = ChunkEvent {
            index: None,
            text: Some("hello".into()),
            ..ChunkEvent::default()
        };
        let outcome = apply_chunk(&mut tracker, "c-1", &event);
        assert!(matches!(
            outcome,
            ChunkOutcome::Suppressed(SuppressReason::MissingIndex)
        ));
    }

    #[test]
    fn glue_spacing_scenario() {
        let mut tracker = MessageTracker::new();
        for (i, piece) in ["Bom", " dia, ", "Rafa."].iter().enumerate() {
            apply_chunk(&mut tracker, "c-1", &chunk(i as i64, piece));
        }
        let assistant_id = tracker.assistant_for("c-1").expect("message").to_string();
        assert_eq!(tracker.ledger(&assistant_id).expect("ledger").text, "Bom dia, Rafa.");
    }

    #[test]
    fn glue_space_inserted_when_producer_splits_mid_phrase() {
        let mut tracker = MessageTracker::new();
        apply_chunk(&mut tracker, "c-1", &chunk(0, "Bom"));
        apply_chunk(&mut tracker, "c-1", &chunk(1, "dia"));
        let assistant_id = tracker.assistant_for("c-1").expect("message").to_string();
        assert_eq!(tracker.ledger(&assistant_id).expect("ledger").text, "Bom dia");
    }

    #[test]
    fn no_glue_before_punctuation() {
        let mut tracker = MessageTracker::new();
        apply_chunk(&mut tracker, "c-1", &chunk(0, "Claro"));
        apply_chunk(&mut tracker, "c-1", &chunk(1, "!"));
        let assistant_id = tracker.assistant_for("c-1").expect("message").to_string();
        assert_eq!(tracker.ledger(&assistant_id).expect("ledger").text, "Claro!");
    }

    #[test]
    fn duplicates_and_out_of_order_indices_are_dropped() {
        let mut tracker = MessageTracker::new();
        apply_chunk(&mut tracker, "c-1", &chunk(0, "A"));
        apply_chunk(&mut tracker, "c-1", &chunk(1, "B"));
        let dup = apply_chunk(&mut tracker, "c-1", &chunk(1, "B"));
        assert!(matches!(
            dup,
            ChunkOutcome::Suppressed(SuppressReason::Duplicate)
        ));
        let stale = apply_chunk(&mut tracker, "c-1", &chunk(0, "A"));
        assert!(matches!(
            stale,
            ChunkOutcome::Suppressed(SuppressReason::Duplicate)
        ));
        let next = apply_chunk(&mut tracker, "c-1", &chunk(2, "C"));
        assert_eq!(applied_text(&next).as_deref(), Some("ABC"));
    }

    #[test]
    fn delivery_order_with_dupes_matches_index_order() {
        // apply(chunks) == apply(sort_by_index(dedupe_by_index(chunks)))
        let deliveries = [(0, "Que "), (1, "bom "), (0, "Que "), (2, "saber!"), (1, "bom ")];
        let mut tracker = MessageTracker::new();
        for (i, text) in deliveries {
            apply_chunk(&mut tracker, "c-1", &chunk(i, text));
        }
        let delivered = {
            let id = tracker.assistant_for("c-1").expect("message").to_string();
            tracker.ledger(&id).expect("ledger").text.clone()
        };

        let mut clean = MessageTracker::new();
        for (i, text) in [(0, "Que "), (1, "bom "), (2, "saber!")] {
            apply_chunk(&mut clean, "c-1", &chunk(i, text));
        }
        let ordered = {
            let id = clean.assistant_for("c-1").expect("message").to_string();
            clean.ledger(&id).expect("ledger").text.clone()
        };
        assert_eq!(delivered, ordered);
        assert_eq!(delivered, "Que bom saber!");
    }

    #[test]
    fn echo_of_user_input_keeps_ledger_empty() {
        let mut tracker = MessageTracker::new();
        tracker.record_user_input("c-1", "estou bem");
        apply_chunk(&mut tracker, "c-1", &chunk(0, "estou  bem "));
        let assistant_id = tracker.assistant_for("c-1").expect("message").to_string();
        assert_eq!(tracker.ledger(&assistant_id).expect("ledger").text, "");
        // The real reply still lands afterwards.
        apply_chunk(&mut tracker, "c-1", &chunk(1, "Que bom saber!"));
        assert_eq!(
            tracker.ledger(&assistant_id).expect("ledger").text,
            "Que bom saber!"
        );
    }

    #[test]
    fn stream_init_patch_without_text_is_dropped() {
        let mut tracker = MessageTracker::new();
        let event = ChunkEvent {
            index: Some(0),
            patch_source: Some("stream_init".into()),
            ..ChunkEvent::default()
        };
        let outcome = apply_chunk(&mut tracker, "c-1", &event);
        assert!(matches!(
            outcome,
            ChunkOutcome::Suppressed(SuppressReason::InitArtifact)
        ));
        assert!(!tracker.has_message("c-1"));
    }

    #[test]
    fn patch_text_is_used_when_direct_text_missing() {
        let env = EventEnvelope::parse(
            "{\"index\":0,\"patch\":{\"content\":\"Oi!\",\"source\":\"model\"}}",
        );
        let event = ChunkEvent::from_envelope(&env);
        let mut tracker = MessageTracker::new();
        let outcome = apply_chunk(&mut tracker, "c-1", &event);
        assert_eq!(applied_text(&outcome).as_deref(), Some("Oi!"));
    }

    #[test]
    fn textless_chunk_never_synthesizes_a_bubble() {
        let mut tracker = MessageTracker::new();
        let event = ChunkEvent {
            index: Some(0),
            ..ChunkEvent::default()
        };
        let outcome = apply_chunk(&mut tracker, "c-1", &event);
        assert!(matches!(outcome, ChunkOutcome::Suppressed(_)));
        assert!(!tracker.has_message("c-1"));
    }

    #[test]
    fn creation_patch_carries_streaming_status_and_meta() {
        let env = EventEnvelope::parse(
            "{\"index\":0,\"delta\":\"Oi\",\"interaction_id\":\"int-1\",\"message_id\":\"srv-1\"}",
        );
        let event = ChunkEvent::from_envelope(&env);
        let mut tracker = MessageTracker::new();
        let ChunkOutcome::Applied { patch, created, .. } =
            apply_chunk(&mut tracker, "c-1", &event)
        else {
            panic!("expected applied chunk");
        };
        assert!(created);
        assert_eq!(patch.status, Some(MessageStatus::Streaming));
        assert_eq!(patch.streaming, Some(true));
        assert_eq!(patch.interaction_id.as_deref(), Some("int-1"));
        assert_eq!(patch.message_id.as_deref(), Some("srv-1"));
    }
}
