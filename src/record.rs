//! Record normalizer: turns loosely-typed event payloads into safe structured
//! records.
//!
//! The producing service's field names and nesting vary across code paths, so
//! extraction is best-effort over a prioritized list of candidate records and
//! candidate key spellings. First non-empty match wins; malformed input never
//! fails, it just yields nothing.

use serde_json::{Map, Value};

/// Key spellings recognized for the fields this engine cares about.
pub mod keys {
    pub const INTERACTION_ID: &[&str] = &["interaction_id", "interactionId"];
    pub const MESSAGE_ID: &[&str] = &["message_id", "messageId", "id"];
    pub const CLIENT_ID: &[&str] = &[
        "client_message_id",
        "clientMessageId",
        "client_id",
        "clientId",
    ];
    pub const TARGET_ID: &[&str] = &["target_id", "targetId"];
    pub const CREATED_AT: &[&str] = &["created_at", "createdAt", "created"];
    pub const TEXT: &[&str] = &["delta", "text", "content"];
    pub const INDEX: &[&str] = &["index", "chunk_index", "chunkIndex"];
    pub const FINISH_REASON: &[&str] = &["finish_reason", "finishReason", "stop_reason"];
    pub const MODEL: &[&str] = &["model", "model_id", "modelId"];
    pub const CONTROL_NAME: &[&str] = &["name", "control", "type"];
    pub const ERROR_REASON: &[&str] = &["reason", "code", "error"];
    pub const ERROR_MESSAGE: &[&str] = &["message", "detail"];
}

/// A safe plain record extracted from an arbitrary event payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Build a record from any JSON value.
    ///
    /// Objects are taken as-is; strings are treated as JSON-encoded objects
    /// and parsed leniently; anything else yields an empty record.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self(map.clone()),
            Value::String(raw) => Self::parse_payload(raw),
            _ => Self::default(),
        }
    }

    /// Parse a raw payload string into a record. Never fails: malformed JSON
    /// or non-object JSON returns an empty record.
    #[must_use]
    pub fn parse_payload(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self(map),
            Ok(_) | Err(_) => Self::default(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Extract a nested record at `key`, if present and record-shaped.
    #[must_use]
    pub fn child(&self, key: &str) -> Option<Record> {
        let value = self.0.get(key)?;
        let record = Record::from_value(value);
        if record.is_empty() {
            None
        } else {
            Some(record)
        }
    }

    fn str_at(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    fn i64_at(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| {
                let f = n.as_f64()?;
                if f.fract() == 0.0 {
                    Some(f as i64)
                } else {
                    None
                }
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    fn u64_at(&self, key: &str) -> Option<u64> {
        self.i64_at(key).and_then(|n| u64::try_from(n).ok())
    }

    fn bool_at(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn str_list_at(&self, key: &str) -> Option<Vec<String>> {
        match self.0.get(key)? {
            Value::Array(items) => {
                let list: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) if !s.is_empty() => Some(s.clone()),
                        _ => None,
                    })
                    .collect();
                if list.is_empty() {
                    None
                } else {
                    Some(list)
                }
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Prioritized extraction
// ---------------------------------------------------------------------------

/// First non-empty string across candidate records (outer priority) and
/// candidate key spellings (inner priority).
#[must_use]
pub fn pick_str<'a>(records: &[&'a Record], candidates: &[&str]) -> Option<&'a str> {
    for record in records {
        for key in candidates {
            if let Some(found) = record.str_at(key) {
                return Some(found);
            }
        }
    }
    None
}

/// First extractable signed integer; accepts JSON numbers, whole floats, and
/// numeric strings.
#[must_use]
pub fn pick_i64(records: &[&Record], candidates: &[&str]) -> Option<i64> {
    for record in records {
        for key in candidates {
            if let Some(found) = record.i64_at(key) {
                return Some(found);
            }
        }
    }
    None
}

/// First extractable unsigned integer.
#[must_use]
pub fn pick_u64(records: &[&Record], candidates: &[&str]) -> Option<u64> {
    for record in records {
        for key in candidates {
            if let Some(found) = record.u64_at(key) {
                return Some(found);
            }
        }
    }
    None
}

/// First extractable boolean; accepts `true`/`false` strings.
#[must_use]
pub fn pick_bool(records: &[&Record], candidates: &[&str]) -> Option<bool> {
    for record in records {
        for key in candidates {
            if let Some(found) = record.bool_at(key) {
                return Some(found);
            }
        }
    }
    None
}

/// First non-empty list of strings; non-string array elements are skipped.
///
/// The engine itself only consumes scalar fields; this completes the
/// extraction surface for callers reading list-shaped payload fields
/// (tags, selection candidates) under the same precedence rules.
#[must_use]
pub fn pick_str_list(records: &[&Record], candidates: &[&str]) -> Option<Vec<String>> {
    for record in records {
        for key in candidates {
            if let Some(found) = record.str_list_at(key) {
                return Some(found);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// The fixed candidate-record layout for one inbound event.
///
/// Priority order for extraction: the payload body, its `metadata`, its
/// nested `response`, then the outer event record.
#[derive(Debug, Clone, Default)]
pub struct EventEnvelope {
    pub outer: Record,
    pub body: Record,
    pub metadata: Record,
    pub response: Record,
}

impl EventEnvelope {
    /// Parse a raw `data:` payload into its candidate records.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let outer = Record::parse_payload(raw);
        Self::from_record(outer)
    }

    /// Wrap an already-parsed record (used for fallback JSON responses).
    #[must_use]
    pub fn from_record(outer: Record) -> Self {
        let body = outer
            .child("data")
            .or_else(|| outer.child("payload"))
            .unwrap_or_else(|| outer.clone());
        let metadata = body
            .child("metadata")
            .or_else(|| outer.child("metadata"))
            .or_else(|| outer.child("meta"))
            .unwrap_or_default();
        let response = body
            .child("response")
            .or_else(|| outer.child("response"))
            .unwrap_or_default();
        Self {
            outer,
            body,
            metadata,
            response,
        }
    }

    /// Candidate records in extraction priority order.
    #[must_use]
    pub fn candidates(&self) -> [&Record; 4] {
        [&self.body, &self.metadata, &self.response, &self.outer]
    }

    #[must_use]
    pub fn str_field(&self, candidates: &[&str]) -> Option<&str> {
        pick_str(&self.candidates(), candidates)
    }

    #[must_use]
    pub fn i64_field(&self, candidates: &[&str]) -> Option<i64> {
        pick_i64(&self.candidates(), candidates)
    }

    #[must_use]
    pub fn u64_field(&self, candidates: &[&str]) -> Option<u64> {
        pick_u64(&self.candidates(), candidates)
    }
}
