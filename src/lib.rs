//! turnstream: client-side streaming response engine for a conversational
//! assistant.
//!
//! Opens a chat request, consumes an SSE-shaped event stream, reconstructs
//! one assistant reply out-of-order-safe, tracks per-conversation identity,
//! detects stalls through tiered watchdogs, and falls back to a
//! non-streaming JSON request when the stream misbehaves.

pub mod config;
pub mod error;
pub mod observability;
pub mod record;
pub mod store;
pub mod stream;
pub mod transport;
pub mod turn;

pub use error::StreamError;
pub use store::{Identity, IdentityProvider, MemoryStore, MessagePatch, MessageStore};
pub use transport::{ChatTransport, HistoryMessage, HttpChatTransport, TurnRequest};
pub use turn::{ChatEngine, ClientFinishReason, TurnPhase, TurnReport, WatchdogConfig};
