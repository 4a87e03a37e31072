#![allow(dead_code)]

//! Scripted transport and engine fixtures shared by the integration tests.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use parking_lot::Mutex;
use serde_json::Value;

use turnstream::error::StreamError;
use turnstream::store::{Identity, MemoryStore, StaticIdentity};
use turnstream::transport::{ByteStream, ChatTransport, TurnRequest};
use turnstream::turn::{ChatEngine, WatchdogConfig};

/// One action in a scripted stream.
pub enum Step {
    /// Emit raw bytes immediately.
    Emit(String),
    /// Wait, then emit.
    DelayEmit(Duration, String),
    /// Wait without emitting anything.
    Wait(Duration),
    /// Yield a mid-read transport error.
    Fail(String),
    /// Never yield again (the connection goes silent).
    Hang,
}

/// Format one SSE block.
pub fn sse(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// What the fallback endpoint should do when called.
pub enum FallbackScript {
    None,
    Body { value: Value, delay: Duration },
    Fail { delay: Duration },
}

/// [`ChatTransport`] test double: each `open_stream` pops one scripted byte
/// stream; `fetch_fallback` plays the configured fallback script.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    fallback: Mutex<FallbackScript>,
    pub open_calls: AtomicUsize,
    pub fallback_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(FallbackScript::None),
            open_calls: AtomicUsize::new(0),
            fallback_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_stream(&self, steps: Vec<Step>) {
        self.scripts.lock().push_back(steps);
    }

    pub fn set_fallback(&self, script: FallbackScript) {
        *self.fallback.lock() = script;
    }

    pub fn open_count(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn fallback_count(&self) -> usize {
        self.fallback_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(
        &self,
        _request: &TurnRequest,
        _identity: &Identity,
    ) -> Result<ByteStream, StreamError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let Some(steps) = self.scripts.lock().pop_front() else {
            return Err(StreamError::Transport("connection refused".into()));
        };
        let s = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next() {
                    Some(Step::Emit(text)) => {
                        return Some((Ok(Bytes::from(text)), steps));
                    }
                    Some(Step::DelayEmit(delay, text)) => {
                        tokio::time::sleep(delay).await;
                        return Some((Ok(Bytes::from(text)), steps));
                    }
                    Some(Step::Wait(delay)) => {
                        tokio::time::sleep(delay).await;
                    }
                    Some(Step::Fail(message)) => {
                        return Some((Err(StreamError::Transport(message)), steps));
                    }
                    Some(Step::Hang) => pending().await,
                    None => return None,
                }
            }
        });
        Ok(Box::pin(s))
    }

    async fn fetch_fallback(
        &self,
        _request: &TurnRequest,
        _identity: &Identity,
    ) -> Result<Value, StreamError> {
        self.fallback_calls.fetch_add(1, Ordering::SeqCst);
        enum Planned {
            Body(Value, Duration),
            Fail(Duration),
            None,
        }
        let planned = match &*self.fallback.lock() {
            FallbackScript::Body { value, delay } => Planned::Body(value.clone(), *delay),
            FallbackScript::Fail { delay } => Planned::Fail(*delay),
            FallbackScript::None => Planned::None,
        };
        match planned {
            Planned::Body(value, delay) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Planned::Fail(delay) => {
                tokio::time::sleep(delay).await;
                Err(StreamError::Transport("fallback connection refused".into()))
            }
            Planned::None => Err(StreamError::Transport("no fallback scripted".into())),
        }
    }
}

/// Engine wired to a scripted transport and an in-memory store.
pub fn engine_with(
    transport: Arc<ScriptedTransport>,
    dogs: WatchdogConfig,
) -> (Arc<ChatEngine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(ChatEngine::new(
        transport,
        store.clone(),
        Arc::new(StaticIdentity(Identity::default())),
        dogs,
    ));
    (engine, store)
}

/// Default watchdog tiers used by the timing tests.
pub fn test_watchdogs() -> WatchdogConfig {
    WatchdogConfig {
        first_token: Duration::from_secs(45),
        heartbeat: Duration::from_secs(15),
        guard_fallback: Duration::from_secs(10),
    }
}

/// Watchdogs that will not interfere with a fast, happy-path script.
pub fn lenient_watchdogs() -> WatchdogConfig {
    WatchdogConfig {
        first_token: Duration::from_secs(600),
        heartbeat: Duration::from_secs(600),
        guard_fallback: Duration::from_secs(600),
    }
}
