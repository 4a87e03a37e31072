//! Stream orchestrator: the engine entry point.
//!
//! Owns the read loop for one turn at a time: opens the transport, decodes
//! bytes into frames, drives the router, polices the watchdog deadlines, and
//! issues the single-shot guard fallback when the stream stalls before the
//! first chunk. Starting a new turn supersedes the active one (last writer
//! wins) through a cancellation token, and the superseded loop unwinds fully
//! before the new turn opens its transport.

use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::record::{EventEnvelope, Record};
use crate::store::{IdentityProvider, MessageStore};
use crate::stream::{FrameBatch, FrameParser, Utf8Accumulator};
use crate::transport::{ChatTransport, TurnRequest};
use crate::turn::router::{ClientFinishReason, RouterAction, RunStats, TurnPhase, TurnRouter};
use crate::turn::tracker::MessageTracker;
use crate::turn::watchdog::{WatchdogConfig, WatchdogKind, Watchdogs};

/// How a completed turn looked from the caller's side.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub client_id: String,
    pub assistant_id: Option<String>,
    pub text: String,
    pub phase: TurnPhase,
    pub stats: RunStats,
}

struct ActiveTurn {
    seq: u64,
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// Client-side streaming response engine. One instance per conversation
/// session; at most one turn streams at a time.
pub struct ChatEngine {
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityProvider>,
    tracker: Mutex<MessageTracker>,
    watchdog_config: WatchdogConfig,
    active: Mutex<Option<ActiveTurn>>,
    turn_seq: AtomicU64,
}

impl ChatEngine {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        watchdog_config: WatchdogConfig,
    ) -> Self {
        Self {
            transport,
            store,
            identity,
            tracker: Mutex::new(MessageTracker::new()),
            watchdog_config,
            active: Mutex::new(None),
            turn_seq: AtomicU64::new(0),
        }
    }

    /// Run one conversational turn to completion.
    ///
    /// If another turn is streaming it is superseded first: its transport and
    /// timers are cancelled and its loop unwinds before this turn opens its
    /// own connection.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Transport`] / [`StreamError::Upstream`] when the
    /// connection cannot be established, and the deferred fatal error when the
    /// stream reported a non-transient failure. Stalls and supersession are
    /// not errors; they surface as client finish reasons on the report.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnReport, StreamError> {
        let seq = self.turn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let prior = self.active.lock().replace(ActiveTurn {
            seq,
            cancel: cancel.clone(),
            finished: finished.clone(),
        });
        if let Some(prior) = prior {
            debug!(client_id = %request.client_id, "superseding active turn");
            prior.cancel.cancel();
            prior.finished.cancelled().await;
        }

        let result = self.drive_turn(&request, &cancel).await;

        finished.cancel();
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|turn| turn.seq == seq) {
            *active = None;
        }
        drop(active);
        result
    }

    /// Cancel the active turn, if any, without starting a new one.
    pub fn cancel_active(&self) {
        if let Some(turn) = self.active.lock().as_ref() {
            turn.cancel.cancel();
        }
    }

    async fn drive_turn(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, StreamError> {
        let mut router = TurnRouter::new(&request.client_id);
        self.tracker
            .lock()
            .record_user_input(&request.client_id, &request.user_text);

        let identity = self.identity.identity();
        let mut dogs = Watchdogs::new(self.watchdog_config);

        let mut stream = tokio::select! {
            () = cancel.cancelled() => {
                router.abort(
                    &mut self.tracker.lock(),
                    self.store.as_ref(),
                    ClientFinishReason::StreamAborted,
                );
                return Ok(self.report(request, router));
            }
            opened = self.transport.open_stream(request, &identity) => match opened {
                Ok(stream) => stream,
                Err(err) => {
                    router.fail(&mut self.tracker.lock(), self.store.as_ref());
                    return Err(err);
                }
            },
        };

        let mut parser = FrameParser::new();
        let mut utf8 = Utf8Accumulator::new();
        let mut frames = FrameBatch::new();

        // Single-shot guard: disarmed permanently once it fires or once the
        // first chunk arrives.
        let mut guard_deadline = Some(Instant::now() + dogs.guard_fallback());
        let mut fallback_fut: Option<
            std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<serde_json::Value, StreamError>> + Send + '_>,
            >,
        > = None;

        loop {
            if dogs.first_token_seen() {
                guard_deadline = None;
            }
            let (dog_kind, dog_deadline) = dogs.active_deadline();
            let guard_at = guard_deadline;

            tokio::select! {
                () = cancel.cancelled() => {
                    router.abort(
                        &mut self.tracker.lock(),
                        self.store.as_ref(),
                        ClientFinishReason::StreamAborted,
                    );
                    break;
                }

                next = stream.next() => match next {
                    Some(Ok(bytes)) => {
                        let comments_before = parser.comment_lines();
                        utf8.push(&bytes, |text| parser.feed_into(text, &mut frames));
                        if parser.comment_lines() > comments_before {
                            // Keepalive comments prove liveness without
                            // producing frames.
                            dogs.note_activity();
                        }
                        if self.pump_frames(&mut router, &mut dogs, &mut frames)
                            == RouterAction::Finished
                        {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(
                            client_id = %request.client_id,
                            error = %err,
                            "stream broke mid-read"
                        );
                        self.flush_and_close(&mut router, &mut dogs, &mut parser, &mut frames);
                        break;
                    }
                    None => {
                        self.flush_and_close(&mut router, &mut dogs, &mut parser, &mut frames);
                        break;
                    }
                },

                () = sleep_until(dog_deadline) => {
                    let reason = match dog_kind {
                        WatchdogKind::FirstToken => ClientFinishReason::FirstTokenTimeout,
                        WatchdogKind::Heartbeat => ClientFinishReason::HeartbeatTimeout,
                    };
                    warn!(
                        client_id = %request.client_id,
                        reason = reason.as_str(),
                        "watchdog expired, forcing completion"
                    );
                    router.finalize(
                        &mut self.tracker.lock(),
                        self.store.as_ref(),
                        &dogs,
                        None,
                        Some(reason),
                    );
                    break;
                }

                () = async {
                    match guard_at {
                        Some(at) => sleep_until(at).await,
                        None => pending().await,
                    }
                } => {
                    debug!(
                        client_id = %request.client_id,
                        "guard timer fired, issuing non-streaming fallback"
                    );
                    guard_deadline = None;
                    fallback_fut =
                        Some(Box::pin(self.transport.fetch_fallback(request, &identity)));
                }

                fetched = async {
                    match fallback_fut.as_mut() {
                        Some(fut) => fut.await,
                        None => pending().await,
                    }
                } => {
                    fallback_fut = None;
                    match fetched {
                        Ok(value) => {
                            let body = EventEnvelope::from_record(Record::from_value(&value));
                            router.finalize_from_fallback(
                                &mut self.tracker.lock(),
                                self.store.as_ref(),
                                &dogs,
                                &body,
                            );
                            break;
                        }
                        Err(err) => {
                            // The stream may still recover; the fallback was
                            // best-effort.
                            warn!(
                                client_id = %request.client_id,
                                error = %err,
                                "fallback request failed, staying on the stream"
                            );
                        }
                    }
                }
            }
        }

        if let Some(fatal) = router.take_fatal() {
            router.fail(&mut self.tracker.lock(), self.store.as_ref());
            return Err(fatal);
        }
        Ok(self.report(request, router))
    }

    fn pump_frames(
        &self,
        router: &mut TurnRouter,
        dogs: &mut Watchdogs,
        frames: &mut FrameBatch,
    ) -> RouterAction {
        for frame in frames.drain(..) {
            let mut tracker = self.tracker.lock();
            let action = router.handle_frame(&mut tracker, self.store.as_ref(), dogs, &frame);
            if action == RouterAction::Finished {
                return RouterAction::Finished;
            }
        }
        RouterAction::Continue
    }

    /// The producer closed the stream without a terminal `done`: flush the
    /// parser's trailing block, route what remains, then force completion.
    fn flush_and_close(
        &self,
        router: &mut TurnRouter,
        dogs: &mut Watchdogs,
        parser: &mut FrameParser,
        frames: &mut FrameBatch,
    ) {
        parser.finish_into(frames);
        if self.pump_frames(router, dogs, frames) == RouterAction::Finished {
            return;
        }
        router.finalize(
            &mut self.tracker.lock(),
            self.store.as_ref(),
            dogs,
            None,
            Some(ClientFinishReason::StreamClosed),
        );
    }

    fn report(&self, request: &TurnRequest, router: TurnRouter) -> TurnReport {
        TurnReport {
            client_id: request.client_id.clone(),
            assistant_id: router.final_assistant_id().map(str::to_string),
            text: router.final_text().to_string(),
            phase: router.phase(),
            stats: router.stats().clone(),
        }
    }
}
