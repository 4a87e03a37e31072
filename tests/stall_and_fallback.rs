//! Watchdog tiers and the single-shot guard fallback, exercised on paused
//! tokio time with scripted stalls.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    engine_with, lenient_watchdogs, sse, test_watchdogs, FallbackScript, ScriptedTransport, Step,
};
use serde_json::json;
use turnstream::store::MessageStatus;
use turnstream::transport::TurnRequest;
use turnstream::turn::{ClientFinishReason, TurnPhase, WatchdogConfig};

#[tokio::test(start_paused = true)]
async fn guard_fallback_completes_a_stalled_turn() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![Step::Emit(sse("prompt_ready", "{}")), Step::Hang]);
    transport.set_fallback(FallbackScript::Body {
        value: json!({"response": {"text": "Olá mundo"}}),
        delay: Duration::from_millis(200),
    });
    let (engine, store) = engine_with(transport.clone(), test_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");

    assert_eq!(report.phase, TurnPhase::Done);
    assert_eq!(report.text, "Olá mundo");
    assert_eq!(
        report.stats.client_finish_reason,
        Some(ClientFinishReason::GuardFallback)
    );
    assert_eq!(report.stats.fallback_attempts, 1);
    assert_eq!(transport.fallback_count(), 1);

    let message = store.get(&report.assistant_id.expect("id")).expect("message");
    assert_eq!(message.text, "Olá mundo");
    assert_eq!(message.status, Some(MessageStatus::Done));
    assert_eq!(
        message.client_finish_reason.as_deref(),
        Some("guard_fallback")
    );
}

#[tokio::test(start_paused = true)]
async fn first_chunk_disarms_the_guard() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![
        Step::Emit(sse("chunk", "{\"index\":0,\"text\":\"Oi\"}")),
        Step::DelayEmit(Duration::from_secs(12), sse("done", "{}")),
    ]);
    let (engine, _store) = engine_with(transport.clone(), test_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");
    assert_eq!(report.text, "Oi");
    assert!(report.stats.client_finish_reason.is_none());
    // The guard window elapsed but the fallback was never issued.
    assert_eq!(transport.fallback_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_keeps_partial_text() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![
        Step::Emit(sse("chunk", "{\"index\":0,\"text\":\"Parcial\"}")),
        Step::Hang,
    ]);
    let (engine, store) = engine_with(transport.clone(), test_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");

    assert_eq!(report.phase, TurnPhase::Done);
    assert_eq!(report.text, "Parcial");
    assert_eq!(
        report.stats.client_finish_reason,
        Some(ClientFinishReason::HeartbeatTimeout)
    );
    assert_eq!(transport.fallback_count(), 0);

    let message = store.get(&report.assistant_id.expect("id")).expect("message");
    assert_eq!(message.status, Some(MessageStatus::Done));
    assert!(!message.streaming);
}

#[tokio::test(start_paused = true)]
async fn chunks_within_the_heartbeat_window_keep_the_turn_alive() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![
        Step::Emit(sse("chunk", "{\"index\":0,\"text\":\"Um \"}")),
        Step::DelayEmit(
            Duration::from_secs(10),
            sse("chunk", "{\"index\":1,\"text\":\"dois \"}"),
        ),
        Step::DelayEmit(
            Duration::from_secs(10),
            sse("chunk", "{\"index\":2,\"text\":\"três\"}"),
        ),
        Step::Emit(sse("done", "{}")),
    ]);
    let (engine, _store) = engine_with(transport, test_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");
    assert_eq!(report.text, "Um dois três");
    assert!(report.stats.client_finish_reason.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_fallback_leaves_the_first_token_watchdog_in_charge() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![Step::Emit(sse("prompt_ready", "{}")), Step::Hang]);
    transport.set_fallback(FallbackScript::Fail {
        delay: Duration::from_secs(1),
    });
    let (engine, store) = engine_with(transport.clone(), test_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");

    // Guard fired at 10s, the fallback errored at 11s, and the stream stayed
    // silent until the 45s first-token deadline forced completion.
    assert_eq!(report.phase, TurnPhase::Done);
    assert_eq!(
        report.stats.client_finish_reason,
        Some(ClientFinishReason::FirstTokenTimeout)
    );
    assert_eq!(transport.fallback_count(), 1);
    assert!(report.assistant_id.is_none());
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn keepalive_comments_hold_off_the_first_token_watchdog() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![
        Step::Emit(sse("prompt_ready", "{}")),
        Step::Wait(Duration::from_secs(40)),
        Step::Emit(": keepalive\n\n".to_string()),
        Step::DelayEmit(
            Duration::from_secs(40),
            format!(
                "{}{}",
                sse("chunk", "{\"index\":0,\"text\":\"Demorou, mas chegou.\"}"),
                sse("done", "{}")
            ),
        ),
    ]);
    // High guard so the fallback path stays out of this scenario.
    let dogs = WatchdogConfig {
        first_token: Duration::from_secs(45),
        heartbeat: Duration::from_secs(15),
        guard_fallback: Duration::from_secs(600),
    };
    let (engine, _store) = engine_with(transport.clone(), dogs);

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");

    // The comment at t=40s pushed the 45s deadline past the t=80s chunk.
    assert_eq!(report.text, "Demorou, mas chegou.");
    assert!(report.stats.client_finish_reason.is_none());
    assert_eq!(transport.fallback_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stream_completion_beats_an_in_flight_fallback() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![
        Step::Emit(sse("prompt_ready", "{}")),
        Step::DelayEmit(
            Duration::from_secs(12),
            format!(
                "{}{}",
                sse("chunk", "{\"index\":0,\"text\":\"Do stream.\"}"),
                sse("done", "{}")
            ),
        ),
    ]);
    // Guard fires at 10s; the fallback would answer at 15s, after the stream.
    transport.set_fallback(FallbackScript::Body {
        value: json!({"response": {"text": "Do fallback."}}),
        delay: Duration::from_secs(5),
    });
    let (engine, store) = engine_with(transport.clone(), test_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");

    assert_eq!(report.text, "Do stream.");
    assert!(report.stats.client_finish_reason.is_none());
    assert_eq!(report.stats.fallback_attempts, 0);
    // The fallback was issued but its in-flight future was dropped unheard.
    assert_eq!(transport.fallback_count(), 1);
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_closed_without_done_flushes_the_trailing_block() {
    let transport = Arc::new(ScriptedTransport::new());
    // Final block lacks its terminating blank line; EOF must still flush it.
    transport.push_stream(vec![
        Step::Emit(sse("chunk", "{\"index\":0,\"text\":\"Quase \"}")),
        Step::Emit("event: chunk\ndata: {\"index\":1,\"text\":\"tudo.\"}".to_string()),
    ]);
    let (engine, store) = engine_with(transport, lenient_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");

    assert_eq!(report.phase, TurnPhase::Done);
    assert_eq!(report.text, "Quase tudo.");
    assert_eq!(
        report.stats.client_finish_reason,
        Some(ClientFinishReason::StreamClosed)
    );
    let message = store.get(&report.assistant_id.expect("id")).expect("message");
    assert_eq!(message.status, Some(MessageStatus::Done));
}

#[tokio::test(start_paused = true)]
async fn mid_read_transport_error_preserves_content() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_stream(vec![
        Step::Emit(sse("chunk", "{\"index\":0,\"text\":\"Metade\"}")),
        Step::Fail("connection reset by peer".into()),
    ]);
    let (engine, store) = engine_with(transport, lenient_watchdogs());

    let report = engine
        .run_turn(TurnRequest::new("c-1", "oi"))
        .await
        .expect("turn");

    assert_eq!(report.text, "Metade");
    assert_eq!(
        report.stats.client_finish_reason,
        Some(ClientFinishReason::StreamClosed)
    );
    assert_eq!(store.snapshot().len(), 1);
}
