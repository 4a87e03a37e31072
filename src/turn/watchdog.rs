//! Tiered stall watchdogs for one streaming turn.
//!
//! Three tiers, each answering a different question:
//!
//! * prompt-ready: a stopwatch only. How long until the server acknowledged
//!   the prompt? Never fires a timeout on its own.
//! * first-token: armed when the stream opens, with a long grace period.
//!   Any stream activity (frames or comment keepalives) pushes the deadline
//!   out; the first renderable chunk disarms it.
//! * heartbeat: armed once the first chunk has arrived, with a short grace
//!   period. Every subsequent event re-arms it.
//!
//! The guard fallback duration also lives in the config but is driven as a
//! single-shot timer by the orchestrator, not by this state machine.

use std::time::Duration;

use tokio::time::Instant;

/// Grace periods for the watchdog tiers.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Grace for the first renderable chunk after the stream opens.
    pub first_token: Duration,
    /// Grace between events once the reply has started.
    pub heartbeat: Duration,
    /// Single-shot guard window for the non-streaming fallback request.
    pub guard_fallback: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            first_token: Duration::from_secs(45),
            heartbeat: Duration::from_secs(15),
            guard_fallback: Duration::from_secs(10),
        }
    }
}

/// Which watchdog tier expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    FirstToken,
    Heartbeat,
}

/// Deadline state for one turn. Purely passive: the read loop asks for the
/// active deadline, sleeps on it, and reports activity back in.
#[derive(Debug)]
pub struct Watchdogs {
    config: WatchdogConfig,
    started_at: Instant,
    prompt_ready_at: Option<Instant>,
    first_token_at: Option<Instant>,
    first_token_deadline: Instant,
    heartbeat_deadline: Option<Instant>,
}

impl Watchdogs {
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            started_at: now,
            prompt_ready_at: None,
            first_token_at: None,
            first_token_deadline: now + config.first_token,
            heartbeat_deadline: None,
        }
    }

    /// The deadline the read loop should currently sleep on.
    #[must_use]
    pub fn active_deadline(&self) -> (WatchdogKind, Instant) {
        match self.heartbeat_deadline {
            Some(deadline) => (WatchdogKind::Heartbeat, deadline),
            None => (WatchdogKind::FirstToken, self.first_token_deadline),
        }
    }

    /// Any stream activity: parsed frames, or comment keepalives that
    /// produced no frame. Pushes the active deadline out.
    pub fn note_activity(&mut self) {
        let now = Instant::now();
        match self.heartbeat_deadline {
            Some(_) => self.heartbeat_deadline = Some(now + self.config.heartbeat),
            None => self.first_token_deadline = now + self.config.first_token,
        }
    }

    /// The server acknowledged the prompt. Stopwatch only.
    pub fn note_prompt_ready(&mut self) {
        if self.prompt_ready_at.is_none() {
            self.prompt_ready_at = Some(Instant::now());
        }
    }

    /// The first renderable chunk arrived: disarm first-token, arm heartbeat.
    pub fn note_first_token(&mut self) {
        let now = Instant::now();
        if self.first_token_at.is_none() {
            self.first_token_at = Some(now);
        }
        self.heartbeat_deadline = Some(now + self.config.heartbeat);
    }

    #[must_use]
    pub fn first_token_seen(&self) -> bool {
        self.first_token_at.is_some()
    }

    /// Time from turn start to prompt acknowledgement, if it happened.
    #[must_use]
    pub fn prompt_ready_latency(&self) -> Option<Duration> {
        self.prompt_ready_at
            .map(|at| at.duration_since(self.started_at))
    }

    /// Time from turn start to the first renderable chunk, if it happened.
    #[must_use]
    pub fn first_token_latency(&self) -> Option<Duration> {
        self.first_token_at
            .map(|at| at.duration_since(self.started_at))
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    #[must_use]
    pub fn guard_fallback(&self) -> Duration {
        self.config.guard_fallback
    }
}
