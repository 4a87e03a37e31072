//! Turn lifecycle: tracking, assembly, watchdogs, routing, orchestration.

pub mod assembly;
pub mod orchestrator;
pub mod router;
pub mod tracker;
pub mod watchdog;

pub use orchestrator::{ChatEngine, TurnReport};
pub use router::{ClientFinishReason, RunStats, TurnPhase};
pub use watchdog::WatchdogConfig;
