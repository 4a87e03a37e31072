/// Canonical error type used across all modules.
///
/// The taxonomy mirrors how failures are surfaced: transport and upstream
/// errors are user-visible and tear the turn down; everything else degrades
/// into diagnostic finish-reason codes on the finalized message. Malformed
/// frames carry no error value at all: the payload decodes to an empty
/// record and the frame is dropped where it is handled.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Server reported error: {0}")]
    ServerReported(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection could not be established or broke mid-read.
    Transport,
    /// Upstream answered with a non-success status or an in-band error event.
    Upstream,
    Internal,
}

impl StreamError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Transport(_) => ErrorCategory::Transport,
            StreamError::Upstream { .. } | StreamError::ServerReported(_) => {
                ErrorCategory::Upstream
            }
            StreamError::Config(_) | StreamError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this failure should reach the end user as an error bubble.
    ///
    /// Only outright transport/connection failure qualifies; internal
    /// anomalies degrade silently per the propagation policy.
    #[must_use]
    pub fn user_visible(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Upstream
        )
    }
}
