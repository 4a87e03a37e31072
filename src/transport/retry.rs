//! Connect-time retry policy.
//!
//! Applies only to opening a connection (stream or fallback). Once a stream
//! is open there are no retries; liveness is the watchdogs' job.

use std::time::Duration;

use http::header::RETRY_AFTER;

pub(crate) const RETRY_MAX_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF_BASE_MS: u64 = 100;
const RETRY_BACKOFF_MAX_MS: u64 = 1_000;
const RETRY_AFTER_MAX_SECS: u64 = 30;

#[inline]
pub(crate) fn should_retry_status(status: http::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 503 | 529)
}

#[inline]
pub(crate) fn should_retry_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 7] = [
        b"timed out",
        b"timeout",
        b"connection reset",
        b"connection refused",
        b"connection aborted",
        b"broken pipe",
        b"unexpected eof",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

#[inline]
pub(crate) fn retry_backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(10);
    let multiplier = 1_u64 << shift;
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

/// Server-suggested delay when present (integral `Retry-After` seconds,
/// capped), exponential backoff otherwise.
#[inline]
pub(crate) fn retry_delay(headers: &http::HeaderMap, attempt: u32) -> Duration {
    parse_retry_after_secs(headers).unwrap_or_else(|| retry_backoff_delay(attempt))
}

#[inline]
fn parse_retry_after_secs(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let seconds = raw.parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds.min(RETRY_AFTER_MAX_SECS)))
}
