//! Engine error types.
//!
//! Provides the error hierarchy for subscription supervision:
//! - [`SourceError`]: failures reported by the external data source
//! - [`StartError`]: subscription startup failures
//! - [`CallError`]: synchronous request failures
//! - [`MigrateError`]: state migration failures

use std::time::Duration;

use thiserror::Error;

/// Errors reported by the external data source capability.
///
/// The recovery strategy differs per variant:
/// - [`SourceError::Transient`] is recovered locally by backing off and
///   reconnecting; it is never surfaced to external callers.
/// - [`SourceError::Fatal`] aborts the subscription without retrying.
/// - [`SourceError::Closed`] signals the cursor or connection was closed
///   out-of-band; the subscription stops with a distinguished reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// A transient failure (e.g. the server is temporarily unavailable).
    /// Recovered by reconnecting with exponential backoff.
    #[error("transient source error: {0}")]
    Transient(String),

    /// A fatal, unretriable failure (e.g. the source rejected the query).
    #[error("fatal source error: {0}")]
    Fatal(String),

    /// The connection or cursor was closed while an operation was in
    /// flight. Distinct from [`SourceError::Transient`]: the resource went
    /// away out-of-band rather than failing to serve the next batch.
    #[error("source closed")]
    Closed,
}

impl SourceError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        SourceError::Transient(message.into())
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        SourceError::Fatal(message.into())
    }

    /// Returns `true` if the engine should retry after this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Errors returned by [`start`](crate::handle::start).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    /// The handler's `init` refused to start the subscription.
    #[error("subscription refused to start: {0}")]
    Refused(String),

    /// The subscription actor died before acknowledging startup
    /// (typically a panic inside the handler's `init`).
    #[error("subscription crashed during startup")]
    Crashed,
}

/// Errors returned by [`FeedHandle::call`](crate::handle::FeedHandle::call).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// No reply arrived within the caller's deadline. The subscription
    /// itself is unaffected and keeps processing.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The subscription terminated, or abandoned the request without
    /// ever replying.
    #[error("subscription terminated")]
    Terminated,
}

/// Errors returned by
/// [`FeedHandle::migrate`](crate::handle::FeedHandle::migrate).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrateError {
    /// The handler rejected the migration; the previous state is kept.
    #[error("migration rejected: {0}")]
    Rejected(String),

    /// The subscription terminated before the migration was applied.
    #[error("subscription terminated")]
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::transient("server unreachable");
        assert_eq!(err.to_string(), "transient source error: server unreachable");
        assert_eq!(SourceError::Closed.to_string(), "source closed");
    }

    #[test]
    fn test_source_error_is_transient() {
        assert!(SourceError::transient("x").is_transient());
        assert!(!SourceError::fatal("x").is_transient());
        assert!(!SourceError::Closed.is_transient());
    }

    #[test]
    fn test_start_error_display() {
        let err = StartError::Refused("bad query".into());
        assert!(err.to_string().contains("bad query"));
    }

    #[test]
    fn test_call_error_display() {
        let err = CallError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
        assert_eq!(CallError::Terminated.to_string(), "subscription terminated");
    }

    #[test]
    fn test_migrate_error_display() {
        let err = MigrateError::Rejected("unknown version".into());
        assert!(err.to_string().contains("unknown version"));
    }
}
