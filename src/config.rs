//! Engine configuration and lifecycle types.
//!
//! Provides:
//! - [`FeedConfig`]: tuning knobs for a subscription
//! - [`FeedPhase`]: lifecycle phase of a running subscription
//! - [`ExitReason`]: structured termination reason

use std::fmt;
use std::time::Duration;

/// Configuration for a subscription.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Delay before the first reconnect attempt after a failure.
    pub initial_backoff: Duration,

    /// Upper bound on the reconnect delay.
    pub max_backoff: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(64_000),
        }
    }
}

/// Lifecycle phase of a running subscription.
///
/// Exactly one phase holds at any time; transitions are driven by the
/// subscription actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    /// A connect attempt is in flight.
    Connecting,

    /// The subscription holds a live cursor and is pulling batches.
    Streaming,

    /// The last connect or fetch failed transiently; a retry timer is
    /// pending.
    BackingOff,

    /// The subscription has terminated.
    Stopped,
}

impl fmt::Display for FeedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedPhase::Connecting => write!(f, "Connecting"),
            FeedPhase::Streaming => write!(f, "Streaming"),
            FeedPhase::BackingOff => write!(f, "BackingOff"),
            FeedPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Structured reason a subscription terminated.
///
/// Delivered to the handler's `terminate` callback and published to
/// dependents watching the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Orderly shutdown with nothing notable to report.
    Normal,

    /// The handler requested a stop with an application-specific reason.
    Handler(String),

    /// The source reported a fatal, unretriable error.
    FatalSource(String),

    /// The source connection or cursor was closed out-of-band.
    SourceClosed,
}

impl ExitReason {
    /// Creates a handler-requested stop reason.
    #[must_use]
    pub fn handler(reason: impl Into<String>) -> Self {
        ExitReason::Handler(reason.into())
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Handler(reason) => write!(f, "handler: {reason}"),
            ExitReason::FatalSource(error) => write!(f, "fatal source error: {error}"),
            ExitReason::SourceClosed => write!(f, "source closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FeedConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_millis(1000));
        assert_eq!(config.max_backoff, Duration::from_millis(64_000));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(FeedPhase::Connecting.to_string(), "Connecting");
        assert_eq!(FeedPhase::Streaming.to_string(), "Streaming");
        assert_eq!(FeedPhase::BackingOff.to_string(), "BackingOff");
        assert_eq!(FeedPhase::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::Normal.to_string(), "normal");
        assert_eq!(
            ExitReason::handler("drained").to_string(),
            "handler: drained"
        );
        assert!(ExitReason::FatalSource("bad query".into())
            .to_string()
            .contains("bad query"));
        assert_eq!(ExitReason::SourceClosed.to_string(), "source closed");
    }
}
