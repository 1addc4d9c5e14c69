//! Pluggable handler contract.
//!
//! Application code reacts to a change feed by implementing
//! [`FeedHandler`]. The engine owns connection management, reconnect
//! backoff, and cursor pagination; the handler owns domain logic and an
//! opaque state value that the engine threads through every invocation
//! by value, never inspecting or aliasing it.
//!
//! Every operation returns a directive instead of performing engine
//! I/O: the engine reshapes the directive into its next transition
//! (continue, reply, or stop).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::change::ChangeBatch;
use crate::config::ExitReason;
use crate::source::FeedSource;

/// The query type of a handler's source.
pub type QueryOf<H> = <<H as FeedHandler>::Source as FeedSource>::Query;

/// The connection handle type of a handler's source.
pub type ConnOf<H> = <<H as FeedHandler>::Source as FeedSource>::Conn;

/// The cursor handle type of a handler's source.
pub type CursorOf<H> = <<H as FeedHandler>::Source as FeedSource>::Cursor;

/// Directive returned by [`FeedHandler::init`].
pub enum Init<Q, C, S> {
    /// Subscribe to `query` over `conn`, starting with `state`.
    Subscribe {
        /// The subscription query to run.
        query: Q,
        /// The connection to run it against.
        conn: C,
        /// The initial application state.
        state: S,
    },

    /// Abort startup; `start` returns a descriptive error.
    Stop {
        /// Why startup was refused.
        reason: String,
    },
}

/// Directive returned by [`FeedHandler::on_update`].
pub enum Update<S> {
    /// Keep streaming: fetch the next batch.
    Next {
        /// The new application state.
        state: S,
        /// Optional idle timeout to arm (see [`FeedInfo::Timeout`]).
        timeout: Option<Duration>,
    },

    /// Stop the subscription; `terminate` runs afterward.
    Stop {
        /// The termination reason.
        reason: ExitReason,
        /// The final application state, passed to `terminate`.
        state: S,
    },
}

impl<S> Update<S> {
    /// Continue streaming with the given state.
    #[must_use]
    pub fn next(state: S) -> Self {
        Update::Next {
            state,
            timeout: None,
        }
    }

    /// Stop with the given reason and state.
    #[must_use]
    pub fn stop(reason: ExitReason, state: S) -> Self {
        Update::Stop { reason, state }
    }
}

/// Directive returned by [`FeedHandler::on_cast`] and
/// [`FeedHandler::on_info`].
pub enum Flow<S> {
    /// Keep running with the given state.
    Continue {
        /// The new application state.
        state: S,
        /// Optional idle timeout to arm (see [`FeedInfo::Timeout`]).
        timeout: Option<Duration>,
    },

    /// Stop the subscription; `terminate` runs afterward.
    Stop {
        /// The termination reason.
        reason: ExitReason,
        /// The final application state, passed to `terminate`.
        state: S,
    },
}

impl<S> Flow<S> {
    /// Continue with the given state.
    #[must_use]
    pub fn next(state: S) -> Self {
        Flow::Continue {
            state,
            timeout: None,
        }
    }

    /// Stop with the given reason and state.
    #[must_use]
    pub fn stop(reason: ExitReason, state: S) -> Self {
        Flow::Stop { reason, state }
    }
}

/// Directive returned by [`FeedHandler::on_call`].
pub enum Call<R, S> {
    /// Reply to the caller and keep running.
    Reply {
        /// The reply to deliver.
        reply: R,
        /// The new application state.
        state: S,
        /// Optional idle timeout to arm (see [`FeedInfo::Timeout`]).
        timeout: Option<Duration>,
    },

    /// Keep running without replying yet; the handler retains the
    /// [`ReplyTo`] and may reply later. If it never does, the caller
    /// times out.
    NoReply {
        /// The new application state.
        state: S,
        /// Optional idle timeout to arm (see [`FeedInfo::Timeout`]).
        timeout: Option<Duration>,
    },

    /// Stop the subscription, optionally delivering a final reply.
    Stop {
        /// The termination reason.
        reason: ExitReason,
        /// A final reply for the caller, if any.
        reply: Option<R>,
        /// The final application state, passed to `terminate`.
        state: S,
    },
}

impl<R, S> Call<R, S> {
    /// Reply and continue with the given state.
    #[must_use]
    pub fn reply(reply: R, state: S) -> Self {
        Call::Reply {
            reply,
            state,
            timeout: None,
        }
    }

    /// Continue without replying.
    #[must_use]
    pub fn no_reply(state: S) -> Self {
        Call::NoReply {
            state,
            timeout: None,
        }
    }
}

/// Directive returned by [`FeedHandler::on_migrate`].
///
/// The engine swaps its stored state only on `Updated`; on `Rejected`
/// the previous state is kept and the caller of `migrate` receives the
/// rejection reason.
pub enum Migration<S> {
    /// Migration succeeded; adopt the new state.
    Updated(S),

    /// Migration refused; keep the previous state.
    Rejected {
        /// Why the migration was refused.
        reason: String,
        /// The untouched previous state, handed back to the engine.
        state: S,
    },
}

/// Payload delivered to [`FeedHandler::on_info`].
///
/// Out-of-band notifications arrive as `Notice`; engine-internal signals
/// are forwarded through the same operation so the handler sees every
/// event category in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedInfo<N> {
    /// A notification delivered through the handle.
    Notice(N),

    /// An idle timeout armed by a previous directive elapsed before any
    /// other event arrived.
    Timeout,
}

/// Reply slot for a synchronous request.
///
/// Handed to [`FeedHandler::on_call`] so the handler can answer the
/// caller either immediately (by returning [`Call::Reply`]) or later
/// (by retaining the slot and invoking [`send`](ReplyTo::send)). The
/// first reply wins; subsequent sends are no-ops.
pub struct ReplyTo<R> {
    slot: Arc<Mutex<Option<oneshot::Sender<R>>>>,
}

impl<R> Clone for ReplyTo<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<R: Send> std::fmt::Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyTo")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

impl<R: Send> ReplyTo<R> {
    pub(crate) fn new(tx: oneshot::Sender<R>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Delivers the reply to the waiting caller.
    ///
    /// Returns `true` if the reply was sent, `false` if a reply was
    /// already delivered or the caller gave up waiting.
    pub fn send(&self, reply: R) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Returns `true` if a reply has already been delivered.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Callback contract implemented by application code.
///
/// All invocations for one subscription are serialized: no two callbacks
/// ever overlap, and the state value moves through them by ownership
/// transfer. Panics inside a callback are not caught; the subscription
/// actor crashes and dependents observe the termination.
#[async_trait]
pub trait FeedHandler: Send + Sync + 'static {
    /// The data-source capability this handler subscribes through.
    type Source: FeedSource;

    /// Opaque application state threaded through every invocation.
    type State: Send + 'static;

    /// Payload of synchronous requests ([`FeedHandle::call`]).
    ///
    /// [`FeedHandle::call`]: crate::handle::FeedHandle::call
    type Request: Send + 'static;

    /// Reply type for synchronous requests.
    type Reply: Send + 'static;

    /// Payload of fire-and-forget messages ([`FeedHandle::cast`]).
    ///
    /// [`FeedHandle::cast`]: crate::handle::FeedHandle::cast
    type Message: Send + 'static;

    /// Payload of out-of-band notifications ([`FeedHandle::notify`]).
    ///
    /// [`FeedHandle::notify`]: crate::handle::FeedHandle::notify
    type Notice: Send + 'static;

    /// Declares the subscription: which query to run, over which
    /// connection, with what initial state.
    ///
    /// `start` blocks its caller until this resolves. Returning
    /// [`Init::Stop`] aborts startup.
    async fn init(&self) -> Init<QueryOf<Self>, ConnOf<Self>, Self::State>;

    /// Reacts to one batch of changes, including the first batch the
    /// subscription produces on connect.
    async fn on_update(&self, batch: ChangeBatch, state: Self::State) -> Update<Self::State>;

    /// Handles a synchronous request.
    ///
    /// The default implementation leaves the request unanswered (the
    /// caller times out) and logs a warning.
    async fn on_call(
        &self,
        request: Self::Request,
        reply_to: ReplyTo<Self::Reply>,
        state: Self::State,
    ) -> Call<Self::Reply, Self::State> {
        let _ = (request, reply_to);
        tracing::warn!("unhandled synchronous request");
        Call::no_reply(state)
    }

    /// Handles a fire-and-forget message. The default ignores it.
    async fn on_cast(&self, message: Self::Message, state: Self::State) -> Flow<Self::State> {
        let _ = message;
        Flow::next(state)
    }

    /// Handles an out-of-band notification or engine signal. The
    /// default ignores it.
    async fn on_info(&self, info: FeedInfo<Self::Notice>, state: Self::State) -> Flow<Self::State> {
        let _ = info;
        Flow::next(state)
    }

    /// Migrates the state during a live upgrade. The default keeps the
    /// state unchanged.
    async fn on_migrate(
        &self,
        from_version: u64,
        state: Self::State,
        extra: Value,
    ) -> Migration<Self::State> {
        let _ = (from_version, extra);
        Migration::Updated(state)
    }

    /// Best-effort cleanup notification, invoked exactly once when the
    /// subscription stops in an orderly fashion. Panics are observed and
    /// logged, never propagated.
    async fn terminate(&self, reason: &ExitReason, state: Self::State) {
        let _ = (reason, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_to_first_send_wins() {
        let (tx, rx) = oneshot::channel();
        let reply_to = ReplyTo::new(tx);
        let clone = reply_to.clone();

        assert!(!reply_to.is_consumed());
        assert!(clone.send("first"));
        assert!(reply_to.is_consumed());
        assert!(!reply_to.send("second"));

        assert_eq!(rx.await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_reply_to_send_after_caller_gone() {
        let (tx, rx) = oneshot::channel::<&str>();
        let reply_to = ReplyTo::new(tx);
        drop(rx);

        assert!(!reply_to.send("too late"));
        assert!(reply_to.is_consumed());
    }

    #[test]
    fn test_directive_helpers() {
        match Update::next(7) {
            Update::Next { state, timeout } => {
                assert_eq!(state, 7);
                assert!(timeout.is_none());
            }
            Update::Stop { .. } => panic!("expected Next"),
        }

        match Flow::<u32>::stop(ExitReason::Normal, 1) {
            Flow::Stop { reason, state } => {
                assert_eq!(reason, ExitReason::Normal);
                assert_eq!(state, 1);
            }
            Flow::Continue { .. } => panic!("expected Stop"),
        }

        match Call::<&str, u32>::reply("ok", 2) {
            Call::Reply { reply, state, .. } => {
                assert_eq!(reply, "ok");
                assert_eq!(state, 2);
            }
            _ => panic!("expected Reply"),
        }
    }
}
