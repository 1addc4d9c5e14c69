//! Single-flight asynchronous fetch operations.
//!
//! Connect attempts and batch pulls run on spawned tasks so the
//! subscription actor stays responsive while they are in flight. Each
//! operation is tagged with a [`FetchToken`]; the actor only accepts the
//! completion bearing the token it is currently waiting for, so results
//! from superseded operations are discarded instead of corrupting the
//! state machine.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::actor::Event;
use crate::handler::{ConnOf, CursorOf, FeedHandler, QueryOf};
use crate::source::FeedSource;

/// Correlation token for one in-flight connect or fetch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchToken(u64);

/// Spawns and tracks the single in-flight source operation.
///
/// At most one operation is outstanding at a time; starting a new one is
/// only permitted once the previous one completed or was cancelled.
pub(crate) struct Fetcher<H: FeedHandler> {
    source: Arc<H::Source>,
    events: mpsc::UnboundedSender<Event<H>>,
    next_token: u64,
    pending: Option<FetchToken>,
}

impl<H: FeedHandler> Fetcher<H> {
    pub(crate) fn new(source: Arc<H::Source>, events: mpsc::UnboundedSender<Event<H>>) -> Self {
        Self {
            source,
            events,
            next_token: 0,
            pending: None,
        }
    }

    /// Starts an asynchronous connect attempt.
    pub(crate) fn begin_connect(&mut self, query: &QueryOf<H>, conn: &ConnOf<H>) -> FetchToken {
        let token = self.mint();
        let source = Arc::clone(&self.source);
        let query = query.clone();
        let conn = conn.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let outcome = source.open(&query, &conn).await;
            let _ = events.send(Event::ConnectDone { token, outcome });
        });

        token
    }

    /// Starts an asynchronous pull of the next batch.
    pub(crate) fn begin_fetch(&mut self, cursor: &CursorOf<H>) -> FetchToken {
        let token = self.mint();
        let source = Arc::clone(&self.source);
        let cursor = cursor.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let outcome = source.next(&cursor).await;
            let _ = events.send(Event::FetchDone { token, outcome });
        });

        token
    }

    /// Consumes the pending operation if `token` matches it.
    ///
    /// Returns `false` for stale tokens; the caller must discard the
    /// corresponding result.
    pub(crate) fn complete(&mut self, token: FetchToken) -> bool {
        if self.pending == Some(token) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Forgets the pending operation so its eventual completion is
    /// treated as stale.
    pub(crate) fn cancel(&mut self) {
        self.pending = None;
    }

    fn mint(&mut self) -> FetchToken {
        debug_assert!(self.pending.is_none(), "operation already in flight");
        self.next_token += 1;
        let token = FetchToken(self.next_token);
        self.pending = Some(token);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingHandler, ScriptedSource};

    fn test_fetcher() -> (
        Fetcher<RecordingHandler>,
        mpsc::UnboundedReceiver<Event<RecordingHandler>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Fetcher::new(Arc::new(ScriptedSource::new()), tx), rx)
    }

    #[tokio::test]
    async fn test_tokens_are_unique_and_current() {
        let (mut fetcher, _rx) = test_fetcher();

        let first = fetcher.begin_fetch(&1);
        assert!(fetcher.complete(first));

        let second = fetcher.begin_fetch(&1);
        assert_ne!(first, second);

        // A stale token no longer matches.
        assert!(!fetcher.complete(first));
        assert!(fetcher.complete(second));
    }

    #[tokio::test]
    async fn test_complete_consumes_pending() {
        let (mut fetcher, _rx) = test_fetcher();

        let token = fetcher.begin_fetch(&1);
        assert!(fetcher.complete(token));
        // Already consumed.
        assert!(!fetcher.complete(token));
    }

    #[tokio::test]
    async fn test_cancel_makes_completion_stale() {
        let (mut fetcher, _rx) = test_fetcher();

        let token = fetcher.begin_fetch(&1);
        fetcher.cancel();
        assert!(!fetcher.complete(token));
    }
}
