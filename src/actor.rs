//! Subscription state machine.
//!
//! One actor task owns one subscription. All state transitions and all
//! handler invocations are serialized through a single consumer loop
//! over one merged event channel: external messages, connect/fetch
//! completions, and retry timers all enqueue into the same inbox.
//!
//! The phases and their transitions:
//!
//! ```text
//!            open ok                    fetch ok
//! Connecting ────────► Streaming ◄──────────────┐
//!     ▲  │                 │  │                 │
//!     │  │ transient       │  └── dispatch ─────┘
//!     │  │ failure         │ transient fetch failure
//!     │  ▼                 ▼
//!  retry timer ◄─── BackingOff
//!
//!  any phase ── stop directive / fatal error ──► Stopped
//! ```
//!
//! The only concurrency is the single in-flight connect/fetch task; the
//! loop itself stays free to process calls, casts, notifications, and
//! timers in arrival order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::backoff::BackoffPolicy;
use crate::change::ChangeBatch;
use crate::config::{ExitReason, FeedConfig, FeedPhase};
use crate::error::{MigrateError, SourceError, StartError};
use crate::fetch::{FetchToken, Fetcher};
use crate::handler::{
    Call, ConnOf, CursorOf, FeedHandler, FeedInfo, Flow, Init, Migration, QueryOf, ReplyTo, Update,
};
use crate::metrics::FeedMetrics;
use crate::source::FeedSource;

/// Everything that can wake the subscription actor.
pub(crate) enum Event<H: FeedHandler> {
    /// A synchronous request from `FeedHandle::call`.
    Call {
        request: H::Request,
        reply: ReplyTo<H::Reply>,
    },

    /// A fire-and-forget message from `FeedHandle::cast`.
    Cast(H::Message),

    /// An out-of-band notification from `FeedHandle::notify`.
    Notice(H::Notice),

    /// A state migration request from `FeedHandle::migrate`.
    Migrate {
        from_version: u64,
        extra: Value,
        done: oneshot::Sender<Result<(), MigrateError>>,
    },

    /// A stop request from `FeedHandle::stop`.
    Stop {
        reason: ExitReason,
        done: Option<oneshot::Sender<()>>,
    },

    /// Completion of an asynchronous connect attempt.
    ConnectDone {
        token: FetchToken,
        outcome: Result<(CursorOf<H>, ChangeBatch), SourceError>,
    },

    /// Completion of an asynchronous batch pull.
    FetchDone {
        token: FetchToken,
        outcome: Result<ChangeBatch, SourceError>,
    },

    /// A backoff retry timer fired.
    Retry,
}

/// Outcome of processing one event.
enum Step<S> {
    Continue(S),
    Stop(ExitReason, S),
}

/// The actor owning one subscription.
pub(crate) struct FeedActor<H: FeedHandler> {
    handler: H,
    source: Arc<H::Source>,
    inbox: mpsc::UnboundedReceiver<Event<H>>,
    events: mpsc::UnboundedSender<Event<H>>,
    fetcher: Fetcher<H>,
    backoff: BackoffPolicy,
    phase: Arc<RwLock<FeedPhase>>,
    metrics: Arc<FeedMetrics>,
    exit: watch::Sender<Option<ExitReason>>,
    query: Option<QueryOf<H>>,
    conn: Option<ConnOf<H>>,
    cursor: Option<CursorOf<H>>,
    idle: Option<Duration>,
    stop_acks: Vec<oneshot::Sender<()>>,
}

impl<H: FeedHandler> FeedActor<H> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handler: H,
        source: Arc<H::Source>,
        config: &FeedConfig,
        inbox: mpsc::UnboundedReceiver<Event<H>>,
        events: mpsc::UnboundedSender<Event<H>>,
        phase: Arc<RwLock<FeedPhase>>,
        metrics: Arc<FeedMetrics>,
        exit: watch::Sender<Option<ExitReason>>,
    ) -> Self {
        let fetcher = Fetcher::new(Arc::clone(&source), events.clone());
        Self {
            handler,
            source,
            inbox,
            events,
            fetcher,
            backoff: BackoffPolicy::from_config(config),
            phase,
            metrics,
            exit,
            query: None,
            conn: None,
            cursor: None,
            idle: None,
            stop_acks: Vec::new(),
        }
    }

    /// Runs the subscription to completion.
    ///
    /// `ready` is resolved once the handler's `init` has been consulted,
    /// unblocking the caller of `start`.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<(), StartError>>) {
        let state = match self.handler.init().await {
            Init::Subscribe { query, conn, state } => {
                self.query = Some(query);
                self.conn = Some(conn);
                let _ = ready.send(Ok(()));
                state
            }
            Init::Stop { reason } => {
                tracing::debug!(%reason, "subscription refused to start");
                self.set_phase(FeedPhase::Stopped);
                let _ = ready.send(Err(StartError::Refused(reason)));
                return;
            }
        };

        self.start_connect();
        let (reason, state) = self.event_loop(state).await;
        self.shutdown(reason, state).await;
    }

    async fn event_loop(&mut self, mut state: H::State) -> (ExitReason, H::State) {
        loop {
            let event = match self.idle.take() {
                Some(window) => match tokio::time::timeout(window, self.inbox.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        match self.dispatch_info(FeedInfo::Timeout, state).await {
                            Step::Continue(next) => {
                                state = next;
                                continue;
                            }
                            Step::Stop(reason, final_state) => return (reason, final_state),
                        }
                    }
                },
                None => self.inbox.recv().await,
            };

            let Some(event) = event else {
                // Cannot happen while the actor holds its own sender.
                return (ExitReason::Normal, state);
            };

            match self.handle_event(event, state).await {
                Step::Continue(next) => state = next,
                Step::Stop(reason, final_state) => return (reason, final_state),
            }
        }
    }

    async fn handle_event(&mut self, event: Event<H>, state: H::State) -> Step<H::State> {
        match event {
            Event::Call { request, reply } => {
                match self.handler.on_call(request, reply.clone(), state).await {
                    Call::Reply {
                        reply: response,
                        state,
                        timeout,
                    } => {
                        reply.send(response);
                        self.idle = timeout;
                        Step::Continue(state)
                    }
                    Call::NoReply { state, timeout } => {
                        self.idle = timeout;
                        Step::Continue(state)
                    }
                    Call::Stop {
                        reason,
                        reply: response,
                        state,
                    } => {
                        if let Some(response) = response {
                            reply.send(response);
                        }
                        Step::Stop(reason, state)
                    }
                }
            }

            Event::Cast(message) => {
                let flow = self.handler.on_cast(message, state).await;
                self.apply_flow(flow)
            }

            Event::Notice(notice) => self.dispatch_info(FeedInfo::Notice(notice), state).await,

            Event::Migrate {
                from_version,
                extra,
                done,
            } => match self.handler.on_migrate(from_version, state, extra).await {
                Migration::Updated(state) => {
                    tracing::debug!(from_version, "state migrated");
                    let _ = done.send(Ok(()));
                    Step::Continue(state)
                }
                Migration::Rejected { reason, state } => {
                    tracing::warn!(from_version, %reason, "state migration rejected");
                    let _ = done.send(Err(MigrateError::Rejected(reason)));
                    Step::Continue(state)
                }
            },

            Event::Stop { reason, done } => {
                if let Some(done) = done {
                    self.stop_acks.push(done);
                }
                Step::Stop(reason, state)
            }

            Event::ConnectDone { token, outcome } => {
                self.on_connect_done(token, outcome, state).await
            }

            Event::FetchDone { token, outcome } => self.on_fetch_done(token, outcome, state).await,

            Event::Retry => {
                if self.phase() == FeedPhase::BackingOff {
                    self.start_connect();
                }
                Step::Continue(state)
            }
        }
    }

    async fn on_connect_done(
        &mut self,
        token: FetchToken,
        outcome: Result<(CursorOf<H>, ChangeBatch), SourceError>,
        state: H::State,
    ) -> Step<H::State> {
        if !self.fetcher.complete(token) {
            // Superseded attempt; release the cursor it may have opened.
            if let Ok((cursor, _)) = outcome {
                let source = Arc::clone(&self.source);
                tokio::spawn(async move { source.close(&cursor).await });
            }
            return Step::Continue(state);
        }

        match outcome {
            Ok((cursor, first_batch)) => {
                tracing::info!("subscription connected");
                self.cursor = Some(cursor);
                self.backoff.reset();
                self.metrics.record_connect();
                self.set_phase(FeedPhase::Streaming);
                self.dispatch_update(first_batch, state).await
            }
            Err(SourceError::Transient(error)) => {
                tracing::warn!(%error, "connect attempt failed");
                self.metrics.record_error();
                self.schedule_retry();
                Step::Continue(state)
            }
            Err(SourceError::Fatal(error)) => {
                tracing::error!(%error, "fatal error establishing subscription");
                self.metrics.record_error();
                Step::Stop(ExitReason::FatalSource(error), state)
            }
            Err(SourceError::Closed) => {
                tracing::warn!("connection closed while establishing subscription");
                self.metrics.record_error();
                Step::Stop(ExitReason::SourceClosed, state)
            }
        }
    }

    async fn on_fetch_done(
        &mut self,
        token: FetchToken,
        outcome: Result<ChangeBatch, SourceError>,
        state: H::State,
    ) -> Step<H::State> {
        if !self.fetcher.complete(token) {
            // Stale result from a superseded fetch.
            return Step::Continue(state);
        }

        match outcome {
            Ok(batch) => {
                self.backoff.reset();
                self.dispatch_update(batch, state).await
            }
            Err(SourceError::Transient(error)) => {
                tracing::warn!(%error, "fetch failed; reconnecting");
                self.metrics.record_error();
                self.release_cursor().await;
                self.schedule_retry();
                Step::Continue(state)
            }
            Err(SourceError::Fatal(error)) => {
                tracing::error!(%error, "fatal source error");
                self.metrics.record_error();
                Step::Stop(ExitReason::FatalSource(error), state)
            }
            Err(SourceError::Closed) => {
                tracing::warn!("source closed during fetch");
                self.metrics.record_error();
                Step::Stop(ExitReason::SourceClosed, state)
            }
        }
    }

    /// Dispatches one batch to the handler and, unless it stopped the
    /// subscription, starts the next fetch.
    async fn dispatch_update(&mut self, batch: ChangeBatch, state: H::State) -> Step<H::State> {
        self.metrics.record_batch(batch.len() as u64);
        match self.handler.on_update(batch, state).await {
            Update::Next { state, timeout } => {
                self.idle = timeout;
                if let Some(cursor) = &self.cursor {
                    self.fetcher.begin_fetch(cursor);
                }
                Step::Continue(state)
            }
            Update::Stop { reason, state } => Step::Stop(reason, state),
        }
    }

    async fn dispatch_info(
        &mut self,
        info: FeedInfo<H::Notice>,
        state: H::State,
    ) -> Step<H::State> {
        let flow = self.handler.on_info(info, state).await;
        self.apply_flow(flow)
    }

    fn apply_flow(&mut self, flow: Flow<H::State>) -> Step<H::State> {
        match flow {
            Flow::Continue { state, timeout } => {
                self.idle = timeout;
                Step::Continue(state)
            }
            Flow::Stop { reason, state } => Step::Stop(reason, state),
        }
    }

    fn start_connect(&mut self) {
        let (Some(query), Some(conn)) = (self.query.as_ref(), self.conn.as_ref()) else {
            return;
        };
        self.set_phase(FeedPhase::Connecting);
        self.fetcher.begin_connect(query, conn);
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        self.set_phase(FeedPhase::BackingOff);
        self.metrics.record_retry();
        tracing::warn!(?delay, "backing off before reconnect");

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Retry);
        });
    }

    async fn release_cursor(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.source.close(&cursor).await;
        }
    }

    /// Releases resources, notifies the handler, and publishes the exit
    /// reason. The cursor is closed before `terminate` runs.
    async fn shutdown(mut self, reason: ExitReason, state: H::State) {
        self.fetcher.cancel();
        self.release_cursor().await;
        self.set_phase(FeedPhase::Stopped);
        tracing::info!(%reason, "subscription stopping");

        let teardown = AssertUnwindSafe(self.handler.terminate(&reason, state)).catch_unwind();
        if teardown.await.is_err() {
            tracing::error!("terminate callback panicked");
        }

        let _ = self.exit.send(Some(reason));
        for ack in self.stop_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    fn phase(&self) -> FeedPhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: FeedPhase) {
        *self.phase.write() = phase;
        tracing::debug!(%phase, "phase change");
    }
}
