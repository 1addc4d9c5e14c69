//! Testing utilities for subscription handlers.
//!
//! Provides a scripted mock source and a recording handler for testing
//! the engine and application handlers without a real data source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::change::{ChangeBatch, ChangeRecord};
use crate::config::ExitReason;
use crate::error::SourceError;
use crate::handler::{Call, FeedHandler, FeedInfo, Flow, Init, Migration, ReplyTo, Update};
use crate::source::FeedSource;

/// Creates a batch of `n` creation records `{"id": 0..n}`.
#[must_use]
pub fn mock_batch(n: usize) -> ChangeBatch {
    ChangeBatch::new(
        (0..n)
            .map(|i| ChangeRecord::creation(json!({ "id": i })))
            .collect(),
    )
}

/// Creates a single-record batch carrying a document's initial value.
#[must_use]
pub fn initial_batch(value: Value) -> ChangeBatch {
    ChangeBatch::new(vec![ChangeRecord::creation(value)])
}

/// Creates a single-record batch carrying an update of one document.
#[must_use]
pub fn update_batch(old_val: Value, new_val: Value) -> ChangeBatch {
    ChangeBatch::new(vec![ChangeRecord::update(old_val, new_val)])
}

struct SourceInner {
    /// Scripted outcome per connect attempt, consumed front to back.
    connects: Mutex<VecDeque<Result<ChangeBatch, SourceError>>>,

    /// Live-driven fetch outcomes; `next()` pulls these in push order.
    fetch_tx: mpsc::UnboundedSender<Result<ChangeBatch, SourceError>>,
    fetch_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ChangeBatch, SourceError>>>,

    /// Number of connect attempts, published for test synchronization.
    opens: watch::Sender<u64>,

    /// Connect attempt timestamps.
    open_times: Mutex<Vec<tokio::time::Instant>>,

    /// Number of `next()` invocations.
    fetches: AtomicU64,

    /// Cursor ids handed out so far.
    next_cursor: AtomicU64,

    /// Cursor ids that were closed.
    closed: Mutex<Vec<u64>>,
}

/// Mock source driven by a script of connect outcomes and a queue of
/// fetch outcomes.
///
/// Connect attempts consume the scripted outcomes in order; an
/// unscripted connect, like a fetch with nothing queued, stays pending
/// forever so tests fully control the timeline. Clones share state, so
/// tests keep one clone for scripting and inspection while the engine
/// owns another.
#[derive(Clone)]
pub struct ScriptedSource {
    inner: Arc<SourceInner>,
}

impl ScriptedSource {
    /// Creates a source with an empty script.
    #[must_use]
    pub fn new() -> Self {
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SourceInner {
                connects: Mutex::new(VecDeque::new()),
                fetch_tx,
                fetch_rx: tokio::sync::Mutex::new(fetch_rx),
                opens: watch::Sender::new(0),
                open_times: Mutex::new(Vec::new()),
                fetches: AtomicU64::new(0),
                next_cursor: AtomicU64::new(0),
                closed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Scripts the outcome of the next unscripted connect attempt.
    /// `Ok` carries the first batch of the subscription.
    pub fn script_connect(&self, outcome: Result<ChangeBatch, SourceError>) {
        self.inner.connects.lock().push_back(outcome);
    }

    /// Queues a batch for delivery through `next()`.
    pub fn push_batch(&self, batch: ChangeBatch) {
        let _ = self.inner.fetch_tx.send(Ok(batch));
    }

    /// Queues a fetch failure for delivery through `next()`.
    pub fn push_fetch_error(&self, error: SourceError) {
        let _ = self.inner.fetch_tx.send(Err(error));
    }

    /// Returns the number of connect attempts so far.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        *self.inner.opens.borrow()
    }

    /// Waits until at least `n` connect attempts were made.
    pub async fn wait_for_opens(&self, n: u64) {
        let mut rx = self.inner.opens.subscribe();
        while *rx.borrow_and_update() < n {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns the timestamps of all connect attempts.
    #[must_use]
    pub fn open_times(&self) -> Vec<tokio::time::Instant> {
        self.inner.open_times.lock().clone()
    }

    /// Returns the number of `next()` invocations so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// Returns the cursor ids that were closed.
    #[must_use]
    pub fn closed_cursors(&self) -> Vec<u64> {
        self.inner.closed.lock().clone()
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    type Query = String;
    type Conn = ();
    type Cursor = u64;

    async fn open(&self, _query: &String, _conn: &()) -> Result<(u64, ChangeBatch), SourceError> {
        let outcome = self.inner.connects.lock().pop_front();
        self.inner.open_times.lock().push(tokio::time::Instant::now());
        self.inner.opens.send_modify(|n| *n += 1);

        match outcome {
            Some(Ok(first_batch)) => {
                let cursor = self.inner.next_cursor.fetch_add(1, Ordering::Relaxed) + 1;
                Ok((cursor, first_batch))
            }
            Some(Err(error)) => Err(error),
            None => std::future::pending().await,
        }
    }

    async fn next(&self, _cursor: &u64) -> Result<ChangeBatch, SourceError> {
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.inner.fetch_rx.lock().await;
        match rx.recv().await {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    async fn close(&self, cursor: &u64) {
        self.inner.closed.lock().push(*cursor);
    }
}

/// What a [`RecordingHandler`] observed, in invocation order.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    /// `on_update` ran with this batch.
    Update(ChangeBatch),

    /// `on_cast` ran with this message.
    Cast(String),

    /// `on_info` ran with this payload.
    Info(FeedInfo<String>),

    /// `on_migrate` ran.
    Migrated {
        /// The version migrated from.
        from_version: u64,
        /// The migration payload.
        extra: Value,
    },

    /// `terminate` ran.
    Terminated {
        /// The termination reason.
        reason: ExitReason,
        /// The final state value.
        state: u64,
    },
}

/// Handler that records every invocation and reacts to a small command
/// vocabulary, for exercising the engine from tests.
///
/// The state is the number of batches seen. Commands:
///
/// - call `"state"`: replies with the current state
/// - call `"noreply"`: parks the request unanswered (the caller times
///   out)
/// - call `"stop"`: replies `"stopping"` and stops
/// - call/cast `"arm:<ms>"`: arms an idle timeout of `<ms>` milliseconds
/// - cast `"stop"`: stops
/// - cast `"panic"`: panics, crashing the subscription
/// - notice `"stop"`: stops
/// - migrate with extra `"reject"`: rejects; anything else adds 1000 to
///   the state
/// - any other call: replies `"echo:<request>"`
pub struct RecordingHandler {
    query: String,
    refuse: Option<String>,
    stop_after: Option<u64>,
    events: mpsc::UnboundedSender<HandlerEvent>,
    /// Requests answered "later" are parked here so the caller keeps
    /// waiting instead of observing a dropped reply slot.
    parked: Mutex<Vec<ReplyTo<String>>>,
}

impl RecordingHandler {
    /// Creates a handler plus the receiver for its observations.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HandlerEvent>) {
        Self::build(None, None)
    }

    /// Creates a handler that stops after dispatching `n` batches.
    #[must_use]
    pub fn with_stop_after(n: u64) -> (Self, mpsc::UnboundedReceiver<HandlerEvent>) {
        Self::build(None, Some(n))
    }

    /// Creates a handler whose `init` refuses to start.
    #[must_use]
    pub fn refusing(reason: &str) -> (Self, mpsc::UnboundedReceiver<HandlerEvent>) {
        Self::build(Some(reason.to_string()), None)
    }

    fn build(
        refuse: Option<String>,
        stop_after: Option<u64>,
    ) -> (Self, mpsc::UnboundedReceiver<HandlerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                query: "changes".to_string(),
                refuse,
                stop_after,
                events,
                parked: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    fn record(&self, event: HandlerEvent) {
        let _ = self.events.send(event);
    }

    fn armed_timeout(command: &str) -> Option<std::time::Duration> {
        let ms = command.strip_prefix("arm:")?.parse().ok()?;
        Some(std::time::Duration::from_millis(ms))
    }
}

#[async_trait]
impl FeedHandler for RecordingHandler {
    type Source = ScriptedSource;
    type State = u64;
    type Request = String;
    type Reply = String;
    type Message = String;
    type Notice = String;

    async fn init(&self) -> Init<String, (), u64> {
        match &self.refuse {
            Some(reason) => Init::Stop {
                reason: reason.clone(),
            },
            None => Init::Subscribe {
                query: self.query.clone(),
                conn: (),
                state: 0,
            },
        }
    }

    async fn on_update(&self, batch: ChangeBatch, state: u64) -> Update<u64> {
        self.record(HandlerEvent::Update(batch));
        let state = state + 1;
        match self.stop_after {
            Some(limit) if state >= limit => {
                Update::stop(ExitReason::handler("batch limit reached"), state)
            }
            _ => Update::next(state),
        }
    }

    async fn on_call(
        &self,
        request: String,
        reply_to: ReplyTo<String>,
        state: u64,
    ) -> Call<String, u64> {
        match request.as_str() {
            "state" => Call::reply(state.to_string(), state),
            "noreply" => {
                self.parked.lock().push(reply_to);
                Call::no_reply(state)
            }
            "stop" => Call::Stop {
                reason: ExitReason::handler("stopped by call"),
                reply: Some("stopping".to_string()),
                state,
            },
            command => match Self::armed_timeout(command) {
                Some(timeout) => Call::Reply {
                    reply: "armed".to_string(),
                    state,
                    timeout: Some(timeout),
                },
                None => Call::reply(format!("echo:{request}"), state),
            },
        }
    }

    async fn on_cast(&self, message: String, state: u64) -> Flow<u64> {
        self.record(HandlerEvent::Cast(message.clone()));
        match message.as_str() {
            "stop" => Flow::stop(ExitReason::handler("stopped by cast"), state),
            "panic" => panic!("handler requested panic"),
            command => match Self::armed_timeout(command) {
                Some(timeout) => Flow::Continue {
                    state,
                    timeout: Some(timeout),
                },
                None => Flow::next(state),
            },
        }
    }

    async fn on_info(&self, info: FeedInfo<String>, state: u64) -> Flow<u64> {
        self.record(HandlerEvent::Info(info.clone()));
        match info {
            FeedInfo::Notice(notice) if notice == "stop" => {
                Flow::stop(ExitReason::handler("stopped by notice"), state)
            }
            _ => Flow::next(state),
        }
    }

    async fn on_migrate(&self, from_version: u64, state: u64, extra: Value) -> Migration<u64> {
        self.record(HandlerEvent::Migrated {
            from_version,
            extra: extra.clone(),
        });
        if extra == json!("reject") {
            Migration::Rejected {
                reason: "unsupported".to_string(),
                state,
            }
        } else {
            Migration::Updated(state + 1000)
        }
    }

    async fn terminate(&self, reason: &ExitReason, state: u64) {
        self.record(HandlerEvent::Terminated {
            reason: reason.clone(),
            state,
        });
    }
}
