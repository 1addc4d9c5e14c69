//! Public subscription handle.
//!
//! [`start`] spawns a subscription actor and returns a [`FeedHandle`]
//! for interacting with it:
//!
//! - [`call`](FeedHandle::call): synchronous request/response
//! - [`cast`](FeedHandle::cast): fire-and-forget message
//! - [`notify`](FeedHandle::notify): out-of-band notification
//! - [`migrate`](FeedHandle::migrate): live state migration
//! - [`stop`](FeedHandle::stop): graceful shutdown
//! - [`stopped`](FeedHandle::stopped): termination observation
//!
//! Handles are cheap to clone; every clone addresses the same actor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::actor::{Event, FeedActor};
use crate::config::{ExitReason, FeedConfig, FeedPhase};
use crate::error::{CallError, MigrateError, StartError};
use crate::handler::{FeedHandler, ReplyTo};
use crate::metrics::{FeedMetrics, FeedMetricsSnapshot};

/// Starts a new subscription.
///
/// Spawns the subscription actor and blocks until the handler's `init`
/// resolves. On success the subscription proceeds to connect in the
/// background and the returned handle is immediately usable; connection
/// failures are handled internally by backing off and retrying and are
/// never surfaced here.
///
/// # Errors
///
/// Returns [`StartError::Refused`] if `init` declined to subscribe, or
/// [`StartError::Crashed`] if the handler died before answering.
pub async fn start<H: FeedHandler>(
    handler: H,
    source: H::Source,
    config: FeedConfig,
) -> Result<FeedHandle<H>, StartError> {
    let (events, inbox) = mpsc::unbounded_channel();
    let phase = Arc::new(RwLock::new(FeedPhase::Connecting));
    let metrics = Arc::new(FeedMetrics::new());
    let (exit_tx, exit_rx) = watch::channel(None);
    let (ready_tx, ready_rx) = oneshot::channel();

    let actor = FeedActor::new(
        handler,
        Arc::new(source),
        &config,
        inbox,
        events.clone(),
        Arc::clone(&phase),
        Arc::clone(&metrics),
        exit_tx,
    );
    tokio::spawn(actor.run(ready_tx));

    match ready_rx.await {
        Ok(Ok(())) => Ok(FeedHandle {
            events,
            phase,
            metrics,
            exit: exit_rx,
        }),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(StartError::Crashed),
    }
}

/// Handle to a running subscription.
pub struct FeedHandle<H: FeedHandler> {
    events: mpsc::UnboundedSender<Event<H>>,
    phase: Arc<RwLock<FeedPhase>>,
    metrics: Arc<FeedMetrics>,
    exit: watch::Receiver<Option<ExitReason>>,
}

impl<H: FeedHandler> FeedHandle<H> {
    /// Sends a synchronous request, waiting up to `timeout` for the
    /// reply.
    ///
    /// Requests are answered in any phase; a subscription that is backing
    /// off between reconnect attempts still replies. Do not call from
    /// inside the subscription's own handler: the actor cannot answer a
    /// request while it is executing a callback.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Timeout`] if no reply arrived in time, or
    /// [`CallError::Terminated`] if the subscription is gone or abandoned
    /// the request.
    pub async fn call(&self, request: H::Request, timeout: Duration) -> Result<H::Reply, CallError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Call {
                request,
                reply: ReplyTo::new(tx),
            })
            .map_err(|_| CallError::Terminated)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallError::Terminated),
            Err(_) => Err(CallError::Timeout(timeout)),
        }
    }

    /// Sends a fire-and-forget message. Silently dropped if the
    /// subscription has terminated.
    pub fn cast(&self, message: H::Message) {
        let _ = self.events.send(Event::Cast(message));
    }

    /// Delivers an out-of-band notification. Silently dropped if the
    /// subscription has terminated.
    pub fn notify(&self, notice: H::Notice) {
        let _ = self.events.send(Event::Notice(notice));
    }

    /// Requests a live state migration and waits for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Rejected`] if the handler refused the
    /// migration (the previous state is kept), or
    /// [`MigrateError::Terminated`] if the subscription is gone.
    pub async fn migrate(&self, from_version: u64, extra: Value) -> Result<(), MigrateError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Migrate {
                from_version,
                extra,
                done: tx,
            })
            .map_err(|_| MigrateError::Terminated)?;
        rx.await.map_err(|_| MigrateError::Terminated)?
    }

    /// Stops the subscription and waits until teardown completes: the
    /// cursor is released and `terminate` has run. Returns immediately
    /// if the subscription is already gone.
    pub async fn stop(&self, reason: ExitReason) {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(Event::Stop {
                reason,
                done: Some(tx),
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Returns the subscription's current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> FeedPhase {
        *self.phase.read()
    }

    /// Returns a snapshot of the subscription's runtime counters.
    #[must_use]
    pub fn metrics(&self) -> FeedMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns the exit reason if the subscription has terminated
    /// in an orderly fashion, `None` while it is still running.
    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit.borrow().clone()
    }

    /// Waits for the subscription to terminate.
    ///
    /// Returns the structured exit reason, or `None` if the actor
    /// crashed (e.g. a handler panic) without reporting one.
    pub async fn stopped(&self) -> Option<ExitReason> {
        let mut exit = self.exit.clone();
        loop {
            let current = exit.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if exit.changed().await.is_err() {
                let last = exit.borrow().clone();
                return last;
            }
        }
    }
}

impl<H: FeedHandler> Clone for FeedHandle<H> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            phase: Arc::clone(&self.phase),
            metrics: Arc::clone(&self.metrics),
            exit: self.exit.clone(),
        }
    }
}

impl<H: FeedHandler> fmt::Debug for FeedHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedHandle")
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::SourceError;
    use crate::testing::{mock_batch, HandlerEvent, RecordingHandler, ScriptedSource};

    fn config() -> FeedConfig {
        FeedConfig::default()
    }

    fn streaming_source() -> ScriptedSource {
        let source = ScriptedSource::new();
        source.script_connect(Ok(mock_batch(1)));
        source
    }

    // ── Startup ──

    #[tokio::test]
    async fn test_start_refused_by_init() {
        let source = ScriptedSource::new();
        let (handler, _events) = RecordingHandler::refusing("not today");

        let result = start(handler, source.clone(), config()).await;
        assert_eq!(result.unwrap_err(), StartError::Refused("not today".into()));
        // No connect attempt was made.
        assert_eq!(source.open_count(), 0);
    }

    // ── Synchronous requests ──

    #[tokio::test]
    async fn test_call_round_trip() {
        let source = streaming_source();
        let (handler, _events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        let reply = handle
            .call("hello".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "echo:hello");

        handle.stop(ExitReason::Normal).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_leaves_subscription_running() {
        let source = streaming_source();
        let (handler, _events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        let result = handle
            .call("noreply".to_string(), Duration::from_millis(100))
            .await;
        assert_eq!(
            result.unwrap_err(),
            CallError::Timeout(Duration::from_millis(100))
        );

        // The actor is unaffected and keeps answering.
        let reply = handle
            .call("still there?".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "echo:still there?");

        handle.stop(ExitReason::Normal).await;
    }

    #[tokio::test]
    async fn test_call_after_stop_is_terminated() {
        let source = streaming_source();
        let (handler, _events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        handle.stop(ExitReason::Normal).await;

        let result = handle
            .call("anyone?".to_string(), Duration::from_secs(1))
            .await;
        assert_eq!(result.unwrap_err(), CallError::Terminated);
    }

    #[tokio::test]
    async fn test_call_stop_directive_replies_then_stops() {
        let source = streaming_source();
        let (handler, mut events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        let reply = handle
            .call("stop".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "stopping");

        assert_eq!(
            handle.stopped().await,
            Some(ExitReason::handler("stopped by call"))
        );

        // Skip the update event, then expect terminate.
        loop {
            match events.recv().await.unwrap() {
                HandlerEvent::Terminated { reason, .. } => {
                    assert_eq!(reason, ExitReason::handler("stopped by call"));
                    break;
                }
                HandlerEvent::Update(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    // ── Casts and notifications ──

    #[tokio::test]
    async fn test_cast_and_notify_are_routed() {
        let source = streaming_source();
        let (handler, mut events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        handle.cast("tick".to_string());
        handle.notify("out-of-band".to_string());

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.recv().await.unwrap());
        }
        assert!(seen.contains(&HandlerEvent::Cast("tick".to_string())));
        assert!(seen.contains(&HandlerEvent::Info(crate::handler::FeedInfo::Notice(
            "out-of-band".to_string()
        ))));

        handle.stop(ExitReason::Normal).await;
    }

    #[tokio::test]
    async fn test_cast_stop_terminates() {
        let source = streaming_source();
        let (handler, _events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        handle.cast("stop".to_string());
        assert_eq!(
            handle.stopped().await,
            Some(ExitReason::handler("stopped by cast"))
        );
    }

    // ── Migration ──

    #[tokio::test]
    async fn test_migrate_swaps_state() {
        let source = streaming_source();
        let (handler, _events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        // One batch seen so far; migration adds 1000.
        handle.migrate(1, json!({})).await.unwrap();
        let reply = handle
            .call("state".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "1001");

        handle.stop(ExitReason::Normal).await;
    }

    #[tokio::test]
    async fn test_migrate_rejected_keeps_state() {
        let source = streaming_source();
        let (handler, _events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        let result = handle.migrate(2, json!("reject")).await;
        assert_eq!(
            result.unwrap_err(),
            MigrateError::Rejected("unsupported".into())
        );

        let reply = handle
            .call("state".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "1");

        handle.stop(ExitReason::Normal).await;
    }

    // ── Shutdown ──

    #[tokio::test]
    async fn test_stop_releases_cursor_and_terminates_once() {
        let source = streaming_source();
        let (handler, mut events) = RecordingHandler::new();
        let handle = start(handler, source.clone(), config()).await.unwrap();

        handle.stop(ExitReason::handler("done")).await;

        assert_eq!(handle.phase(), FeedPhase::Stopped);
        assert_eq!(handle.exit_reason(), Some(ExitReason::handler("done")));
        assert_eq!(source.closed_cursors().len(), 1);

        let mut terminations = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HandlerEvent::Terminated { .. }) {
                terminations += 1;
            }
        }
        assert_eq!(terminations, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_crashes_subscription() {
        let source = streaming_source();
        let (handler, mut events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        handle.cast("panic".to_string());

        // The crash reports no orderly exit reason.
        assert_eq!(handle.stopped().await, None);
        let result = handle
            .call("anyone?".to_string(), Duration::from_secs(1))
            .await;
        assert_eq!(result.unwrap_err(), CallError::Terminated);

        // terminate never ran.
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, HandlerEvent::Terminated { .. }));
        }
    }

    // ── Handle conveniences ──

    #[tokio::test]
    async fn test_clones_address_same_subscription() {
        let source = streaming_source();
        let (handler, _events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();
        let clone = handle.clone();

        clone.stop(ExitReason::Normal).await;
        assert_eq!(handle.stopped().await, Some(ExitReason::Normal));
    }

    #[tokio::test]
    async fn test_metrics_track_batches_and_connects() {
        let source = ScriptedSource::new();
        source.script_connect(Ok(mock_batch(2)));
        source.push_batch(mock_batch(3));

        let (handler, mut events) = RecordingHandler::new();
        let handle = start(handler, source, config()).await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                events.recv().await.unwrap(),
                HandlerEvent::Update(_)
            ));
        }

        let snapshot = handle.metrics();
        assert_eq!(snapshot.connects_total, 1);
        assert_eq!(snapshot.batches_total, 2);
        assert_eq!(snapshot.records_total, 5);
        assert_eq!(snapshot.retries_total, 0);

        handle.stop(ExitReason::Normal).await;
    }

    #[tokio::test]
    async fn test_transient_errors_are_invisible_to_callers() {
        let source = ScriptedSource::new();
        source.script_connect(Err(SourceError::transient("first attempt fails")));
        source.script_connect(Ok(mock_batch(1)));

        let (handler, _events) = RecordingHandler::new();
        // start succeeds even though the first connect attempt will fail.
        let config = FeedConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        };
        let handle = start(handler, source.clone(), config).await.unwrap();

        source.wait_for_opens(2).await;
        assert!(handle.exit_reason().is_none());

        handle.stop(ExitReason::Normal).await;
    }
}
