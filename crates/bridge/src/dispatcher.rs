//! Control-message dispatcher.
//!
//! The [`Dispatcher`] is the only writer of registry membership. Every
//! registry operation (start, cancel, fragment hand-off, terminal hand-off)
//! takes the registry mutex for the duration of that one operation and never
//! across an `.await`; pumps acquire their channel permit *before* calling in,
//! so the send under the lock cannot block.
//!
//! Because the fragment and terminal checks happen under the same lock as
//! eviction, no chunk can follow its request's terminal event on the channel.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use protocol::{
    ChatPayload, ControlMessage, ErrorEnvelope, EventMessage, Fragment, InferenceClient,
    RequestId, RequestState, TerminalOutcome,
};
use tokio::sync::mpsc::{self, Permit};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::BridgeError;
use crate::pump::StreamPump;
use crate::registry::{CancelSignal, RequestRegistry, TerminalLatch};

/// Tunables for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of the bounded event channel created by [`Dispatcher::with_channel`].
    pub event_buffer: usize,
    /// How long [`Dispatcher::shutdown`] waits for cancelled pumps to finish.
    pub cancel_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            event_buffer: 64,
            cancel_grace: Duration::from_secs(2),
        }
    }
}

struct Inner {
    client: Arc<dyn InferenceClient>,
    registry: Mutex<RequestRegistry>,
    events: mpsc::Sender<EventMessage>,
    tracker: TaskTracker,
    config: DispatcherConfig,
}

/// Routes control messages to stream pumps and their events to the controller.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates a dispatcher that forwards events into `events`.
    pub fn new(
        client: Arc<dyn InferenceClient>,
        events: mpsc::Sender<EventMessage>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                registry: Mutex::new(RequestRegistry::new()),
                events,
                tracker: TaskTracker::new(),
                config,
            }),
        }
    }

    /// Creates a dispatcher together with the receiving end of its event channel.
    pub fn with_channel(
        client: Arc<dyn InferenceClient>,
        config: DispatcherConfig,
    ) -> (Self, mpsc::Receiver<EventMessage>) {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        (Self::new(client, tx, config), rx)
    }

    /// Applies one control message. Protocol errors are logged and absorbed.
    pub fn handle(&self, message: ControlMessage) {
        match message {
            ControlMessage::StartRequest {
                id,
                payload,
                streaming,
            } => {
                if let Err(err) = self.handle_start(id, payload, streaming) {
                    warn!(error = %err, kind = %err.kind(), "start request rejected");
                }
            }
            ControlMessage::CancelRequest { id } => {
                self.handle_cancel(&id);
            }
        }
    }

    /// Registers `id` and spawns its pump. Returns without waiting for output.
    pub fn handle_start(
        &self,
        id: RequestId,
        payload: ChatPayload,
        streaming: bool,
    ) -> Result<(), BridgeError> {
        if self.inner.tracker.is_closed() {
            return Err(BridgeError::ShuttingDown(id));
        }

        let entry = self.lock_registry().register(id.clone())?;
        debug!(request_id = %id, streaming, messages = payload.messages.len(), "request accepted");

        let latch = Arc::clone(&entry.latch);
        let pump = StreamPump::new(
            id.clone(),
            payload,
            streaming,
            entry.latch,
            entry.cancel,
            self.clone(),
        );
        let dispatcher = self.clone();
        let span = info_span!("request", request_id = %id);

        self.inner.tracker.spawn(
            async move {
                if let Err(panic) = AssertUnwindSafe(pump.run()).catch_unwind().await {
                    dispatcher
                        .fail_internal(&id, &latch, panic_message(panic.as_ref()))
                        .await;
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Signals the pump owning `id` to stop.
    ///
    /// Unknown and already-finished ids are ignored; no event is produced for
    /// them. Returns `true` if a pump was signalled.
    pub fn handle_cancel(&self, id: &RequestId) -> bool {
        match self.lock_registry().signal_cancel(id) {
            CancelSignal::Signalled => {
                debug!(request_id = %id, "cancellation signalled");
                true
            }
            CancelSignal::Unknown => {
                debug!(request_id = %id, "cancel for unknown request ignored");
                false
            }
            CancelSignal::AlreadyFinished => {
                debug!(request_id = %id, "cancel for finished request ignored");
                false
            }
        }
    }

    /// Forwards a chunk if `id` is still owned by `latch` and live.
    ///
    /// Returns `false` (and drops the fragment) if the request was cancelled or
    /// already finished.
    pub(crate) fn on_fragment(
        &self,
        id: &RequestId,
        latch: &Arc<TerminalLatch>,
        fragment: Fragment,
        permit: Permit<'_, EventMessage>,
    ) -> bool {
        let registry = self.lock_registry();
        let live = registry
            .get(id)
            .is_some_and(|entry| entry.is_owned_by(latch) && latch.is_live());
        if !live {
            debug!(request_id = %id, seq = fragment.seq, "fragment dropped for inactive request");
            return false;
        }

        if latch.mark_streaming() {
            debug!(request_id = %id, "first fragment");
        }
        permit.send(EventMessage::chunk(id.clone(), fragment));
        true
    }

    /// Forwards the terminal event for `id` and evicts its entry.
    ///
    /// Called exactly once per request by the owning pump. `permit` is `None`
    /// when the event channel is closed, in which case the entry is still
    /// evicted.
    pub(crate) fn on_terminal(
        &self,
        id: &RequestId,
        latch: &Arc<TerminalLatch>,
        outcome: TerminalOutcome,
        permit: Option<Permit<'_, EventMessage>>,
    ) {
        let mut registry = self.lock_registry();
        let owned = registry.get(id).is_some_and(|entry| entry.is_owned_by(latch));
        if !owned {
            drop(registry);
            error!(request_id = %id, "terminal event for a request that is no longer registered");
            debug_assert!(false, "second terminal signal for {id}");
            return;
        }

        let evicted = registry.remove(id);
        let state = outcome.state();
        match permit {
            Some(permit) => permit.send(EventMessage::terminal(id.clone(), outcome)),
            None => warn!(request_id = %id, "event channel closed; terminal event dropped"),
        }
        drop(registry);

        if let Some(entry) = evicted {
            info!(
                request_id = %id,
                state = %state,
                elapsed_ms = entry.accepted_at.elapsed_ms(),
                "request finished"
            );
        }
    }

    /// Ends a request whose pump panicked.
    ///
    /// The panic proposes an `internal_error` outcome through the latch like
    /// any other; a cancellation recorded earlier still wins. Only the
    /// offending request is affected. If the pump had already forwarded its
    /// terminal event, nothing more is sent.
    async fn fail_internal(&self, id: &RequestId, latch: &Arc<TerminalLatch>, message: String) {
        error!(request_id = %id, panic = %message, "stream pump panicked");
        let envelope = ErrorEnvelope::internal(format!("stream pump panicked: {message}"));
        // `None` means the pump finalized before panicking; its outcome was
        // never sent, so report the panic.
        let outcome = latch
            .finalize(TerminalOutcome::Failed(envelope.clone()))
            .unwrap_or(TerminalOutcome::Failed(envelope));

        let permit = self.inner.events.reserve().await.ok();
        let mut registry = self.lock_registry();
        let owned = registry.get(id).is_some_and(|entry| entry.is_owned_by(latch));
        if !owned {
            return;
        }
        registry.remove(id);
        let state = outcome.state();
        if let Some(permit) = permit {
            permit.send(EventMessage::terminal(id.clone(), outcome));
        }
        drop(registry);
        info!(request_id = %id, state = %state, "request finished after pump panic");
    }

    /// Cancels every outstanding request and waits, up to the configured grace
    /// period, for their pumps to report. New starts are refused afterwards.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        let signalled = self.lock_registry().cancel_all();
        if signalled > 0 {
            info!(signalled, "cancelling outstanding requests");
        }

        let grace = self.inner.config.cancel_grace;
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.in_flight(),
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed with pumps still running"
            );
        }
    }

    /// Number of outstanding requests.
    pub fn in_flight(&self) -> usize {
        self.lock_registry().len()
    }

    /// Current state of `id`, if it is outstanding.
    pub fn request_state(&self, id: &RequestId) -> Option<RequestState> {
        self.lock_registry().state(id)
    }

    pub(crate) fn client(&self) -> Arc<dyn InferenceClient> {
        Arc::clone(&self.inner.client)
    }

    pub(crate) fn events(&self) -> &mpsc::Sender<EventMessage> {
        &self.inner.events
    }

    fn lock_registry(&self) -> MutexGuard<'_, RequestRegistry> {
        // Every mutation is a single map operation, so a poisoned registry is still consistent.
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
