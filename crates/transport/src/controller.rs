//! Controller side of the channel.
//!
//! A [`Controller`] owns one connection to a worker. Requests are started
//! through it and each gets a [`RequestHandle`] that receives only that
//! request's events, in order. A background reader routes inbound events by
//! id and drops the route once the request's terminal event has been
//! delivered.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use protocol::{
    codec, AggregateResponse, ChatPayload, ControlMessage, ErrorEnvelope, EventMessage,
    RemoteFailure, RequestId, RequestState,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Inbound, NdjsonCodec};
use crate::error::TransportError;

type ControllerCodec = NdjsonCodec<EventMessage, ControlMessage>;
type Routes = Arc<Mutex<HashMap<RequestId, mpsc::UnboundedSender<EventMessage>>>>;

/// Capacity of the outbound control queue.
const OUTBOUND_BUFFER: usize = 64;

/// Multiplexing client for one worker connection.
pub struct Controller {
    outbound: mpsc::Sender<ControlMessage>,
    routes: Routes,
    closing: CancellationToken,
    writer: Option<JoinHandle<Result<(), TransportError>>>,
    reader: Option<JoinHandle<()>>,
}

impl Controller {
    /// Starts the reader and writer tasks over an already-open channel.
    ///
    /// `reader` carries events from the worker and `writer` carries control
    /// messages to it. Must be called within a tokio runtime.
    ///
    /// `max_frame_bytes` bounds every event line, including a `done` carrying
    /// a large aggregate. A longer line cannot be attributed to its request,
    /// so it releases every outstanding handle: their [`RequestHandle::collect`]
    /// fails with [`TransportError::Closed`].
    pub fn connect<R, W>(reader: R, writer: W, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let closing = CancellationToken::new();
        let (outbound, queue) = mpsc::channel(OUTBOUND_BUFFER);

        let writer = tokio::spawn(write_controls(
            queue,
            FramedWrite::new(writer, ControllerCodec::new(max_frame_bytes)),
            closing.clone(),
        ));
        let reader = tokio::spawn(route_events(
            FramedRead::new(reader, ControllerCodec::new(max_frame_bytes)),
            Arc::clone(&routes),
        ));

        Self {
            outbound,
            routes,
            closing,
            writer: Some(writer),
            reader: Some(reader),
        }
    }

    /// Sends a `start_request` and returns the handle for its events.
    ///
    /// Fails with [`TransportError::DuplicateRequest`] if `id` is still
    /// outstanding on this controller.
    pub async fn start(
        &self,
        id: RequestId,
        payload: ChatPayload,
        streaming: bool,
    ) -> Result<RequestHandle, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = lock_routes(&self.routes);
            if routes.contains_key(&id) {
                return Err(TransportError::DuplicateRequest(id));
            }
            routes.insert(id.clone(), tx);
        }

        let message = ControlMessage::StartRequest {
            id: id.clone(),
            payload,
            streaming,
        };
        if self.outbound.send(message).await.is_err() {
            lock_routes(&self.routes).remove(&id);
            return Err(TransportError::Closed);
        }
        debug!(request_id = %id, streaming, "request started");

        Ok(RequestHandle {
            id,
            events: rx,
            outbound: self.outbound.clone(),
        })
    }

    /// Sends a `cancel_request` for `id`. The worker ignores unknown ids.
    pub async fn cancel(&self, id: &RequestId) -> Result<(), TransportError> {
        send_cancel(&self.outbound, id).await
    }

    /// Requests whose terminal event has not arrived yet.
    pub fn outstanding(&self) -> usize {
        lock_routes(&self.routes).len()
    }

    /// Closes the control direction and waits for the worker to finish.
    ///
    /// Queued control messages are flushed first. The worker sees end of
    /// input, cancels what is still running, and closes its side; the reader
    /// delivers those last events and then releases every handle.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.closing.cancel();
        let written = match self.writer.take() {
            Some(writer) => writer.await.unwrap_or(Err(TransportError::Closed)),
            None => Ok(()),
        };
        if let Some(reader) = self.reader.take() {
            if reader.await.is_err() {
                warn!("event reader task failed");
            }
        }
        written
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

// ---------------------------------------------------------------------------
// Per-request handle
// ---------------------------------------------------------------------------

/// Receiving end for one request's events.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    events: mpsc::UnboundedReceiver<EventMessage>,
    outbound: mpsc::Sender<ControlMessage>,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Next event for this request; `None` after the terminal event or if
    /// the connection is gone.
    pub async fn next_event(&mut self) -> Option<EventMessage> {
        self.events.recv().await
    }

    pub async fn cancel(&self) -> Result<(), TransportError> {
        send_cancel(&self.outbound, &self.id).await
    }

    /// Consumes events until the terminal one and summarizes the request.
    ///
    /// Chunk data is concatenated in arrival order. Fails with
    /// [`TransportError::Closed`] if the connection ends first.
    pub async fn collect(mut self) -> Result<RequestOutcome, TransportError> {
        let mut text = String::new();
        let mut chunks = 0_u64;
        while let Some(event) = self.next_event().await {
            match event {
                EventMessage::Chunk { seq, data, .. } => {
                    if seq != chunks {
                        warn!(request_id = %self.id, expected = chunks, seq, "chunk out of sequence");
                    }
                    chunks += 1;
                    text.push_str(&data);
                }
                EventMessage::Done {
                    aggregate_result, ..
                } => {
                    return Ok(RequestOutcome::Completed {
                        text: aggregate_result
                            .as_ref()
                            .map_or(text, |aggregate| aggregate.content.clone()),
                        chunks,
                        aggregate: aggregate_result,
                    })
                }
                EventMessage::Error { envelope, .. } => {
                    return Ok(RequestOutcome::Failed {
                        partial: text,
                        chunks,
                        envelope,
                    })
                }
                EventMessage::Cancelled { .. } => {
                    return Ok(RequestOutcome::Cancelled {
                        partial: text,
                        chunks,
                    })
                }
            }
        }
        Err(TransportError::Closed)
    }
}

/// How a request ended, as seen by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Completed {
        /// Concatenated chunks, or the aggregate content for non-streaming
        /// requests.
        text: String,
        chunks: u64,
        aggregate: Option<AggregateResponse>,
    },
    Failed {
        partial: String,
        chunks: u64,
        envelope: ErrorEnvelope,
    },
    Cancelled {
        partial: String,
        chunks: u64,
    },
}

impl RequestOutcome {
    pub fn state(&self) -> RequestState {
        match self {
            RequestOutcome::Completed { .. } => RequestState::Completed,
            RequestOutcome::Failed { .. } => RequestState::Failed,
            RequestOutcome::Cancelled { .. } => RequestState::Cancelled,
        }
    }

    /// The decoded failure chain, for `Failed` outcomes.
    pub fn failure(&self) -> Option<RemoteFailure> {
        match self {
            RequestOutcome::Failed { envelope, .. } => Some(codec::decode(envelope)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker process
// ---------------------------------------------------------------------------

/// A worker running as a child process, connected over its stdio.
///
/// The child's stderr is inherited so its logs reach the parent's stderr.
/// Dropping the value kills the child.
pub struct WorkerProcess {
    child: Child,
    controller: Controller,
}

impl WorkerProcess {
    /// Starts `command` with piped stdin and stdout and connects to it.
    ///
    /// `max_frame_bytes` should be at least the worker's own limit so that
    /// large aggregate results fit; see [`Controller::connect`] for what
    /// happens to a longer event line.
    pub fn spawn(mut command: Command, max_frame_bytes: usize) -> Result<Self, TransportError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(TransportError::Spawn)?;
        let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;
        info!(pid = child.id(), "worker process started");

        Ok(Self {
            child,
            controller: Controller::connect(stdout, stdin, max_frame_bytes),
        })
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Closes the channel and waits for the child to exit.
    pub async fn shutdown(mut self) -> Result<ExitStatus, TransportError> {
        self.controller.close().await?;
        let status = self.child.wait().await?;
        info!(%status, "worker process exited");
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn send_cancel(
    outbound: &mpsc::Sender<ControlMessage>,
    id: &RequestId,
) -> Result<(), TransportError> {
    outbound
        .send(ControlMessage::CancelRequest { id: id.clone() })
        .await
        .map_err(|_| TransportError::Closed)
}

async fn write_controls<W>(
    mut queue: mpsc::Receiver<ControlMessage>,
    mut sink: FramedWrite<W, ControllerCodec>,
    closing: CancellationToken,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            message = queue.recv() => message,
            _ = closing.cancelled() => None,
        };
        let Some(message) = message else { break };
        sink.send(message).await?;
    }

    // Flush anything queued before the close was requested.
    while let Ok(message) = queue.try_recv() {
        sink.send(message).await?;
    }
    sink.close().await
}

async fn route_events<R>(mut frames: FramedRead<R, ControllerCodec>, routes: Routes)
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        let event = match frame {
            Ok(Inbound::Message(event)) => event,
            Ok(Inbound::Rejected(err @ TransportError::FrameTooLarge { .. })) => {
                // The line is discarded unread, so whichever request it
                // belonged to can no longer be told apart from the rest.
                let released = release_all(&routes);
                warn!(error = %err, released, "event frame too large; releasing outstanding requests");
                continue;
            }
            Ok(Inbound::Rejected(err)) => {
                warn!(error = %err, "event frame rejected");
                continue;
            }
            Err(err) => {
                warn!(error = %err, "event channel read failed");
                break;
            }
        };

        let mut table = lock_routes(&routes);
        let id = event.id().clone();
        let route = if event.is_terminal() {
            table.remove(&id)
        } else {
            table.get(&id).cloned()
        };
        match route {
            // A dropped handle just means nobody is listening any more.
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!(request_id = %id, "event for unknown request dropped"),
        }
    }

    let orphaned = release_all(&routes);
    if orphaned > 0 {
        warn!(orphaned, "worker channel closed with requests outstanding");
    }
}

/// Drops every route so the waiting handles see the connection as closed.
fn release_all(routes: &Routes) -> usize {
    let mut table = lock_routes(routes);
    let released = table.len();
    table.clear();
    released
}

fn lock_routes(
    routes: &Mutex<HashMap<RequestId, mpsc::UnboundedSender<EventMessage>>>,
) -> MutexGuard<'_, HashMap<RequestId, mpsc::UnboundedSender<EventMessage>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}
