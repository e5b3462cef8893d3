//! Worker side of the channel.
//!
//! [`serve`] owns one control channel for its whole lifetime: it decodes
//! control frames from `input`, hands them to a [`Dispatcher`], and writes
//! the dispatcher's events to `output` from a dedicated writer task. The
//! event channel between the two is bounded, so a slow reader of `output`
//! slows the pumps down rather than growing memory.

use std::sync::Arc;
use std::time::Duration;

use bridge::{Dispatcher, DispatcherConfig};
use futures::{SinkExt, StreamExt};
use protocol::{ControlMessage, ErrorKind, EventMessage, InferenceClient};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::codec::{Inbound, NdjsonCodec, DEFAULT_MAX_FRAME_BYTES};
use crate::error::TransportError;

type WorkerCodec = NdjsonCodec<ControlMessage, EventMessage>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub dispatcher: DispatcherConfig,
    /// Longest control line accepted; longer lines are rejected and skipped.
    pub max_frame_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Counters reported when [`serve`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    /// Control messages handed to the dispatcher.
    pub accepted: u64,
    /// Inbound lines absorbed as protocol errors.
    pub rejected: u64,
}

/// Runs the worker until `input` reaches end of stream.
///
/// On EOF every outstanding request is cancelled, the pumps get the
/// configured grace period to report, and the remaining events are flushed
/// to `output` before returning. An I/O failure on either side ends the
/// loop the same way and is returned after the drain.
pub async fn serve<R, W>(
    input: R,
    output: W,
    client: Arc<dyn InferenceClient>,
    config: WorkerConfig,
) -> Result<ServeSummary, TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (dispatcher, events) = Dispatcher::with_channel(client, config.dispatcher.clone());
    let mut writer = tokio::spawn(write_events(
        events,
        FramedWrite::new(output, WorkerCodec::new(config.max_frame_bytes)),
    ));
    let mut frames = FramedRead::new(input, WorkerCodec::new(config.max_frame_bytes));

    info!(max_frame_bytes = config.max_frame_bytes, "worker serving");

    let mut summary = ServeSummary::default();
    let read_result = loop {
        match frames.next().await {
            Some(Ok(Inbound::Message(message))) => {
                debug!(request_id = %message.id(), "control message received");
                summary.accepted += 1;
                dispatcher.handle(message);
            }
            Some(Ok(Inbound::Rejected(err))) => {
                summary.rejected += 1;
                warn!(error = %err, kind = %ErrorKind::ProtocolError, "control frame rejected");
            }
            Some(Err(err)) => {
                error!(error = %err, "control channel read failed");
                break Err(err);
            }
            None => break Ok(()),
        }
    };

    info!(
        accepted = summary.accepted,
        rejected = summary.rejected,
        outstanding = dispatcher.in_flight(),
        "control channel closed; shutting down"
    );
    dispatcher.shutdown().await;

    // The writer ends once every sender is gone: ours here, and the pumps'
    // clones as they finish.
    drop(dispatcher);
    let drain = config.dispatcher.cancel_grace.max(Duration::from_millis(100));
    let write_result = match tokio::time::timeout(drain, &mut writer).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            error!(error = %join_err, "event writer task failed");
            Err(TransportError::Closed)
        }
        Err(_) => {
            warn!("event writer did not drain in time; abandoning remaining events");
            writer.abort();
            Ok(())
        }
    };

    read_result?;
    write_result?;
    info!("worker stopped");
    Ok(summary)
}

async fn write_events<W>(
    mut events: mpsc::Receiver<EventMessage>,
    mut sink: FramedWrite<W, WorkerCodec>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        if let Err(err) = sink.send(event).await {
            error!(error = %err, "event channel write failed");
            return Err(err);
        }
    }
    sink.close().await
}
