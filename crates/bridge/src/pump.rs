//! Per-request stream pump.
//!
//! A [`StreamPump`] owns one request from the moment its task starts until
//! its terminal event is handed to the dispatcher. It pulls from the
//! [`InferenceClient`](protocol::InferenceClient) on demand: the next fragment is
//! requested only after a permit on the bounded event channel has been
//! obtained and the previous fragment forwarded, so a slow controller
//! throttles the engine instead of growing a backlog in the worker.
//!
//! Both suspension points (waiting for upstream, waiting for a permit) race
//! against the request's cancellation token.

use std::sync::Arc;

use futures::StreamExt;
use protocol::{
    codec, AggregateResponse, ChatPayload, ErrorEnvelope, Fragment, FragmentStream,
    InferenceOutput, RequestId, RequestState, TerminalOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::TerminalLatch;

/// Lifecycle of a pump task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PumpState {
    fn can_transition_to(self, next: PumpState) -> bool {
        matches!(
            (self, next),
            (PumpState::Idle, PumpState::Running)
                | (
                    PumpState::Running,
                    PumpState::Completed | PumpState::Failed | PumpState::Cancelled
                )
        )
    }
}

impl From<RequestState> for PumpState {
    fn from(state: RequestState) -> Self {
        match state {
            RequestState::Pending => PumpState::Idle,
            RequestState::Streaming => PumpState::Running,
            RequestState::Completed => PumpState::Completed,
            RequestState::Failed => PumpState::Failed,
            RequestState::Cancelled => PumpState::Cancelled,
        }
    }
}

/// Why the pull loop stopped.
enum PumpExit {
    Finished(Option<AggregateResponse>),
    Failed(ErrorEnvelope),
    Cancelled,
    /// The event channel receiver is gone; nobody is listening any more.
    DownstreamClosed,
}

pub(crate) struct StreamPump {
    id: RequestId,
    payload: ChatPayload,
    streaming: bool,
    latch: Arc<TerminalLatch>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
    next_seq: u64,
    state: PumpState,
}

impl StreamPump {
    pub(crate) fn new(
        id: RequestId,
        payload: ChatPayload,
        streaming: bool,
        latch: Arc<TerminalLatch>,
        cancel: CancellationToken,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            id,
            payload,
            streaming,
            latch,
            cancel,
            dispatcher,
            next_seq: 0,
            state: PumpState::Idle,
        }
    }

    /// Drives the request to exactly one terminal event.
    pub(crate) async fn run(mut self) {
        self.transition(PumpState::Running);
        let exit = self.drive().await;
        self.finish(exit).await;
    }

    async fn drive(&mut self) -> PumpExit {
        let client = self.dispatcher.client();
        let invoked = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return PumpExit::Cancelled,
            result = client.invoke(&self.payload, self.streaming) => result,
        };

        let output = match invoked {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, kind = %err.kind(), "inference request failed before streaming");
                return PumpExit::Failed(codec::encode(&err));
            }
        };

        match (output, self.streaming) {
            (InferenceOutput::Stream(stream), true) => self.pump_stream(stream).await,
            (InferenceOutput::Stream(stream), false) => self.drain_stream(stream).await,
            (InferenceOutput::Aggregate(aggregate), false) => PumpExit::Finished(Some(aggregate)),
            (InferenceOutput::Aggregate(aggregate), true) => {
                debug!("client returned an aggregate for a streaming request");
                if !aggregate.content.is_empty() {
                    if let Err(exit) = self.deliver(aggregate.content).await {
                        return exit;
                    }
                }
                PumpExit::Finished(None)
            }
        }
    }

    async fn pump_stream(&mut self, mut stream: FragmentStream) -> PumpExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(data)) => {
                    if let Err(exit) = self.deliver(data).await {
                        return exit;
                    }
                }
                Some(Err(err)) => {
                    warn!(
                        error = %err,
                        kind = %err.kind(),
                        delivered = self.next_seq,
                        "fragment stream failed"
                    );
                    return PumpExit::Failed(codec::encode(&err));
                }
                None => return PumpExit::Finished(None),
            }
        }
    }

    /// Collects a stream into one aggregate for a non-streaming request.
    async fn drain_stream(&mut self, mut stream: FragmentStream) -> PumpExit {
        debug!("client returned a stream for a non-streaming request; draining");
        let mut content = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(data)) => content.push_str(&data),
                Some(Err(err)) => {
                    warn!(error = %err, kind = %err.kind(), "fragment stream failed while draining");
                    return PumpExit::Failed(codec::encode(&err));
                }
                None => return PumpExit::Finished(Some(AggregateResponse::from_content(content))),
            }
        }
    }

    /// Offers one fragment downstream. This is the backpressure point.
    async fn deliver(&mut self, data: String) -> Result<(), PumpExit> {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PumpExit::Cancelled),
            permit = self.dispatcher.events().reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(PumpExit::DownstreamClosed),
            },
        };

        let fragment = Fragment::new(self.next_seq, data);
        if !self
            .dispatcher
            .on_fragment(&self.id, &self.latch, fragment, permit)
        {
            // Cancelled between the pull and the hand-off: the fragment is dropped.
            return Err(PumpExit::Cancelled);
        }
        self.next_seq += 1;
        Ok(())
    }

    async fn finish(&mut self, exit: PumpExit) {
        let proposed = match exit {
            PumpExit::Finished(aggregate) => TerminalOutcome::Completed { aggregate },
            PumpExit::Failed(envelope) => TerminalOutcome::Failed(envelope),
            PumpExit::Cancelled => TerminalOutcome::Cancelled,
            PumpExit::DownstreamClosed => {
                warn!("event channel closed; abandoning request");
                TerminalOutcome::Cancelled
            }
        };

        let Some(outcome) = self.latch.finalize(proposed) else {
            error!("request reached a terminal state twice");
            debug_assert!(false, "pump for {} finalized twice", self.id);
            return;
        };
        self.transition(outcome.state().into());

        let permit = self.dispatcher.events().reserve().await.ok();
        self.dispatcher
            .on_terminal(&self.id, &self.latch, outcome, permit);
    }

    fn transition(&mut self, next: PumpState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid pump transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "pump transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pump_transitions() {
        assert!(PumpState::Idle.can_transition_to(PumpState::Running));
        assert!(PumpState::Running.can_transition_to(PumpState::Cancelled));
        assert!(!PumpState::Idle.can_transition_to(PumpState::Completed));
        assert!(!PumpState::Completed.can_transition_to(PumpState::Failed));
        assert!(!PumpState::Cancelled.can_transition_to(PumpState::Running));
    }

    #[test]
    fn test_terminal_request_states_map_to_terminal_pump_states() {
        assert_eq!(PumpState::from(RequestState::Failed), PumpState::Failed);
        assert_eq!(PumpState::from(RequestState::Cancelled), PumpState::Cancelled);
        assert_eq!(PumpState::from(RequestState::Completed), PumpState::Completed);
    }
}
