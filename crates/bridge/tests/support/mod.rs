//! Scripted inference clients and event helpers shared by the bridge suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge::{Dispatcher, DispatcherConfig};
use futures::stream::{self, StreamExt};
use protocol::{
    ChatMessage, ChatPayload, EventMessage, FragmentStream, InferenceClient, InferenceError,
    InferenceOutput, RequestId,
};
use tokio::sync::mpsc;

type Script =
    dyn Fn(&ChatPayload, bool) -> Result<InferenceOutput, InferenceError> + Send + Sync + 'static;

/// An [`InferenceClient`] whose behaviour is a closure over the payload.
pub struct ScriptedClient {
    script: Box<Script>,
    invocations: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(
        script: impl Fn(&ChatPayload, bool) -> Result<InferenceOutput, InferenceError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            invocations: AtomicUsize::new(0),
        })
    }

    /// Streams `fragments` and then completes.
    pub fn streaming(fragments: &[&str]) -> Arc<Self> {
        let fragments: Vec<String> = fragments.iter().map(|s| s.to_string()).collect();
        Self::new(move |_, _| {
            Ok(InferenceOutput::Stream(ok_stream(fragments.clone())))
        })
    }

    /// Never yields and never finishes.
    pub fn hanging() -> Arc<Self> {
        Self::new(|_, _| Ok(InferenceOutput::Stream(stream::pending().boxed())))
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn invoke(
        &self,
        payload: &ChatPayload,
        streaming: bool,
    ) -> Result<InferenceOutput, InferenceError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        (self.script)(payload, streaming)
    }
}

pub fn ok_stream(fragments: Vec<String>) -> FragmentStream {
    stream::iter(fragments.into_iter().map(Ok)).boxed()
}

/// A stream fed by the returned sender; ends when the sender is dropped.
pub fn gated_stream() -> (mpsc::UnboundedSender<Result<String, InferenceError>>, FragmentStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    (tx, stream)
}

pub fn id(s: &str) -> RequestId {
    RequestId::new(s).unwrap()
}

pub fn hi() -> ChatPayload {
    ChatPayload::new(vec![ChatMessage::user("hi")])
}

pub fn dispatcher(
    client: Arc<dyn InferenceClient>,
    event_buffer: usize,
) -> (Dispatcher, mpsc::Receiver<EventMessage>) {
    Dispatcher::with_channel(
        client,
        DispatcherConfig {
            event_buffer,
            cancel_grace: Duration::from_secs(2),
        },
    )
}

pub async fn next_event(rx: &mut mpsc::Receiver<EventMessage>) -> EventMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Receives events until `terminals` terminal events have been seen.
pub async fn collect_terminals(
    rx: &mut mpsc::Receiver<EventMessage>,
    terminals: usize,
) -> Vec<EventMessage> {
    let mut events = Vec::new();
    let mut seen = 0;
    while seen < terminals {
        let event = next_event(rx).await;
        if event.is_terminal() {
            seen += 1;
        }
        events.push(event);
    }
    events
}

/// Waits until the dispatcher has no outstanding requests.
pub async fn wait_idle(dispatcher: &Dispatcher) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("dispatcher did not go idle");
}

/// Asserts that nothing else arrives on the channel.
pub async fn assert_quiet(rx: &mut mpsc::Receiver<EventMessage>) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    if let Ok(event) = rx.try_recv() {
        panic!("unexpected event: {event:?}");
    }
}

/// Sequence numbers of the chunks for `id`, in arrival order.
pub fn chunk_seqs(events: &[EventMessage], id: &RequestId) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            EventMessage::Chunk { id: eid, seq, .. } if eid == id => Some(*seq),
            _ => None,
        })
        .collect()
}
