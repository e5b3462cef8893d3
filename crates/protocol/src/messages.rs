//! Messages exchanged over the inter-process channel.
//!
//! The controller sends [`ControlMessage`]s; the worker answers with
//! [`EventMessage`]s. Both serialize as one JSON object with a `type` tag, which
//! the transport writes as one line per message.

use serde::{Deserialize, Serialize};

use crate::{AggregateResponse, ChatPayload, ErrorEnvelope, Fragment, RequestId, TerminalOutcome};

fn default_streaming() -> bool {
    true
}

/// Controller → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    StartRequest {
        id: RequestId,
        payload: ChatPayload,
        #[serde(default = "default_streaming")]
        streaming: bool,
    },
    CancelRequest {
        id: RequestId,
    },
}

impl ControlMessage {
    pub fn id(&self) -> &RequestId {
        match self {
            ControlMessage::StartRequest { id, .. } | ControlMessage::CancelRequest { id } => id,
        }
    }
}

/// Worker → controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMessage {
    Chunk {
        id: RequestId,
        seq: u64,
        data: String,
    },
    Done {
        id: RequestId,
        /// Present only when the request was started with `streaming: false`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregate_result: Option<AggregateResponse>,
    },
    Error {
        id: RequestId,
        envelope: ErrorEnvelope,
    },
    Cancelled {
        id: RequestId,
    },
}

impl EventMessage {
    pub fn chunk(id: RequestId, fragment: Fragment) -> Self {
        EventMessage::Chunk {
            id,
            seq: fragment.seq,
            data: fragment.data,
        }
    }

    /// The event that reports `outcome` for `id`.
    pub fn terminal(id: RequestId, outcome: TerminalOutcome) -> Self {
        match outcome {
            TerminalOutcome::Completed { aggregate } => EventMessage::Done {
                id,
                aggregate_result: aggregate,
            },
            TerminalOutcome::Failed(envelope) => EventMessage::Error { id, envelope },
            TerminalOutcome::Cancelled => EventMessage::Cancelled { id },
        }
    }

    pub fn id(&self) -> &RequestId {
        match self {
            EventMessage::Chunk { id, .. }
            | EventMessage::Done { id, .. }
            | EventMessage::Error { id, .. }
            | EventMessage::Cancelled { id } => id,
        }
    }

    /// Done, Error and Cancelled end a request; Chunk does not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventMessage::Chunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::{ChatMessage, ErrorKind};

    fn r1() -> RequestId {
        RequestId::new("r1").unwrap()
    }

    #[test]
    fn test_start_request_wire_shape() {
        let raw = json!({
            "type": "start_request",
            "id": "r1",
            "payload": {"messages": [{"role": "user", "content": "hi"}]},
            "streaming": true
        });
        let msg: ControlMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            msg,
            ControlMessage::StartRequest {
                id: r1(),
                payload: ChatPayload::new(vec![ChatMessage::user("hi")]),
                streaming: true,
            }
        );
    }

    #[test]
    fn test_streaming_defaults_to_true() {
        let raw = json!({"type": "start_request", "id": "r1", "payload": {"messages": []}});
        let msg: ControlMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, ControlMessage::StartRequest { streaming: true, .. }));
    }

    #[test]
    fn test_cancel_with_empty_id_is_rejected() {
        let raw = json!({"type": "cancel_request", "id": ""});
        assert!(serde_json::from_value::<ControlMessage>(raw).is_err());
    }

    #[test]
    fn test_event_wire_shapes() {
        let chunk = EventMessage::chunk(r1(), Fragment::new(0, "He"));
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"type": "chunk", "id": "r1", "seq": 0, "data": "He"})
        );

        let done = EventMessage::terminal(r1(), TerminalOutcome::Completed { aggregate: None });
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"type": "done", "id": "r1"})
        );

        let cancelled = EventMessage::terminal(r1(), TerminalOutcome::Cancelled);
        assert_eq!(
            serde_json::to_value(&cancelled).unwrap(),
            json!({"type": "cancelled", "id": "r1"})
        );
    }

    #[test]
    fn test_error_event_carries_envelope() {
        let envelope = ErrorEnvelope::new(ErrorKind::ConnectionError, "engine unreachable");
        let event = EventMessage::terminal(r1(), TerminalOutcome::Failed(envelope.clone()));
        assert!(event.is_terminal());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["envelope"]["kind"], "connection_error");
        assert_eq!(value["envelope"]["retryable"], true);

        let back: EventMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, EventMessage::Error { id: r1(), envelope });
    }
}
