//! Conversion between native error chains and [`ErrorEnvelope`]s.
//!
//! Native errors cannot cross the process boundary, so the worker encodes
//! them into an envelope and the controller decodes the envelope into a
//! [`RemoteFailure`] for logging and display. The round trip keeps each
//! link's kind and message and their outer→inner order; everything else
//! (concrete types, backtraces) is dropped.

use std::error::Error as StdError;

use crate::errors::{CauseEntry, ErrorEnvelope, ErrorKind, InferenceError, RemoteFailure};

/// Flattens `error` and its `source()` chain into an [`ErrorEnvelope`].
///
/// The top-level kind comes from the outermost error and falls back to
/// [`ErrorKind::InternalError`] when it is not one of ours. Inner links that
/// cannot be classified inherit the kind of the nearest classified outer
/// link, so a `reqwest` error wrapped in a connection failure stays a
/// connection failure.
pub fn encode(error: &(dyn StdError + 'static)) -> ErrorEnvelope {
    let kind = classify(error).unwrap_or(ErrorKind::InternalError);

    let mut cause_chain = Vec::new();
    let mut inherited = kind;
    let mut current = Some(error);
    while let Some(err) = current {
        let link_kind = classify(err).unwrap_or(inherited);
        inherited = link_kind;
        cause_chain.push(CauseEntry {
            kind: link_kind,
            message: err.to_string(),
        });
        current = err.source();
    }

    ErrorEnvelope {
        kind,
        message: error.to_string(),
        cause_chain,
        retryable: kind.is_retryable(),
    }
}

/// Rebuilds a displayable failure chain from an envelope.
pub fn decode(envelope: &ErrorEnvelope) -> RemoteFailure {
    let mut links = envelope.cause_chain.iter().rev();
    let Some(innermost) = links.next() else {
        return RemoteFailure::new(envelope.kind, envelope.message.clone(), None);
    };

    let mut failure = RemoteFailure::new(innermost.kind, innermost.message.clone(), None);
    for link in links {
        failure = RemoteFailure::new(link.kind, link.message.clone(), Some(Box::new(failure)));
    }
    failure
}

/// Renders a decoded failure as `outer: inner: innermost`, the shape used in
/// log lines on the controller side.
pub fn render_chain(failure: &RemoteFailure) -> String {
    failure
        .chain()
        .map(|link| link.message())
        .collect::<Vec<_>>()
        .join(": ")
}

fn classify(error: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    if let Some(err) = error.downcast_ref::<InferenceError>() {
        return Some(err.kind());
    }
    if let Some(err) = error.downcast_ref::<RemoteFailure>() {
        return Some(err.kind());
    }
    if error.downcast_ref::<std::io::Error>().is_some() {
        return Some(ErrorKind::ConnectionError);
    }
    if error.downcast_ref::<serde_json::Error>().is_some() {
        return Some(ErrorKind::StreamDecodeError);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::errors::BoxError;

    #[derive(Debug, thiserror::Error)]
    #[error("opaque library failure")]
    struct Opaque;

    fn three_level_chain() -> InferenceError {
        let socket = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "socket reset");
        let http = InferenceError::connection("HTTP read failed", socket);
        InferenceError::stream_decode("parse failed", http)
    }

    #[test]
    fn test_encode_flattens_outer_to_inner() {
        let envelope = encode(&three_level_chain());

        assert_eq!(envelope.kind, ErrorKind::StreamDecodeError);
        assert_eq!(envelope.message, "parse failed");
        assert!(!envelope.retryable);

        let links: Vec<_> = envelope
            .cause_chain
            .iter()
            .map(|c| (c.kind, c.message.as_str()))
            .collect();
        assert_eq!(
            links,
            vec![
                (ErrorKind::StreamDecodeError, "parse failed"),
                (ErrorKind::ConnectionError, "HTTP read failed"),
                (ErrorKind::ConnectionError, "socket reset"),
            ]
        );
    }

    #[test]
    fn test_round_trip_preserves_kind_message_and_order() {
        let envelope = encode(&three_level_chain());
        let decoded = decode(&envelope);

        let links: Vec<_> = decoded
            .chain()
            .map(|f| (f.kind(), f.message().to_string()))
            .collect();
        let expected: Vec<_> = envelope
            .cause_chain
            .iter()
            .map(|c| (c.kind, c.message.clone()))
            .collect();
        assert_eq!(links, expected);

        // Re-encoding the decoded chain reproduces the envelope.
        assert_eq!(encode(&decoded), envelope);
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        let err = InferenceError::connection("engine unreachable", Opaque);
        let envelope = encode(&err);
        assert_eq!(envelope.kind, ErrorKind::ConnectionError);
        assert!(envelope.retryable);
        // The opaque inner error inherits the outer kind.
        assert_eq!(envelope.cause_chain[1].kind, ErrorKind::ConnectionError);
        assert_eq!(envelope.cause_chain[1].message, "opaque library failure");
    }

    #[test]
    fn test_unknown_top_level_is_internal() {
        let boxed: BoxError = Box::new(Opaque);
        let envelope = encode(boxed.as_ref());
        assert_eq!(envelope.kind, ErrorKind::InternalError);
        assert!(!envelope.retryable);
    }

    #[test]
    fn test_decode_without_chain_uses_head() {
        let envelope = ErrorEnvelope {
            kind: ErrorKind::HttpStatusError,
            message: "engine returned HTTP 500: boom".into(),
            cause_chain: Vec::new(),
            retryable: false,
        };
        let decoded = decode(&envelope);
        assert_eq!(decoded.kind(), ErrorKind::HttpStatusError);
        assert!(std::error::Error::source(&decoded).is_none());
    }

    #[test]
    fn test_render_chain() {
        let decoded = decode(&encode(&three_level_chain()));
        assert_eq!(
            render_chain(&decoded),
            "parse failed: HTTP read failed: socket reset"
        );
    }
}
