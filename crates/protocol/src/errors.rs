//! Error taxonomy shared by both sides of the bridge.
//!
//! [`InferenceError`] is what an [`crate::InferenceClient`] fails with inside the
//! worker. It never crosses the process boundary as-is: the codec in
//! [`crate::codec`] flattens it into an [`ErrorEnvelope`], which is plain data.
//!
//! The taxonomy is closed. Controllers switch on [`ErrorKind`] and may rely on
//! [`ErrorEnvelope::retryable`] to decide whether issuing a fresh request is
//! worthwhile; the bridge itself never retries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error used as the `source` of an [`InferenceError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// Closed set of failure classes understood by both processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The inference engine could not be reached or the connection dropped.
    ConnectionError,
    /// The engine answered with a non-success status before streaming began.
    HttpStatusError,
    /// A fragment could not be decoded mid-stream.
    StreamDecodeError,
    /// The controller violated the channel protocol (duplicate id, bad frame).
    /// Absorbed and logged by the worker; never surfaced as a request failure.
    ProtocolError,
    /// A bridge invariant was violated. Fatal to the offending request only.
    InternalError,
}

impl ErrorKind {
    /// Returns the wire tag of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::HttpStatusError => "http_status_error",
            ErrorKind::StreamDecodeError => "stream_decode_error",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Only transient network-class failures are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ConnectionError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Wire representation
// ---------------------------------------------------------------------------

/// One link of a flattened cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseEntry {
    pub kind: ErrorKind,
    pub message: String,
}

/// Transport-safe description of a failure.
///
/// `cause_chain` is ordered outer→inner and starts with the top-level error
/// itself, so `cause_chain[0]` always mirrors `kind`/`message` when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub cause_chain: Vec<CauseEntry>,
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorEnvelope {
    /// Builds a single-level envelope with no deeper causes.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            cause_chain: vec![CauseEntry {
                kind,
                message: message.clone(),
            }],
            message,
            retryable: kind.is_retryable(),
        }
    }

    /// Envelope for a violated bridge invariant.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Worker-side failures
// ---------------------------------------------------------------------------

/// Failures produced by an [`crate::InferenceClient`].
///
/// The `Display` of each variant describes only that layer; deeper causes are
/// reachable through [`std::error::Error::source`] so the codec can record
/// each layer separately.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The engine is unreachable or the connection failed mid-flight.
    #[error("{message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The engine rejected the request with a non-success HTTP status.
    #[error("engine returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// A streamed fragment was malformed or the stream ended prematurely.
    #[error("{message}")]
    StreamDecode {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The client detected a condition that should be impossible.
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl InferenceError {
    /// Connection failure wrapping an underlying cause.
    pub fn connection(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        InferenceError::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Decode failure wrapping an underlying cause.
    pub fn stream_decode(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        InferenceError::StreamDecode {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Decode failure with no deeper cause.
    pub fn stream_decode_msg(message: impl Into<String>) -> Self {
        InferenceError::StreamDecode {
            message: message.into(),
            source: None,
        }
    }

    /// The taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::Connection { .. } => ErrorKind::ConnectionError,
            InferenceError::HttpStatus { .. } => ErrorKind::HttpStatusError,
            InferenceError::StreamDecode { .. } => ErrorKind::StreamDecodeError,
            InferenceError::Internal { .. } => ErrorKind::InternalError,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller-side view
// ---------------------------------------------------------------------------

/// Local, display-only reconstruction of a remote failure.
///
/// Produced by [`crate::codec::decode`]. Each link of the original cause chain
/// becomes one `RemoteFailure` whose [`source`](std::error::Error::source) is
/// the next inner link. Backtraces and native error types are not preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    kind: ErrorKind,
    message: String,
    cause: Option<Box<RemoteFailure>>,
}

impl RemoteFailure {
    pub(crate) fn new(kind: ErrorKind, message: String, cause: Option<Box<RemoteFailure>>) -> Self {
        Self {
            kind,
            message,
            cause,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Iterates the chain outer→inner, starting with `self`.
    pub fn chain(&self) -> impl Iterator<Item = &RemoteFailure> {
        std::iter::successors(Some(self), |f| f.cause.as_deref())
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}
