//! Errors of the inter-process channel.

use std::io;

use protocol::{ErrorKind, RequestId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// An inbound line was longer than the configured frame limit.
    #[error("frame exceeds the {limit}-byte limit")]
    FrameTooLarge { limit: usize },

    /// An inbound line was empty or whitespace only.
    #[error("blank frame")]
    BlankFrame,

    /// An inbound line was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8(#[source] io::Error),

    /// An inbound line was not a well-formed message.
    #[error("malformed frame")]
    Malformed(#[source] serde_json::Error),

    /// An outbound message could not be serialized.
    #[error("failed to encode frame")]
    Encode(#[source] serde_json::Error),

    #[error("channel I/O failed")]
    Io(#[from] io::Error),

    /// The peer went away before the operation completed.
    #[error("channel closed")]
    Closed,

    /// The controller already has an outstanding request with this id.
    #[error("request '{0}' is already outstanding")]
    DuplicateRequest(RequestId),

    #[error("failed to spawn worker process")]
    Spawn(#[source] io::Error),

    #[error("worker process has no {0} pipe")]
    MissingPipe(&'static str),
}

impl TransportError {
    /// Inbound frames that are absorbed rather than ending the channel.
    pub fn is_frame_rejection(&self) -> bool {
        matches!(
            self,
            TransportError::FrameTooLarge { .. }
                | TransportError::BlankFrame
                | TransportError::InvalidUtf8(_)
                | TransportError::Malformed(_)
        )
    }

    /// Frame rejections are protocol errors; everything else is the channel
    /// itself failing.
    pub fn kind(&self) -> ErrorKind {
        if self.is_frame_rejection() || matches!(self, TransportError::DuplicateRequest(_)) {
            ErrorKind::ProtocolError
        } else {
            ErrorKind::ConnectionError
        }
    }
}
