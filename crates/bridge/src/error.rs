//! Errors raised by the dispatcher itself.

use protocol::{ErrorKind, RequestId};
use thiserror::Error;

/// Rejections of controller commands.
///
/// All of these are protocol errors: they are logged and absorbed by the
/// worker and never turn into a request failure.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A `StartRequest` reused an id that is still outstanding.
    #[error("request {0} is already outstanding")]
    DuplicateRequest(RequestId),

    /// A `StartRequest` arrived after shutdown began.
    #[error("dispatcher is shutting down; request {0} not started")]
    ShuttingDown(RequestId),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolError
    }
}
