//! Port trait for the inference engine.
//!
//! The bridge depends only on [`InferenceClient`]; concrete engines live in
//! infrastructure crates. Any retry policy belongs to the implementation, never
//! to the bridge.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{AggregateResponse, ChatPayload, InferenceError};

/// A finite, non-restartable, lazily pulled sequence of text fragments.
///
/// The stream may yield an error at any point, including before the first
/// fragment. Fragments yielded before an error remain valid. Dropping the
/// stream releases whatever upstream handle it holds.
pub type FragmentStream = BoxStream<'static, Result<String, InferenceError>>;

/// What a successful [`InferenceClient::invoke`] hands back.
pub enum InferenceOutput {
    /// The whole answer at once.
    Aggregate(AggregateResponse),
    /// Incremental fragments, pulled on demand.
    Stream(FragmentStream),
}

impl std::fmt::Debug for InferenceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceOutput::Aggregate(a) => f.debug_tuple("Aggregate").field(a).finish(),
            InferenceOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Executes chat requests against an inference engine.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Starts one request.
    ///
    /// `streaming` is a preference: implementations should return
    /// [`InferenceOutput::Stream`] when it is `true` and
    /// [`InferenceOutput::Aggregate`] otherwise, but callers tolerate either.
    async fn invoke(
        &self,
        payload: &ChatPayload,
        streaming: bool,
    ) -> Result<InferenceOutput, InferenceError>;
}
