//! Errors raised while constructing an [`crate::OllamaClient`].
//!
//! Failures of an individual inference call are reported as
//! [`protocol::InferenceError`]; this type only covers setup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// The configured base URL is not an absolute `http(s)` URL.
    #[error("invalid engine base URL '{url}': expected http:// or https://")]
    InvalidBaseUrl { url: String },

    /// The configured default model name is blank.
    #[error("default model name must not be empty")]
    EmptyModel,

    /// The HTTP client could not be built (e.g. TLS backend initialisation).
    #[error("failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}
