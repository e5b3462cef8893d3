//! Inference engine adapter for the LLM bridge.
//!
//! Implements [`protocol::InferenceClient`] against an Ollama-compatible HTTP
//! engine. Other engines are added as further implementations of the same
//! trait without touching the `bridge` crate.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting and NDJSON response
//! parsing live here. The bridge sees only [`protocol::InferenceClient`] and
//! the [`protocol::InferenceError`] kinds it reports.
//!
//! | Failure | Reported as |
//! |---------|-------------|
//! | engine unreachable, connect timeout, body read interrupted | `Connection` |
//! | non-2xx status | `HttpStatus` |
//! | malformed line, `error` line, body ends before `done` | `StreamDecode` |

pub mod config;
pub mod error;
pub mod ollama;
mod wire;

pub use config::OllamaConfig;
pub use error::LlmError;
pub use ollama::OllamaClient;
