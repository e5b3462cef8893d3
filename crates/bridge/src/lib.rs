//! Worker-side core of the LLM bridge.
//!
//! This crate turns a stream of [`protocol::ControlMessage`]s into a stream of
//! [`protocol::EventMessage`]s. It multiplexes any number of concurrent requests
//! by id, pumps each request's fragments from an
//! [`InferenceClient`](protocol::InferenceClient) under backpressure, and
//! guarantees exactly one terminal event per request.
//!
//! ## Architectural Layer
//!
//! **Orchestration.** No transport or engine details live here: events leave
//! through a bounded `tokio::sync::mpsc` channel and the engine is reached only
//! through the port trait.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`registry`] | `RequestRegistry` and the per-request `TerminalLatch` |
//! | [`pump`] | `StreamPump`, the per-request pull loop |
//! | [`dispatcher`] | `Dispatcher`, the single writer of registry membership |
//! | [`error`] | `BridgeError` protocol rejections |

pub mod dispatcher;
pub mod error;
pub mod pump;
pub mod registry;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::BridgeError;
pub use pump::PumpState;
pub use registry::{CancelSignal, RequestRegistry, TerminalLatch};
