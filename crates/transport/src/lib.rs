//! Inter-process channel for the LLM bridge.
//!
//! Control messages and events travel as newline-delimited JSON, one message
//! per line, over any `AsyncRead`/`AsyncWrite` pair (stdio pipes in
//! production, in-memory duplex pipes in tests).
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Framing and task plumbing only. Request semantics
//! belong to [`bridge`]; wire shapes belong to [`protocol`].
//!
//! | Module | Side | Contents |
//! |--------|------|----------|
//! | [`codec`] | both | `NdjsonCodec`, bad lines surfaced as `Inbound::Rejected` |
//! | [`worker`] | worker | `serve`, the read/dispatch/write loop |
//! | [`controller`] | controller | `Controller`, `RequestHandle`, `WorkerProcess` |

pub mod codec;
pub mod controller;
pub mod error;
pub mod worker;

pub use codec::{Inbound, NdjsonCodec, DEFAULT_MAX_FRAME_BYTES};
pub use controller::{Controller, RequestHandle, RequestOutcome, WorkerProcess};
pub use error::TransportError;
pub use worker::{serve, ServeSummary, WorkerConfig};
