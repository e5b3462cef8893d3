//! Shared domain for the LLM bridge.
//!
//! This crate contains every type that both processes of the bridge agree on:
//! request identifiers, chat payloads, the six wire messages, the closed error
//! taxonomy with its codec, and the [`InferenceClient`] port that the worker
//! drives. Infrastructure crates implement the port; they never add wire types.
//!
//! ## Architectural Layer
//!
//! **Domain + port definitions.** This crate has no I/O dependencies.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RequestId`, `WorkerSessionId`) |
//! | [`types`] | Payloads, fragments, lifecycle states and outcomes |
//! | [`messages`] | `ControlMessage` / `EventMessage` wire enums |
//! | [`errors`] | Error taxonomy, `ErrorEnvelope`, `InferenceError`, `RemoteFailure` |
//! | [`codec`] | Error chain ⇄ envelope conversion |
//! | [`client`] | The `InferenceClient` port |

pub mod client;
pub mod codec;
pub mod errors;
pub mod identifiers;
pub mod messages;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use client::{FragmentStream, InferenceClient, InferenceOutput};
pub use errors::{BoxError, CauseEntry, ErrorEnvelope, ErrorKind, InferenceError, RemoteFailure};
pub use identifiers::{RequestId, WorkerSessionId};
pub use messages::{ControlMessage, EventMessage};
pub use types::{
    AggregateResponse, ChatMessage, ChatOptions, ChatPayload, Fragment, RequestState, Role,
    TerminalOutcome, Timestamp, UsageStats,
};
