//! Live request bookkeeping.
//!
//! The [`RequestRegistry`] holds one entry per outstanding request id, from the
//! moment a `StartRequest` is accepted until its terminal event has been
//! forwarded. It is a plain data structure; the dispatcher owns the single
//! mutex that serializes access to it.
//!
//! Each entry carries a [`TerminalLatch`], the compare-and-set cell that decides
//! which terminal outcome a request ends with. Both the cancel path and the
//! pump's natural finish go through it, so exactly one outcome ever wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use protocol::{RequestId, RequestState, TerminalOutcome, Timestamp};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

// ---------------------------------------------------------------------------
// Terminal latch
// ---------------------------------------------------------------------------

const PENDING: u8 = 0;
const STREAMING: u8 = 1;
const COMPLETED: u8 = 2;
const FAILED: u8 = 3;
const CANCELLED: u8 = 4;

const STATE_MASK: u8 = 0x0f;
const CANCEL_REQUESTED: u8 = 0x80;

fn is_terminal_code(code: u8) -> bool {
    matches!(code & STATE_MASK, COMPLETED | FAILED | CANCELLED)
}

fn code_for(state: RequestState) -> u8 {
    match state {
        RequestState::Pending => PENDING,
        RequestState::Streaming => STREAMING,
        RequestState::Completed => COMPLETED,
        RequestState::Failed => FAILED,
        RequestState::Cancelled => CANCELLED,
    }
}

/// Atomic lifecycle cell for one request.
///
/// Holds the [`RequestState`] plus a sticky "cancel requested" flag. Terminal
/// states are written at most once.
#[derive(Debug, Default)]
pub struct TerminalLatch {
    state: AtomicU8,
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        match self.state.load(Ordering::Acquire) & STATE_MASK {
            PENDING => RequestState::Pending,
            STREAMING => RequestState::Streaming,
            COMPLETED => RequestState::Completed,
            FAILED => RequestState::Failed,
            _ => RequestState::Cancelled,
        }
    }

    /// `true` while fragments may still be delivered: not terminal and no
    /// cancellation pending.
    pub fn is_live(&self) -> bool {
        let code = self.state.load(Ordering::Acquire);
        !is_terminal_code(code) && code & CANCEL_REQUESTED == 0
    }

    /// `Pending → Streaming`. Returns `false` if the request was not pending.
    pub fn mark_streaming(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |code| {
                (code & STATE_MASK == PENDING).then_some(STREAMING | (code & CANCEL_REQUESTED))
            })
            .is_ok()
    }

    /// Records a cancellation request.
    ///
    /// Returns `false` if the request already reached a terminal state or a
    /// cancellation was already recorded.
    pub fn request_cancel(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |code| {
                if is_terminal_code(code) || code & CANCEL_REQUESTED != 0 {
                    None
                } else {
                    Some(code | CANCEL_REQUESTED)
                }
            })
            .is_ok()
    }

    /// Writes the terminal state.
    ///
    /// If a cancellation was requested before this call, the request ends
    /// `Cancelled` regardless of `proposed`. Returns the outcome that won, or
    /// `None` if the latch was already terminal.
    pub fn finalize(&self, proposed: TerminalOutcome) -> Option<TerminalOutcome> {
        let proposed_code = code_for(proposed.state());
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |code| {
                if is_terminal_code(code) {
                    None
                } else if code & CANCEL_REQUESTED != 0 {
                    Some(CANCELLED)
                } else {
                    Some(proposed_code)
                }
            })
            .ok()?;

        if previous & CANCEL_REQUESTED != 0 {
            Some(TerminalOutcome::Cancelled)
        } else {
            Some(proposed)
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handles shared between a registry entry and the pump that owns it.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub latch: Arc<TerminalLatch>,
    pub cancel: CancellationToken,
    pub accepted_at: Timestamp,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            latch: Arc::new(TerminalLatch::new()),
            cancel: CancellationToken::new(),
            accepted_at: Timestamp::now(),
        }
    }

    /// `true` if `latch` is this entry's latch, i.e. the caller is the pump
    /// that owns the entry rather than a stale pump for a reused id.
    pub fn is_owned_by(&self, latch: &Arc<TerminalLatch>) -> bool {
        Arc::ptr_eq(&self.latch, latch)
    }
}

/// Result of [`RequestRegistry::signal_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSignal {
    /// The owning pump was told to stop.
    Signalled,
    /// No entry with this id.
    Unknown,
    /// The entry already reached a terminal state or was already cancelled.
    AlreadyFinished,
}

/// One entry per outstanding request id.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: HashMap<RequestId, RegistryEntry>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh `Pending` entry for `id`.
    ///
    /// Fails with [`BridgeError::DuplicateRequest`] if `id` is outstanding; the
    /// existing entry is left untouched.
    pub fn register(&mut self, id: RequestId) -> Result<RegistryEntry, BridgeError> {
        use std::collections::hash_map::Entry;

        match self.entries.entry(id) {
            Entry::Occupied(occupied) => Err(BridgeError::DuplicateRequest(occupied.key().clone())),
            Entry::Vacant(vacant) => Ok(vacant.insert(RegistryEntry::new()).clone()),
        }
    }

    pub fn get(&self, id: &RequestId) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    /// Current state of `id`, if it is outstanding.
    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.entries.get(id).map(|entry| entry.latch.state())
    }

    /// Asks the pump owning `id` to stop.
    pub fn signal_cancel(&self, id: &RequestId) -> CancelSignal {
        let Some(entry) = self.entries.get(id) else {
            return CancelSignal::Unknown;
        };
        if entry.latch.request_cancel() {
            entry.cancel.cancel();
            CancelSignal::Signalled
        } else {
            CancelSignal::AlreadyFinished
        }
    }

    /// Signals every outstanding request. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        self.entries
            .keys()
            .filter(|id| self.signal_cancel(id) == CancelSignal::Signalled)
            .count()
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use protocol::{ErrorEnvelope, ErrorKind};

    fn id(s: &str) -> RequestId {
        RequestId::new(s).unwrap()
    }

    fn failed() -> TerminalOutcome {
        TerminalOutcome::Failed(ErrorEnvelope::new(ErrorKind::StreamDecodeError, "bad line"))
    }

    #[test]
    fn test_latch_lifecycle() {
        let latch = TerminalLatch::new();
        assert_eq!(latch.state(), RequestState::Pending);
        assert!(latch.is_live());

        assert!(latch.mark_streaming());
        assert!(!latch.mark_streaming());
        assert_eq!(latch.state(), RequestState::Streaming);

        let done = TerminalOutcome::Completed { aggregate: None };
        assert_eq!(latch.finalize(done.clone()), Some(done));
        assert_eq!(latch.state(), RequestState::Completed);
        assert!(!latch.is_live());
    }

    #[test]
    fn test_latch_finalizes_once() {
        let latch = TerminalLatch::new();
        assert!(latch.finalize(failed()).is_some());
        assert_eq!(latch.finalize(TerminalOutcome::Cancelled), None);
        assert_eq!(latch.state(), RequestState::Failed);
    }

    #[test]
    fn test_cancel_wins_over_later_natural_outcome() {
        let latch = TerminalLatch::new();
        latch.mark_streaming();
        assert!(latch.request_cancel());
        assert!(!latch.is_live());
        // Still streaming until the pump finalizes.
        assert_eq!(latch.state(), RequestState::Streaming);

        assert_eq!(latch.finalize(failed()), Some(TerminalOutcome::Cancelled));
        assert_eq!(latch.state(), RequestState::Cancelled);
    }

    #[test]
    fn test_cancel_after_terminal_is_refused() {
        let latch = TerminalLatch::new();
        latch.finalize(TerminalOutcome::Completed { aggregate: None });
        assert!(!latch.request_cancel());
        // The refused cancel leaves the natural outcome in place.
        assert_eq!(latch.state(), RequestState::Completed);
        assert_eq!(latch.finalize(TerminalOutcome::Cancelled), None);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = RequestRegistry::new();
        let first = registry.register(id("r1")).unwrap();

        let err = registry.register(id("r1")).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateRequest(ref dup) if dup.as_str() == "r1"));

        // The original entry survives the rejected registration.
        let kept = registry.get(&id("r1")).unwrap();
        assert!(kept.is_owned_by(&first.latch));
        assert_eq!(kept.latch.state(), RequestState::Pending);
        assert!(!first.cancel.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_signal_cancel() {
        let mut registry = RequestRegistry::new();
        let entry = registry.register(id("r1")).unwrap();

        assert_eq!(registry.signal_cancel(&id("nope")), CancelSignal::Unknown);
        assert_eq!(registry.signal_cancel(&id("r1")), CancelSignal::Signalled);
        assert!(entry.cancel.is_cancelled());
        assert_eq!(
            registry.signal_cancel(&id("r1")),
            CancelSignal::AlreadyFinished
        );
    }

    #[test]
    fn test_cancel_all_skips_finished_entries() {
        let mut registry = RequestRegistry::new();
        registry.register(id("a")).unwrap();
        let b = registry.register(id("b")).unwrap();
        b.latch.finalize(TerminalOutcome::Completed { aggregate: None });

        assert_eq!(registry.cancel_all(), 1);
        assert_eq!(registry.state(&id("a")), Some(RequestState::Pending));
    }

    #[test]
    fn test_remove_frees_the_id() {
        let mut registry = RequestRegistry::new();
        registry.register(id("r1")).unwrap();
        assert!(registry.remove(&id("r1")).is_some());
        assert!(registry.is_empty());
        assert!(registry.register(id("r1")).is_ok());
    }
}
