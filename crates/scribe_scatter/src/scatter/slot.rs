//! Per-remote slot records for one fan-out.
//!
//! A slot tracks one shard's request lifecycle: target resolution, the
//! in-flight send, the stored outcome, and the retry budget. Slots are
//! mutated only under the dispatcher's lock; keeping them separate from the
//! dispatch logic keeps the bookkeeping easy to reason about.

use super::error::Status;
use super::executor::CallbackHandle;
use super::types::{Document, HostAndPort, ShardId};

/// One remote's mutable state within a fan-out.
///
/// A slot holds at most one of an in-flight handle or an unobserved outcome;
/// once `terminal` is set neither field changes again.
pub(super) struct RemoteSlot {
    pub(super) shard_id: ShardId,
    pub(super) body: Document,
    /// Set on successful target resolution; refreshed on every attempt.
    pub(super) host: Option<HostAndPort>,
    /// Valid while a send is outstanding with the executor.
    pub(super) in_flight: Option<CallbackHandle>,
    /// Response or error recorded by the callback or a scheduling failure.
    pub(super) outcome: Option<Result<Document, Status>>,
    pub(super) retry_count: u32,
    /// Set when `next` hands the outcome to the caller.
    pub(super) terminal: bool,
}

impl RemoteSlot {
    pub(super) fn new(shard_id: ShardId, body: Document) -> Self {
        Self {
            shard_id,
            body,
            host: None,
            in_flight: None,
            outcome: None,
            retry_count: 0,
            terminal: false,
        }
    }

    /// A live slot with neither an outcome nor an outstanding send wants
    /// scheduling.
    pub(super) fn needs_scheduling(&self) -> bool {
        !self.terminal && self.outcome.is_none() && self.in_flight.is_none()
    }

    /// Ready slots hold an outcome the caller has not observed yet.
    pub(super) fn is_ready(&self) -> bool {
        !self.terminal && self.outcome.is_some()
    }

    /// Clear the outcome for another attempt, spending one retry.
    pub(super) fn reset_for_retry(&mut self) {
        self.retry_count += 1;
        self.outcome = None;
    }
}
