//! Common contract for the chain and DAG decision graphs.

use meridian_core::{Bag, DecisionStatus, Id};

use crate::errors::GraphError;
use crate::types::Decision;

/// Everything a completed poll changed: decisions that finalized in favor
/// (ancestor-first) and decisions that were rejected as a consequence.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub accepted: Vec<Decision>,
    pub rejected: Vec<Id>,
}

impl PollOutcome {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }
}

/// A decision graph: parent/child structure, conflict sets, preference, and
/// finalization cascades. The engine holds exactly one graph behind its
/// state lock; implementations need no internal synchronization.
pub trait DecisionGraph: Send + 'static {
    /// Insert a new decision.
    ///
    /// Re-inserting an identical decision is idempotent and succeeds; the
    /// same id with different parents is [`GraphError::ConflictingReinsert`].
    fn insert(&mut self, decision: Decision) -> Result<(), GraphError>;

    /// Feed one completed poll about `target` into its conflict set.
    /// Unknown or already-decided targets are a no-op.
    fn record_poll(&mut self, target: Id, votes: &Bag<Id>) -> PollOutcome;

    /// The decision the engine should currently build on and poll for.
    fn preference(&self) -> Id;

    /// The decisions worth polling right now, deterministically ordered:
    /// the preferred tip for a chain, the live frontier for a DAG.
    fn poll_targets(&self) -> Vec<Id>;

    fn status(&self, id: &Id) -> DecisionStatus;

    fn is_accepted(&self, id: &Id) -> bool {
        self.status(id) == DecisionStatus::Accepted
    }

    /// Look up a decision the graph has seen (processing or decided).
    fn decision(&self, id: &Id) -> Option<&Decision>;

    /// Ids still processing, in id order.
    fn processing(&self) -> Vec<Id>;

    fn num_processing(&self) -> usize;
}
