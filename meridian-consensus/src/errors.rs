//! Error types for the consensus engine.

use meridian_core::{Id, ParametersError, SamplerError};
use meridian_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by decision graph mutations.
#[derive(Error, Debug)]
pub enum GraphError {
    /// The decision references a parent the graph has never seen.
    #[error("unknown parent {parent} for decision {decision}")]
    UnknownParent { decision: Id, parent: Id },

    /// A decision with this id already exists with different parents.
    /// Re-adding an identical decision is idempotent and not an error.
    #[error("decision {decision} re-added with conflicting parents")]
    ConflictingReinsert { decision: Id },

    /// The parent list shape does not fit the graph variant (chain
    /// decisions need exactly one parent, DAG vertices at least one).
    #[error("decision {decision} carries {got} parents, expected {expected}")]
    MalformedParents {
        decision: Id,
        got: usize,
        expected: &'static str,
    },

    /// Height is inconsistent with the parents' heights.
    #[error("decision {decision} has height {got}, expected {expected}")]
    HeightMismatch { decision: Id, got: u64, expected: u64 },
}

/// Errors surfaced by the engine's public API.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Backpressure: the graph already holds the configured maximum of
    /// processing decisions. Retry after something finalizes.
    #[error("too many outstanding decisions (limit {limit})")]
    OutstandingLimit { limit: usize },

    /// Backpressure: this decision already has the configured maximum of
    /// polls in flight.
    #[error("too many concurrent polls for {decision} (limit {limit})")]
    TooManyPolls { decision: Id, limit: usize },

    /// The engine is not in a state that can serve the call.
    #[error("engine is not running")]
    NotRunning,

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    InvalidParameters(#[from] ParametersError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Unrecoverable conditions escalated on the engine's fatal channel rather
/// than returned from any particular call.
#[derive(Error, Debug)]
pub enum FatalError {
    /// A `die_on_error` acceptor rejected an accepted decision.
    #[error("acceptor {name:?} failed for decision {decision} on chain {chain}: {source}")]
    AcceptorFailed {
        chain: Id,
        decision: Id,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Accepted decisions could not be persisted; acceptors were not
    /// notified for this batch.
    #[error("commit persistence failed on chain {chain}: {source}")]
    StorageFailed {
        chain: Id,
        #[source]
        source: StorageError,
    },
}
