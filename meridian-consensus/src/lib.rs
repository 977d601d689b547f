//! # Meridian Consensus Engine
//!
//! Sampling-based Byzantine-fault-tolerant consensus for blockchain
//! validators. Instead of all-to-all voting, every node repeatedly polls a
//! small random stake-weighted sample of its peers and feeds the aggregated
//! replies into per-decision confidence counters. A decision finalizes once
//! it clears the confidence threshold for β consecutive polls, giving
//! probabilistic safety and liveness with per-poll message cost `O(k)`.
//!
//! ## Architecture
//!
//! The engine is assembled from four cooperating pieces:
//!
//! - [`ConfidenceState`]: the dual-α threshold state machine tracking
//!   preference and consecutive confidence for one set of conflicting
//!   decisions
//! - [`PollSet`]: bookkeeping for in-flight polls — sampled peers, reply
//!   bags, deadlines, and the per-decision concurrency budget
//! - Decision graphs: [`ChainGraph`] for a linear chain where same-parent
//!   siblings conflict, [`DagGraph`] for a vertex DAG with an injected
//!   [`ConflictRule`] and safe-prefix finality
//! - [`ConsensusEngine`]: the orchestrator binding graph, poll pipeline,
//!   sampler, transport, commit store, and acceptor hooks behind a
//!   thread-safe public API
//!
//! External collaborators are injected behind traits: [`VoteTransport`]
//! carries poll messages, `ValidatorSource` supplies the weighted
//! membership, `CommitStore` persists accepted decisions, and
//! [`CertificateSigner`] attaches opaque finality certificates.

pub mod acceptors;
pub mod certificates;
pub mod chain;
pub mod confidence;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod poll;
pub mod transport;
pub mod types;

pub use acceptors::{Acceptor, AcceptorRegistry};
pub use certificates::{
    Certificate, CertificateError, CertificateSigner, CertificateVerifier, Ed25519Signer,
    Ed25519Verifier,
};
pub use chain::ChainGraph;
pub use confidence::ConfidenceState;
pub use dag::{ConflictRule, DagGraph, NoConflicts};
pub use engine::{
    BootstrapSignal, BootstrapTrigger, ChainEngine, ConsensusEngine, DagEngine, EngineConfig,
    EngineState, HealthReport,
};
pub use errors::{ConsensusError, FatalError, GraphError};
pub use graph::{DecisionGraph, PollOutcome};
pub use poll::{Poll, PollSet, ReplyOutcome};
pub use transport::{TransportError, VoteTransport};
pub use types::Decision;
