//! Identifiers, decision lifecycle states, and validator membership types
//! shared across the Meridian engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a decision (a block or a DAG vertex).
///
/// Identifiers are opaque 32-byte strings. Equality, hashing, and the total
/// order used for deterministic tie-breaking are all defined bytewise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id([u8; Id::LEN]);

impl Id {
    /// Width of an identifier in bytes.
    pub const LEN: usize = 32;

    /// The all-zero identifier, conventionally reserved for genesis.
    pub const ZERO: Id = Id([0u8; Id::LEN]);

    /// Wrap raw bytes as an identifier.
    pub const fn from_bytes(bytes: [u8; Id::LEN]) -> Self {
        Id(bytes)
    }

    /// Derive an identifier by hashing arbitrary content.
    pub fn digest(data: &[u8]) -> Self {
        Id(*blake3::hash(data).as_bytes())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; Id::LEN] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl From<[u8; Id::LEN]> for Id {
    fn from(bytes: [u8; Id::LEN]) -> Self {
        Id(bytes)
    }
}

/// Unique identifier for a peer in the validator set.
///
/// 20 bytes wide, typically the truncated hash of a staking key. Like [`Id`],
/// ordering is bytewise and used wherever deterministic iteration matters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NodeId::LEN]);

impl NodeId {
    /// Width of a peer identifier in bytes.
    pub const LEN: usize = 20;

    /// Wrap raw bytes as a peer identifier.
    pub const fn from_bytes(bytes: [u8; NodeId::LEN]) -> Self {
        NodeId(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NodeId::LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl From<[u8; NodeId::LEN]> for NodeId {
    fn from(bytes: [u8; NodeId::LEN]) -> Self {
        NodeId(bytes)
    }
}

/// Lifecycle state of a decision inside the engine.
///
/// Transitions are monotone along `Unknown → Processing → Preferred →
/// (Accepted | Rejected)`; once a decision is accepted or rejected it never
/// changes state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionStatus {
    /// Never submitted to the engine.
    Unknown,
    /// Submitted and undergoing polling.
    Processing,
    /// Processing, and currently on the preferred path.
    Preferred,
    /// Finalized in favor. Terminal.
    Accepted,
    /// Finalized against. Terminal.
    Rejected,
}

impl DecisionStatus {
    /// Whether the state can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecisionStatus::Accepted | DecisionStatus::Rejected)
    }

    /// Whether the decision is known and still awaiting finalization.
    pub fn is_processing(&self) -> bool {
        matches!(self, DecisionStatus::Processing | DecisionStatus::Preferred)
    }
}

/// One member of the validator set, with its stake weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub node: NodeId,
    pub weight: u64,
}

impl Validator {
    pub fn new(node: NodeId, weight: u64) -> Self {
        Self { node, weight }
    }
}

/// Read-only source of the current validator membership.
///
/// The engine snapshots the membership at the start of every poll and never
/// re-reads it mid-poll, so implementations are free to rotate the set
/// between calls.
pub trait ValidatorSource: Send + Sync {
    fn validators(&self) -> Vec<Validator>;
}

/// A fixed validator set, for tests and single-configuration deployments.
#[derive(Debug, Clone)]
pub struct StaticValidators {
    validators: Vec<Validator>,
}

impl StaticValidators {
    pub fn new(validators: Vec<Validator>) -> Self {
        Self { validators }
    }

    /// Convenience constructor: `n` equally weighted peers with ids derived
    /// from their index.
    pub fn uniform(n: usize) -> Self {
        let validators = (0..n)
            .map(|i| {
                let mut bytes = [0u8; NodeId::LEN];
                bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
                Validator::new(NodeId::from_bytes(bytes), 1)
            })
            .collect();
        Self { validators }
    }
}

impl ValidatorSource for StaticValidators {
    fn validators(&self) -> Vec<Validator> {
        self.validators.clone()
    }
}
