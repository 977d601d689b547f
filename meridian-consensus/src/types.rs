//! The decision type submitted to the engine.

use meridian_core::Id;
use serde::{Deserialize, Serialize};

/// One candidate decision: a block on a chain or a vertex in a DAG.
///
/// The payload is opaque to the engine; only the identifier, the parent
/// links, and the height participate in consensus. Chain decisions carry
/// exactly one parent, DAG vertices one or more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Id,
    pub parents: Vec<Id>,
    pub height: u64,
    pub payload: Vec<u8>,
}

impl Decision {
    /// Build a decision whose id is derived from its content, so equal
    /// content always maps to the same identifier.
    pub fn new(parents: Vec<Id>, height: u64, payload: Vec<u8>) -> Self {
        let mut material = Vec::with_capacity(parents.len() * Id::LEN + 8 + payload.len());
        for parent in &parents {
            material.extend_from_slice(parent.as_bytes());
        }
        material.extend_from_slice(&height.to_be_bytes());
        material.extend_from_slice(&payload);
        Self {
            id: Id::digest(&material),
            parents,
            height,
            payload,
        }
    }

    /// Build a decision with an externally assigned id.
    pub fn with_id(id: Id, parents: Vec<Id>, height: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            parents,
            height,
            payload,
        }
    }

    /// The single parent of a chain decision, if it has exactly one.
    pub fn parent(&self) -> Option<Id> {
        match self.parents.as_slice() {
            [parent] => Some(*parent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_addressed_ids() {
        let a = Decision::new(vec![Id::ZERO], 1, b"payload".to_vec());
        let b = Decision::new(vec![Id::ZERO], 1, b"payload".to_vec());
        let c = Decision::new(vec![Id::ZERO], 1, b"other".to_vec());
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_height_changes_the_id() {
        let a = Decision::new(vec![Id::ZERO], 1, b"x".to_vec());
        let b = Decision::new(vec![Id::ZERO], 2, b"x".to_vec());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_parent_accessor() {
        let chain = Decision::new(vec![Id::ZERO], 1, Vec::new());
        assert_eq!(chain.parent(), Some(Id::ZERO));

        let joint = Decision::new(vec![Id::ZERO, Id::digest(b"b")], 2, Vec::new());
        assert_eq!(joint.parent(), None);
    }
}
