//! Wire frames for the polling protocol.
//!
//! Both messages are fixed-size: a 4-byte poll id followed by a 32-byte
//! decision id, 36 bytes total. Anything else on the wire is rejected
//! before it reaches the engine.

use meridian_consensus::TransportError;
use meridian_core::Id;
use serde::{Deserialize, Serialize};

/// Exact encoded size of both frame types.
pub const FRAME_LEN: usize = 4 + Id::LEN;

/// Ask a peer which decision it currently prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub poll_id: u32,
    pub decision: Id,
}

/// A peer's answer to a [`VoteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub poll_id: u32,
    pub vote: Id,
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, TransportError> {
    let bytes =
        bincode::serialize(message).map_err(|e| TransportError::BadFrame(e.to_string()))?;
    debug_assert_eq!(bytes.len(), FRAME_LEN);
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, TransportError> {
    if bytes.len() != FRAME_LEN {
        return Err(TransportError::BadFrame(format!(
            "expected {FRAME_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    bincode::deserialize(bytes).map_err(|e| TransportError::BadFrame(e.to_string()))
}

impl VoteRequest {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        decode(bytes)
    }
}

impl VoteReply {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        decode(bytes)
    }
}
