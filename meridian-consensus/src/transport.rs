//! The outbound seam between the engine and the host's network stack.

use meridian_core::{Id, NodeId};
use thiserror::Error;

/// Fire-and-forget dispatch of vote requests.
///
/// The engine calls this once per sampled peer per poll, outside its state
/// lock, and never waits for an answer: replies arrive asynchronously
/// through `ConsensusEngine::record_reply`. A send error drops that peer
/// from the poll — the poll then completes without its vote or times out.
pub trait VoteTransport: Send + Sync {
    fn send_vote_request(&self, to: NodeId, poll_id: u32, decision: Id)
        -> Result<(), TransportError>;
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {peer} is unreachable")]
    Unreachable { peer: NodeId },

    #[error("send to {peer} failed: {reason}")]
    SendFailed { peer: NodeId, reason: String },

    #[error("malformed frame: {0}")]
    BadFrame(String),
}
