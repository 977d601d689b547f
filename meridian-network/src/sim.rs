//! Deterministic in-process network for tests and simulations.

use std::collections::{HashMap, VecDeque};

use meridian_consensus::{TransportError, VoteTransport};
use meridian_core::{Id, NodeId};
use parking_lot::Mutex;
use tracing::trace;

use crate::wire::{VoteReply, VoteRequest};

/// How a simulated peer answers vote requests.
#[derive(Debug, Clone)]
pub enum VoterBehavior {
    /// Always vote for the same decision.
    Prefer(Id),
    /// Vote for whatever decision the poll asks about — an honest peer
    /// that agrees with the sender's proposal.
    Echo,
    /// Vote the scripted sequence, one entry per request; the last entry
    /// repeats once the script runs out.
    FollowScript(Vec<Id>),
    /// Accept requests but never answer; forces the timeout path.
    Silent,
    /// Fail the send itself; exercises the dropped-peer path.
    Unreachable,
}

/// A reply waiting to be delivered to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimReply {
    pub from: NodeId,
    pub poll_id: u32,
    pub vote: Id,
}

struct PeerState {
    behavior: VoterBehavior,
    served: usize,
}

/// In-process transport where every peer is scripted.
///
/// Requests and replies pass through the real wire codec, so the simulation
/// exercises the same frames a socket transport would. Replies accumulate
/// in an outbox; the driver moves them into the engine with
/// [`SimNetwork::drain`], which makes delivery order and timing fully
/// controlled by the test.
#[derive(Default)]
pub struct SimNetwork {
    peers: Mutex<HashMap<NodeId, PeerState>>,
    outbox: Mutex<VecDeque<(NodeId, Vec<u8>)>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or reconfigure a peer.
    pub fn register(&self, node: NodeId, behavior: VoterBehavior) {
        self.peers.lock().insert(
            node,
            PeerState {
                behavior,
                served: 0,
            },
        );
    }

    /// Registered peers, in id order.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.peers.lock().keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Take every queued reply, decoded and in send order.
    pub fn drain(&self) -> Vec<SimReply> {
        let frames: Vec<(NodeId, Vec<u8>)> = self.outbox.lock().drain(..).collect();
        frames
            .into_iter()
            .filter_map(|(from, frame)| {
                let reply = VoteReply::decode(&frame).ok()?;
                Some(SimReply {
                    from,
                    poll_id: reply.poll_id,
                    vote: reply.vote,
                })
            })
            .collect()
    }

    /// Number of undelivered replies.
    pub fn pending(&self) -> usize {
        self.outbox.lock().len()
    }
}

impl VoteTransport for SimNetwork {
    fn send_vote_request(
        &self,
        to: NodeId,
        poll_id: u32,
        decision: Id,
    ) -> Result<(), TransportError> {
        // Round-trip the request through the codec like a socket would.
        let frame = VoteRequest { poll_id, decision }.encode()?;
        let request = VoteRequest::decode(&frame)?;

        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&to) else {
            return Err(TransportError::Unreachable { peer: to });
        };

        let vote = match &peer.behavior {
            VoterBehavior::Unreachable => {
                return Err(TransportError::Unreachable { peer: to });
            }
            VoterBehavior::Silent => {
                trace!(peer = %to, poll = poll_id, "peer stays silent");
                return Ok(());
            }
            VoterBehavior::Prefer(id) => *id,
            VoterBehavior::Echo => request.decision,
            VoterBehavior::FollowScript(script) => {
                let index = peer.served.min(script.len().saturating_sub(1));
                match script.get(index) {
                    Some(id) => *id,
                    None => return Ok(()),
                }
            }
        };
        peer.served += 1;

        let reply = VoteReply {
            poll_id: request.poll_id,
            vote,
        }
        .encode()?;
        self.outbox.lock().push_back((to, reply));
        Ok(())
    }
}
