//! # Meridian Network Layer
//!
//! The engine core never opens a socket: it sends vote requests through the
//! [`VoteTransport`](meridian_consensus::VoteTransport) trait and receives
//! replies through `ConsensusEngine::record_reply`. This crate supplies the
//! pieces a host needs to wire a real or simulated network to that seam:
//!
//! - **Wire codec** ([`wire`]): the fixed 36-byte request/reply frames
//!   exchanged between validators, with strict length validation
//! - **Simulated network** ([`sim`]): a deterministic in-process transport
//!   where every peer is scripted — honest, flaky, silent, or unreachable —
//!   used by the test suite and the demo node
//!
//! A production host would implement `VoteTransport` over its own P2P stack
//! and feed inbound [`VoteReply`] frames back into the engine; the codec
//! here is the shared vocabulary for both directions.

pub mod sim;
pub mod wire;

pub use sim::{SimNetwork, SimReply, VoterBehavior};
pub use wire::{VoteReply, VoteRequest, FRAME_LEN};
