//! # Meridian Core Types
//!
//! Foundation crate for the Meridian consensus engine. It contains the
//! building blocks every other crate agrees on:
//!
//! - **Identifiers**: fixed-width [`Id`] (decisions) and [`NodeId`] (peers)
//! - **Lifecycle**: the [`DecisionStatus`] state set and its transition rules
//! - **Parameters**: the validated [`Parameters`] block controlling sample
//!   size, the dual α thresholds, and the β finalization requirement
//! - **Vote bag**: [`Bag`], a deterministic counting multiset used to
//!   aggregate poll replies
//! - **Sampling**: [`WeightedSampler`], stake-weighted peer selection
//!   without replacement
//!
//! Everything in this crate is synchronous and allocation-light; the async
//! machinery lives in `meridian-consensus`.

mod bag;
mod params;
mod sampler;
mod types;

pub use bag::Bag;
pub use params::{Parameters, ParametersError};
pub use sampler::{SamplerError, WeightedSampler};
pub use types::{DecisionStatus, Id, NodeId, StaticValidators, Validator, ValidatorSource};
