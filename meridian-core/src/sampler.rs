//! Stake-weighted peer sampling without replacement.

use rand::Rng;
use thiserror::Error;

use crate::types::{NodeId, Validator};

/// Selects poll participants from a validator snapshot, proportionally to
/// stake weight and without replacement.
///
/// The sampler is a pure function of its snapshot and the injected RNG: the
/// same seed and validator set always produce the same sequence, which the
/// test suite relies on. Construction copies the snapshot and discards
/// zero-stake entries — a peer without stake is not sampleable. A sampler
/// is built per poll, so membership changes between polls never bleed into
/// an in-progress sample.
#[derive(Debug, Clone)]
pub struct WeightedSampler {
    validators: Vec<Validator>,
    total_weight: u64,
}

impl WeightedSampler {
    pub fn new(validators: Vec<Validator>) -> Self {
        let validators: Vec<Validator> =
            validators.into_iter().filter(|v| v.weight > 0).collect();
        let total_weight = validators.iter().map(|v| v.weight).sum();
        Self {
            validators,
            total_weight,
        }
    }

    /// Number of sampleable peers in the snapshot.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Draw `k` distinct peers, each draw weighted by remaining stake.
    pub fn sample<R: Rng>(&self, rng: &mut R, k: usize) -> Result<Vec<NodeId>, SamplerError> {
        if self.validators.len() < k {
            return Err(SamplerError::InsufficientValidators {
                need: k,
                have: self.validators.len(),
            });
        }

        let mut pool = self.validators.clone();
        let mut remaining = self.total_weight;
        let mut sampled = Vec::with_capacity(k);

        for _ in 0..k {
            let mut point = rng.gen_range(0..remaining);
            let mut index = pool.len() - 1;
            for (i, validator) in pool.iter().enumerate() {
                if point < validator.weight {
                    index = i;
                    break;
                }
                point -= validator.weight;
            }
            let chosen = pool.swap_remove(index);
            remaining -= chosen.weight;
            sampled.push(chosen.node);
        }

        Ok(sampled)
    }
}

/// Sampling failure: fatal for the poll being assembled; the engine logs
/// and skips the tick rather than polling a short sample.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    #[error("validator set too small: need {need}, have {have} with stake")]
    InsufficientValidators { need: usize, have: usize },
}
