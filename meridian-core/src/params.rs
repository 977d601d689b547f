//! Consensus parameters and their validation rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tuning parameters for the sampling consensus protocol.
///
/// The parameters are immutable once an engine is built; [`Parameters::validate`]
/// must pass before they are used. The two α thresholds split the roles of a
/// poll result: `alpha_preference` is the weaker bar required to *move* the
/// preference, `alpha_confidence` the stronger bar required to *accumulate*
/// confidence toward finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Number of peers sampled per poll.
    pub k: usize,

    /// Minimum same-value votes for a poll to count as successful for
    /// preference purposes. Must exceed k/2 so two values can never both
    /// clear it in one poll.
    pub alpha_preference: usize,

    /// Minimum same-value votes for a poll to earn confidence. At least
    /// `alpha_preference`, at most `k`.
    pub alpha_confidence: usize,

    /// Consecutive confidence-earning polls required to finalize.
    pub beta: u32,

    /// Maximum polls in flight for a single decision.
    pub concurrent_polls: usize,

    /// Maximum number of decisions processing at once; `add` applies
    /// backpressure beyond this.
    pub max_outstanding_items: usize,

    /// Age after which a still-processing decision makes the engine report
    /// itself unhealthy, and the bound on shutdown draining.
    pub max_item_processing_time: Duration,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            k: 20,
            alpha_preference: 15,
            alpha_confidence: 15,
            beta: 20,
            concurrent_polls: 4,
            max_outstanding_items: 256,
            max_item_processing_time: Duration::from_secs(30),
        }
    }
}

impl Parameters {
    /// Check every structural constraint on the parameter block.
    pub fn validate(&self) -> Result<(), ParametersError> {
        if self.k < 1 {
            return Err(ParametersError::SampleSizeTooSmall { k: self.k });
        }
        if self.alpha_preference <= self.k / 2 {
            return Err(ParametersError::AlphaPreferenceTooSmall {
                alpha_preference: self.alpha_preference,
                k: self.k,
            });
        }
        if self.alpha_confidence < self.alpha_preference {
            return Err(ParametersError::AlphaConfidenceBelowPreference {
                alpha_confidence: self.alpha_confidence,
                alpha_preference: self.alpha_preference,
            });
        }
        if self.alpha_confidence > self.k {
            return Err(ParametersError::AlphaConfidenceAboveK {
                alpha_confidence: self.alpha_confidence,
                k: self.k,
            });
        }
        if self.beta < 1 {
            return Err(ParametersError::BetaTooSmall { beta: self.beta });
        }
        if self.concurrent_polls < 1 {
            return Err(ParametersError::ConcurrentPollsTooSmall {
                concurrent_polls: self.concurrent_polls,
            });
        }
        if self.max_outstanding_items < 1 {
            return Err(ParametersError::MaxOutstandingTooSmall {
                max_outstanding_items: self.max_outstanding_items,
            });
        }
        if self.max_item_processing_time.is_zero() {
            return Err(ParametersError::ZeroProcessingTime);
        }
        Ok(())
    }
}

/// Validation failures for [`Parameters`], naming the offending field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParametersError {
    #[error("k = {k}: at least one peer must be sampled per poll")]
    SampleSizeTooSmall { k: usize },

    #[error("alpha_preference = {alpha_preference}: must exceed k/2 (k = {k})")]
    AlphaPreferenceTooSmall { alpha_preference: usize, k: usize },

    #[error("alpha_confidence = {alpha_confidence}: must be at least alpha_preference ({alpha_preference})")]
    AlphaConfidenceBelowPreference {
        alpha_confidence: usize,
        alpha_preference: usize,
    },

    #[error("alpha_confidence = {alpha_confidence}: cannot exceed the sample size k ({k})")]
    AlphaConfidenceAboveK { alpha_confidence: usize, k: usize },

    #[error("beta = {beta}: at least one confidence round is required")]
    BetaTooSmall { beta: u32 },

    #[error("concurrent_polls = {concurrent_polls}: at least one poll must be allowed in flight")]
    ConcurrentPollsTooSmall { concurrent_polls: usize },

    #[error("max_outstanding_items = {max_outstanding_items}: at least one processing item must be allowed")]
    MaxOutstandingTooSmall { max_outstanding_items: usize },

    #[error("max_item_processing_time must be positive")]
    ZeroProcessingTime,
}
