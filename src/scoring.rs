//! Pairwise feature extraction and the scoring oracle boundary.
//!
//! Both the feature function and the scoring model are external collaborators.
//! The engine only relies on their shape: a pair of entities becomes a matrix
//! of features, and the oracle turns that matrix into a raw distance score.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::entity::{LinkingEntity, PropertyIndex};

/// Errors raised by feature extraction or the scoring oracle.
#[derive(Debug, Error)]
pub enum ScoringError {
    /// The oracle could not be reached or refused the request.
    #[error("Scoring oracle unavailable: {0}")]
    Unavailable(String),

    /// The oracle returned a value that cannot be used as a distance.
    #[error("Scoring oracle returned an invalid score: {score}")]
    InvalidScore {
        /// Returned score.
        score: f64,
    },

    /// Features could not be computed for the pair.
    #[error("Feature extraction failed: {0}")]
    FeatureExtraction(String),
}

/// Computes a feature matrix for a pair of entities.
pub trait FeatureExtractor: Send + Sync {
    /// One row per selected property, in `index` order.
    fn features(
        &self,
        a: &LinkingEntity,
        b: &LinkingEntity,
        index: &PropertyIndex,
    ) -> Result<Vec<Vec<f64>>, ScoringError>;
}

/// Black-box model mapping a feature matrix to a raw distance score.
///
/// Must be callable concurrently from many workers. Failures must be
/// returned, never swallowed.
pub trait ScoringOracle: Send + Sync {
    /// Scores one feature matrix.
    fn score(&self, features: &[Vec<f64>]) -> Result<f64, ScoringError>;
}

impl<F> ScoringOracle for F
where
    F: Fn(&[Vec<f64>]) -> Result<f64, ScoringError> + Send + Sync,
{
    fn score(&self, features: &[Vec<f64>]) -> Result<f64, ScoringError> {
        self(features)
    }
}

/// Reference feature extractor based on exact value overlap.
///
/// For every selected property it emits `[exact, jaccard]`:
/// - `exact` is 1.0 if the value sets share any value, else 0.0
/// - `jaccard` is |A ∩ B| / |A ∪ B|, 0.0 when both sides are empty
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatchFeatures;

impl FeatureExtractor for ExactMatchFeatures {
    fn features(
        &self,
        a: &LinkingEntity,
        b: &LinkingEntity,
        index: &PropertyIndex,
    ) -> Result<Vec<Vec<f64>>, ScoringError> {
        let empty = BTreeSet::new();
        Ok(index
            .properties()
            .iter()
            .map(|property| {
                let left = a.values(*property).unwrap_or(&empty);
                let right = b.values(*property).unwrap_or(&empty);
                let shared = left.intersection(right).count();
                let total = left.union(right).count();
                let exact = if shared > 0 { 1.0 } else { 0.0 };
                #[allow(clippy::cast_precision_loss)]
                let jaccard = if total == 0 {
                    0.0
                } else {
                    shared as f64 / total as f64
                };
                vec![exact, jaccard]
            })
            .collect())
    }
}
