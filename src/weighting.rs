//! Feature/weighting stage.
//!
//! Turns one candidate pair into graph state: a singleton vertex per entity
//! and, for distinct entities, an edge weighted by the scoring oracle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::entity::{LinkingEntity, PropertyIndex};
use crate::error::{LinkingResult, ValidationError};
use crate::graph::{Edge, VertexKey};
use crate::ids::{EntityKeyId, GraphId};
use crate::scoring::{FeatureExtractor, ScoringError, ScoringOracle};
use crate::storage::{GraphStore, StorageError};

/// Default constant added to every model score.
pub const DEFAULT_SCORE_BIAS: f64 = 0.4;

/// Lock-free running minimum of observed weights.
///
/// Min is commutative and associative, so per-worker trackers can be combined
/// in any order.
#[derive(Debug)]
pub struct MinWeightTracker {
    bits: AtomicU64,
}

impl Default for MinWeightTracker {
    fn default() -> Self {
        Self {
            bits: AtomicU64::new(f64::INFINITY.to_bits()),
        }
    }
}

impl MinWeightTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one weight into the minimum. NaN is ignored.
    pub fn observe(&self, weight: f64) {
        if weight.is_nan() {
            return;
        }
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (weight < f64::from_bits(current)).then(|| weight.to_bits())
            });
    }

    /// Folds another tracker into this one.
    pub fn combine(&self, other: &Self) {
        if let Some(weight) = other.get() {
            self.observe(weight);
        }
    }

    /// Smallest weight observed so far.
    #[must_use]
    pub fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.bits.load(Ordering::Acquire));
        value.is_finite().then_some(value)
    }
}

/// What `score_and_record` wrote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairOutcome {
    /// Self-pair: only the singleton vertex was ensured.
    Singleton(VertexKey),
    /// Distinct pair: an edge was written.
    Edge {
        /// Edge between the two singleton vertices.
        edge: Edge,
        /// Stored weight (model score plus bias).
        weight: f64,
    },
}

/// Scores candidate pairs and records them in the graph store.
pub struct EdgeWeighter {
    store: Arc<dyn GraphStore>,
    features: Arc<dyn FeatureExtractor>,
    oracle: Arc<dyn ScoringOracle>,
    bias: f64,
    min_weight: MinWeightTracker,
    edges_recorded: AtomicU64,
}

impl std::fmt::Debug for EdgeWeighter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeWeighter")
            .field("bias", &self.bias)
            .field("min_weight", &self.min_weight.get())
            .field("edges_recorded", &self.edges_recorded())
            .finish_non_exhaustive()
    }
}

impl EdgeWeighter {
    /// Creates a weighter with the default bias.
    pub fn new(
        store: Arc<dyn GraphStore>,
        features: Arc<dyn FeatureExtractor>,
        oracle: Arc<dyn ScoringOracle>,
    ) -> Self {
        Self {
            store,
            features,
            oracle,
            bias: DEFAULT_SCORE_BIAS,
            min_weight: MinWeightTracker::new(),
            edges_recorded: AtomicU64::new(0),
        }
    }

    /// Overrides the bias added to every model score.
    ///
    /// # Errors
    /// `InvalidBias` if the bias is negative or not finite.
    pub fn with_bias(mut self, bias: f64) -> Result<Self, ValidationError> {
        if !bias.is_finite() || bias < 0.0 {
            return Err(ValidationError::InvalidBias { value: bias });
        }
        self.bias = bias;
        Ok(self)
    }

    /// Bias added to every model score.
    #[must_use]
    pub const fn bias(&self) -> f64 {
        self.bias
    }

    /// Smallest weight this weighter has written.
    #[must_use]
    pub fn min_weight(&self) -> Option<f64> {
        self.min_weight.get()
    }

    /// Running minimum tracker, for combining across weighters.
    #[must_use]
    pub const fn min_weight_tracker(&self) -> &MinWeightTracker {
        &self.min_weight
    }

    /// Number of edges written.
    #[must_use]
    pub fn edges_recorded(&self) -> u64 {
        self.edges_recorded.load(Ordering::Acquire)
    }

    /// Scores one pair and records the result.
    ///
    /// Self-pairs only ensure the singleton vertex. Distinct pairs ensure both
    /// singletons, score the feature matrix and write the edge with weight
    /// `model score + bias`.
    ///
    /// # Errors
    /// - `Scoring` if feature extraction or the oracle fails, or the resulting
    ///   weight is not a finite non-negative number; nothing is written for the edge
    /// - `Storage` if the graph store rejects a write, or `VertexNotFound` if
    ///   either singleton was merged away by an earlier drain; nothing is written
    pub fn score_and_record(
        &self,
        graph_id: GraphId,
        key_a: EntityKeyId,
        entity_a: &LinkingEntity,
        key_b: EntityKeyId,
        entity_b: &LinkingEntity,
        index: &PropertyIndex,
    ) -> LinkingResult<PairOutcome> {
        if key_a == key_b {
            let vertex = self.live_singleton(graph_id, key_a)?;
            return Ok(PairOutcome::Singleton(vertex));
        }

        let va = self.live_singleton(graph_id, key_a)?;
        let vb = self.live_singleton(graph_id, key_b)?;

        let features = self.features.features(entity_a, entity_b, index)?;
        let score = self.oracle.score(&features).map_err(|err| {
            warn!(%graph_id, a = %key_a, b = %key_b, error = %err, "scoring oracle failed");
            err
        })?;
        let weight = score + self.bias;
        if !weight.is_finite() || weight < 0.0 {
            return Err(ScoringError::InvalidScore { score }.into());
        }

        let edge = Edge::between(va, vb)?;
        self.store.put_edge(edge, weight)?;
        self.min_weight.observe(weight);
        self.edges_recorded.fetch_add(1, Ordering::AcqRel);
        debug!(%graph_id, %edge, weight, "recorded edge");

        Ok(PairOutcome::Edge { edge, weight })
    }

    /// Ensures the singleton vertex of `entity` and checks it is still live.
    ///
    /// Once clustering has merged a singleton away its id is retired, so the
    /// store hands the key back without re-creating the vertex.
    fn live_singleton(&self, graph_id: GraphId, entity: EntityKeyId) -> LinkingResult<VertexKey> {
        let key = self.store.singleton_vertex(graph_id, entity)?;
        if !self.store.vertex_exists(key)? {
            warn!(%graph_id, %entity, vertex = %key, "singleton already merged away");
            return Err(StorageError::VertexNotFound(key).into());
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::LinkingError;
    use crate::ids::{EntitySetId, PropertyTypeId};
    use crate::scoring::ExactMatchFeatures;
    use crate::storage::InMemoryGraphStore;

    fn mismatch_count(features: &[Vec<f64>]) -> Result<f64, ScoringError> {
        Ok(features.iter().filter(|row| row[0] == 0.0).count() as f64 * 0.1)
    }

    fn weighter(store: Arc<InMemoryGraphStore>) -> EdgeWeighter {
        EdgeWeighter::new(store, Arc::new(ExactMatchFeatures), Arc::new(mismatch_count))
    }

    #[test]
    fn self_pair_creates_singleton_only() {
        let store = Arc::new(InMemoryGraphStore::new());
        let w = weighter(Arc::clone(&store));
        let g = GraphId::new();
        let key = EntityKeyId::random_in(EntitySetId::new());
        let entity = LinkingEntity::new();

        let out = w
            .score_and_record(g, key, &entity, key, &entity, &PropertyIndex::default())
            .unwrap();
        assert!(matches!(out, PairOutcome::Singleton(_)));
        assert_eq!(store.vertices(g).unwrap().len(), 1);
        assert!(store.edges(g).unwrap().is_empty());
        assert_eq!(w.min_weight(), None);
    }

    #[test]
    fn distinct_pair_writes_biased_edge() {
        let store = Arc::new(InMemoryGraphStore::new());
        let w = weighter(Arc::clone(&store));
        let g = GraphId::new();
        let set = EntitySetId::new();
        let name = PropertyTypeId::new();
        let city = PropertyTypeId::new();
        let index = PropertyIndex::new([name, city]);

        let (ka, kb) = (EntityKeyId::random_in(set), EntityKeyId::random_in(set));
        let a = LinkingEntity::new().with_value(name, "ann").with_value(city, "oslo");
        let b = LinkingEntity::new().with_value(name, "ann").with_value(city, "bergen");

        let PairOutcome::Edge { edge, weight } =
            w.score_and_record(g, ka, &a, kb, &b, &index).unwrap()
        else {
            panic!("expected an edge");
        };
        assert!((weight - 0.5).abs() < 1e-12);
        assert_eq!(store.edge_weight(edge).unwrap(), Some(weight));
        assert_eq!(store.vertices(g).unwrap().len(), 2);
        assert_eq!(w.min_weight(), Some(weight));
        assert_eq!(w.edges_recorded(), 1);
    }

    #[test]
    fn oracle_failure_propagates_and_writes_no_edge() {
        let store = Arc::new(InMemoryGraphStore::new());
        let down = |_: &[Vec<f64>]| -> Result<f64, ScoringError> {
            Err(ScoringError::Unavailable("timeout".to_string()))
        };
        let w = EdgeWeighter::new(store.clone(), Arc::new(ExactMatchFeatures), Arc::new(down));
        let g = GraphId::new();
        let set = EntitySetId::new();
        let e = LinkingEntity::new();

        let err = w
            .score_and_record(
                g,
                EntityKeyId::random_in(set),
                &e,
                EntityKeyId::random_in(set),
                &e,
                &PropertyIndex::default(),
            )
            .unwrap_err();
        assert!(matches!(err, LinkingError::Scoring(ScoringError::Unavailable(_))));
        assert!(store.edges(g).unwrap().is_empty());
        assert_eq!(w.edges_recorded(), 0);
    }

    #[test]
    fn negative_weight_is_rejected() {
        let store = Arc::new(InMemoryGraphStore::new());
        let oracle = |_: &[Vec<f64>]| -> Result<f64, ScoringError> { Ok(-1.0) };
        let w = EdgeWeighter::new(store.clone(), Arc::new(ExactMatchFeatures), Arc::new(oracle));
        let set = EntitySetId::new();
        let e = LinkingEntity::new();

        let err = w
            .score_and_record(
                GraphId::new(),
                EntityKeyId::random_in(set),
                &e,
                EntityKeyId::random_in(set),
                &e,
                &PropertyIndex::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LinkingError::Scoring(ScoringError::InvalidScore { .. })
        ));
    }

    #[test]
    fn pair_touching_a_merged_singleton_is_refused() {
        let store = Arc::new(InMemoryGraphStore::new());
        let w = weighter(Arc::clone(&store));
        let g = GraphId::new();
        let set = EntitySetId::new();
        let (ka, kb, kc) = (
            EntityKeyId::random_in(set),
            EntityKeyId::random_in(set),
            EntityKeyId::random_in(set),
        );
        let e = LinkingEntity::new();
        let index = PropertyIndex::default();

        let PairOutcome::Edge { edge, .. } = w.score_and_record(g, ka, &e, kb, &e, &index).unwrap() else {
            panic!("expected an edge");
        };
        // A drain merged `a` away and dropped its edges.
        let va = store.singleton_vertex(g, ka).unwrap();
        store.remove_edge(edge).unwrap();
        assert!(store.remove_vertex(va).unwrap());

        let err = w.score_and_record(g, ka, &e, kc, &e, &index).unwrap_err();
        assert!(matches!(err, LinkingError::Storage(StorageError::VertexNotFound(k)) if k == va));
        let err = w.score_and_record(g, ka, &e, ka, &e, &index).unwrap_err();
        assert!(matches!(err, LinkingError::Storage(StorageError::VertexNotFound(k)) if k == va));

        assert!(store.edges(g).unwrap().is_empty());
        assert!(!store.vertex_exists(va).unwrap());
        assert_eq!(w.edges_recorded(), 1);
    }

    #[test]
    fn bias_validation() {
        let store = Arc::new(InMemoryGraphStore::new());
        assert!(weighter(store.clone()).with_bias(-0.1).is_err());
        assert!(weighter(store.clone()).with_bias(f64::NAN).is_err());
        let w = weighter(store).with_bias(0.0).unwrap();
        assert_eq!(w.bias(), 0.0);
    }

    #[test]
    fn min_tracker_combines_across_threads() {
        let global = Arc::new(MinWeightTracker::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let global = Arc::clone(&global);
                std::thread::spawn(move || {
                    let local = MinWeightTracker::new();
                    for j in 0..100 {
                        local.observe(f64::from(i * 100 + j) / 10.0 + 0.5);
                    }
                    global.combine(&local);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(global.get(), Some(0.5));

        let empty = MinWeightTracker::new();
        empty.observe(f64::NAN);
        assert_eq!(empty.get(), None);
    }
}
