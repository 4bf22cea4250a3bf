//! Hierarchical clustering over a linking graph.
//!
//! The engine repeatedly takes the lightest edge of a graph, merges its two
//! endpoints into a new cluster vertex, re-weights the edges to every neighbor
//! and removes what the merge superseded. It stops when no edge lighter than
//! the threshold is left; the vertices that remain are the final clusters.
//!
//! A merge touches many keys and none of it is atomic. Another worker may have
//! consumed an endpoint between the lightest-edge read and the merge. Such an
//! edge is stale: it is removed and the loop moves on. Stale edges are
//! recovered, counted and logged, never surfaced as errors.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LinkingResult, ValidationError};
use crate::graph::{Cluster, Edge, VertexKey, WeightedEdge};
use crate::ids::{GraphId, VertexId};
use crate::storage::{GraphStore, StorageError};

/// Default merge threshold: edges at or above it are never merged.
pub const DEFAULT_THRESHOLD: f64 = 0.1;

/// Per-graph drain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    /// Edges below the threshold may remain.
    Draining,
    /// Terminal: remaining vertices are final clusters.
    Done,
}

/// Why draining stopped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum StopReason {
    /// The graph has no edges left.
    Exhausted,
    /// The lightest edge is at or above the threshold.
    ThresholdReached {
        /// Weight of the lightest remaining edge.
        weight: f64,
    },
}

/// One completed merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    /// First merged vertex.
    pub a: VertexKey,
    /// Second merged vertex.
    pub b: VertexKey,
    /// Newly created cluster vertex.
    pub merged: VertexKey,
    /// Weight of the merged edge (the new vertex's diameter).
    pub weight: f64,
    /// Number of neighbors re-linked to the new vertex.
    pub relinked: usize,
}

/// Result of a single step of the drain loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// Two vertices were merged.
    Merged(MergeRecord),
    /// The lightest edge referenced a vertex that no longer exists and was removed.
    StaleEdgeRemoved(Edge),
    /// Nothing left to merge.
    Done(StopReason),
}

impl Step {
    /// Drain state after this step.
    #[must_use]
    pub const fn state(&self) -> DrainState {
        match self {
            Self::Done(_) => DrainState::Done,
            Self::Merged(_) | Self::StaleEdgeRemoved(_) => DrainState::Draining,
        }
    }
}

/// Summary of one full drain of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringReport {
    /// Drained graph.
    pub graph_id: GraphId,
    /// Threshold used.
    pub threshold: f64,
    /// Number of merges performed.
    pub merges: u64,
    /// Number of stale edges removed along the way.
    pub stale_edges_removed: u64,
    /// Why draining stopped.
    pub stop_reason: StopReason,
    /// Live vertices once the graph reached DONE.
    pub clusters: Vec<Cluster>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
}

/// Weight of the edge between a merged cluster and neighbor `n`.
///
/// `sw` is the weight of `n` to the first merged vertex, `dw` its weight to the
/// second, `w` the weight of the merged edge. A side on which `n` is not a
/// neighbor is penalized by routing through the merged edge (`+ w`); the result
/// is the looser of the two tightened bounds. Returns `None` when `n` is a
/// neighbor of neither side.
///
/// ```
/// use linkgraph::clustering::linkage_weight;
///
/// assert_eq!(linkage_weight(Some(0.2), Some(0.2), 0.05), Some(0.2));
/// assert_eq!(linkage_weight(Some(0.2), None, 0.05), Some(0.25));
/// assert_eq!(linkage_weight(None, None, 0.05), None);
/// ```
#[must_use]
pub fn linkage_weight(sw: Option<f64>, dw: Option<f64>, w: f64) -> Option<f64> {
    let (min_src, min_dst) = match (sw, dw) {
        (None, None) => return None,
        (None, Some(dw)) => (dw + w, dw),
        (Some(sw), None) => (sw, sw + w),
        (Some(sw), Some(dw)) => (sw.min(dw + w), (sw + w).min(dw)),
    };
    Some(min_src.max(min_dst))
}

/// Drains linking graphs into clusters.
pub struct ClusteringEngine {
    store: Arc<dyn GraphStore>,
}

impl std::fmt::Debug for ClusteringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteringEngine").finish_non_exhaustive()
    }
}

impl ClusteringEngine {
    /// Creates an engine over `store`.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Drains `graph_id` until no edge below `threshold` remains.
    ///
    /// Returns once the graph is DONE, with the final clusters and the number
    /// of merges and stale-edge recoveries.
    ///
    /// # Errors
    /// - `InvalidThreshold` if `threshold` is not finite and positive
    /// - `Storage` if the graph store fails
    pub fn cluster(&self, graph_id: GraphId, threshold: f64) -> LinkingResult<ClusteringReport> {
        validate_threshold(threshold)?;
        let started_at = Utc::now();
        let mut merges = 0u64;
        let mut stale = 0u64;

        let stop_reason = loop {
            match self.step(graph_id, threshold)? {
                Step::Merged(_) => merges += 1,
                Step::StaleEdgeRemoved(_) => stale += 1,
                Step::Done(reason) => break reason,
            }
        };

        let clusters = self
            .store
            .vertices(graph_id)?
            .into_iter()
            .map(|(key, vertex)| Cluster { key, vertex })
            .collect::<Vec<_>>();

        info!(
            %graph_id,
            merges,
            stale_edges_removed = stale,
            clusters = clusters.len(),
            "graph clustered"
        );

        Ok(ClusteringReport {
            graph_id,
            threshold,
            merges,
            stale_edges_removed: stale,
            stop_reason,
            clusters,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Runs one step of the drain loop.
    ///
    /// # Errors
    /// - `InvalidThreshold` if `threshold` is not finite and positive
    /// - `Storage` if the graph store fails
    pub fn step(&self, graph_id: GraphId, threshold: f64) -> LinkingResult<Step> {
        validate_threshold(threshold)?;

        let Some(WeightedEdge { edge, weight }) = self.store.lightest_edge(graph_id)? else {
            return Ok(Step::Done(StopReason::Exhausted));
        };
        if weight >= threshold {
            return Ok(Step::Done(StopReason::ThresholdReached { weight }));
        }

        let (a, b) = (edge.src(), edge.dst());
        if !(self.store.vertex_exists(a)? && self.store.vertex_exists(b)?) {
            self.drop_stale(edge)?;
            return Ok(Step::StaleEdgeRemoved(edge));
        }

        match self.merge(edge, weight)? {
            Some(record) => Ok(Step::Merged(record)),
            None => Ok(Step::StaleEdgeRemoved(edge)),
        }
    }

    /// Merges the endpoints of `edge`. Returns `None` if an endpoint vanished
    /// before the new vertex could be created.
    fn merge(&self, edge: Edge, weight: f64) -> LinkingResult<Option<MergeRecord>> {
        let graph_id = edge.graph_id();
        let (a, b) = (edge.src(), edge.dst());

        let mut from_a = self.store.neighbors(a)?;
        from_a.remove(&b.vertex_id);
        let mut from_b = self.store.neighbors(b)?;
        from_b.remove(&a.vertex_id);

        let relinked = relinked_weights(&from_a, &from_b, weight);

        let merged = match self.store.merge_vertices(a, b, weight) {
            Ok(key) => key,
            Err(StorageError::VertexNotFound(missing)) => {
                debug!(%graph_id, vertex = %missing, "endpoint vanished before merge");
                self.drop_stale(edge)?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        for (neighbor, new_weight) in &relinked {
            self.store
                .put_edge(Edge::within(graph_id, merged.vertex_id, *neighbor)?, *new_weight)?;
        }
        for neighbor in from_a.keys() {
            self.store.remove_edge(Edge::within(graph_id, a.vertex_id, *neighbor)?)?;
        }
        for neighbor in from_b.keys() {
            self.store.remove_edge(Edge::within(graph_id, b.vertex_id, *neighbor)?)?;
        }
        self.store.remove_edge(edge)?;
        self.store.remove_vertex(a)?;
        self.store.remove_vertex(b)?;

        debug!(%graph_id, %a, %b, %merged, weight, relinked = relinked.len(), "merged vertices");

        Ok(Some(MergeRecord {
            a,
            b,
            merged,
            weight,
            relinked: relinked.len(),
        }))
    }

    fn drop_stale(&self, edge: Edge) -> LinkingResult<()> {
        self.store.remove_edge(edge)?;
        warn!(graph_id = %edge.graph_id(), %edge, "removed stale edge");
        Ok(())
    }
}

fn relinked_weights(
    from_a: &HashMap<VertexId, f64>,
    from_b: &HashMap<VertexId, f64>,
    weight: f64,
) -> Vec<(VertexId, f64)> {
    let neighbors: BTreeSet<VertexId> = from_a.keys().chain(from_b.keys()).copied().collect();
    neighbors
        .into_iter()
        .filter_map(|n| {
            linkage_weight(from_a.get(&n).copied(), from_b.get(&n).copied(), weight)
                .map(|w| (n, w))
        })
        .collect()
}

fn validate_threshold(threshold: f64) -> Result<(), ValidationError> {
    if threshold.is_finite() && threshold > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidThreshold { value: threshold })
    }
}
