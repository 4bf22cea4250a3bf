//! Abstract graph store trait.
//!
//! The graph store is the only shared mutable resource in the engine. It holds
//! linking vertices and edges for many independent graphs and offers per-key
//! operations only: there is no multi-key transaction and no lock exposed to
//! callers. Algorithms built on top must tolerate reading state that another
//! worker is halfway through changing.

use std::collections::HashMap;

use thiserror::Error;

use crate::graph::{Edge, Vertex, VertexKey, WeightedEdge};
use crate::ids::{EntityKeyId, GraphId, VertexId};

/// Errors that can occur during graph store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Vertex not found.
    #[error("Vertex not found: {0}")]
    VertexNotFound(VertexKey),

    /// Two keys from different graphs were combined.
    #[error("Graph mismatch: {left} vs {right}")]
    GraphMismatch {
        /// First graph.
        left: GraphId,
        /// Second graph.
        right: GraphId,
    },

    /// An edge from a vertex to itself was requested.
    #[error("Self-loop on vertex {0}")]
    SelfLoop(VertexKey),

    /// Edge weights must be finite and non-negative.
    #[error("Invalid edge weight: {weight}")]
    InvalidWeight {
        /// Rejected weight.
        weight: f64,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Storage trait for linking graphs.
///
/// # Consistency
/// - Every mutation is atomic for the single key it touches and immediately
///   visible to every other caller.
/// - Nothing spanning several keys is atomic. In particular `merge_vertices`
///   neither deletes its inputs nor touches edges; that is the caller's job.
pub trait GraphStore: Send + Sync {
    /// Get-or-create the singleton vertex for an entity.
    ///
    /// Idempotent: concurrent callers for the same entity get the same key. A
    /// singleton that has already been merged away is returned as-is and never
    /// re-created.
    fn singleton_vertex(&self, graph_id: GraphId, entity: EntityKeyId) -> Result<VertexKey, StorageError>;

    /// Get a vertex by key.
    fn vertex(&self, key: VertexKey) -> Result<Option<Vertex>, StorageError>;

    /// Returns true if the vertex is live.
    fn vertex_exists(&self, key: VertexKey) -> Result<bool, StorageError> {
        Ok(self.vertex(key)?.is_some())
    }

    /// All live vertices of a graph.
    fn vertices(&self, graph_id: GraphId) -> Result<Vec<(VertexKey, Vertex)>, StorageError>;

    /// Allocates a new vertex whose members are the union of `a` and `b`, with
    /// `diameter = weight`.
    ///
    /// # Errors
    /// - `VertexNotFound` if either input is not live
    /// - `GraphMismatch` if the inputs belong to different graphs
    fn merge_vertices(&self, a: VertexKey, b: VertexKey, weight: f64) -> Result<VertexKey, StorageError>;

    /// Removes a vertex. Incident edges are left in place. Returns true if it was live.
    fn remove_vertex(&self, key: VertexKey) -> Result<bool, StorageError>;

    /// Inserts or replaces an edge.
    ///
    /// # Errors
    /// - `InvalidWeight` if `weight` is negative or not finite
    fn put_edge(&self, edge: Edge, weight: f64) -> Result<(), StorageError>;

    /// Current weight of an edge, if present.
    fn edge_weight(&self, edge: Edge) -> Result<Option<f64>, StorageError>;

    /// Removes an edge. Returns true if it was present.
    fn remove_edge(&self, edge: Edge) -> Result<bool, StorageError>;

    /// Globally lightest edge of a graph, or `None` if the graph has no edges.
    fn lightest_edge(&self, graph_id: GraphId) -> Result<Option<WeightedEdge>, StorageError>;

    /// All edges of a graph.
    fn edges(&self, graph_id: GraphId) -> Result<Vec<WeightedEdge>, StorageError>;

    /// Edges on which `key` is the canonical source, keyed by the other endpoint.
    fn neighbors_as_src(&self, key: VertexKey) -> Result<HashMap<VertexId, f64>, StorageError>;

    /// Edges on which `key` is the canonical destination, keyed by the other endpoint.
    fn neighbors_as_dst(&self, key: VertexKey) -> Result<HashMap<VertexId, f64>, StorageError>;

    /// All edges incident to `key`, both directions merged.
    fn neighbors(&self, key: VertexKey) -> Result<HashMap<VertexId, f64>, StorageError> {
        let mut out = self.neighbors_as_src(key)?;
        for (vertex, weight) in self.neighbors_as_dst(key)? {
            out.entry(vertex)
                .and_modify(|w| *w = w.min(weight))
                .or_insert(weight);
        }
        out.remove(&key.vertex_id);
        Ok(out)
    }
}

/// Validates a weight for storage.
pub(crate) fn check_weight(weight: f64) -> Result<(), StorageError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(StorageError::InvalidWeight { weight })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_graph_store_object_safe(_: &dyn GraphStore) {}

    #[test]
    fn test_storage_error_display() {
        let key = VertexKey::new(GraphId::new(), VertexId::new());
        let err = StorageError::VertexNotFound(key);
        assert!(err.to_string().contains("Vertex not found"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn check_weight_rejects_negative_and_nan() {
        assert!(check_weight(0.0).is_ok());
        assert!(check_weight(1.5).is_ok());
        assert!(matches!(check_weight(-0.1), Err(StorageError::InvalidWeight { .. })));
        assert!(check_weight(f64::NAN).is_err());
        assert!(check_weight(f64::INFINITY).is_err());
    }
}
