//! Linking graph data model.
//!
//! A linking graph is scoped by a [`GraphId`]. Vertices are clusters of entity
//! keys; edges carry a distance between two clusters (smaller is more similar).
//! Vertices are immutable once created: a merge always produces a new vertex.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{EntityKeyId, GraphId, VertexId};
use crate::storage::StorageError;

/// Fully qualified vertex key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexKey {
    /// Owning graph.
    pub graph_id: GraphId,
    /// Vertex id within the graph.
    pub vertex_id: VertexId,
}

impl VertexKey {
    /// Creates a vertex key.
    #[must_use]
    pub const fn new(graph_id: GraphId, vertex_id: VertexId) -> Self {
        Self {
            graph_id,
            vertex_id,
        }
    }
}

impl fmt::Display for VertexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.graph_id, self.vertex_id)
    }
}

/// A cluster of entities believed to denote the same real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    /// Weight of the edge whose merge produced this vertex; 0 for singletons.
    pub diameter: f64,
    /// Entities subsumed by this cluster.
    pub members: BTreeSet<EntityKeyId>,
}

impl Vertex {
    /// Singleton vertex for one entity.
    #[must_use]
    pub fn singleton(entity: EntityKeyId) -> Self {
        Self {
            diameter: 0.0,
            members: BTreeSet::from([entity]),
        }
    }

    /// Union of two clusters, produced by merging them along an edge of weight `diameter`.
    #[must_use]
    pub fn merged(a: &Self, b: &Self, diameter: f64) -> Self {
        Self {
            diameter,
            members: a.members.union(&b.members).copied().collect(),
        }
    }

    /// Number of member entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the cluster has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Undirected edge between two vertices of the same graph.
///
/// Endpoints are stored in canonical order (`src < dst` by vertex id), so
/// `{a, b}` and `{b, a}` always produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    graph_id: GraphId,
    src: VertexId,
    dst: VertexId,
}

impl Edge {
    /// Builds the canonical edge between two vertices.
    ///
    /// # Errors
    /// - `GraphMismatch` if the vertices belong to different graphs
    /// - `SelfLoop` if both keys are the same vertex
    pub fn between(a: VertexKey, b: VertexKey) -> Result<Self, StorageError> {
        if a.graph_id != b.graph_id {
            return Err(StorageError::GraphMismatch {
                left: a.graph_id,
                right: b.graph_id,
            });
        }
        Self::within(a.graph_id, a.vertex_id, b.vertex_id)
    }

    /// Builds the canonical edge between two vertex ids of `graph_id`.
    ///
    /// # Errors
    /// - `SelfLoop` if `a == b`
    pub fn within(graph_id: GraphId, a: VertexId, b: VertexId) -> Result<Self, StorageError> {
        if a == b {
            return Err(StorageError::SelfLoop(VertexKey::new(graph_id, a)));
        }
        let (src, dst) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { graph_id, src, dst })
    }

    /// Owning graph.
    #[must_use]
    pub const fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    /// Lower endpoint.
    #[must_use]
    pub const fn src(&self) -> VertexKey {
        VertexKey::new(self.graph_id, self.src)
    }

    /// Upper endpoint.
    #[must_use]
    pub const fn dst(&self) -> VertexKey {
        VertexKey::new(self.graph_id, self.dst)
    }

    /// Returns the endpoint opposite to `vertex`, if `vertex` is an endpoint.
    #[must_use]
    pub fn other(&self, vertex: VertexId) -> Option<VertexId> {
        if vertex == self.src {
            Some(self.dst)
        } else if vertex == self.dst {
            Some(self.src)
        } else {
            None
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{{{}, {}}}", self.graph_id, self.src, self.dst)
    }
}

/// An edge together with its weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedEdge {
    /// The edge.
    pub edge: Edge,
    /// Distance between the endpoints.
    pub weight: f64,
}

/// A live vertex reported as a clustering result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Vertex key of the cluster.
    pub key: VertexKey,
    /// The cluster.
    pub vertex: Vertex,
}
