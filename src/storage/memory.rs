//! In-memory graph store backend.
//!
//! Thread-safe implementation of [`GraphStore`], intended for embedded usage,
//! tests, and as a reference implementation. Each graph keeps a weight-ordered
//! edge index so the lightest edge is an O(log n) lookup.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use uuid::Uuid;

use crate::graph::{Edge, Vertex, VertexKey, WeightedEdge};
use crate::ids::{EntityKeyId, GraphId, VertexId};
use crate::storage::traits::{check_weight, GraphStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Total order over stored weights (which are always finite and non-negative).
#[derive(Debug, Clone, Copy)]
struct WeightKey(f64);

impl PartialEq for WeightKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WeightKey {}

impl PartialOrd for WeightKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WeightKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn singleton_id(graph_id: GraphId, entity: EntityKeyId) -> VertexId {
    VertexId::from_uuid(Uuid::new_v5(graph_id.as_uuid(), &entity.to_bytes()))
}

#[derive(Debug, Default)]
struct GraphState {
    vertices: HashMap<VertexId, Vertex>,
    retired: HashSet<VertexId>,
    edges: HashMap<Edge, f64>,
    by_weight: BTreeSet<(WeightKey, Edge)>,
    // canonical src -> dsts
    outgoing: HashMap<VertexId, HashSet<VertexId>>,
    // canonical dst -> srcs
    incoming: HashMap<VertexId, HashSet<VertexId>>,
}

impl GraphState {
    fn remove_edge(&mut self, edge: Edge) -> bool {
        let Some(weight) = self.edges.remove(&edge) else {
            return false;
        };
        self.by_weight.remove(&(WeightKey(weight), edge));

        let src = edge.src().vertex_id;
        let dst = edge.dst().vertex_id;
        if let Some(set) = self.outgoing.get_mut(&src) {
            set.remove(&dst);
            if set.is_empty() {
                self.outgoing.remove(&src);
            }
        }
        if let Some(set) = self.incoming.get_mut(&dst) {
            set.remove(&src);
            if set.is_empty() {
                self.incoming.remove(&dst);
            }
        }
        true
    }

    fn put_edge(&mut self, edge: Edge, weight: f64) {
        if let Some(prev) = self.edges.insert(edge, weight) {
            self.by_weight.remove(&(WeightKey(prev), edge));
        }
        self.by_weight.insert((WeightKey(weight), edge));

        let src = edge.src().vertex_id;
        let dst = edge.dst().vertex_id;
        self.outgoing.entry(src).or_default().insert(dst);
        self.incoming.entry(dst).or_default().insert(src);
    }

    fn adjacent(&self, index: &HashMap<VertexId, HashSet<VertexId>>, graph_id: GraphId, vertex: VertexId) -> HashMap<VertexId, f64> {
        let Some(others) = index.get(&vertex) else {
            return HashMap::new();
        };
        others
            .iter()
            .filter_map(|other| {
                let edge = Edge::within(graph_id, vertex, *other).ok()?;
                self.edges.get(&edge).map(|w| (*other, *w))
            })
            .collect()
    }
}

/// Thread-safe in-memory graph store.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    graphs: RwLock<HashMap<GraphId, GraphState>>,
}

impl InMemoryGraphStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of graphs that have ever been written to.
    pub fn graph_count(&self) -> Result<usize, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("graph.count"))?;
        Ok(graphs.len())
    }

    /// Drops every vertex and edge of a graph, including retirement records.
    pub fn clear_graph(&self, graph_id: GraphId) -> Result<bool, StorageError> {
        let mut graphs = self.graphs.write().map_err(|_| lock_err("graph.clear"))?;
        Ok(graphs.remove(&graph_id).is_some())
    }
}

impl GraphStore for InMemoryGraphStore {
    fn singleton_vertex(&self, graph_id: GraphId, entity: EntityKeyId) -> Result<VertexKey, StorageError> {
        let vertex_id = singleton_id(graph_id, entity);
        let key = VertexKey::new(graph_id, vertex_id);

        let mut graphs = self.graphs.write().map_err(|_| lock_err("vertex.singleton"))?;
        let state = graphs.entry(graph_id).or_default();
        if !state.retired.contains(&vertex_id) {
            state
                .vertices
                .entry(vertex_id)
                .or_insert_with(|| Vertex::singleton(entity));
        }
        Ok(key)
    }

    fn vertex(&self, key: VertexKey) -> Result<Option<Vertex>, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("vertex.get"))?;
        Ok(graphs
            .get(&key.graph_id)
            .and_then(|state| state.vertices.get(&key.vertex_id))
            .cloned())
    }

    fn vertex_exists(&self, key: VertexKey) -> Result<bool, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("vertex.exists"))?;
        Ok(graphs
            .get(&key.graph_id)
            .is_some_and(|state| state.vertices.contains_key(&key.vertex_id)))
    }

    fn vertices(&self, graph_id: GraphId) -> Result<Vec<(VertexKey, Vertex)>, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("vertex.list"))?;
        let Some(state) = graphs.get(&graph_id) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<(VertexKey, Vertex)> = state
            .vertices
            .iter()
            .map(|(id, v)| (VertexKey::new(graph_id, *id), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn merge_vertices(&self, a: VertexKey, b: VertexKey, weight: f64) -> Result<VertexKey, StorageError> {
        if a.graph_id != b.graph_id {
            return Err(StorageError::GraphMismatch {
                left: a.graph_id,
                right: b.graph_id,
            });
        }
        if a == b {
            return Err(StorageError::SelfLoop(a));
        }
        check_weight(weight)?;

        let mut graphs = self.graphs.write().map_err(|_| lock_err("vertex.merge"))?;
        let state = graphs
            .get_mut(&a.graph_id)
            .ok_or(StorageError::VertexNotFound(a))?;
        let left = state
            .vertices
            .get(&a.vertex_id)
            .ok_or(StorageError::VertexNotFound(a))?;
        let right = state
            .vertices
            .get(&b.vertex_id)
            .ok_or(StorageError::VertexNotFound(b))?;

        let merged = Vertex::merged(left, right, weight);
        let mut vertex_id = VertexId::new();
        while state.vertices.contains_key(&vertex_id) || state.retired.contains(&vertex_id) {
            vertex_id = VertexId::new();
        }
        state.vertices.insert(vertex_id, merged);
        Ok(VertexKey::new(a.graph_id, vertex_id))
    }

    fn remove_vertex(&self, key: VertexKey) -> Result<bool, StorageError> {
        let mut graphs = self.graphs.write().map_err(|_| lock_err("vertex.remove"))?;
        let Some(state) = graphs.get_mut(&key.graph_id) else {
            return Ok(false);
        };
        let removed = state.vertices.remove(&key.vertex_id).is_some();
        state.retired.insert(key.vertex_id);
        Ok(removed)
    }

    fn put_edge(&self, edge: Edge, weight: f64) -> Result<(), StorageError> {
        check_weight(weight)?;
        let mut graphs = self.graphs.write().map_err(|_| lock_err("edge.put"))?;
        graphs.entry(edge.graph_id()).or_default().put_edge(edge, weight);
        Ok(())
    }

    fn edge_weight(&self, edge: Edge) -> Result<Option<f64>, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("edge.get"))?;
        Ok(graphs
            .get(&edge.graph_id())
            .and_then(|state| state.edges.get(&edge))
            .copied())
    }

    fn remove_edge(&self, edge: Edge) -> Result<bool, StorageError> {
        let mut graphs = self.graphs.write().map_err(|_| lock_err("edge.remove"))?;
        Ok(graphs
            .get_mut(&edge.graph_id())
            .is_some_and(|state| state.remove_edge(edge)))
    }

    fn lightest_edge(&self, graph_id: GraphId) -> Result<Option<WeightedEdge>, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("edge.lightest"))?;
        Ok(graphs
            .get(&graph_id)
            .and_then(|state| state.by_weight.first())
            .map(|(weight, edge)| WeightedEdge {
                edge: *edge,
                weight: weight.0,
            }))
    }

    fn edges(&self, graph_id: GraphId) -> Result<Vec<WeightedEdge>, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("edge.list"))?;
        Ok(graphs
            .get(&graph_id)
            .map(|state| {
                state
                    .by_weight
                    .iter()
                    .map(|(weight, edge)| WeightedEdge {
                        edge: *edge,
                        weight: weight.0,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn neighbors_as_src(&self, key: VertexKey) -> Result<HashMap<VertexId, f64>, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("edge.neighbors_src"))?;
        Ok(graphs
            .get(&key.graph_id)
            .map(|state| state.adjacent(&state.outgoing, key.graph_id, key.vertex_id))
            .unwrap_or_default())
    }

    fn neighbors_as_dst(&self, key: VertexKey) -> Result<HashMap<VertexId, f64>, StorageError> {
        let graphs = self.graphs.read().map_err(|_| lock_err("edge.neighbors_dst"))?;
        Ok(graphs
            .get(&key.graph_id)
            .map(|state| state.adjacent(&state.incoming, key.graph_id, key.vertex_id))
            .unwrap_or_default())
    }
}
