//! Consistency sweep.
//!
//! Merges never delete edges of the vertices they retire, so a drained or
//! interrupted graph can hold edges whose endpoints are gone. The sweep
//! removes those and reports vertices left with no edges at all.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LinkingResult;
use crate::graph::VertexKey;
use crate::ids::{GraphId, VertexId};
use crate::storage::GraphStore;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Edges removed because an endpoint no longer exists.
    pub dangling_edges_removed: usize,
    /// Live vertices with no remaining edges. Reported, not removed.
    pub isolated_vertices: Vec<VertexKey>,
}

/// Removes dangling edges from a graph.
pub struct ConsistencySweep {
    store: Arc<dyn GraphStore>,
}

impl ConsistencySweep {
    /// Creates a sweep over `store`.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Sweeps one graph.
    ///
    /// # Errors
    /// `Storage` if the store fails.
    pub fn sweep(&self, graph_id: GraphId) -> LinkingResult<SweepReport> {
        let live: HashSet<VertexId> = self
            .store
            .vertices(graph_id)?
            .into_iter()
            .map(|(key, _)| key.vertex_id)
            .collect();

        let mut report = SweepReport::default();
        let mut connected = HashSet::new();
        for weighted in self.store.edges(graph_id)? {
            let edge = weighted.edge;
            let (src, dst) = (edge.src().vertex_id, edge.dst().vertex_id);
            if live.contains(&src) && live.contains(&dst) {
                connected.insert(src);
                connected.insert(dst);
                continue;
            }
            if self.store.remove_edge(edge)? {
                debug!(%graph_id, %edge, "removed dangling edge");
                report.dangling_edges_removed += 1;
            }
        }

        let mut isolated: Vec<VertexKey> = live
            .difference(&connected)
            .map(|&vertex_id| VertexKey::new(graph_id, vertex_id))
            .collect();
        isolated.sort_unstable();
        report.isolated_vertices = isolated;

        info!(
            %graph_id,
            dangling = report.dangling_edges_removed,
            isolated = report.isolated_vertices.len(),
            "consistency sweep finished"
        );
        Ok(report)
    }
}
