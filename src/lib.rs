//! # linkgraph - Linking-Graph Clustering for Entity Resolution
//!
//! linkgraph decides which records across entity sets describe the same
//! real-world thing. Candidate pairs inside a block are scored into a weighted
//! graph whose vertices are clusters of entities and whose edge weights are
//! distances. Draining the graph by repeatedly merging the lightest edge
//! yields the final clusters.
//!
//! ## Core Concepts
//!
//! - **Graph**: one linking graph per blocking key, identified by [`GraphId`]
//! - **Vertex**: a cluster of entity keys with the weight it was formed at
//! - **Edge**: canonical undirected distance between two live vertices
//! - **Threshold**: edges at or above it are never merged
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use linkgraph::{
//!     BlockContext, BlockingStage, ExactMatchFeatures, GraphId, InMemoryEntitySource,
//!     InMemoryGraphStore, LinkingConfig, LinkingRuntime,
//! };
//!
//! let config = LinkingConfig::load()?;
//! let store = Arc::new(InMemoryGraphStore::new());
//! let runtime = Arc::new(LinkingRuntime::from_config(
//!     store,
//!     Arc::new(InMemoryEntitySource::new()),
//!     Arc::new(ExactMatchFeatures),
//!     Arc::new(|features: &[Vec<f64>]| Ok(model.predict(features))),
//!     &config,
//! )?);
//!
//! let graph_id = GraphId::for_blocking_key("smith|1970");
//! let ticket = BlockingStage::new(runtime.clone()).run_block(graph_id, &block, context)?;
//! ticket.wait(&config.poll_config(), &linkgraph::progress::ThreadSleeper)?;
//! let report = runtime.cluster(graph_id)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod entity;
pub mod error;
pub mod graph;
pub mod ids;

// Storage and scoring seams
pub mod scoring;
pub mod storage;

// Pipeline stages
pub mod blocking;
pub mod clustering;
pub mod progress;
pub mod sweep;
pub mod weighting;

// Execution and configuration
pub mod config;
pub mod runtime;

// Re-export primary types at crate root for convenience
pub use blocking::{BlockContext, BlockTicket, BlockingStage, InlineDispatcher, PairDispatcher, PairProcessor, PairTask};
pub use clustering::{ClusteringEngine, ClusteringReport, DrainState, StopReason};
pub use config::{ConfigError, LinkingConfig};
pub use entity::{EntitySource, GraphEntityPair, InMemoryEntitySource, LinkingEntity, PropertyIndex};
pub use error::{LinkingError, LinkingResult, ValidationError};
pub use graph::{Cluster, Edge, Vertex, VertexKey, WeightedEdge};
pub use ids::{EntityKeyId, EntitySetId, GraphId, PropertyTypeId, SyncId, VertexId};
pub use progress::{CompletionCounter, PollConfig, StallError};
pub use runtime::{LinkingRuntime, RuntimeConfig};
pub use scoring::{ExactMatchFeatures, FeatureExtractor, ScoringError, ScoringOracle};
pub use storage::{GraphStore, InMemoryGraphStore, StorageError};
pub use sweep::{ConsistencySweep, SweepReport};
pub use weighting::{EdgeWeighter, PairOutcome};
