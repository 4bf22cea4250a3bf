//! Graph storage for linkgraph.
//!
//! [`GraphStore`] is the abstract contract; [`InMemoryGraphStore`] is the
//! embedded backend used by tests and single-process deployments.

mod memory;
mod traits;

pub use memory::InMemoryGraphStore;
pub use traits::{GraphStore, StorageError};
