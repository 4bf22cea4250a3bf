//! Linking entities and the entity-store boundary.
//!
//! The entity store itself (type model, storage, versioning) lives outside this
//! crate. The engine only needs read access to the normalized property values
//! of an entity at a given sync id, which is what [`EntitySource`] provides.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{LinkingError, LinkingResult};
use crate::ids::{EntityKeyId, EntitySetId, GraphId, PropertyTypeId, SyncId};

/// Normalized property values of one entity, keyed by property type.
///
/// Values are already string-normalized; this crate never interprets them
/// beyond equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkingEntity {
    properties: BTreeMap<PropertyTypeId, BTreeSet<String>>,
}

impl LinkingEntity {
    /// Creates an entity with no properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value for a property type.
    #[must_use]
    pub fn with_value(mut self, property: PropertyTypeId, value: impl Into<String>) -> Self {
        self.insert(property, value);
        self
    }

    /// Adds a value for a property type.
    pub fn insert(&mut self, property: PropertyTypeId, value: impl Into<String>) {
        self.properties.entry(property).or_default().insert(value.into());
    }

    /// Returns the values for a property type, if any.
    #[must_use]
    pub fn values(&self, property: PropertyTypeId) -> Option<&BTreeSet<String>> {
        self.properties.get(&property)
    }

    /// Returns true if the entity has no property values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Ordered selection of property types that feed the feature vector.
///
/// The order is significant: feature rows are emitted in index order, so the
/// scoring model sees the same column layout for every pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyIndex {
    properties: Vec<PropertyTypeId>,
}

impl PropertyIndex {
    /// Creates an index from property types, dropping duplicates but keeping first-seen order.
    #[must_use]
    pub fn new(properties: impl IntoIterator<Item = PropertyTypeId>) -> Self {
        let mut seen = BTreeSet::new();
        let properties = properties
            .into_iter()
            .filter(|p| seen.insert(*p))
            .collect();
        Self { properties }
    }

    /// Property types in feature order.
    #[must_use]
    pub fn properties(&self) -> &[PropertyTypeId] {
        &self.properties
    }

    /// Number of selected property types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Returns true if no property type is selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// An entity identified inside a linking graph, before any vertex exists for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GraphEntityPair {
    /// Graph the entity was blocked into.
    pub graph_id: GraphId,
    /// The entity.
    pub entity_key: EntityKeyId,
}

impl GraphEntityPair {
    /// Creates a pair.
    #[must_use]
    pub const fn new(graph_id: GraphId, entity_key: EntityKeyId) -> Self {
        Self {
            graph_id,
            entity_key,
        }
    }
}

/// Read-only access to linking entities.
///
/// Implementations must be callable concurrently from many workers.
pub trait EntitySource: Send + Sync {
    /// Loads the linking view of an entity as of `sync_id`.
    ///
    /// Returns `Ok(None)` when the entity does not exist at that version.
    fn linking_entity(
        &self,
        key: &EntityKeyId,
        sync_id: SyncId,
    ) -> LinkingResult<Option<LinkingEntity>>;

    /// Loads an entity, resolving its sync id from `sync_ids`.
    ///
    /// # Errors
    /// - `MissingSyncId` if the entity set has no registered sync id
    /// - `EntityNotFound` if the entity does not exist at that version
    fn require(
        &self,
        key: &EntityKeyId,
        sync_ids: &HashMap<EntitySetId, SyncId>,
    ) -> LinkingResult<LinkingEntity> {
        let sync_id = sync_ids
            .get(&key.entity_set_id)
            .copied()
            .ok_or(LinkingError::MissingSyncId(key.entity_set_id))?;
        self.linking_entity(key, sync_id)?
            .ok_or(LinkingError::EntityNotFound(*key))
    }
}

/// Thread-safe in-memory entity source.
///
/// Keeps one snapshot per `(entity, sync id)`; intended for embedded use and tests.
#[derive(Debug, Default)]
pub struct InMemoryEntitySource {
    entities: RwLock<HashMap<(EntityKeyId, SyncId), LinkingEntity>>,
}

impl InMemoryEntitySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entity snapshot.
    pub fn insert(&self, key: EntityKeyId, sync_id: SyncId, entity: LinkingEntity) -> LinkingResult<()> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| LinkingError::internal("poisoned lock: entity_source.insert"))?;
        entities.insert((key, sync_id), entity);
        Ok(())
    }
}

impl EntitySource for InMemoryEntitySource {
    fn linking_entity(
        &self,
        key: &EntityKeyId,
        sync_id: SyncId,
    ) -> LinkingResult<Option<LinkingEntity>> {
        let entities = self
            .entities
            .read()
            .map_err(|_| LinkingError::internal("poisoned lock: entity_source.get"))?;
        Ok(entities.get(&(*key, sync_id)).cloned())
    }
}
