//! Identifier newtypes.
//!
//! Every identifier in the linking graph is a UUID wrapped in its own type so
//! that graph ids, vertex ids and entity ids can never be swapped by accident.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used to derive graph ids from blocking keys.
const BLOCKING_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6c69_6e6b_6772_6170_6862_6c6f_636b_0001);

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id! {
    /// Scope of one independent linking problem.
    ///
    /// Vertices and edges from different graphs never interact.
    GraphId
}

uuid_id! {
    /// Vertex identifier, unique within its [`GraphId`].
    VertexId
}

uuid_id! {
    /// Entity set (collection) identifier.
    EntitySetId
}

uuid_id! {
    /// Version marker of an entity set, used when reading entities from the entity store.
    SyncId
}

uuid_id! {
    /// Property type identifier.
    PropertyTypeId
}

impl GraphId {
    /// Derives a stable graph id from a blocking key.
    ///
    /// Workers that see the same blocking key agree on the graph id without
    /// coordinating.
    ///
    /// ```
    /// use linkgraph::GraphId;
    ///
    /// assert_eq!(GraphId::for_blocking_key("smith|1970"), GraphId::for_blocking_key("smith|1970"));
    /// assert_ne!(GraphId::for_blocking_key("smith|1970"), GraphId::for_blocking_key("smyth|1970"));
    /// ```
    #[must_use]
    pub fn for_blocking_key(key: &str) -> Self {
        Self(Uuid::new_v5(&BLOCKING_KEY_NAMESPACE, key.as_bytes()))
    }
}

/// Identity of one underlying entity: the entity set it lives in plus its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKeyId {
    /// Owning entity set.
    pub entity_set_id: EntitySetId,
    /// Entity id within the set.
    pub entity_id: Uuid,
}

impl EntityKeyId {
    /// Creates an entity key.
    #[must_use]
    pub const fn new(entity_set_id: EntitySetId, entity_id: Uuid) -> Self {
        Self {
            entity_set_id,
            entity_id,
        }
    }

    /// Creates a random entity key in the given set.
    #[must_use]
    pub fn random_in(entity_set_id: EntitySetId) -> Self {
        Self::new(entity_set_id, Uuid::new_v4())
    }

    /// 32-byte representation used for deterministic id derivation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(self.entity_set_id.as_uuid().as_bytes());
        out[16..].copy_from_slice(self.entity_id.as_bytes());
        out
    }
}

impl fmt::Display for EntityKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_set_id, self.entity_id)
    }
}
