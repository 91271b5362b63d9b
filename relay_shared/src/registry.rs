//! Type registry and entity store.
//!
//! The replication and RPC layers never inspect concrete entity types.
//! They see three explicit, constructed objects owned by the peer:
//!
//! - [`TypeRegistry`]: maps a small integer type tag to a field schema and a
//!   factory. Registration order defines the tags, so every peer must
//!   register the same types in the same order before any snapshot flows.
//! - [`Replicable`]: the capability an entity exposes — a stable id, an
//!   owner peer, a type tag, and schema-ordered field access.
//! - [`EntityStore`]: the live entity set, iterated in id order so snapshot
//!   contents are deterministic.

use std::any::Any;
use std::collections::BTreeMap;

use crate::codec::{Schema, Value};
use crate::transport::PeerId;

/// Stable entity identity, assigned by the authoritative peer at creation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct EntityId(pub i32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Index into the shared type registry; identical on every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub i32);

/// The replicable capability.
///
/// Field access is schema-ordered: `replicated_fields` must yield values in
/// the exact order the type's [`Schema`] declares, and
/// `apply_replicated_fields` receives them back in that order.
pub trait Replicable: Send {
    fn id(&self) -> EntityId;
    fn set_id(&mut self, id: EntityId);

    fn owner(&self) -> PeerId;
    fn set_owner(&mut self, owner: PeerId);

    fn type_id(&self) -> TypeId;

    fn replicated_fields(&self) -> Vec<Value>;
    fn apply_replicated_fields(&mut self, fields: &[Value]) -> anyhow::Result<()>;

    /// Concrete-type access for method handlers.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Produces a blank entity of a registered type.
pub type EntityFactory = Box<dyn Fn() -> Box<dyn Replicable> + Send + Sync>;

/// One registered replicable type.
pub struct RegisteredType {
    pub name: &'static str,
    pub schema: Schema,
    factory: EntityFactory,
}

/// Tag -> (schema, factory) mapping, registered identically on all peers.
#[derive(Default)]
pub struct TypeRegistry {
    types: Vec<RegisteredType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type; the returned tag is its registration index.
    pub fn register(
        &mut self,
        name: &'static str,
        schema: Schema,
        factory: EntityFactory,
    ) -> TypeId {
        let id = TypeId(self.types.len() as i32);
        tracing::debug!(name, type_id = id.0, "registered replicable type");
        self.types.push(RegisteredType {
            name,
            schema,
            factory,
        });
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&RegisteredType> {
        usize::try_from(id.0).ok().and_then(|i| self.types.get(i))
    }

    pub fn schema(&self, id: TypeId) -> Option<&Schema> {
        self.get(id).map(|t| &t.schema)
    }

    /// Builds a blank entity of the given type; id and owner are applied by
    /// the caller.
    pub fn instantiate(&self, id: TypeId) -> Option<Box<dyn Replicable>> {
        self.get(id).map(|t| (t.factory)())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Live entity set, keyed and iterated by id.
#[derive(Default)]
pub struct EntityStore {
    entities: BTreeMap<EntityId, Box<dyn Replicable>>,
    next_id: i32,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Server side: assigns the next free id, stamps the entity with it and
    /// its owner, and inserts it.
    pub fn spawn(&mut self, mut entity: Box<dyn Replicable>, owner: PeerId) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        entity.set_id(id);
        entity.set_owner(owner);
        self.entities.insert(id, entity);
        id
    }

    /// Inserts an entity under the id it already carries (client side, where
    /// ids arrive from snapshots).
    pub fn insert(&mut self, entity: Box<dyn Replicable>) -> EntityId {
        let id = entity.id();
        self.entities.insert(id, entity);
        id
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Box<dyn Replicable>> {
        self.entities.remove(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&dyn Replicable> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut (dyn Replicable + 'static)> {
        self.entities.get_mut(&id).map(|e| e.as_mut())
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &dyn Replicable)> {
        self.entities.iter().map(|(id, e)| (*id, e.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Removes every entity owned by `peer`, returning the removed ids.
    /// Used when a peer disconnects and its entities leave the world.
    pub fn remove_owned_by(&mut self, peer: PeerId) -> Vec<EntityId> {
        let doomed: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, e)| e.owner() == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.entities.remove(id);
        }
        doomed
    }
}
