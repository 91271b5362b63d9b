//! Pawn: the built-in replicable actor.
//!
//! A pawn is the entity the server spawns for each connecting peer — a
//! named, positioned actor the owner steers through authenticated calls.
//! It doubles as the reference implementation of the [`Replicable`]
//! contract and of method registration, and is what the demo binaries and
//! integration tests drive.

use anyhow::Context;

use crate::codec::{Schema, Value, WireType};
use crate::registry::{EntityId, EntityStore, Replicable, TypeId, TypeRegistry};
use crate::rpc::{AllowRemote, MethodTable, RunOn};
use crate::transport::PeerId;

/// A controllable actor with replicated name, position, and cheer count.
#[derive(Debug, Clone, PartialEq)]
pub struct Pawn {
    id: EntityId,
    owner: PeerId,
    type_id: TypeId,
    pub name: Option<String>,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub cheers: i32,
}

impl Pawn {
    pub fn new(type_id: TypeId) -> Self {
        Pawn {
            id: EntityId(0),
            owner: PeerId(0),
            type_id,
            name: None,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            cheers: 0,
        }
    }

    /// Field schema, in replication order.
    pub fn schema() -> Schema {
        Schema::new(
            "pawn",
            vec![
                ("name", WireType::Str),
                ("x", WireType::F32),
                ("y", WireType::F32),
                ("z", WireType::F32),
                ("cheers", WireType::I32),
            ],
        )
    }

    /// Registers the pawn type; must run in the same order on every peer.
    pub fn register_type(registry: &mut TypeRegistry) -> TypeId {
        // The factory needs the tag the registry is about to assign, which
        // is its current length by construction.
        let type_id = TypeId(registry.len() as i32);
        registry.register(
            "pawn",
            Pawn::schema(),
            Box::new(move || Box::new(Pawn::new(type_id))),
        )
    }

    /// Registers the pawn's callable methods.
    ///
    /// - `rename`: the owner asks the authoritative peer to set the name.
    /// - `move_to`: the owner steers its pawn; runs on the server, which
    ///   replicates the result back through snapshots.
    /// - `cheer`: anyone may call; runs everywhere for immediate feedback.
    pub fn register_methods(methods: &mut MethodTable) {
        methods.register(
            "rename",
            vec![WireType::Str],
            AllowRemote::Master,
            RunOn::Server,
            Box::new(|store, target, args| {
                let pawn = pawn_mut(store, target)?;
                pawn.name = match &args[0] {
                    Value::Str(name) => name.clone(),
                    other => anyhow::bail!("rename expects a string, got {}", other.type_name()),
                };
                Ok(())
            }),
        );
        methods.register(
            "move_to",
            vec![WireType::F32, WireType::F32, WireType::F32],
            AllowRemote::Master,
            RunOn::Server,
            Box::new(|store, target, args| {
                let pawn = pawn_mut(store, target)?;
                pawn.x = args[0].as_f32().context("move_to x")?;
                pawn.y = args[1].as_f32().context("move_to y")?;
                pawn.z = args[2].as_f32().context("move_to z")?;
                Ok(())
            }),
        );
        methods.register(
            "cheer",
            vec![],
            AllowRemote::Any,
            RunOn::All,
            Box::new(|store, target, _args| {
                let pawn = pawn_mut(store, target)?;
                pawn.cheers += 1;
                Ok(())
            }),
        );
    }
}

fn pawn_mut(store: &mut EntityStore, id: EntityId) -> anyhow::Result<&mut Pawn> {
    store
        .get_mut(id)
        .and_then(|e| e.as_any_mut().downcast_mut::<Pawn>())
        .context("target entity is not a pawn")
}

impl Replicable for Pawn {
    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn owner(&self) -> PeerId {
        self.owner
    }

    fn set_owner(&mut self, owner: PeerId) {
        self.owner = owner;
    }

    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn replicated_fields(&self) -> Vec<Value> {
        vec![
            Value::Str(self.name.clone()),
            Value::F32(self.x),
            Value::F32(self.y),
            Value::F32(self.z),
            Value::I32(self.cheers),
        ]
    }

    fn apply_replicated_fields(&mut self, fields: &[Value]) -> anyhow::Result<()> {
        match fields {
            [Value::Str(name), Value::F32(x), Value::F32(y), Value::F32(z), Value::I32(cheers)] =>
            {
                self.name = name.clone();
                self.x = *x;
                self.y = *y;
                self.z = *z;
                self.cheers = *cheers;
                Ok(())
            }
            _ => anyhow::bail!("pawn fields out of shape"),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
