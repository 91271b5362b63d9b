//! Entity state replication.
//!
//! The authoritative peer samples every live replicable entity on a fixed
//! interval and ships the whole set as one snapshot over the unreliable
//! lane. Snapshots are loss-tolerant: a missed one is superseded by the
//! next, never retried. Receivers reconcile their local entity set against
//! each snapshot by identity — create what is new, update what persists,
//! delete what disappeared — so after every snapshot the local live set
//! equals the snapshot's id set exactly.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{read_value, take, write_value, CodecError, Value};
use crate::registry::{EntityId, EntityStore, TypeId, TypeRegistry};
use crate::transport::{Lane, PeerId, PeerSender};

/// Replication failures.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("snapshot references unregistered type {0:?}")]
    UnknownType(TypeId),
    #[error("{id} carries {found} fields, schema {schema} declares {expected}")]
    SchemaMismatch {
        id: EntityId,
        schema: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("duplicate {0} in snapshot")]
    DuplicateId(EntityId),
    #[error("applying fields to {id} failed: {source}")]
    Apply {
        id: EntityId,
        #[source]
        source: anyhow::Error,
    },
}

/// One entity's sample within a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub id: EntityId,
    pub type_id: TypeId,
    pub owner: PeerId,
    pub fields: Vec<Value>,
}

/// A full replicated-state sample, built fresh each tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Samples every live entity, in id order.
    pub fn capture(
        store: &EntityStore,
        registry: &TypeRegistry,
    ) -> Result<Snapshot, ReplicationError> {
        let mut entries = Vec::with_capacity(store.len());
        for (id, entity) in store.iter() {
            let type_id = entity.type_id();
            let schema = registry
                .schema(type_id)
                .ok_or(ReplicationError::UnknownType(type_id))?;
            let fields = entity.replicated_fields();
            if fields.len() != schema.field_count() {
                return Err(ReplicationError::SchemaMismatch {
                    id,
                    schema: schema.name,
                    expected: schema.field_count(),
                    found: fields.len(),
                });
            }
            entries.push(SnapshotEntry {
                id,
                type_id,
                owner: entity.owner(),
                fields,
            });
        }
        Ok(Snapshot { entries })
    }

    /// Ids present in this snapshot.
    pub fn active_ids(&self) -> BTreeSet<EntityId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Wire form: count, then per entity id/type/owner and the field values
    /// in schema order. Field count is implicit in the schema, so both ends
    /// must hold identical registries.
    pub fn encode(&self, registry: &TypeRegistry) -> Result<Vec<u8>, ReplicationError> {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.entries.len() as i32);
        for entry in &self.entries {
            let schema = registry
                .schema(entry.type_id)
                .ok_or(ReplicationError::UnknownType(entry.type_id))?;
            buf.put_i32_le(entry.id.0);
            buf.put_i32_le(entry.type_id.0);
            buf.put_i32_le(entry.owner.0);
            if entry.fields.len() != schema.field_count() {
                return Err(ReplicationError::SchemaMismatch {
                    id: entry.id,
                    schema: schema.name,
                    expected: schema.field_count(),
                    found: entry.fields.len(),
                });
            }
            for (value, field) in entry.fields.iter().zip(&schema.fields) {
                write_value(&mut buf, value, &field.ty)?;
            }
        }
        Ok(buf.to_vec())
    }

    pub fn decode(bytes: &[u8], registry: &TypeRegistry) -> Result<Snapshot, ReplicationError> {
        let mut input = bytes;
        let count = take(&mut input, 4)?.get_i32_le();
        if count < 0 {
            return Err(CodecError::InvalidCount(count).into());
        }
        let mut entries = Vec::new();
        let mut seen = BTreeSet::new();
        for _ in 0..count {
            let mut head = take(&mut input, 12)?;
            let id = EntityId(head.get_i32_le());
            let type_id = TypeId(head.get_i32_le());
            let owner = PeerId(head.get_i32_le());
            if !seen.insert(id) {
                return Err(ReplicationError::DuplicateId(id));
            }
            let schema = registry
                .schema(type_id)
                .ok_or(ReplicationError::UnknownType(type_id))?;
            let mut fields = Vec::with_capacity(schema.field_count());
            for field in &schema.fields {
                fields.push(read_value(&mut input, &field.ty)?);
            }
            entries.push(SnapshotEntry {
                id,
                type_id,
                owner,
                fields,
            });
        }
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes {
                remaining: input.len(),
            }
            .into());
        }
        Ok(Snapshot { entries })
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyReport {
    pub created: Vec<EntityId>,
    pub updated: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
}

/// Fixed-interval snapshot scheduler for the authoritative peer.
pub struct ReplicationEngine {
    interval: Duration,
    accum: Duration,
}

impl ReplicationEngine {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            accum: Duration::ZERO,
        }
    }

    /// Advances the scheduler by `dt`. When the interval has elapsed and at
    /// least one peer is connected, captures and broadcasts a snapshot over
    /// the unreliable lane; with zero peers nothing is built or sent (time
    /// keeps accumulating, so a late joiner gets a snapshot promptly).
    ///
    /// Returns whether a snapshot went out. Per-peer delivery failures are
    /// logged and ignored — the next snapshot supersedes this one anyway.
    pub fn tick(
        &mut self,
        dt: Duration,
        store: &EntityStore,
        registry: &TypeRegistry,
        out: &mut dyn PeerSender,
    ) -> Result<bool, ReplicationError> {
        self.accum += dt;
        if self.accum < self.interval {
            return Ok(false);
        }
        let peers = out.peers();
        if peers.is_empty() {
            return Ok(false);
        }
        self.accum = Duration::ZERO;

        let snapshot = Snapshot::capture(store, registry)?;
        let bytes = snapshot.encode(registry)?;
        debug!(
            entities = snapshot.entries.len(),
            peers = peers.len(),
            "broadcasting snapshot"
        );
        for peer in peers {
            if let Err(err) = out.send(peer, Lane::Replication, &bytes) {
                warn!(%peer, error = %err, "snapshot delivery failed");
            }
        }
        Ok(true)
    }

    /// Reconciles the local entity set against a snapshot: create what is
    /// new, update what persists (owner included), delete what is gone —
    /// in that order, the whole snapshot before returning.
    ///
    /// The snapshot is validated in full (known types, schema-shaped field
    /// counts, unique ids) before the store is touched.
    pub fn apply(
        snapshot: &Snapshot,
        store: &mut EntityStore,
        registry: &TypeRegistry,
    ) -> Result<ApplyReport, ReplicationError> {
        let mut seen = BTreeSet::new();
        for entry in &snapshot.entries {
            if !seen.insert(entry.id) {
                return Err(ReplicationError::DuplicateId(entry.id));
            }
            let schema = registry
                .schema(entry.type_id)
                .ok_or(ReplicationError::UnknownType(entry.type_id))?;
            if entry.fields.len() != schema.field_count() {
                return Err(ReplicationError::SchemaMismatch {
                    id: entry.id,
                    schema: schema.name,
                    expected: schema.field_count(),
                    found: entry.fields.len(),
                });
            }
        }

        let active = snapshot.active_ids();
        let existing: BTreeSet<EntityId> = store.ids().into_iter().collect();
        let mut report = ApplyReport::default();

        for entry in &snapshot.entries {
            if existing.contains(&entry.id) {
                continue;
            }
            let mut entity = registry
                .instantiate(entry.type_id)
                .ok_or(ReplicationError::UnknownType(entry.type_id))?;
            entity.set_id(entry.id);
            entity.set_owner(entry.owner);
            entity
                .apply_replicated_fields(&entry.fields)
                .map_err(|source| ReplicationError::Apply {
                    id: entry.id,
                    source,
                })?;
            store.insert(entity);
            report.created.push(entry.id);
        }

        for entry in &snapshot.entries {
            if !existing.contains(&entry.id) {
                continue;
            }
            let entity = store
                .get_mut(entry.id)
                .expect("existing id disappeared mid-apply");
            entity.set_owner(entry.owner);
            entity
                .apply_replicated_fields(&entry.fields)
                .map_err(|source| ReplicationError::Apply {
                    id: entry.id,
                    source,
                })?;
            report.updated.push(entry.id);
        }

        for id in existing.difference(&active) {
            store.remove(*id);
            report.deleted.push(*id);
        }

        debug!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            "snapshot applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{registry_with_marker, Marker};
    use crate::transport::test_support::RecordingSender;

    fn marker(type_id: TypeId, hits: i32) -> Box<Marker> {
        Box::new(Marker {
            type_id,
            hits,
            ..Marker::default()
        })
    }

    fn snapshot_entry(id: i32, type_id: TypeId, owner: i32, hits: i32) -> SnapshotEntry {
        SnapshotEntry {
            id: EntityId(id),
            type_id,
            owner: PeerId(owner),
            fields: vec![Value::Str(None), Value::I32(hits)],
        }
    }

    #[test]
    fn capture_samples_in_id_order() {
        let (registry, type_id) = registry_with_marker();
        let mut store = EntityStore::new();
        store.spawn(marker(type_id, 10), PeerId(2));
        store.spawn(marker(type_id, 20), PeerId(3));

        let snapshot = Snapshot::capture(&store, &registry).unwrap();
        let ids: Vec<EntityId> = snapshot.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![EntityId(1), EntityId(2)]);
        assert_eq!(snapshot.entries[0].owner, PeerId(2));
        assert_eq!(snapshot.entries[1].fields[1], Value::I32(20));
    }

    #[test]
    fn snapshot_roundtrips_through_the_wire() {
        let (registry, type_id) = registry_with_marker();
        let snapshot = Snapshot {
            entries: vec![
                snapshot_entry(1, type_id, 2, 5),
                snapshot_entry(2, type_id, 1, -3),
            ],
        };
        let bytes = snapshot.encode(&registry).unwrap();
        assert_eq!(Snapshot::decode(&bytes, &registry).unwrap(), snapshot);
    }

    #[test]
    fn decode_rejects_unknown_types_and_duplicates() {
        let (registry, type_id) = registry_with_marker();

        let unknown = Snapshot {
            entries: vec![snapshot_entry(1, TypeId(9), 2, 0)],
        };
        assert!(unknown.encode(&registry).is_err());

        let dup = Snapshot {
            entries: vec![
                snapshot_entry(1, type_id, 2, 0),
                snapshot_entry(1, type_id, 2, 0),
            ],
        };
        let bytes = dup.encode(&registry).unwrap();
        assert!(matches!(
            Snapshot::decode(&bytes, &registry),
            Err(ReplicationError::DuplicateId(EntityId(1)))
        ));
    }

    #[test]
    fn reconciliation_creates_updates_and_deletes() {
        let (registry, type_id) = registry_with_marker();
        let mut store = EntityStore::new();
        for _ in 0..3 {
            store.spawn(marker(type_id, 0), PeerId(1));
        }
        assert_eq!(
            store.ids(),
            vec![EntityId(1), EntityId(2), EntityId(3)]
        );

        let snapshot = Snapshot {
            entries: vec![
                snapshot_entry(2, type_id, 1, 22),
                snapshot_entry(3, type_id, 1, 33),
                snapshot_entry(4, type_id, 5, 44),
            ],
        };
        let report = ReplicationEngine::apply(&snapshot, &mut store, &registry).unwrap();

        assert_eq!(report.created, vec![EntityId(4)]);
        assert_eq!(report.updated, vec![EntityId(2), EntityId(3)]);
        assert_eq!(report.deleted, vec![EntityId(1)]);
        assert_eq!(store.ids(), vec![EntityId(2), EntityId(3), EntityId(4)]);

        let created = store.get(EntityId(4)).unwrap();
        assert_eq!(created.owner(), PeerId(5));
        assert_eq!(created.replicated_fields()[1], Value::I32(44));
    }

    #[test]
    fn applying_the_same_snapshot_twice_is_idempotent() {
        let (registry, type_id) = registry_with_marker();
        let mut store = EntityStore::new();
        store.spawn(marker(type_id, 0), PeerId(1));

        let snapshot = Snapshot {
            entries: vec![
                snapshot_entry(1, type_id, 1, 7),
                snapshot_entry(8, type_id, 2, 8),
            ],
        };

        let first = ReplicationEngine::apply(&snapshot, &mut store, &registry).unwrap();
        assert_eq!(first.created, vec![EntityId(8)]);

        let second = ReplicationEngine::apply(&snapshot, &mut store, &registry).unwrap();
        assert!(second.created.is_empty(), "no duplicate creates");
        assert!(second.deleted.is_empty());
        assert_eq!(second.updated, vec![EntityId(1), EntityId(8)]);
        assert_eq!(store.ids(), vec![EntityId(1), EntityId(8)]);
    }

    #[test]
    fn update_moves_ownership_in_place() {
        let (registry, type_id) = registry_with_marker();
        let mut store = EntityStore::new();
        let id = store.spawn(marker(type_id, 0), PeerId(2));

        let snapshot = Snapshot {
            entries: vec![snapshot_entry(id.0, type_id, 6, 1)],
        };
        ReplicationEngine::apply(&snapshot, &mut store, &registry).unwrap();
        assert_eq!(store.get(id).unwrap().owner(), PeerId(6));
    }

    #[test]
    fn invalid_snapshot_leaves_the_store_untouched() {
        let (registry, type_id) = registry_with_marker();
        let mut store = EntityStore::new();
        store.spawn(marker(type_id, 9), PeerId(1));

        let snapshot = Snapshot {
            entries: vec![
                snapshot_entry(7, type_id, 1, 0),
                snapshot_entry(8, TypeId(5), 1, 0),
            ],
        };
        assert!(ReplicationEngine::apply(&snapshot, &mut store, &registry).is_err());
        assert_eq!(store.ids(), vec![EntityId(1)]);
        assert_eq!(
            store.get(EntityId(1)).unwrap().replicated_fields()[1],
            Value::I32(9)
        );
    }

    #[test]
    fn engine_sends_on_interval_to_every_peer() {
        let (registry, type_id) = registry_with_marker();
        let mut store = EntityStore::new();
        store.spawn(marker(type_id, 1), PeerId(2));
        let mut engine = ReplicationEngine::new(Duration::from_millis(100));
        let mut out = RecordingSender::new(vec![PeerId(2), PeerId(3)]);

        let sent = engine
            .tick(Duration::from_millis(40), &store, &registry, &mut out)
            .unwrap();
        assert!(!sent, "interval not yet elapsed");

        let sent = engine
            .tick(Duration::from_millis(60), &store, &registry, &mut out)
            .unwrap();
        assert!(sent);
        assert_eq!(out.sent.len(), 2);
        for (_, lane, payload) in &out.sent {
            assert_eq!(*lane, Lane::Replication);
            let snapshot = Snapshot::decode(payload, &registry).unwrap();
            assert_eq!(snapshot.entries.len(), 1);
        }
    }

    #[test]
    fn engine_skips_ticks_with_no_peers() {
        let (registry, _type_id) = registry_with_marker();
        let store = EntityStore::new();
        let mut engine = ReplicationEngine::new(Duration::from_millis(100));
        let mut out = RecordingSender::new(vec![]);

        for _ in 0..5 {
            let sent = engine
                .tick(Duration::from_millis(100), &store, &registry, &mut out)
                .unwrap();
            assert!(!sent);
        }
        assert!(out.sent.is_empty());

        // A peer joining gets the overdue snapshot on the next tick.
        out.connected.push(PeerId(2));
        let sent = engine
            .tick(Duration::from_millis(1), &store, &registry, &mut out)
            .unwrap();
        assert!(sent);
    }
}
