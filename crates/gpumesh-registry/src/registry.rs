//! RoomRegistry: replicated room membership backed by a yrs document.
//!
//! # Document layout
//!
//! ```text
//! Doc
//!   ├── "room"        Map: room_id, admin_peer_id
//!   ├── "members"     Map: peer_id → true
//!   ├── "versions"    Map: client_id → highest version this replica wrote
//!   └── "worker:<id>" Map: one root map per worker, one key per field
//! ```
//!
//! Each worker field is its own map entry, so concurrent writes to
//! different fields of the same record both survive a merge and writes to
//! the same field resolve through yrs' own conflict rule. Root maps are
//! addressed by name, so two replicas that independently create the same
//! worker end up sharing one record rather than shadowing each other.
//!
//! The room version is the maximum over the `versions` map. Every replica
//! only ever writes its own key, which makes the version a grow-only max
//! register: merges can never lower it and delivery order cannot change it.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update, WriteTxn,
};

use gpumesh_core::{epoch_millis, JobType, WorkerMetadata, WorkerRecord, WorkerStatus};

use crate::error::{RegistryError, RegistryResult};
use crate::types::RoomSnapshot;

const ROOM: &str = "room";
const MEMBERS: &str = "members";
const VERSIONS: &str = "versions";
const WORKER_PREFIX: &str = "worker:";

const ROOM_ID: &str = "room_id";
const ADMIN_PEER_ID: &str = "admin_peer_id";

// Worker record fields.
const ROLE: &str = "role";
const TAGS: &str = "tags";
const GPU_MEMORY_MB: &str = "gpu_memory_mb";
const GPU_NAME: &str = "gpu_name";
const SUPPORTED_MODELS: &str = "supported_models";
const SUPPORTED_JOB_TYPES: &str = "supported_job_types";
const STATUS: &str = "status";
const CURRENT_JOB_ID: &str = "current_job_id";
const LAST_HEARTBEAT_MS: &str = "last_heartbeat_ms";
const IS_ADMIN: &str = "is_admin";

struct Inner {
    doc: Doc,
    room: MapRef,
    members: MapRef,
    versions: MapRef,
}

/// One replica of a room's membership.
///
/// Every operation is a short synchronous critical section; nothing here
/// awaits, so the registry can be shared freely across tasks behind an
/// `Arc`.
pub struct RoomRegistry {
    room_id: String,
    inner: Mutex<Inner>,
}

impl RoomRegistry {
    /// Create a replica. With a `creator`, seed it as sole member and admin.
    pub fn create(room_id: &str, creator: Option<(&str, &WorkerMetadata)>) -> Self {
        let doc = Doc::new();
        let room = doc.get_or_insert_map(ROOM);
        let members = doc.get_or_insert_map(MEMBERS);
        let versions = doc.get_or_insert_map(VERSIONS);

        let registry = Self {
            room_id: room_id.to_string(),
            inner: Mutex::new(Inner {
                doc,
                room,
                members,
                versions,
            }),
        };

        {
            let inner = registry.inner.lock();
            let mut txn = inner.doc.transact_mut();
            inner.room.insert(&mut txn, ROOM_ID, room_id);
        }

        if let Some((peer_id, metadata)) = creator {
            registry.add_worker(peer_id, metadata, true);
        }

        debug!(%room_id, "room registry created");
        registry
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Insert or refresh a worker record.
    ///
    /// A worker that is already a member keeps its status and current job;
    /// only the advertised metadata is rewritten.
    pub fn add_worker(&self, peer_id: &str, metadata: &WorkerMetadata, is_admin: bool) {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();

        let existing = if is_member(&inner, &txn, peer_id) {
            read_record(&mut txn, peer_id)
        } else {
            None
        };

        let mut record = WorkerRecord::from_metadata(peer_id, metadata, is_admin);
        if let Some(prev) = existing {
            record.status = prev.status;
            record.current_job_id = prev.current_job_id;
            record.is_admin = prev.is_admin || is_admin;
        }

        inner.members.insert(&mut txn, peer_id, true);
        write_record(&mut txn, &record);
        if is_admin {
            write_admin(&inner, &mut txn, Some(peer_id));
        }
        let version = bump_version(&inner, &mut txn);
        debug!(%peer_id, is_admin, version, "worker added");
    }

    /// Set a worker's status and current job. Returns false for unknown workers.
    pub fn update_status(&self, peer_id: &str, status: WorkerStatus, job_id: Option<&str>) -> bool {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();
        if !is_member(&inner, &txn, peer_id) {
            return false;
        }

        let map = worker_map(&mut txn, peer_id);
        map.insert(&mut txn, STATUS, status.as_str());
        map.insert(&mut txn, CURRENT_JOB_ID, opt_string(job_id));
        let version = bump_version(&inner, &mut txn);
        debug!(%peer_id, %status, ?job_id, version, "worker status updated");
        true
    }

    /// Stamp the worker's last-heartbeat time. Returns false for unknown workers.
    pub fn update_heartbeat(&self, peer_id: &str) -> bool {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();
        if !is_member(&inner, &txn, peer_id) {
            return false;
        }
        let map = worker_map(&mut txn, peer_id);
        map.insert(&mut txn, LAST_HEARTBEAT_MS, Any::Number(epoch_millis() as f64));
        true
    }

    /// Remove a worker. Clears the admin pointer if it named this worker.
    pub fn remove_worker(&self, peer_id: &str) -> bool {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();
        if !is_member(&inner, &txn, peer_id) {
            return false;
        }

        inner.members.remove(&mut txn, peer_id);
        let map = worker_map(&mut txn, peer_id);
        map.clear(&mut txn);

        let was_admin = read_admin(&inner, &txn).as_deref() == Some(peer_id);
        if was_admin {
            inner.room.insert(&mut txn, ADMIN_PEER_ID, Any::Null);
        }
        let version = bump_version(&inner, &mut txn);
        debug!(%peer_id, was_admin, version, "worker removed");
        true
    }

    /// Point the room at a new admin and flip every record's flag to match.
    pub fn set_admin(&self, peer_id: &str) {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();
        write_admin(&inner, &mut txn, Some(peer_id));
        let version = bump_version(&inner, &mut txn);
        debug!(%peer_id, version, "admin set");
    }

    /// Drop the admin pointer and clear every record's flag.
    pub fn clear_admin(&self) {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();
        write_admin(&inner, &mut txn, None);
        let version = bump_version(&inner, &mut txn);
        debug!(version, "admin cleared");
    }

    // ── Replication ───────────────────────────────────────────────

    /// Encode the full document as one update.
    pub fn serialize(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode this replica's state vector, for delta requests.
    pub fn state_vector(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode only what a replica with `remote_state_vector` is missing.
    pub fn serialize_since(&self, remote_state_vector: &[u8]) -> RegistryResult<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge an update produced by any replica of this room.
    ///
    /// Commutative, associative, and idempotent. A malformed update is
    /// rejected before it touches the document.
    pub fn apply_update(&self, update: &[u8]) -> RegistryResult<()> {
        let update =
            Update::decode_v1(update).map_err(|e| RegistryError::Decode(e.to_string()))?;
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| RegistryError::Apply(e.to_string()))?;
        debug!(room_id = %self.room_id, "update merged");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Flattened view of the whole room.
    pub fn get_state(&self) -> RoomSnapshot {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();

        let mut workers = BTreeMap::new();
        for peer_id in member_ids(&inner, &txn) {
            if let Some(record) = read_record(&mut txn, &peer_id) {
                workers.insert(peer_id, record);
            }
        }

        let admin_peer_id = read_admin(&inner, &txn).filter(|id| workers.contains_key(id));
        let room_id = read_string(&inner.room, &txn, ROOM_ID).unwrap_or_else(|| self.room_id.clone());

        RoomSnapshot {
            room_id,
            workers,
            admin_peer_id,
            version: read_version(&inner, &txn),
        }
    }

    /// Current admin, if it names a present member.
    pub fn admin_peer_id(&self) -> Option<String> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        read_admin(&inner, &txn).filter(|id| is_member(&inner, &txn, id))
    }

    /// Raw admin pointer. Unlike [`Self::admin_peer_id`] this may name a
    /// worker whose record has not been merged into this replica yet.
    pub fn admin_pointer(&self) -> Option<String> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        read_admin(&inner, &txn)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        is_member(&inner, &txn, peer_id)
    }

    pub fn worker(&self, peer_id: &str) -> Option<WorkerRecord> {
        let inner = self.inner.lock();
        let mut txn = inner.doc.transact_mut();
        if !is_member(&inner, &txn, peer_id) {
            return None;
        }
        read_record(&mut txn, peer_id)
    }

    pub fn member_ids(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        member_ids(&inner, &txn)
    }

    pub fn len(&self) -> usize {
        self.member_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        read_version(&inner, &txn)
    }
}

// ── Document helpers ────────────────────────────────────────────────

fn worker_key(peer_id: &str) -> String {
    format!("{WORKER_PREFIX}{peer_id}")
}

fn worker_map(txn: &mut TransactionMut<'_>, peer_id: &str) -> MapRef {
    txn.get_or_insert_map(worker_key(peer_id))
}

fn is_member<T: ReadTxn>(inner: &Inner, txn: &T, peer_id: &str) -> bool {
    inner.members.contains_key(txn, peer_id)
}

fn member_ids<T: ReadTxn>(inner: &Inner, txn: &T) -> Vec<String> {
    let mut ids: Vec<String> = inner.members.keys(txn).map(str::to_string).collect();
    ids.sort();
    ids
}

fn read_admin<T: ReadTxn>(inner: &Inner, txn: &T) -> Option<String> {
    read_string(&inner.room, txn, ADMIN_PEER_ID).filter(|id| !id.is_empty())
}

fn write_admin(inner: &Inner, txn: &mut TransactionMut<'_>, admin: Option<&str>) {
    inner.room.insert(txn, ADMIN_PEER_ID, opt_string(admin));
    for peer_id in member_ids(inner, &*txn) {
        let map = worker_map(txn, &peer_id);
        map.insert(txn, IS_ADMIN, Some(peer_id.as_str()) == admin);
    }
}

fn read_version<T: ReadTxn>(inner: &Inner, txn: &T) -> u64 {
    inner
        .versions
        .iter(txn)
        .filter_map(|(_, value)| out_u64(value))
        .max()
        .unwrap_or(0)
}

/// Raise the room version by one, recording it under this replica's key.
fn bump_version(inner: &Inner, txn: &mut TransactionMut<'_>) -> u64 {
    let next = read_version(inner, &*txn) + 1;
    let key = inner.doc.client_id().to_string();
    inner.versions.insert(txn, key, Any::Number(next as f64));
    next
}

fn write_record(txn: &mut TransactionMut<'_>, record: &WorkerRecord) {
    let map = worker_map(txn, &record.peer_id);
    map.insert(txn, ROLE, record.role.as_str());
    map.insert(txn, TAGS, encode_list(&record.tags));
    map.insert(txn, GPU_MEMORY_MB, Any::Number(record.gpu_memory_mb as f64));
    map.insert(txn, GPU_NAME, opt_string(record.gpu_name.as_deref()));
    map.insert(txn, SUPPORTED_MODELS, encode_list(&record.supported_models));
    map.insert(txn, SUPPORTED_JOB_TYPES, encode_list(&record.supported_job_types));
    map.insert(txn, STATUS, record.status.as_str());
    map.insert(txn, CURRENT_JOB_ID, opt_string(record.current_job_id.as_deref()));
    map.insert(txn, LAST_HEARTBEAT_MS, Any::Number(record.last_heartbeat_ms as f64));
    map.insert(txn, IS_ADMIN, record.is_admin);
}

/// Rebuild a record from its field map. Records missing their GPU figure
/// are half-written (e.g. a field update raced a removal) and are skipped.
fn read_record(txn: &mut TransactionMut<'_>, peer_id: &str) -> Option<WorkerRecord> {
    let map = worker_map(txn, peer_id);
    let txn = &*txn;

    let gpu_memory_mb = out_u64(map.get(txn, GPU_MEMORY_MB)?)?;
    let status = read_string(&map, txn, STATUS)
        .and_then(|s| s.parse::<WorkerStatus>().ok())
        .unwrap_or_default();

    Some(WorkerRecord {
        peer_id: peer_id.to_string(),
        role: read_string(&map, txn, ROLE).unwrap_or_else(|| "worker".to_string()),
        tags: decode_list(read_string(&map, txn, TAGS)),
        gpu_memory_mb,
        gpu_name: read_string(&map, txn, GPU_NAME),
        supported_models: decode_list(read_string(&map, txn, SUPPORTED_MODELS)),
        supported_job_types: decode_list::<Vec<JobType>>(read_string(
            &map,
            txn,
            SUPPORTED_JOB_TYPES,
        )),
        status,
        current_job_id: read_string(&map, txn, CURRENT_JOB_ID),
        last_heartbeat_ms: map.get(txn, LAST_HEARTBEAT_MS).and_then(out_u64).unwrap_or(0),
        is_admin: matches!(map.get(txn, IS_ADMIN), Some(Out::Any(Any::Bool(true)))),
    })
}

fn read_string<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn out_u64(value: Out) -> Option<u64> {
    match value {
        Out::Any(Any::Number(n)) if n >= 0.0 => Some(n as u64),
        Out::Any(Any::BigInt(n)) if n >= 0 => Some(n as u64),
        _ => None,
    }
}

fn opt_string(value: Option<&str>) -> Any {
    match value {
        Some(s) => Any::String(s.into()),
        None => Any::Null,
    }
}

/// Lists are stored as JSON text so that a record field stays one register.
fn encode_list<T: serde::Serialize>(items: &T) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn decode_list<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}
