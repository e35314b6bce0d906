//! In-memory store with optional file durability

use async_trait::async_trait;
use gpupool_core::{
    Cluster, ClusterId, Device, DeviceId, Node, NodeId, RecordQuery, RelationCursor,
    RelationQuery, UsageRecord, UsageRelation,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::{EntityWrite, RelationWrite, Store, Versioned, WriteBatch};

/// Entity with a primary key
trait Keyed {
    type Key: Ord + Clone + std::fmt::Display;
    const KIND: &'static str;

    fn key(&self) -> &Self::Key;
}

impl Keyed for Cluster {
    type Key = ClusterId;
    const KIND: &'static str = "cluster";

    fn key(&self) -> &ClusterId {
        &self.id
    }
}

impl Keyed for Node {
    type Key = NodeId;
    const KIND: &'static str = "node";

    fn key(&self) -> &NodeId {
        &self.id
    }
}

impl Keyed for Device {
    type Key = DeviceId;
    const KIND: &'static str = "device";

    fn key(&self) -> &DeviceId {
        &self.id
    }
}

type Table<T> = BTreeMap<<T as Keyed>::Key, Versioned<T>>;

/// Check writes in batch order. A key written earlier in the batch is
/// compared against the version that write leaves behind.
fn check_writes<T: Keyed>(table: &Table<T>, writes: &[EntityWrite<T::Key, T>]) -> StoreResult<()> {
    let mut staged: BTreeMap<&T::Key, Option<u64>> = BTreeMap::new();
    for write in writes {
        let (id, expected, next) = match write {
            EntityWrite::Insert(value) => (value.key(), None, Some(1)),
            EntityWrite::Update { expected, value } => {
                (value.key(), Some(*expected), Some(expected + 1))
            }
            EntityWrite::Delete { id, expected } => (id, Some(*expected), None),
        };
        let found = match staged.get(id) {
            Some(version) => *version,
            None => table.get(id).map(|v| v.version),
        };
        if found != expected {
            return Err(StoreError::VersionConflict {
                entity: format!("{} {}", T::KIND, id),
                expected,
                found,
            });
        }
        staged.insert(id, next);
    }
    Ok(())
}

fn apply_write<T: Keyed>(table: &mut Table<T>, write: EntityWrite<T::Key, T>) {
    match write {
        EntityWrite::Insert(value) => {
            table.insert(value.key().clone(), Versioned { version: 1, value });
        }
        EntityWrite::Update { expected, value } => {
            table.insert(
                value.key().clone(),
                Versioned {
                    version: expected + 1,
                    value,
                },
            );
        }
        EntityWrite::Delete { id, .. } => {
            table.remove(&id);
        }
    }
}

/// Everything except the record log
#[derive(Debug, Clone, Default)]
struct State {
    clusters: Table<Cluster>,
    nodes: Table<Node>,
    devices: Table<Device>,
    relations: BTreeMap<RelationCursor, UsageRelation>,
    open: HashMap<DeviceId, RelationCursor>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct Tables {
    state: State,
    /// Append-only, in seq order
    records: Vec<UsageRecord>,
}

/// On-disk form of [`State`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    clusters: Vec<Versioned<Cluster>>,
    nodes: Vec<Versioned<Node>>,
    devices: Vec<Versioned<Device>>,
    relations: Vec<UsageRelation>,
    next_seq: u64,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = State {
            next_seq: snapshot.next_seq,
            ..Default::default()
        };
        for c in snapshot.clusters {
            state.clusters.insert(c.value.id.clone(), c);
        }
        for n in snapshot.nodes {
            state.nodes.insert(n.value.id.clone(), n);
        }
        for d in snapshot.devices {
            state.devices.insert(d.value.id.clone(), d);
        }
        for r in snapshot.relations {
            if r.is_open() {
                state.open.insert(r.device_id.clone(), r.cursor());
            }
            state.relations.insert(r.cursor(), r);
        }
        state
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            clusters: self.clusters.values().cloned().collect(),
            nodes: self.nodes.values().cloned().collect(),
            devices: self.devices.values().cloned().collect(),
            relations: self.relations.values().cloned().collect(),
            next_seq: self.next_seq,
        }
    }

    fn validate(&self, batch: &WriteBatch) -> StoreResult<()> {
        check_writes(&self.clusters, &batch.clusters)?;
        check_writes(&self.nodes, &batch.nodes)?;
        check_writes(&self.devices, &batch.devices)?;

        // Relation writes are checked in order against the open set as it
        // evolves within the batch.
        let mut staged: HashMap<&DeviceId, bool> = HashMap::new();
        for w in &batch.relations {
            let device_id = match w {
                RelationWrite::Open(r) => &r.device_id,
                RelationWrite::Commit { device_id, .. } | RelationWrite::Close { device_id, .. } => {
                    device_id
                }
            };
            let is_open = staged
                .get(device_id)
                .copied()
                .unwrap_or_else(|| self.open.contains_key(device_id));
            match w {
                RelationWrite::Open(_) if is_open => {
                    return Err(StoreError::RelationAlreadyOpen(device_id.clone()));
                }
                RelationWrite::Open(_) => {
                    staged.insert(device_id, true);
                }
                RelationWrite::Commit { .. } | RelationWrite::Close { .. } if !is_open => {
                    return Err(StoreError::NoOpenRelation(device_id.clone()));
                }
                RelationWrite::Close { .. } => {
                    staged.insert(device_id, false);
                }
                RelationWrite::Commit { .. } => {}
            }
        }
        Ok(())
    }

    /// Apply a validated batch, returning its records with seq assigned
    fn apply(&mut self, batch: WriteBatch) -> Vec<UsageRecord> {
        for w in batch.clusters {
            apply_write(&mut self.clusters, w);
        }
        for w in batch.nodes {
            apply_write(&mut self.nodes, w);
        }
        for w in batch.devices {
            apply_write(&mut self.devices, w);
        }
        for w in batch.relations {
            match w {
                RelationWrite::Open(relation) => {
                    let cursor = relation.cursor();
                    self.open.insert(relation.device_id.clone(), cursor);
                    self.relations.insert(cursor, relation);
                }
                RelationWrite::Commit { device_id, at } => {
                    if let Some(r) = self
                        .open
                        .get(&device_id)
                        .and_then(|c| self.relations.get_mut(c))
                    {
                        r.committed_at = Some(at);
                    }
                }
                RelationWrite::Close { device_id, at } => {
                    if let Some(r) = self
                        .open
                        .remove(&device_id)
                        .and_then(|c| self.relations.get_mut(&c))
                    {
                        r.ended_at = Some(at);
                    }
                }
            }
        }
        batch
            .records
            .into_iter()
            .map(|mut record| {
                self.next_seq += 1;
                record.seq = self.next_seq;
                record
            })
            .collect()
    }
}

/// Store keeping all tables in memory.
///
/// With a snapshot path, usage records are appended as JSON lines to a
/// ledger file next to the snapshot, and the remaining state (entities and
/// relations) is rewritten to the snapshot on every commit. Commits hold the
/// write lock across that file I/O, so readers wait for the disk and commit
/// cost grows with the number of entities and relations, not with records.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
}

/// Ledger file kept beside a snapshot
fn ledger_path(snapshot: &Path) -> PathBuf {
    snapshot.with_extension("records.jsonl")
}

impl MemoryStore {
    /// Create an empty, purely in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if present
    pub async fn open(path: PathBuf) -> StoreResult<Self> {
        let state = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read(&path).await?;
            let snapshot: Snapshot = serde_json::from_slice(&content)?;
            State::from_snapshot(snapshot)
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            State::default()
        };
        let records = Self::load_ledger(&ledger_path(&path), state.next_seq).await?;

        info!(
            path = %path.display(),
            devices = state.devices.len(),
            records = records.len(),
            "Loaded store"
        );

        Ok(Self {
            tables: RwLock::new(Tables { state, records }),
            snapshot_path: Some(path),
        })
    }

    /// Read the ledger, keeping records the snapshot accounts for. Lines
    /// past `next_seq` come from a commit whose snapshot never landed and
    /// are cut from the file.
    async fn load_ledger(path: &Path, next_seq: u64) -> StoreResult<Vec<UsageRecord>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let mut records = Vec::new();
        let mut dropped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) if record.seq <= next_seq => records.push(record),
                Ok(_) => dropped += 1,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable ledger line");
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            warn!(path = %path.display(), dropped, "Truncating uncommitted ledger entries");
            let mut buf = Vec::new();
            for record in &records {
                serde_json::to_writer(&mut buf, record)?;
                buf.push(b'\n');
            }
            let tmp = path.with_extension("jsonl.tmp");
            tokio::fs::write(&tmp, buf).await?;
            tokio::fs::rename(&tmp, path).await?;
        }
        Ok(records)
    }

    /// Append records to the ledger, returning its length before the append
    async fn append_ledger(path: &Path, records: &[UsageRecord]) -> StoreResult<u64> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        if buf.is_empty() {
            return Ok(len);
        }

        let written = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            let _ = file.set_len(len).await;
            return Err(e.into());
        }
        Ok(len)
    }

    async fn truncate_ledger(path: &Path, len: u64) -> StoreResult<()> {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await?;
        Ok(())
    }

    async fn write_snapshot(path: &Path, state: &State) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(&state.to_snapshot())?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Records first, then the snapshot that makes them visible
    async fn persist(path: &Path, state: &State, records: &[UsageRecord]) -> StoreResult<()> {
        let ledger = ledger_path(path);
        let len = Self::append_ledger(&ledger, records).await?;
        if let Err(e) = Self::write_snapshot(path, state).await {
            if let Err(undo) = Self::truncate_ledger(&ledger, len).await {
                warn!(error = %undo, "Failed to roll back ledger append");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_cluster(&self, id: &ClusterId) -> StoreResult<Option<Versioned<Cluster>>> {
        Ok(self.tables.read().await.state.clusters.get(id).cloned())
    }

    async fn list_clusters(&self) -> StoreResult<Vec<Versioned<Cluster>>> {
        Ok(self.tables.read().await.state.clusters.values().cloned().collect())
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<Versioned<Node>>> {
        Ok(self.tables.read().await.state.nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Versioned<Node>>> {
        Ok(self.tables.read().await.state.nodes.values().cloned().collect())
    }

    async fn get_device(&self, id: &DeviceId) -> StoreResult<Option<Versioned<Device>>> {
        Ok(self.tables.read().await.state.devices.get(id).cloned())
    }

    async fn list_devices(&self) -> StoreResult<Vec<Versioned<Device>>> {
        Ok(self.tables.read().await.state.devices.values().cloned().collect())
    }

    async fn open_relation(&self, device_id: &DeviceId) -> StoreResult<Option<UsageRelation>> {
        let tables = self.tables.read().await;
        let state = &tables.state;
        Ok(state
            .open
            .get(device_id)
            .and_then(|c| state.relations.get(c))
            .cloned())
    }

    async fn list_open_relations(&self) -> StoreResult<Vec<UsageRelation>> {
        let tables = self.tables.read().await;
        let state = &tables.state;
        let mut open: Vec<UsageRelation> = state
            .open
            .values()
            .filter_map(|c| state.relations.get(c))
            .cloned()
            .collect();
        open.sort_by_key(|r| r.cursor());
        Ok(open)
    }

    async fn list_relations(
        &self,
        query: &RelationQuery,
        limit: usize,
    ) -> StoreResult<Vec<UsageRelation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .state
            .relations
            .values()
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_records(
        &self,
        query: &RecordQuery,
        limit: usize,
    ) -> StoreResult<Vec<UsageRecord>> {
        let tables = self.tables.read().await;
        let start = query
            .after_seq
            .map_or(0, |seq| tables.records.partition_point(|r| r.seq <= seq));
        Ok(tables.records[start..]
            .iter()
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().await;
        tables.state.validate(&batch)?;

        debug!(
            devices = batch.devices.len(),
            records = batch.records.len(),
            relations = batch.relations.len(),
            "Committing batch"
        );

        let records = match &self.snapshot_path {
            Some(path) => {
                let mut next = tables.state.clone();
                let records = next.apply(batch);
                Self::persist(path, &next, &records).await?;
                tables.state = next;
                records
            }
            None => tables.state.apply(batch),
        };
        tables.records.extend(records);

        Ok(())
    }
}
