//! Entity store and deployment persistence.
//!
//! A `Table<T>` is a plain keyed collection; identity comes from one
//! process-wide monotonic `IdSeq` shared by every table so ids never collide,
//! even across a reload (the sequence is re-seeded by scanning all tables for
//! the maximum observed id). Reads are synchronous and return `Option` —
//! a missing id is a `None`, never a panic.
//!
//! `Deployment` aggregates the cluster singleton, the three entity tables and
//! the per-family node-id cursors. `DeploymentStore` adds the JSON snapshot
//! on disk (load at startup, save after mutations).

use crate::models::{
    Cluster, Family, Host, Process, ProcessType, RecordId,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: RecordId },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that lives in a `Table`.
pub trait Entity {
    fn id(&self) -> RecordId;
    fn set_id(&mut self, id: RecordId);
    fn kind() -> &'static str;
}

macro_rules! impl_entity {
    ($ty:ty, $kind:literal) => {
        impl Entity for $ty {
            fn id(&self) -> RecordId {
                self.id
            }
            fn set_id(&mut self, id: RecordId) {
                self.id = id;
            }
            fn kind() -> &'static str {
                $kind
            }
        }
    };
}

impl_entity!(Host, "host");
impl_entity!(ProcessType, "process type");
impl_entity!(Process, "process");

/// Process-wide monotonic identity source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdSeq {
    next: RecordId,
}

impl IdSeq {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn take(&mut self) -> RecordId {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Make sure the sequence stays above any id already in use.
    pub fn bump_past(&mut self, id: RecordId) {
        if id >= self.next {
            self.next = id + 1;
        }
    }

    pub fn peek(&self) -> RecordId {
        self.next
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table<T> {
    items: BTreeMap<RecordId, T>,
}

impl<T: Entity> Table<T> {
    pub fn new() -> Self {
        Self { items: BTreeMap::new() }
    }

    pub fn insert(&mut self, ids: &mut IdSeq, mut item: T) -> RecordId {
        let id = ids.take();
        item.set_id(id);
        self.items.insert(id, item);
        id
    }

    pub fn get(&self, id: RecordId) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    pub fn require(&self, id: RecordId) -> Result<&T, StoreError> {
        self.get(id).ok_or(StoreError::NotFound { kind: T::kind(), id })
    }

    pub fn remove(&mut self, id: RecordId) -> Option<T> {
        self.items.remove(&id)
    }

    /// All records in ascending id order (creation order).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }

    pub fn filter<'a, F: Fn(&T) -> bool + 'a>(&'a self, pred: F) -> Vec<&'a T> {
        self.items.values().filter(|t| pred(t)).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_id(&self) -> Option<RecordId> {
        self.items.keys().next_back().copied()
    }
}

/// The whole configured deployment, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub cluster: Cluster,
    pub hosts: Table<Host>,
    pub ptypes: Table<ProcessType>,
    pub processes: Table<Process>,
    pub ids: IdSeq,
    /// Next node id per family. Freed ids are never reclaimed.
    pub node_id_cursors: HashMap<Family, u64>,
}

/// The five fixed process type rows.
const SEED_PTYPES: [(&str, Family); 5] = [
    ("ndb_mgmd", Family::Management),
    ("ndbd", Family::Data),
    ("ndbmtd", Family::Data),
    ("mysqld", Family::Sql),
    ("api", Family::Api),
];

impl Deployment {
    pub fn new() -> Self {
        let mut dep = Self {
            cluster: Cluster::default(),
            hosts: Table::new(),
            ptypes: Table::new(),
            processes: Table::new(),
            ids: IdSeq::new(),
            node_id_cursors: HashMap::new(),
        };
        for (name, family) in SEED_PTYPES {
            dep.ptypes.insert(&mut dep.ids, ProcessType::new(name, family));
        }
        dep.seed_cursors();
        dep
    }

    /// Re-seed the id sequence and the per-family node-id cursors from the
    /// records actually present. Called after loading a snapshot so neither
    /// counter can hand out a value already in use.
    pub fn seed_cursors(&mut self) {
        for max in [self.hosts.max_id(), self.ptypes.max_id(), self.processes.max_id()]
            .into_iter()
            .flatten()
        {
            self.ids.bump_past(max);
        }
        for family in [Family::Management, Family::Data, Family::Sql, Family::Api] {
            let floor = *family.node_id_range().start();
            let cursor = self.node_id_cursors.entry(family).or_insert(floor);
            if *cursor < floor {
                *cursor = floor;
            }
        }
        for proc in self.processes.iter() {
            let Some(node_id) = proc.node_id else { continue };
            let Some(ptype) = self.ptypes.get(proc.ptype_id) else { continue };
            let cursor = self
                .node_id_cursors
                .entry(ptype.family)
                .or_insert(*ptype.family.node_id_range().start());
            if node_id >= *cursor {
                *cursor = node_id + 1;
            }
        }
    }

    pub fn ptype_by_name(&self, name: &str) -> Option<&ProcessType> {
        self.ptypes.iter().find(|t| t.name == name)
    }

    /// Family of an existing process, via its type row.
    pub fn family_of(&self, process: &Process) -> Option<Family> {
        self.ptypes.get(process.ptype_id).map(|t| t.family)
    }

    pub fn add_host(&mut self, name: &str, wildcard: bool) -> RecordId {
        self.hosts.insert(&mut self.ids, Host::new(name, wildcard))
    }

    /// Add a process of the given type on the given host. A missing explicit
    /// name is generated from the type's naming sequence. Node id and port
    /// are assigned separately by the allocator.
    pub fn add_process(
        &mut self,
        name: Option<&str>,
        host_id: RecordId,
        ptype_id: RecordId,
    ) -> Result<RecordId, StoreError> {
        self.hosts.require(host_id)?;
        let name = match name {
            Some(n) => n.to_string(),
            None => {
                let ptype = self.ptypes.get_mut(ptype_id).ok_or(StoreError::NotFound {
                    kind: "process type",
                    id: ptype_id,
                })?;
                ptype.name_seq += 1;
                format!("{} {}", ptype.name, ptype.name_seq)
            }
        };
        self.ptypes.require(ptype_id)?;
        Ok(self.processes.insert(&mut self.ids, Process::new(&name, host_id, ptype_id)))
    }

    /// Delete a host and cascade to its processes. Returns the ids of the
    /// removed processes so the tree projections can drop their leaves.
    pub fn delete_host(&mut self, host_id: RecordId) -> Result<Vec<RecordId>, StoreError> {
        self.hosts.remove(host_id).ok_or(StoreError::NotFound { kind: "host", id: host_id })?;
        let doomed: Vec<RecordId> = self
            .processes
            .iter()
            .filter(|p| p.host_id == host_id)
            .map(|p| p.id)
            .collect();
        for id in &doomed {
            self.processes.remove(*id);
        }
        Ok(doomed)
    }

    pub fn delete_process(&mut self, process_id: RecordId) -> Result<Process, StoreError> {
        self.processes
            .remove(process_id)
            .ok_or(StoreError::NotFound { kind: "process", id: process_id })
    }

    /// Colleague processes: same family, same host, creation order.
    pub fn colleagues(&self, host_id: RecordId, family: Family) -> Vec<&Process> {
        self.processes.filter(move |p| {
            p.host_id == host_id && self.family_of(p) == Some(family)
        })
    }

    pub fn family_count(&self, family: Family) -> usize {
        self.processes
            .iter()
            .filter(|p| self.family_of(p) == Some(family))
            .count()
    }

    /// Data-family processes colocated on one host.
    pub fn data_nodes_on_host(&self, host_id: RecordId) -> usize {
        self.colleagues(host_id, Family::Data).len()
    }
}

/// Shared deployment plus its JSON snapshot on disk.
#[derive(Clone)]
pub struct DeploymentStore {
    inner: Shared<Deployment>,
    data_file: PathBuf,
}

impl DeploymentStore {
    pub fn new<P: AsRef<Path>>(data_file: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Deployment::new())),
            data_file: data_file.as_ref().to_path_buf(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Deployment> {
        self.inner.lock()
    }

    /// Load the snapshot if one exists; a missing file just means a fresh
    /// deployment. Counters are re-seeded from the loaded records.
    pub async fn load(&self) -> Result<(), StoreError> {
        if !self.data_file.exists() {
            info!("no existing deployment file, starting fresh");
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&self.data_file).await?;
        let mut dep: Deployment = serde_json::from_str(&content)?;
        if dep.ptypes.is_empty() {
            warn!("loaded deployment has no process types, re-seeding");
            let fresh = Deployment::new();
            dep.ptypes = fresh.ptypes;
        }
        dep.seed_cursors();
        info!(
            hosts = dep.hosts.len(),
            processes = dep.processes.len(),
            "loaded deployment from {}",
            self.data_file.display()
        );
        *self.inner.lock() = dep;
        Ok(())
    }

    /// Persist the current deployment. Serializes under the lock, writes
    /// without holding it.
    pub async fn save(&self) -> Result<(), StoreError> {
        let content = {
            let dep = self.inner.lock();
            serde_json::to_string_pretty(&*dep)?
        };
        tokio::fs::write(&self.data_file, content).await?;
        Ok(())
    }
}
