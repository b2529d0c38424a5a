//! Record store - the arena every component looks services up in
//!
//! Records and groups live in concurrent maps and are handed out as cloned
//! snapshots. When a state directory is configured, each record and group is
//! mirrored to its own JSON file so that a restarted gateway re-attaches to
//! jobs that are already running on the cluster.
//!
//! ```text
//! <state_dir>/records/<id>.json
//! <state_dir>/groups/<group_id>.json
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::service::{InvalidTransition, ReplicaGroup, ServiceRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record '{0}' not found")]
    NotFound(String),

    #[error("Record '{0}' already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Concurrent arena of service records and replica groups
pub struct RecordStore {
    records: DashMap<String, ServiceRecord>,
    groups: DashMap<String, ReplicaGroup>,
    root: Option<PathBuf>,
    /// Serializes file writes so the newest snapshot always lands last
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Store without persistence
    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            groups: DashMap::new(),
            root: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Open (or create) a persistent store rooted at `dir`, loading every
    /// record and group found there.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("records"))?;
        std::fs::create_dir_all(root.join("groups"))?;

        let store = Self {
            records: DashMap::new(),
            groups: DashMap::new(),
            root: Some(root.clone()),
            write_lock: Mutex::new(()),
        };

        for path in json_files(&root.join("records"))? {
            match read_json::<ServiceRecord>(&path) {
                Ok(record) => {
                    store.records.insert(record.id.clone(), record);
                }
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        for path in json_files(&root.join("groups"))? {
            match read_json::<ReplicaGroup>(&path) {
                Ok(group) => {
                    store.groups.insert(group.group_id.clone(), group);
                }
                Err(e) => warn!("Skipping unreadable group {}: {}", path.display(), e),
            }
        }

        info!(
            "Loaded {} record(s) and {} group(s) from {}",
            store.records.len(),
            store.groups.len(),
            root.display()
        );

        Ok(store)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a standalone record
    pub fn insert_record(&self, record: ServiceRecord) -> Result<(), StoreError> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.write_record(&record)?;
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Insert a group together with all of its members.
    ///
    /// Files are written before anything becomes visible in memory, so a
    /// failed write leaves the store unchanged.
    pub fn insert_group(
        &self,
        group: ReplicaGroup,
        members: Vec<ServiceRecord>,
    ) -> Result<(), StoreError> {
        if self.groups.contains_key(&group.group_id) {
            return Err(StoreError::AlreadyExists(group.group_id));
        }
        if let Some(dup) = members.iter().find(|r| self.records.contains_key(&r.id)) {
            return Err(StoreError::AlreadyExists(dup.id.clone()));
        }

        for record in &members {
            self.write_record(record)?;
        }
        self.write_group(&group)?;

        for record in members {
            self.records.insert(record.id.clone(), record);
        }
        self.groups.insert(group.group_id.clone(), group);
        Ok(())
    }

    /// Mutate a record in place.
    ///
    /// The closure runs while the entry is locked, so updates to one record
    /// are serialized. It returns whether anything changed; changed records
    /// are persisted after the lock is released.
    pub fn update<F>(&self, id: &str, f: F) -> Result<ServiceRecord, StoreError>
    where
        F: FnOnce(&mut ServiceRecord) -> Result<bool, StoreError>,
    {
        let (snapshot, changed) = {
            let mut entry = self
                .records
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let changed = f(&mut entry)?;
            (entry.clone(), changed)
        };

        if changed {
            self.persist_latest(id)?;
        }
        Ok(snapshot)
    }

    /// Remove a record (legacy delete path)
    pub fn remove(&self, id: &str) -> Result<Option<ServiceRecord>, StoreError> {
        let removed = self.records.remove(id).map(|(_, r)| r);
        if removed.is_some() {
            if let Some(root) = &self.root {
                let _guard = self.lock_writes();
                remove_if_exists(&record_path(root, id))?;
            }
        }
        Ok(removed)
    }

    /// Remove a group (its members are untouched)
    pub fn remove_group(&self, group_id: &str) -> Result<Option<ReplicaGroup>, StoreError> {
        let removed = self.groups.remove(group_id).map(|(_, g)| g);
        if removed.is_some() {
            if let Some(root) = &self.root {
                let _guard = self.lock_writes();
                remove_if_exists(&group_path(root, group_id))?;
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Reads (snapshots)
    // =========================================================================

    pub fn get(&self, id: &str) -> Option<ServiceRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn get_group(&self, group_id: &str) -> Option<ReplicaGroup> {
        self.groups.get(group_id).map(|g| g.clone())
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// All groups, oldest first
    pub fn list_groups(&self) -> Vec<ReplicaGroup> {
        let mut groups: Vec<ReplicaGroup> = self.groups.iter().map(|g| g.clone()).collect();
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        groups
    }

    /// Members of a group in routing order; ids without a record are skipped
    pub fn members(&self, group: &ReplicaGroup) -> Vec<ServiceRecord> {
        group.members.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Ids of every record that still needs reconciling
    pub fn non_terminal_ids(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Ports held by records that are not yet terminal
    pub fn used_ports(&self) -> HashSet<u16> {
        self.records
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.port)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // =========================================================================
    // Persistence helpers
    // =========================================================================

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_record(&self, record: &ServiceRecord) -> Result<(), StoreError> {
        if let Some(root) = &self.root {
            let _guard = self.lock_writes();
            write_json_atomic(&record_path(root, &record.id), record)?;
        }
        Ok(())
    }

    fn write_group(&self, group: &ReplicaGroup) -> Result<(), StoreError> {
        if let Some(root) = &self.root {
            let _guard = self.lock_writes();
            write_json_atomic(&group_path(root, &group.group_id), group)?;
        }
        Ok(())
    }

    /// Write whatever is current in memory for `id`
    fn persist_latest(&self, id: &str) -> Result<(), StoreError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let _guard = self.lock_writes();
        if let Some(current) = self.get(id) {
            write_json_atomic(&record_path(root, id), &current)?;
            debug!("Persisted record {} ({})", id, current.status);
        }
        Ok(())
    }
}

/// Job ids may carry characters that are awkward in file names
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn record_path(root: &Path, id: &str) -> PathBuf {
    root.join("records").join(format!("{}.json", file_stem(id)))
}

fn group_path(root: &Path, group_id: &str) -> PathBuf {
    root.join("groups").join(format!("{}.json", file_stem(group_id)))
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    Ok(files)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
