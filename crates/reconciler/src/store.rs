//! Record store trait and implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bpfsync_core::ProgramSpec;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::types::{ChildRecord, ProgramRecord, RecordStatus};

/// Trait for program record storage backends.
///
/// Writes use optimistic concurrency: a record is accepted only if its
/// `resource_version` matches the stored one, and every accepted write bumps
/// it. Removing the last finalizer of a deleting record removes the record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get a program record.
    async fn get(&self, name: &str) -> StoreResult<Option<ProgramRecord>>;

    /// Get a child record.
    async fn get_child(&self, name: &str) -> StoreResult<Option<ChildRecord>>;

    /// List all program records.
    async fn list(&self) -> StoreResult<Vec<ProgramRecord>>;

    /// Write spec, annotations and finalizers. Returns the stored record.
    async fn update(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord>;

    /// Write status only. Returns the stored record.
    async fn update_status(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord>;
}

/// Records and children, with the write rules every store shares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordTable {
    #[serde(default)]
    records: BTreeMap<String, ProgramRecord>,
    #[serde(default)]
    children: BTreeMap<String, ChildRecord>,
}

impl RecordTable {
    fn check_version<'a>(
        &'a mut self,
        record: &ProgramRecord,
    ) -> StoreResult<&'a mut ProgramRecord> {
        let stored = self
            .records
            .get_mut(&record.name)
            .ok_or_else(|| StoreError::not_found(&record.name))?;
        if stored.resource_version != record.resource_version {
            return Err(StoreError::conflict(
                &record.name,
                stored.resource_version,
                record.resource_version,
            ));
        }
        Ok(stored)
    }

    fn create(&mut self, mut record: ProgramRecord) -> StoreResult<ProgramRecord> {
        if self.records.contains_key(&record.name) {
            return Err(StoreError::already_exists(&record.name));
        }
        record.resource_version = 1;
        self.records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    fn update(&mut self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
        let stored = self.check_version(record)?;
        stored.spec = record.spec.clone();
        stored.annotations = record.annotations.clone();
        stored.finalizers = record.finalizers.clone();
        stored.resource_version = stored.resource_version.wrapping_add(1);
        let updated = stored.clone();

        if updated.is_deleting() && updated.finalizers.is_empty() {
            debug!(name = %updated.name, "Last finalizer released, removing record");
            self.records.remove(&updated.name);
        }
        Ok(updated)
    }

    fn update_status(&mut self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
        let stored = self.check_version(record)?;
        stored.status = record.status.clone();
        stored.resource_version = stored.resource_version.wrapping_add(1);
        Ok(stored.clone())
    }

    fn set_spec(&mut self, name: &str, spec: ProgramSpec) -> StoreResult<ProgramRecord> {
        let stored = self
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(name))?;
        stored.spec = spec;
        stored.resource_version = stored.resource_version.wrapping_add(1);
        Ok(stored.clone())
    }

    fn delete(&mut self, name: &str) -> StoreResult<Option<ProgramRecord>> {
        let stored = self
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(name))?;
        if stored.finalizers.is_empty() {
            self.records.remove(name);
            return Ok(None);
        }
        if stored.deletion_timestamp.is_none() {
            stored.deletion_timestamp = Some(Utc::now());
            stored.resource_version = stored.resource_version.wrapping_add(1);
        }
        Ok(Some(stored.clone()))
    }

    fn patch_status(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut RecordStatus),
    ) -> StoreResult<ProgramRecord> {
        let stored = self
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(name))?;
        f(&mut stored.status);
        stored.resource_version = stored.resource_version.wrapping_add(1);
        Ok(stored.clone())
    }
}

/// In-memory record store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryRecordStore {
    table: RwLock<RecordTable>,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new record at version 1.
    ///
    /// # Errors
    /// `AlreadyExists` if the name is taken.
    pub async fn create(&self, record: ProgramRecord) -> StoreResult<ProgramRecord> {
        self.table.write().await.create(record)
    }

    /// Replace a record's desired state, as a user edit would.
    ///
    /// # Errors
    /// `NotFound` if the record does not exist.
    pub async fn set_spec(&self, name: &str, spec: ProgramSpec) -> StoreResult<ProgramRecord> {
        self.table.write().await.set_spec(name, spec)
    }

    /// Request deletion.
    ///
    /// Records holding finalizers are marked deleting and returned; others
    /// are removed at once and `None` is returned.
    ///
    /// # Errors
    /// `NotFound` if the record does not exist.
    pub async fn delete(&self, name: &str) -> StoreResult<Option<ProgramRecord>> {
        self.table.write().await.delete(name)
    }

    /// Modify a record's status out of band, bumping its version.
    ///
    /// # Errors
    /// `NotFound` if the record does not exist.
    pub async fn patch_status(
        &self,
        name: &str,
        f: impl FnOnce(&mut RecordStatus) + Send,
    ) -> StoreResult<ProgramRecord> {
        self.table.write().await.patch_status(name, f)
    }

    /// Store a child record.
    pub async fn put_child(&self, child: ChildRecord) {
        self.table
            .write()
            .await
            .children
            .insert(child.name.clone(), child);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, name: &str) -> StoreResult<Option<ProgramRecord>> {
        Ok(self.table.read().await.records.get(name).cloned())
    }

    async fn get_child(&self, name: &str) -> StoreResult<Option<ChildRecord>> {
        Ok(self.table.read().await.children.get(name).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<ProgramRecord>> {
        Ok(self.table.read().await.records.values().cloned().collect())
    }

    async fn update(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
        self.table.write().await.update(record)
    }

    async fn update_status(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
        self.table.write().await.update_status(record)
    }
}

/// Record store persisted as one JSON document.
///
/// The file is re-read on every call, so edits made between calls (by an
/// operator, or another process) are picked up.
pub struct FileRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRecordStore {
    /// Use the document at `path`. A missing file reads as an empty store.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<RecordTable> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(RecordTable::default()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::malformed(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RecordTable::default()),
            Err(e) => Err(StoreError::backend(format!(
                "reading {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, table: &RecordTable) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(table)
            .map_err(|e| StoreError::malformed(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::backend(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::backend(format!("replacing {}: {e}", self.path.display())))
    }

    async fn modify<T>(
        &self,
        f: impl FnOnce(&mut RecordTable) -> StoreResult<T> + Send,
    ) -> StoreResult<T> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        let out = f(&mut table)?;
        self.save(&table).await?;
        Ok(out)
    }

    /// Store a new record at version 1.
    ///
    /// # Errors
    /// `AlreadyExists` if the name is taken, or a backend error.
    pub async fn create(&self, record: ProgramRecord) -> StoreResult<ProgramRecord> {
        self.modify(|table| table.create(record)).await
    }

    /// Request deletion. See [`InMemoryRecordStore::delete`].
    ///
    /// # Errors
    /// `NotFound` if the record does not exist, or a backend error.
    pub async fn delete(&self, name: &str) -> StoreResult<Option<ProgramRecord>> {
        self.modify(|table| table.delete(name)).await
    }

    /// Store a child record.
    ///
    /// # Errors
    /// Backend errors.
    pub async fn put_child(&self, child: ChildRecord) -> StoreResult<()> {
        self.modify(|table| {
            table.children.insert(child.name.clone(), child);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn get(&self, name: &str) -> StoreResult<Option<ProgramRecord>> {
        Ok(self.load().await?.records.remove(name))
    }

    async fn get_child(&self, name: &str) -> StoreResult<Option<ChildRecord>> {
        Ok(self.load().await?.children.remove(name))
    }

    async fn list(&self) -> StoreResult<Vec<ProgramRecord>> {
        Ok(self.load().await?.records.into_values().collect())
    }

    async fn update(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
        self.modify(|table| table.update(record)).await
    }

    async fn update_status(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
        self.modify(|table| table.update_status(record)).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use bpfsync_core::{BytecodeSource, ProgramType};

    use super::*;
    use crate::types::{ConditionType, PROGRAM_FINALIZER};

    fn record(name: &str) -> ProgramRecord {
        ProgramRecord::new(
            name,
            ProgramSpec::new(
                ProgramType::Xdp,
                "pass",
                BytecodeSource::Path("/progs/xdp_pass.o".into()),
            ),
        )
    }

    #[tokio::test]
    async fn test_create_assigns_version() {
        let store = InMemoryRecordStore::new();
        let created = store.create(record("a")).await.unwrap();
        assert_eq!(created.resource_version, 1);
        assert!(matches!(
            store.create(record("a")).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = InMemoryRecordStore::new();
        let created = store.create(record("a")).await.unwrap();

        let mut first = created.clone();
        first.annotations.insert("k".to_string(), "v".to_string());
        let updated = store.update(&first).await.unwrap();
        assert_eq!(updated.resource_version, 2);

        let result = store.update(&created).await;
        assert_eq!(result, Err(StoreError::conflict("a", 2, 1)));
    }

    #[tokio::test]
    async fn test_update_status_leaves_spec_alone() {
        let store = InMemoryRecordStore::new();
        let mut created = store.create(record("a")).await.unwrap();
        created.spec.name = "ignored".to_string();
        created
            .status
            .conditions
            .push(ConditionType::Loaded.condition("ok"));

        let stored = store.update_status(&created).await.unwrap();
        assert_eq!(stored.spec.name, "pass");
        assert_eq!(stored.status.conditions.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = InMemoryRecordStore::new();
        let mut created = store.create(record("a")).await.unwrap();
        created.finalizers.push(PROGRAM_FINALIZER.to_string());
        store.update(&created).await.unwrap();

        let deleting = store.delete("a").await.unwrap().expect("held by finalizer");
        assert!(deleting.is_deleting());

        let mut released = deleting;
        released.finalizers.clear();
        store.update(&released).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_without_finalizers_removes() {
        let store = InMemoryRecordStore::new();
        store.create(record("a")).await.unwrap();
        assert_eq!(store.delete("a").await.unwrap(), None);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.json");

        let store = FileRecordStore::new(&path);
        assert!(store.list().await.unwrap().is_empty());
        let created = store.create(record("a")).await.unwrap();
        store
            .put_child(ChildRecord::owned_by("a-node1", "a"))
            .await
            .unwrap();

        let mut edited = created;
        edited.annotations.insert("k".to_string(), "v".to_string());
        store.update(&edited).await.unwrap();

        let reopened = FileRecordStore::new(&path);
        let stored = reopened.get("a").await.unwrap().expect("persisted");
        assert_eq!(stored.annotation("k"), Some("v"));
        assert_eq!(stored.resource_version, 2);
        assert_eq!(
            reopened.get_child("a-node1").await.unwrap(),
            Some(ChildRecord::owned_by("a-node1", "a"))
        );
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.json");
        std::fs::write(&path, b"not json").unwrap();

        let result = FileRecordStore::new(&path).list().await;
        assert!(matches!(result, Err(StoreError::Malformed { .. })));
    }
}
