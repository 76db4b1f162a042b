//! Status condition writes against fresh copies of program records.

use std::sync::Arc;
use std::time::Duration;

use bpfsync_core::{Error, MapTable, Result};
use tracing::debug;

use crate::error::StoreError;
use crate::store::RecordStore;
use crate::types::{Condition, ConditionType, RecordStatus};

/// Result of a status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusWrite {
    /// The status was changed.
    Written,
    /// The status already said this.
    Unchanged,
    /// A concurrent write won; retry the pass after the delay.
    Requeue(Duration),
    /// The record no longer exists.
    Gone,
}

impl StatusWrite {
    /// Requeue delay, if the write asked for one.
    #[must_use]
    pub const fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Requeue(after) => Some(*after),
            _ => None,
        }
    }
}

/// Add `condition` to a history keyed by type.
///
/// A no-op when the most recent condition already has the same type;
/// otherwise any older condition of that type is dropped and the new one
/// appended. Returns whether the history changed.
pub fn apply_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    if conditions.last().is_some_and(|c| c.kind == condition.kind) {
        return false;
    }
    conditions.retain(|c| c.kind != condition.kind);
    conditions.push(condition);
    true
}

/// Writes conditions and map tables onto program records.
///
/// Every write re-fetches the record first so that racing passes never
/// write over each other's status with a stale copy.
#[derive(Clone)]
pub struct StatusWriter {
    store: Arc<dyn RecordStore>,
    retry_delay: Duration,
}

impl StatusWriter {
    /// Writer that asks for a requeue after `retry_delay` on conflicts.
    pub fn new(store: Arc<dyn RecordStore>, retry_delay: Duration) -> Self {
        Self { store, retry_delay }
    }

    /// Set a condition on the named record.
    ///
    /// # Errors
    /// `Store` if the record cannot be read or written for reasons other
    /// than a conflict.
    pub async fn set_condition(
        &self,
        name: &str,
        kind: ConditionType,
        message: impl Into<String> + Send,
    ) -> Result<StatusWrite> {
        let condition = kind.condition(message);
        self.write(name, |status| apply_condition(&mut status.conditions, condition))
            .await
            .inspect(|outcome| {
                if *outcome == StatusWrite::Written {
                    debug!(name, condition = %kind, "Status condition set");
                }
            })
    }

    /// Record the discovered map table, if it differs from the stored one.
    ///
    /// # Errors
    /// `Store` if the record cannot be read or written for reasons other
    /// than a conflict.
    pub async fn set_maps(&self, name: &str, maps: Option<MapTable>) -> Result<StatusWrite> {
        self.write(name, |status| {
            if status.maps == maps {
                return false;
            }
            status.maps = maps;
            true
        })
        .await
    }

    async fn write(
        &self,
        name: &str,
        change: impl FnOnce(&mut RecordStatus) -> bool + Send,
    ) -> Result<StatusWrite> {
        let Some(mut record) = self.store.get(name).await.map_err(Error::from)? else {
            debug!(name, "Record gone before status write");
            return Ok(StatusWrite::Gone);
        };

        if !change(&mut record.status) {
            return Ok(StatusWrite::Unchanged);
        }

        match self.store.update_status(&record).await {
            Ok(_) => Ok(StatusWrite::Written),
            Err(StoreError::Conflict { .. }) => {
                debug!(name, "Status write conflicted, requeuing");
                Ok(StatusWrite::Requeue(self.retry_delay))
            }
            Err(StoreError::NotFound { .. }) => Ok(StatusWrite::Gone),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use bpfsync_core::{BytecodeSource, ProgramSpec, ProgramType};
    use proptest::prelude::*;

    use super::*;
    use crate::error::StoreResult;
    use crate::store::InMemoryRecordStore;
    use crate::types::{ChildRecord, ProgramRecord};

    const DELAY: Duration = Duration::from_secs(5);

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

    async fn writer_with(name: &str) -> (StatusWriter, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        store.create(record(name)).await.unwrap();
        let writer = StatusWriter::new(store.clone(), DELAY);
        (writer, store)
    }

    #[tokio::test]
    async fn test_same_type_twice_is_single_entry() {
        let (writer, store) = writer_with("a").await;

        let first = writer
            .set_condition("a", ConditionType::Loaded, "loaded")
            .await
            .unwrap();
        let second = writer
            .set_condition("a", ConditionType::Loaded, "a different message")
            .await
            .unwrap();

        assert_eq!(first, StatusWrite::Written);
        assert_eq!(second, StatusWrite::Unchanged);
        let stored = store.get("a").await.unwrap().expect("exists");
        assert_eq!(stored.status.conditions.len(), 1);
        assert_eq!(
            stored.status.current().map(|c| c.message.as_str()),
            Some("loaded")
        );
    }

    #[tokio::test]
    async fn test_older_entry_of_same_type_replaced() {
        let (writer, store) = writer_with("a").await;
        for kind in [ConditionType::Loaded, ConditionType::Error, ConditionType::Loaded] {
            writer.set_condition("a", kind, "m").await.unwrap();
        }

        let stored = store.get("a").await.unwrap().expect("exists");
        let kinds: Vec<_> = stored.status.conditions.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ConditionType::Error, ConditionType::Loaded]);
    }

    #[tokio::test]
    async fn test_missing_record_is_gone() {
        let store = Arc::new(InMemoryRecordStore::new());
        let writer = StatusWriter::new(store, DELAY);
        assert_eq!(
            writer
                .set_condition("absent", ConditionType::Loaded, "m")
                .await
                .unwrap(),
            StatusWrite::Gone
        );
    }

    #[tokio::test]
    async fn test_maps_written_only_when_changed() {
        let (writer, _store) = writer_with("a").await;
        assert_eq!(
            writer.set_maps("a", None).await.unwrap(),
            StatusWrite::Unchanged
        );

        let mut maps = BTreeMap::new();
        maps.insert("counts".to_string(), PathBuf::from("/run/bpfd/fs/maps/7/counts"));
        assert_eq!(
            writer.set_maps("a", Some(maps.clone())).await.unwrap(),
            StatusWrite::Written
        );
        assert_eq!(
            writer.set_maps("a", Some(maps)).await.unwrap(),
            StatusWrite::Unchanged
        );
        assert_eq!(
            writer.set_maps("a", Some(BTreeMap::new())).await.unwrap(),
            StatusWrite::Written
        );
    }

    /// Store whose status writes always lose a race.
    struct RacingStore {
        inner: InMemoryRecordStore,
    }

    #[async_trait]
    impl RecordStore for RacingStore {
        async fn get(&self, name: &str) -> StoreResult<Option<ProgramRecord>> {
            self.inner.get(name).await
        }

        async fn get_child(&self, name: &str) -> StoreResult<Option<ChildRecord>> {
            self.inner.get_child(name).await
        }

        async fn list(&self) -> StoreResult<Vec<ProgramRecord>> {
            self.inner.list().await
        }

        async fn update(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
            self.inner.update(record).await
        }

        async fn update_status(&self, record: &ProgramRecord) -> StoreResult<ProgramRecord> {
            Err(StoreError::conflict(
                &record.name,
                record.resource_version.saturating_add(1),
                record.resource_version,
            ))
        }
    }

    #[tokio::test]
    async fn test_conflict_requeues() {
        let inner = InMemoryRecordStore::new();
        inner.create(record("a")).await.unwrap();
        let writer = StatusWriter::new(Arc::new(RacingStore { inner }), DELAY);

        let outcome = writer
            .set_condition("a", ConditionType::Loaded, "m")
            .await
            .unwrap();
        assert_eq!(outcome, StatusWrite::Requeue(DELAY));
        assert_eq!(outcome.requeue_after(), Some(DELAY));
    }

    fn kind() -> impl Strategy<Value = ConditionType> {
        prop_oneof![
            Just(ConditionType::Loaded),
            Just(ConditionType::Unloaded),
            Just(ConditionType::Error),
        ]
    }

    proptest! {
        #[test]
        fn prop_history_keyed_by_type(kinds in prop::collection::vec(kind(), 0..40)) {
            let mut conditions = Vec::new();
            for kind in &kinds {
                apply_condition(&mut conditions, kind.condition("m"));
            }

            // At most one entry per type.
            for kind in [ConditionType::Loaded, ConditionType::Unloaded, ConditionType::Error] {
                prop_assert!(conditions.iter().filter(|c| c.kind == kind).count() <= 1);
            }
            // The latest applied type is always current.
            prop_assert_eq!(conditions.last().map(|c| c.kind), kinds.last().copied());
        }

        #[test]
        fn prop_repeating_current_type_is_noop(kinds in prop::collection::vec(kind(), 1..20)) {
            let mut conditions = Vec::new();
            for kind in &kinds {
                apply_condition(&mut conditions, kind.condition("m"));
            }
            let before = conditions.clone();
            let last = conditions.last().map(|c| c.kind).unwrap();
            prop_assert!(!apply_condition(&mut conditions, last.condition("other")));
            prop_assert_eq!(conditions, before);
        }
    }
}
