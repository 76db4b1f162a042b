//! Reconciler implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bpfsync_core::{
    Error, IDENTITY_METADATA_KEY, KernelId, LogicalIdentity, ProgramSpec, ProgramType, Result,
    ResultExt,
};
use bpfsync_daemon::{DaemonAdapter, ListResult, LoadRequest, LoadedProgram, Location, Observed};
use futures::future::join_all;
use itertools::{Either, Itertools};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use crate::bytecode::BytecodeLocator;
use crate::credentials::{CredentialStore, InMemoryCredentialStore};
use crate::identity;
use crate::status::{StatusWrite, StatusWriter};
use crate::store::RecordStore;
use crate::types::{
    ConditionType, KERNEL_ID_ANNOTATION, PROGRAM_FINALIZER, ProgramRecord, ReconcileOutcome,
    Trigger, UNLOAD_ATTEMPTS_ANNOTATION, kernel_info_annotations,
};

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before retrying a pass that hit a recoverable failure.
    pub retry_delay: Duration,
    /// Upper bound on the unload backoff of deleting records.
    pub max_backoff: Duration,
    /// Failed unloads tolerated before a deleting record is released anyway.
    pub max_unload_attempts: u32,
    /// Finalizer held on records while their program may be loaded.
    pub finalizer: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            max_unload_attempts: 5,
            finalizer: PROGRAM_FINALIZER.to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Requeue delay after the `attempt`-th failed unload (1-based):
    /// `retry_delay * 2^(attempt-1)`, capped at `max_backoff`.
    #[must_use]
    pub fn unload_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay.saturating_mul(factor).min(self.max_backoff)
    }
}

/// One async mutex per record name.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only the map holds idle entries.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// K8s-style reconciler for eBPF program records.
///
/// Each pass converges one record against the daemon, keyed by the record's
/// logical identity. Passes for distinct records run concurrently; passes for
/// the same record are serialised.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    daemon: DaemonAdapter,
    locator: BytecodeLocator,
    status: StatusWriter,
    config: ReconcilerConfig,
    locks: KeyedLocks,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        store: Arc<dyn RecordStore>,
        daemon: DaemonAdapter,
        credentials: Arc<dyn CredentialStore>,
        config: ReconcilerConfig,
    ) -> Self {
        let status = StatusWriter::new(Arc::clone(&store), config.retry_delay);
        Self {
            store,
            daemon,
            locator: BytecodeLocator::new(credentials),
            status,
            config,
            locks: KeyedLocks::default(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Get the daemon adapter.
    #[must_use]
    pub const fn daemon(&self) -> &DaemonAdapter {
        &self.daemon
    }

    /// Run one reconciliation pass.
    ///
    /// Recoverable failures come back as [`ReconcileOutcome::Requeue`];
    /// every failure is also mirrored into an Error condition.
    ///
    /// # Errors
    /// Failures that retrying will not fix: `AmbiguousIdentity`,
    /// `MissingIdentityMetadata`, `InvalidReference`, `InvalidAnnotation`,
    /// `ReservedMetadataKey` and `FilesystemError`.
    #[instrument(skip_all, fields(trigger = %trigger.name))]
    pub async fn reconcile(&self, trigger: &Trigger) -> Result<ReconcileOutcome> {
        let name = match self.resolve_trigger(&trigger.name).await {
            Ok(name) => name,
            Err(e) => return self.settle(&trigger.name, Err(e)).await,
        };

        let _guard = self.locks.lock(&name).await;
        let result = self.pass(&name).await;
        self.settle(&name, result).await
    }

    /// Run passes for many triggers concurrently.
    pub async fn reconcile_all(
        &self,
        triggers: &[Trigger],
    ) -> Vec<(Trigger, Result<ReconcileOutcome>)> {
        join_all(
            triggers
                .iter()
                .map(|trigger| async move { (trigger.clone(), self.reconcile(trigger).await) }),
        )
        .await
    }

    /// Unload daemon-managed programs of a type whose identity belongs to no
    /// record. Returns the kernel ids unloaded.
    ///
    /// The daemon is listed before the records, so a program loaded after the
    /// daemon listing cannot be swept: its identity was persisted first.
    ///
    /// # Errors
    /// Listing failures, or the first failed unload after all were tried.
    #[instrument(skip(self))]
    pub async fn sweep_orphans(&self, program_type: ProgramType) -> Result<Vec<KernelId>> {
        let resident = self.daemon.list_managed(program_type).await?;
        let records = self.store.list().await.map_err(Error::from)?;

        let known: HashSet<LogicalIdentity> = records
            .iter()
            .filter_map(|r| identity::persisted_identity(r).into_option_logged().flatten())
            .collect();

        let unloads = resident
            .into_iter()
            .filter(|(identity, _)| !known.contains(identity))
            .map(|(identity, program)| async move {
                let kernel_id = program.kernel_id();
                info!(%identity, %kernel_id, "Unloading orphaned program");
                self.daemon.unload(kernel_id).await.map(|()| kernel_id)
            });

        let (mut unloaded, failed): (Vec<_>, Vec<_>) =
            join_all(unloads).await.into_iter().partition_map(|r| match r {
                Ok(kernel_id) => Either::Left(kernel_id),
                Err(e) => Either::Right(e),
            });
        unloaded.sort();

        match failed.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(unloaded),
        }
    }

    /// Map a trigger to the program record it concerns.
    ///
    /// Triggers may name a child record; those are followed to their owner.
    async fn resolve_trigger(&self, name: &str) -> Result<String> {
        if self.store.get(name).await.map_err(Error::from)?.is_some() {
            return Ok(name.to_string());
        }

        let child = self
            .store
            .get_child(name)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::stale_trigger(name, "no program or child record"))?;
        let owner = child
            .owner
            .ok_or_else(|| Error::stale_trigger(name, "child record has no owner"))?;

        if self.store.get(&owner).await.map_err(Error::from)?.is_none() {
            return Err(Error::stale_trigger(name, format!("owner '{owner}' not found")));
        }
        debug!(child = name, %owner, "Trigger resolved through child record");
        Ok(owner)
    }

    /// Turn a pass result into an outcome, recording failures on the record.
    async fn settle(
        &self,
        name: &str,
        result: Result<ReconcileOutcome>,
    ) -> Result<ReconcileOutcome> {
        let err = match result {
            Ok(outcome) => return Ok(outcome),
            Err(Error::StaleTrigger { name: trigger, reason }) => {
                info!(%trigger, %reason, "Stale trigger, nothing to do");
                return Ok(ReconcileOutcome::Done);
            }
            Err(err) => err,
        };

        if let Err(status_err) = self
            .status
            .set_condition(name, ConditionType::Error, err.to_string())
            .await
        {
            warn!(name, error = %status_err, "Could not record failure on status");
        }

        if err.is_retryable() {
            warn!(name, error = %err, "Reconciliation failed, requeuing");
            return Ok(ReconcileOutcome::requeue(self.config.retry_delay));
        }
        if err.is_invariant_violation() {
            error!(name, error = %err, "Daemon state breaks the identity contract");
        } else {
            warn!(name, error = %err, "Reconciliation failed, not retrying");
        }
        Err(err)
    }

    async fn pass(&self, name: &str) -> Result<ReconcileOutcome> {
        let record = self
            .store
            .get(name)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::stale_trigger(name, "record removed"))?;

        if record.is_deleting() {
            self.finalize(record).await
        } else {
            self.converge(record).await
        }
    }

    async fn converge(&self, mut record: ProgramRecord) -> Result<ReconcileOutcome> {
        record.spec.validate()?;
        let (identity, minted) = identity::ensure_identity(&mut record)?;
        let needs_finalizer = !record.has_finalizer(&self.config.finalizer);
        if needs_finalizer {
            record.finalizers.push(self.config.finalizer.clone());
        }
        if minted || needs_finalizer {
            record = self.store.update(&record).await.map_err(Error::from)?;
        }

        let desired = self.locator.describe(&record.spec.bytecode)?;
        let metadata = record.spec.daemon_metadata(identity);

        let program = match self.daemon.get_by_identity(identity).await? {
            Observed::Loaded(observed) if is_converged(&observed, &record.spec, &desired) => {
                let kernel_id = observed.kernel_id();
                if identity::cached_kernel_id(&record).is_some_and(|cached| cached != kernel_id) {
                    debug!(%kernel_id, "Cached kernel id is stale");
                }
                let maps = self.daemon.discover_maps(kernel_id).await?;
                LoadedProgram {
                    kernel_id,
                    info: observed.info,
                    maps,
                }
            }
            Observed::Loaded(observed) => {
                // Resolve the replacement first; a locator failure must leave
                // the resident program in place.
                let request = self.load_request(&record, metadata).await?;
                info!(kernel_id = %observed.kernel_id(), "Program differs from desired state, replacing");
                self.daemon.unload(observed.kernel_id()).await?;
                self.daemon.load(request).await?
            }
            Observed::NotLoaded => {
                let request = self.load_request(&record, metadata).await?;
                self.daemon.load(request).await?
            }
        };

        self.record_loaded(record, program).await
    }

    async fn load_request(
        &self,
        record: &ProgramRecord,
        metadata: BTreeMap<String, String>,
    ) -> Result<LoadRequest> {
        let location = self.locator.locate(&record.spec.bytecode).await?;
        Ok(LoadRequest {
            location,
            name: record.spec.name.clone(),
            program_type: record.spec.program_type.code(),
            metadata,
            global_data: record.spec.global_data.clone(),
            map_owner_id: record.spec.map_owner_id,
        })
    }

    async fn record_loaded(
        &self,
        mut record: ProgramRecord,
        program: LoadedProgram,
    ) -> Result<ReconcileOutcome> {
        let mut annotations = record.annotations.clone();
        annotations.insert(
            KERNEL_ID_ANNOTATION.to_string(),
            program.kernel_id.to_string(),
        );
        annotations.extend(kernel_info_annotations(&program.info));
        annotations.remove(UNLOAD_ATTEMPTS_ANNOTATION);
        if annotations != record.annotations {
            record.annotations = annotations;
            record = self.store.update(&record).await.map_err(Error::from)?;
        }

        let maps = self.status.set_maps(&record.name, program.maps).await?;
        let condition = self
            .status
            .set_condition(
                &record.name,
                ConditionType::Loaded,
                format!("Program '{}' loaded", record.spec.name),
            )
            .await?;
        Ok(outcome_of(&[maps, condition]))
    }

    async fn finalize(&self, record: ProgramRecord) -> Result<ReconcileOutcome> {
        if !record.has_finalizer(&self.config.finalizer) {
            debug!(name = %record.name, "Deleting record holds no finalizer of ours");
            return Ok(ReconcileOutcome::Done);
        }

        // Without a persisted identity nothing was ever loaded for this record.
        if let Some(identity) = identity::persisted_identity(&record)? {
            let resident = match self.daemon.get_by_identity(identity).await {
                Ok(Observed::Loaded(observed)) => Some(observed.kernel_id()),
                Ok(Observed::NotLoaded) => None,
                // An unreachable daemon must not hold the record forever.
                Err(err) if err.is_retryable() => {
                    let cached = identity::cached_kernel_id(&record);
                    return self.unload_failed(record, cached, &err).await;
                }
                Err(err) => return Err(err),
            };
            if let Some(kernel_id) = resident {
                if let Err(err) = self.daemon.unload(kernel_id).await {
                    return self.unload_failed(record, Some(kernel_id), &err).await;
                }
            }
        }

        let written = self
            .status
            .set_condition(&record.name, ConditionType::Unloaded, "Program unloaded")
            .await?;
        if let Some(after) = written.requeue_after() {
            return Ok(ReconcileOutcome::requeue(after));
        }
        self.release_finalizer(&record.name).await
    }

    /// Count a failed unload (or failed observation) of a deleting record
    /// and back off; once attempts run out, release the record anyway.
    async fn unload_failed(
        &self,
        mut record: ProgramRecord,
        kernel_id: Option<KernelId>,
        err: &Error,
    ) -> Result<ReconcileOutcome> {
        let name = record.name.clone();
        let program = kernel_id.map_or_else(|| "program".to_string(), |id| format!("program {id}"));
        let attempts = record
            .annotation(UNLOAD_ATTEMPTS_ANNOTATION)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            .saturating_add(1);

        if attempts >= self.config.max_unload_attempts {
            error!(
                name,
                ?kernel_id,
                attempts,
                error = %err,
                "Unload retries exhausted, releasing finalizer; program may remain loaded"
            );
            let written = self
                .status
                .set_condition(
                    &name,
                    ConditionType::Error,
                    format!("gave up unloading {program} after {attempts} attempts: {err}"),
                )
                .await?;
            if let Some(after) = written.requeue_after() {
                return Ok(ReconcileOutcome::requeue(after));
            }
            return self.release_finalizer(&name).await;
        }

        record
            .annotations
            .insert(UNLOAD_ATTEMPTS_ANNOTATION.to_string(), attempts.to_string());
        self.store.update(&record).await.map_err(Error::from)?;

        let after = self.config.unload_backoff(attempts);
        warn!(name, ?kernel_id, attempts, ?after, error = %err, "Unload failed, backing off");
        self.status
            .set_condition(&name, ConditionType::Error, err.to_string())
            .await?;
        Ok(ReconcileOutcome::requeue(after))
    }

    async fn release_finalizer(&self, name: &str) -> Result<ReconcileOutcome> {
        let Some(mut record) = self.store.get(name).await.map_err(Error::from)? else {
            return Ok(ReconcileOutcome::Done);
        };
        record.finalizers.retain(|f| *f != self.config.finalizer);
        self.store.update(&record).await.map_err(Error::from)?;
        info!(name, "Finalizer released");
        Ok(ReconcileOutcome::Done)
    }
}

/// Whether a resident program matches the desired spec on every field the
/// daemon persists. Kernel-assigned fields are ignored.
fn is_converged(observed: &ListResult, spec: &ProgramSpec, desired: &Location) -> bool {
    let user_metadata_matches = observed
        .metadata
        .iter()
        .filter(|(k, _)| k.as_str() != IDENTITY_METADATA_KEY)
        .eq(spec.metadata.iter());

    observed.info.name == spec.name
        && observed.info.program_type == spec.program_type.code()
        && user_metadata_matches
        && observed.global_data == spec.global_data
        && observed.map_owner_id == spec.map_owner_id
        && observed
            .location
            .as_ref()
            .is_some_and(|location| location.same_source(desired))
}

fn outcome_of(writes: &[StatusWrite]) -> ReconcileOutcome {
    writes
        .iter()
        .find_map(StatusWrite::requeue_after)
        .map_or(ReconcileOutcome::Done, ReconcileOutcome::requeue)
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    store: Option<Arc<dyn RecordStore>>,
    daemon: Option<DaemonAdapter>,
    credentials: Option<Arc<dyn CredentialStore>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: None,
            daemon: None,
            credentials: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the record store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the daemon adapter.
    #[must_use]
    pub fn with_daemon(mut self, daemon: DaemonAdapter) -> Self {
        self.daemon = Some(daemon);
        self
    }

    /// Set the credential store used for pull secrets.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retry delay.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the unload attempt bound for deleting records.
    #[must_use]
    pub const fn max_unload_attempts(mut self, attempts: u32) -> Self {
        self.config.max_unload_attempts = attempts;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    /// `InvalidConfig` if the store or daemon is missing, or the retry delay
    /// exceeds the backoff cap.
    pub fn build(self) -> Result<Reconciler> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("record store is required"))?;
        let daemon = self
            .daemon
            .ok_or_else(|| Error::invalid_config("daemon adapter is required"))?;
        if self.config.retry_delay > self.config.max_backoff {
            return Err(Error::invalid_config(
                "retry delay must not exceed the maximum backoff",
            ));
        }
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(InMemoryCredentialStore::new()));

        Ok(Reconciler::new(store, daemon, credentials, self.config))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use bpfsync_core::BytecodeSource;
    use bpfsync_daemon::{InMemoryDaemon, KernelInfo, MapDiscovery};

    use super::*;
    use crate::store::InMemoryRecordStore;

    fn adapter() -> DaemonAdapter {
        DaemonAdapter::new(
            Arc::new(InMemoryDaemon::new()),
            MapDiscovery::new("/nonexistent/bpfsync/maps"),
        )
    }

    #[test]
    fn test_unload_backoff_doubles_and_caps() {
        let config = ReconcilerConfig {
            retry_delay: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30),
            ..ReconcilerConfig::default()
        };
        assert_eq!(config.unload_backoff(1), Duration::from_secs(5));
        assert_eq!(config.unload_backoff(2), Duration::from_secs(10));
        assert_eq!(config.unload_backoff(3), Duration::from_secs(20));
        assert_eq!(config.unload_backoff(4), Duration::from_secs(30));
        assert_eq!(config.unload_backoff(64), Duration::from_secs(30));
    }

    #[test]
    fn test_builder() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let reconciler = ReconcilerBuilder::new()
            .with_store(store)
            .with_daemon(adapter())
            .retry_delay(Duration::from_secs(1))
            .max_unload_attempts(3)
            .build()
            .unwrap();
        assert_eq!(reconciler.config().retry_delay, Duration::from_secs(1));
        assert_eq!(reconciler.config().max_unload_attempts, 3);
    }

    #[test]
    fn test_builder_requires_store() {
        let result = ReconcilerBuilder::new().with_daemon(adapter()).build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_builder_rejects_delay_above_cap() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let result = ReconcilerBuilder::new()
            .with_store(store)
            .with_daemon(adapter())
            .retry_delay(Duration::from_secs(600))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    fn observed(spec: &ProgramSpec, identity: LogicalIdentity) -> ListResult {
        ListResult {
            info: KernelInfo {
                id: 1,
                name: spec.name.clone(),
                program_type: spec.program_type.code(),
                ..KernelInfo::default()
            },
            location: Some(Location::File("/bin/true".to_string())),
            metadata: spec.daemon_metadata(identity),
            global_data: spec.global_data.clone(),
            map_owner_id: spec.map_owner_id,
        }
    }

    #[test]
    fn test_is_converged_ignores_identity_and_kernel_fields() {
        let spec = ProgramSpec::new(
            ProgramType::Uprobe,
            "trace1",
            BytecodeSource::Path("/bin/true".into()),
        )
        .with_metadata("owner", "team-a");
        let desired = Location::File("/bin/true".to_string());
        let mut program = observed(&spec, LogicalIdentity::mint());
        program.info.loaded_at = "later".to_string();
        assert!(is_converged(&program, &spec, &desired));
        assert!(program.metadata.contains_key(IDENTITY_METADATA_KEY));
    }

    #[test]
    fn test_is_converged_detects_drift() {
        let spec = ProgramSpec::new(
            ProgramType::Uprobe,
            "trace1",
            BytecodeSource::Path("/bin/true".into()),
        );
        let desired = Location::File("/bin/true".to_string());
        let identity = LogicalIdentity::mint();

        let mut metadata_drift = observed(&spec, identity);
        metadata_drift
            .metadata
            .insert("extra".to_string(), "x".to_string());
        assert!(!is_converged(&metadata_drift, &spec, &desired));

        let mut global_drift = observed(&spec, identity);
        global_drift
            .global_data
            .insert("GLOBAL_u8".to_string(), vec![1]);
        assert!(!is_converged(&global_drift, &spec, &desired));

        let moved = observed(&spec, identity);
        assert!(!is_converged(
            &moved,
            &spec,
            &Location::File("/bin/false".to_string())
        ));

        let mut no_location = observed(&spec, identity);
        no_location.location = None;
        assert!(!is_converged(&no_location, &spec, &desired));
    }

    #[tokio::test]
    async fn test_keyed_locks_serialise_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let guard = locks.lock("a").await;

        let other = locks.lock("b").await;
        drop(other);

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock("a").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
