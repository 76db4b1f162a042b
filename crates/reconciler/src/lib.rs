//! K8s-style reconciliation of eBPF program records against the loader daemon.
//!
//! Each program record declares a desired program; the daemon holds what is
//! actually loaded. A reconciliation pass converges one against the other:
//!
//! - **Identity**: every record carries a minted UUID annotation that is also
//!   stored in the daemon's load metadata. Records and programs are joined on
//!   it, never on kernel ids.
//! - **Converge**: load when absent, confirm when matching, replace (unload
//!   then load) when the resident program differs from the desired one.
//! - **Finalize**: a finalizer holds deleting records until their program is
//!   gone, with a bounded number of unload retries.
//! - **Status**: outcomes land as conditions keyed by type; map pin paths are
//!   recorded alongside.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bpfsync_daemon::{DaemonAdapter, InMemoryDaemon, MapDiscovery};
//! use bpfsync_reconciler::{InMemoryRecordStore, ReconcilerBuilder, Trigger};
//!
//! let store = Arc::new(InMemoryRecordStore::new());
//! let daemon = DaemonAdapter::new(Arc::new(InMemoryDaemon::new()), MapDiscovery::default());
//! let reconciler = ReconcilerBuilder::new()
//!     .with_store(store)
//!     .with_daemon(daemon)
//!     .build()?;
//! let outcome = reconciler.reconcile(&Trigger::new("trace1")).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bytecode;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod types;

pub use bytecode::{BytecodeLocator, ImageReference};
pub use credentials::{
    CredentialStore, InMemoryCredentialStore, RegistryCredential, RegistryCredentials,
};
pub use error::{StoreError, StoreResult};
pub use reconciler::{Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use status::{StatusWrite, StatusWriter};
pub use store::{FileRecordStore, InMemoryRecordStore, RecordStore};
pub use types::{
    ChildRecord, Condition, ConditionStatus, ConditionType, IDENTITY_ANNOTATION,
    KERNEL_ID_ANNOTATION, PROGRAM_FINALIZER, ProgramRecord, ReconcileOutcome, RecordStatus,
    Trigger, UNLOAD_ATTEMPTS_ANNOTATION,
};
