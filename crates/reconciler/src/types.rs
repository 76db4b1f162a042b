//! Core types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bpfsync_core::{IDENTITY_METADATA_KEY, MapTable, ProgramSpec, ProgramType};
use bpfsync_daemon::KernelInfo;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Annotation holding the record's logical identity.
pub const IDENTITY_ANNOTATION: &str = IDENTITY_METADATA_KEY;

/// Annotation caching the last observed kernel id. Best effort only.
pub const KERNEL_ID_ANNOTATION: &str = "bpfd.dev/ProgramId";

/// Annotation counting failed unload attempts of a deleting record.
pub const UNLOAD_ATTEMPTS_ANNOTATION: &str = "bpfd.dev/unload-attempts";

/// Finalizer held while a program may be resident in the daemon.
pub const PROGRAM_FINALIZER: &str = "bpfd.dev/program-finalizer";

/// Informational annotations derived from the kernel's view of a program.
///
/// Never used as reconciliation inputs.
#[must_use]
pub fn kernel_info_annotations(info: &KernelInfo) -> BTreeMap<String, String> {
    let program_type = ProgramType::from_code(info.program_type)
        .map_or_else(|| info.program_type.to_string(), |t| t.as_str().to_string());
    let map_ids = format!("[{}]", info.map_ids.iter().join(" "));

    [
        ("Kernel-ID", info.id.to_string()),
        ("Name", info.name.clone()),
        ("Type", program_type),
        ("Loaded-At", info.loaded_at.clone()),
        ("Tag", info.tag.clone()),
        ("GPL-Compatible", info.gpl_compatible.to_string()),
        ("Map-IDs", map_ids),
        ("BTF-ID", info.btf_id.to_string()),
        ("Size-Translated-Bytes", info.bytes_xlated.to_string()),
        ("JITed", info.jited.to_string()),
        ("Size-JITed-Bytes", info.bytes_jited.to_string()),
        ("Kernel-Allocated-Memory-Bytes", info.bytes_memlock.to_string()),
        ("Verified-Instruction-Count", info.verified_insns.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Lifecycle condition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Loaded,
    Unloaded,
    Error,
}

impl ConditionType {
    /// Machine-readable reason recorded with the condition.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Loaded => "bpfdLoaded",
            Self::Unloaded => "bpfdUnloaded",
            Self::Error => "bpfdError",
        }
    }

    /// Build a condition of this type, stamped now.
    pub fn condition(self, message: impl Into<String>) -> Condition {
        Condition {
            kind: self,
            status: ConditionStatus::True,
            reason: self.reason().to_string(),
            message: message.into(),
            last_transition: Utc::now(),
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loaded => "Loaded",
            Self::Unloaded => "Unloaded",
            Self::Error => "Error",
        };
        write!(f, "{s}")
    }
}

/// Condition truth value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One entry of a record's condition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// Observed state written back to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStatus {
    /// Keyed by type; the last entry is the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// `None` until the daemon has materialised a pin directory.
    #[serde(default)]
    pub maps: Option<MapTable>,
}

impl RecordStatus {
    /// Most recent condition.
    #[must_use]
    pub fn current(&self) -> Option<&Condition> {
        self.conditions.last()
    }
}

/// Persisted program record: desired state plus metadata and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub name: String,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    pub spec: ProgramSpec,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: RecordStatus,
}

impl ProgramRecord {
    /// A fresh record that has never been stored.
    pub fn new(name: impl Into<String>, spec: ProgramSpec) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            spec,
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            deletion_timestamp: None,
            status: RecordStatus::default(),
        }
    }

    /// Whether deletion has been requested.
    #[must_use]
    pub const fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether `finalizer` is held.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Annotation value.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Derived per-node record pointing back at the program record it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub name: String,
    /// Name of the owning program record.
    #[serde(default)]
    pub owner: Option<String>,
}

impl ChildRecord {
    /// Child owned by `owner`.
    pub fn owned_by(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: Some(owner.into()),
        }
    }
}

/// A request to reconcile, keyed by a program record or child record name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trigger {
    pub name: String,
}

impl Trigger {
    /// Trigger for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// What the trigger-delivery layer should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged, or nothing left to do until the next trigger.
    Done,
    /// Re-invoke after the delay.
    Requeue { after: Duration },
}

impl ReconcileOutcome {
    /// Requeue after `after`.
    #[must_use]
    pub const fn requeue(after: Duration) -> Self {
        Self::Requeue { after }
    }

    /// Whether the pass asked to be retried.
    #[must_use]
    pub const fn is_requeue(&self) -> bool {
        matches!(self, Self::Requeue { .. })
    }
}

#[cfg(test)]
mod tests {
    use bpfsync_core::BytecodeSource;

    use super::*;

    fn info() -> KernelInfo {
        KernelInfo {
            id: 7,
            name: "trace1".to_string(),
            program_type: 2,
            loaded_at: "2023-05-01T10:00:00Z".to_string(),
            tag: "abcd".to_string(),
            gpl_compatible: true,
            map_ids: vec![3, 4],
            btf_id: 9,
            bytes_xlated: 96,
            jited: true,
            bytes_jited: 64,
            bytes_memlock: 4096,
            verified_insns: 12,
        }
    }

    #[test]
    fn test_kernel_info_annotations() {
        let annotations = kernel_info_annotations(&info());
        assert_eq!(annotations.len(), 13);
        assert_eq!(annotations.get("Kernel-ID").map(String::as_str), Some("7"));
        assert_eq!(annotations.get("Type").map(String::as_str), Some("kprobe"));
        assert_eq!(annotations.get("Map-IDs").map(String::as_str), Some("[3 4]"));
        assert_eq!(
            annotations.get("GPL-Compatible").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn test_unknown_type_code_is_numeric() {
        let mut info = info();
        info.program_type = 999;
        let annotations = kernel_info_annotations(&info);
        assert_eq!(annotations.get("Type").map(String::as_str), Some("999"));
    }

    #[test]
    fn test_condition_carries_reason() {
        let condition = ConditionType::Loaded.condition("ok");
        assert_eq!(condition.reason, "bpfdLoaded");
        assert_eq!(condition.status, ConditionStatus::True);
    }

    #[test]
    fn test_record_defaults() {
        let record = ProgramRecord::new(
            "trace1",
            ProgramSpec::new(
                ProgramType::Uprobe,
                "trace1",
                BytecodeSource::Path("/bin/true".into()),
            ),
        );
        assert!(!record.is_deleting());
        assert!(!record.has_finalizer(PROGRAM_FINALIZER));
        assert_eq!(record.status.current(), None);
    }
}
