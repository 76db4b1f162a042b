//! Identity resolution from record annotations.

use bpfsync_core::{Error, KernelId, LogicalIdentity, Result, ResultExt};
use tracing::{debug, info};

use crate::types::{IDENTITY_ANNOTATION, KERNEL_ID_ANNOTATION, ProgramRecord};

/// Identity persisted on a record, if one has been minted.
///
/// # Errors
/// `InvalidAnnotation` if the annotation is present but not a UUID. A bad
/// identity is never replaced, since a program may already carry it.
pub fn persisted_identity(record: &ProgramRecord) -> Result<Option<LogicalIdentity>> {
    record
        .annotation(IDENTITY_ANNOTATION)
        .map(str::parse::<LogicalIdentity>)
        .transpose()
}

/// Identity of a record, minting one into its annotations when absent.
///
/// Returns the identity and whether the record was changed. A changed record
/// must be persisted before any daemon call.
///
/// # Errors
/// `InvalidAnnotation` if the existing annotation is malformed.
pub fn ensure_identity(record: &mut ProgramRecord) -> Result<(LogicalIdentity, bool)> {
    if let Some(identity) = persisted_identity(record)? {
        return Ok((identity, false));
    }
    let identity = LogicalIdentity::mint();
    record
        .annotations
        .insert(IDENTITY_ANNOTATION.to_string(), identity.to_string());
    info!(name = %record.name, %identity, "Minted program identity");
    Ok((identity, true))
}

/// Cached kernel id, if present and well formed.
///
/// Best effort: a malformed value is logged and treated as absent.
#[must_use]
pub fn cached_kernel_id(record: &ProgramRecord) -> Option<KernelId> {
    let raw = record.annotation(KERNEL_ID_ANNOTATION)?;
    raw.parse::<KernelId>()
        .map_err(|_| Error::invalid_annotation(KERNEL_ID_ANNOTATION, format!("'{raw}' is not a u32")))
        .into_option_logged()
        .inspect(|id| debug!(name = %record.name, kernel_id = %id, "Cached kernel id"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use bpfsync_core::{BytecodeSource, ProgramSpec, ProgramType};

    use super::*;

    fn record() -> ProgramRecord {
        ProgramRecord::new(
            "trace1",
            ProgramSpec::new(
                ProgramType::Uprobe,
                "trace1",
                BytecodeSource::Path("/bin/true".into()),
            ),
        )
    }

    #[test]
    fn test_mints_once() {
        let mut record = record();
        let (first, changed) = ensure_identity(&mut record).unwrap();
        assert!(changed);
        let (second, changed) = ensure_identity(&mut record).unwrap();
        assert!(!changed);
        assert_eq!(first, second);
        assert_eq!(persisted_identity(&record).unwrap(), Some(first));
    }

    #[test]
    fn test_malformed_identity_is_not_replaced() {
        let mut record = record();
        record
            .annotations
            .insert(IDENTITY_ANNOTATION.to_string(), "not-a-uuid".to_string());
        assert!(matches!(
            ensure_identity(&mut record),
            Err(Error::InvalidAnnotation { .. })
        ));
        assert_eq!(record.annotation(IDENTITY_ANNOTATION), Some("not-a-uuid"));
    }

    #[test]
    fn test_cached_kernel_id() {
        let mut record = record();
        assert_eq!(cached_kernel_id(&record), None);

        record
            .annotations
            .insert(KERNEL_ID_ANNOTATION.to_string(), "42".to_string());
        assert_eq!(cached_kernel_id(&record), Some(KernelId::new(42)));

        record
            .annotations
            .insert(KERNEL_ID_ANNOTATION.to_string(), "-1".to_string());
        assert_eq!(cached_kernel_id(&record), None);
    }
}
