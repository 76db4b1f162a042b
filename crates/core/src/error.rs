//! Core error taxonomy for bpfsync operations.
//!
//! Every failure a reconciliation pass can hit is a variant here, so that the
//! engine can classify it (retry later, or surface as a hard failure) without
//! string matching.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for bpfsync operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Bytecode location
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("failed to look up pull secret '{namespace}/{name}': {reason}")]
    CredentialLookupFailed {
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("no registry credentials found in secret '{namespace}/{name}'")]
    NoCredentialsFound { name: String, namespace: String },

    // Daemon
    #[error("failed to load program via daemon: {cause}")]
    LoadFailed { cause: String },

    #[error("failed to unload program {kernel_id} via daemon: {cause}")]
    UnloadFailed { kernel_id: u32, cause: String },

    #[error("identity metadata missing: {context}")]
    MissingIdentityMetadata { context: String },

    #[error("{count} daemon programs carry identity {identity}")]
    AmbiguousIdentity { identity: String, count: usize },

    #[error("daemon RPC failed: {reason}")]
    Rpc { reason: String },

    // Map discovery
    #[error("failed to read map pin directory '{path}': {reason}")]
    FilesystemError { path: PathBuf, reason: String },

    // Records
    #[error("record '{name}' was modified concurrently")]
    WriteConflict { name: String },

    #[error("stale trigger '{name}': {reason}")]
    StaleTrigger { name: String, reason: String },

    #[error("record store error: {reason}")]
    Store { reason: String },

    #[error("invalid annotation '{key}': {reason}")]
    InvalidAnnotation { key: String, reason: String },

    #[error("metadata key '{key}' is reserved for the program identity")]
    ReservedMetadataKey { key: String },

    // Parsing and configuration
    #[error("unknown program type '{value}'")]
    UnknownProgramType { value: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create an invalid reference error.
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Create a credential lookup error.
    pub fn credential_lookup_failed(
        name: impl Into<String>,
        namespace: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CredentialLookupFailed {
            name: name.into(),
            namespace: namespace.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing credentials error.
    pub fn no_credentials_found(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::NoCredentialsFound {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a load failure.
    pub fn load_failed(cause: impl Into<String>) -> Self {
        Self::LoadFailed {
            cause: cause.into(),
        }
    }

    /// Create an unload failure.
    pub fn unload_failed(kernel_id: u32, cause: impl Into<String>) -> Self {
        Self::UnloadFailed {
            kernel_id,
            cause: cause.into(),
        }
    }

    /// Create a missing identity metadata error.
    pub fn missing_identity_metadata(context: impl Into<String>) -> Self {
        Self::MissingIdentityMetadata {
            context: context.into(),
        }
    }

    /// Create an ambiguous identity error.
    pub fn ambiguous_identity(identity: impl ToString, count: usize) -> Self {
        Self::AmbiguousIdentity {
            identity: identity.to_string(),
            count,
        }
    }

    /// Create an RPC failure.
    pub fn rpc(reason: impl Into<String>) -> Self {
        Self::Rpc {
            reason: reason.into(),
        }
    }

    /// Create a filesystem error.
    pub fn filesystem(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FilesystemError {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a write conflict error.
    pub fn write_conflict(name: impl Into<String>) -> Self {
        Self::WriteConflict { name: name.into() }
    }

    /// Create a stale trigger marker.
    pub fn stale_trigger(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StaleTrigger {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a store error.
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    /// Create an invalid annotation error.
    pub fn invalid_annotation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAnnotation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a reserved metadata key error.
    pub fn reserved_metadata_key(key: impl Into<String>) -> Self {
        Self::ReservedMetadataKey { key: key.into() }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether a later pass can be expected to succeed without intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LoadFailed { .. }
                | Self::UnloadFailed { .. }
                | Self::WriteConflict { .. }
                | Self::CredentialLookupFailed { .. }
                | Self::NoCredentialsFound { .. }
                | Self::Rpc { .. }
                | Self::Store { .. }
        )
    }

    /// Whether the daemon broke the identity contract.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::MissingIdentityMetadata { .. } | Self::AmbiguousIdentity { .. }
        )
    }
}
