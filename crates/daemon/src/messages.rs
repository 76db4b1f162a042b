//! Wire messages exchanged with the daemon.
//!
//! # Message Flow
//!
//! **Client → Daemon ([`DaemonRequest`])**: one of Load, Unload, List.
//!
//! **Daemon → Client ([`DaemonResponse`])**: the matching reply, or an
//! [`DaemonResponse::Error`] carrying a status code.
//!
//! Every call is a single request frame followed by a single response frame.
//! Types here stay bincode friendly: externally tagged enums only, no
//! skipped fields.

use std::collections::BTreeMap;

use bpfsync_core::{IDENTITY_METADATA_KEY, KernelId, ProgramType, PullPolicy};
use serde::{Deserialize, Serialize};

use crate::error::StatusCode;

/// Image location of bytecode, as the daemon receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLocation {
    pub url: String,
    /// Pull policy wire code (see [`PullPolicy::wire_code`]).
    pub image_pull_policy: i32,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ImageLocation {
    /// Pull policy decoded from its wire code.
    #[must_use]
    pub const fn pull_policy(&self) -> PullPolicy {
        PullPolicy::from_wire_code(self.image_pull_policy)
    }

    /// Copy of this location with credentials removed.
    #[must_use]
    pub fn without_credentials(&self) -> Self {
        Self {
            url: self.url.clone(),
            image_pull_policy: self.image_pull_policy,
            username: None,
            password: None,
        }
    }
}

/// Normalized load-location descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Image(ImageLocation),
    File(String),
}

impl Location {
    /// Whether two locations name the same bytecode. Credentials are ignored.
    #[must_use]
    pub fn same_source(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Image(a), Self::Image(b)) => {
                a.url == b.url && a.image_pull_policy == b.image_pull_policy
            }
            (Self::File(a), Self::File(b)) => a == b,
            _ => false,
        }
    }
}

/// Load a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub location: Location,
    pub name: String,
    /// Kernel program type code.
    pub program_type: u32,
    pub metadata: BTreeMap<String, String>,
    pub global_data: BTreeMap<String, Vec<u8>>,
    pub map_owner_id: Option<u32>,
}

impl LoadRequest {
    /// Identity carried in the request metadata, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.metadata.get(IDENTITY_METADATA_KEY).map(String::as_str)
    }
}

/// Unload a program by kernel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadRequest {
    pub id: u32,
}

/// List programs, optionally filtered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    pub program_type: Option<u32>,
    /// Every entry must match exactly.
    pub match_metadata: BTreeMap<String, String>,
    /// Only programs the daemon itself loaded.
    pub daemon_managed_only: Option<bool>,
}

impl ListRequest {
    /// Unfiltered listing.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Daemon-managed programs of one type.
    #[must_use]
    pub fn managed(program_type: ProgramType) -> Self {
        Self {
            program_type: Some(program_type.code()),
            match_metadata: BTreeMap::new(),
            daemon_managed_only: Some(true),
        }
    }

    /// Exact match on one metadata entry.
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_metadata = BTreeMap::new();
        match_metadata.insert(key.into(), value.into());
        Self {
            program_type: None,
            match_metadata,
            daemon_managed_only: None,
        }
    }
}

/// Kernel-reported facts about a loaded program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: u32,
    pub name: String,
    pub program_type: u32,
    pub loaded_at: String,
    pub tag: String,
    pub gpl_compatible: bool,
    pub map_ids: Vec<u32>,
    pub btf_id: u32,
    pub bytes_xlated: u32,
    pub jited: bool,
    pub bytes_jited: u32,
    pub bytes_memlock: u32,
    pub verified_insns: u32,
}

impl KernelInfo {
    /// Kernel id.
    #[must_use]
    pub const fn kernel_id(&self) -> KernelId {
        KernelId::new(self.id)
    }
}

/// One entry of a list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult {
    pub info: KernelInfo,
    /// Absent for programs the daemon did not load itself.
    pub location: Option<Location>,
    pub metadata: BTreeMap<String, String>,
    pub global_data: BTreeMap<String, Vec<u8>>,
    pub map_owner_id: Option<u32>,
}

impl ListResult {
    /// Kernel id.
    #[must_use]
    pub const fn kernel_id(&self) -> KernelId {
        self.info.kernel_id()
    }

    /// Identity metadata value, if present.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.metadata.get(IDENTITY_METADATA_KEY).map(String::as_str)
    }
}

/// Requests from client to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonRequest {
    Load(LoadRequest),
    Unload(UnloadRequest),
    List(ListRequest),
}

impl DaemonRequest {
    /// Call name, for logs and error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Unload(_) => "unload",
            Self::List(_) => "list",
        }
    }
}

/// Responses from daemon to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonResponse {
    Loaded(KernelInfo),
    Unloaded,
    Listed(Vec<ListResult>),
    Error { code: StatusCode, message: String },
}

impl DaemonResponse {
    /// Response name, for logs and error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Loaded(_) => "load",
            Self::Unloaded => "unload",
            Self::Listed(_) => "list",
            Self::Error { .. } => "error",
        }
    }

    /// Build an error response.
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}
