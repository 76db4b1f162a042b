//! Core domain types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::program_type::ProgramType;

/// Reserved metadata key carrying the logical identity of a loaded program.
pub const IDENTITY_METADATA_KEY: &str = "bpfd.dev/uuid";

/// Stable identity of a desired program instance.
///
/// Minted once per record and never reused. Survives daemon restarts and
/// kernel id churn; the daemon sees it as program metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalIdentity(Uuid);

impl LogicalIdentity {
    /// Mint a fresh random identity.
    #[must_use]
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LogicalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for LogicalIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::invalid_annotation(IDENTITY_METADATA_KEY, e.to_string()))
    }
}

/// Daemon-assigned kernel program id. Only valid while the program stays loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(u32);

impl KernelId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KernelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|e| Error::invalid_annotation("kernel id", format!("'{s}': {e}")))
    }
}

/// Map name to pin path for one loaded program.
pub type MapTable = BTreeMap<String, PathBuf>;

/// Image pull policy.
///
/// Policies are a closed set validated upstream; anything unrecognised
/// decodes to `IfNotPresent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    /// Daemon wire code.
    #[must_use]
    pub const fn wire_code(self) -> i32 {
        match self {
            Self::Always => 0,
            Self::IfNotPresent => 1,
            Self::Never => 2,
        }
    }

    /// Decode a wire code, defaulting to `IfNotPresent`.
    #[must_use]
    pub const fn from_wire_code(code: i32) -> Self {
        match code {
            0 => Self::Always,
            2 => Self::Never,
            _ => Self::IfNotPresent,
        }
    }

    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl From<&str> for PullPolicy {
    fn from(value: &str) -> Self {
        match value {
            "Always" => Self::Always,
            "Never" => Self::Never,
            _ => Self::IfNotPresent,
        }
    }
}

impl From<String> for PullPolicy {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<PullPolicy> for String {
    fn from(value: PullPolicy) -> Self {
        value.as_str().to_string()
    }
}

/// Reference to a pull secret in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

impl SecretRef {
    /// Create a secret reference.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Bytecode packaged in a container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeImage {
    pub url: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<SecretRef>,
}

impl BytecodeImage {
    /// Image with the default pull policy and no credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pull_policy: PullPolicy::default(),
            pull_secret: None,
        }
    }

    /// Set the pull policy.
    #[must_use]
    pub const fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Reference a pull secret.
    #[must_use]
    pub fn with_pull_secret(mut self, secret: SecretRef) -> Self {
        self.pull_secret = Some(secret);
        self
    }
}

/// Where a program's bytecode comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BytecodeSource {
    Image(BytecodeImage),
    Path(PathBuf),
}

/// Desired state of one program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub program_type: ProgramType,
    pub name: String,
    pub bytecode: BytecodeSource,
    #[serde(default)]
    pub global_data: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_owner_id: Option<u32>,
}

impl ProgramSpec {
    /// Create a spec with no metadata, global data or map owner.
    pub fn new(program_type: ProgramType, name: impl Into<String>, bytecode: BytecodeSource) -> Self {
        Self {
            program_type,
            name: name.into(),
            bytecode,
            global_data: BTreeMap::new(),
            metadata: BTreeMap::new(),
            map_owner_id: None,
        }
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a global data entry.
    #[must_use]
    pub fn with_global_data(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.global_data.insert(name.into(), bytes);
        self
    }

    /// Share maps with an already loaded program.
    #[must_use]
    pub const fn with_map_owner(mut self, owner: u32) -> Self {
        self.map_owner_id = Some(owner);
        self
    }

    /// Reject user metadata that would shadow the identity key.
    ///
    /// # Errors
    /// `ReservedMetadataKey` if [`IDENTITY_METADATA_KEY`] is among the entries.
    pub fn validate(&self) -> Result<(), Error> {
        if self.metadata.contains_key(IDENTITY_METADATA_KEY) {
            return Err(Error::reserved_metadata_key(IDENTITY_METADATA_KEY));
        }
        Ok(())
    }

    /// Metadata as sent to the daemon: the user's entries plus the identity key.
    #[must_use]
    pub fn daemon_metadata(&self, identity: LogicalIdentity) -> BTreeMap<String, String> {
        let mut metadata = self.metadata.clone();
        metadata.insert(IDENTITY_METADATA_KEY.to_string(), identity.to_string());
        metadata
    }
}
