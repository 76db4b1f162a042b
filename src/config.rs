//! Configuration for the bpfsync binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bpfsync_core::SecretRef;
use bpfsync_daemon::DEFAULT_MAP_ROOT;
use bpfsync_reconciler::{InMemoryCredentialStore, ReconcilerConfig, RegistryCredentials};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the daemon socket path.
pub const SOCKET_ENV: &str = "BPFSYNC_SOCKET";

/// Environment variable overriding the map pin root.
pub const MAP_ROOT_ENV: &str = "BPFSYNC_MAP_ROOT";

/// Configuration for bpfsync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpfsyncConfig {
    /// Unix socket of the loader daemon.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Root of the daemon's map pin filesystem.
    #[serde(default = "default_map_root")]
    pub map_root: PathBuf,

    /// JSON document holding program records.
    #[serde(default = "default_records_path")]
    pub records_path: PathBuf,

    /// Timeout for one daemon round trip.
    #[serde(with = "duration_secs", default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,

    /// Requeue delay after recoverable failures.
    #[serde(with = "duration_secs", default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Cap on the unload backoff of deleting records.
    #[serde(with = "duration_secs", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Failed unloads tolerated before a deleting record is released.
    #[serde(default = "default_max_unload_attempts")]
    pub max_unload_attempts: u32,

    /// Pull secrets, each read from a Docker config file.
    #[serde(default)]
    pub pull_secrets: Vec<PullSecretFile>,
}

/// A pull secret backed by a Docker `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSecretFile {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub path: PathBuf,
}

impl Default for BpfsyncConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            map_root: default_map_root(),
            records_path: default_records_path(),
            rpc_timeout: default_rpc_timeout(),
            retry_delay: default_retry_delay(),
            max_backoff: default_max_backoff(),
            max_unload_attempts: default_max_unload_attempts(),
            pull_secrets: Vec::new(),
        }
    }
}

impl BpfsyncConfig {
    /// Load from a TOML file when given, then apply environment overrides.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply overrides from an environment lookup.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(socket) = lookup(SOCKET_ENV) {
            self.socket_path = socket.into();
        }
        if let Some(root) = lookup(MAP_ROOT_ENV) {
            self.map_root = root.into();
        }
        self
    }

    /// Engine settings.
    #[must_use]
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            retry_delay: self.retry_delay,
            max_backoff: self.max_backoff,
            max_unload_attempts: self.max_unload_attempts,
            ..ReconcilerConfig::default()
        }
    }

    /// Read every configured pull secret into a credential store.
    ///
    /// # Errors
    /// Returns an error if a Docker config file cannot be read or parsed.
    pub async fn credentials(&self) -> Result<InMemoryCredentialStore> {
        let store = InMemoryCredentialStore::new();
        for secret in &self.pull_secrets {
            let content = tokio::fs::read_to_string(&secret.path)
                .await
                .with_context(|| format!("Failed to read pull secret {}", secret.path.display()))?;
            let credentials = RegistryCredentials::from_docker_config(&content)
                .with_context(|| format!("Invalid pull secret {}", secret.path.display()))?;
            store
                .insert(SecretRef::new(&secret.name, &secret.namespace), credentials)
                .await;
        }
        Ok(store)
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/bpfd/bpfd.sock")
}

fn default_map_root() -> PathBuf {
    PathBuf::from(DEFAULT_MAP_ROOT)
}

fn default_records_path() -> PathBuf {
    PathBuf::from("/var/lib/bpfsync/records.json")
}

fn default_namespace() -> String {
    "default".to_string()
}

const fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

const fn default_max_unload_attempts() -> u32 {
    5
}

/// Duration as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use std::io::Write;

    use bpfsync_reconciler::CredentialStore;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = BpfsyncConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/run/bpfd/bpfd.sock"));
        assert_eq!(config.map_root, PathBuf::from("/run/bpfd/fs/maps"));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.max_unload_attempts, 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "socket_path = \"/tmp/bpfd.sock\"\nretry_delay = 2\n\n[[pull_secrets]]\nname = \"regcred\"\npath = \"/etc/bpfsync/regcred.json\""
        )
        .unwrap();

        let config = BpfsyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/bpfd.sock"));
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert_eq!(config.pull_secrets.len(), 1);
        assert_eq!(config.pull_secrets[0].namespace, "default");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retry_delay = \"soon\"").unwrap();
        assert!(BpfsyncConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = BpfsyncConfig::default().with_env(|key| match key {
            SOCKET_ENV => Some("/tmp/other.sock".to_string()),
            _ => None,
        });
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.map_root, PathBuf::from(DEFAULT_MAP_ROOT));
    }

    #[test]
    fn test_reconciler_settings() {
        let config = BpfsyncConfig {
            max_unload_attempts: 2,
            ..BpfsyncConfig::default()
        };
        let engine = config.reconciler();
        assert_eq!(engine.max_unload_attempts, 2);
        assert_eq!(engine.max_backoff, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_pull_secrets_loaded() {
        let mut docker = tempfile::NamedTempFile::new().unwrap();
        write!(
            docker,
            r#"{{"auths": {{"quay.io": {{"username": "robot", "password": "pw"}}}}}}"#
        )
        .unwrap();
        let config = BpfsyncConfig {
            pull_secrets: vec![PullSecretFile {
                name: "regcred".to_string(),
                namespace: "default".to_string(),
                path: docker.path().to_path_buf(),
            }],
            ..BpfsyncConfig::default()
        };

        let store = config.credentials().await.unwrap();
        let creds = store
            .lookup(&SecretRef::new("regcred", "default"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creds.for_domain("quay.io").map(|c| c.username.as_str()), Some("robot"));
    }
}
