//! Registry credential lookup for pull secrets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bpfsync_core::SecretRef;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};

/// Username and password for one registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

impl RegistryCredential {
    /// Credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials held by one pull secret, keyed by registry domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    by_domain: BTreeMap<String, RegistryCredential>,
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth: Option<String>,
}

impl RegistryCredentials {
    /// Empty credential set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credentials for `domain`.
    #[must_use]
    pub fn with(mut self, domain: impl Into<String>, credential: RegistryCredential) -> Self {
        self.by_domain.insert(domain.into(), credential);
        self
    }

    /// Credentials for `domain`, if any.
    #[must_use]
    pub fn for_domain(&self, domain: &str) -> Option<&RegistryCredential> {
        self.by_domain.get(domain)
    }

    /// Parse a Docker config document (`{"auths": {domain: {...}}}`).
    ///
    /// Each entry carries either `username` and `password`, or `auth` holding
    /// base64 of `username:password`.
    ///
    /// # Errors
    /// `Malformed` if the JSON, base64 or `auth` layout is invalid.
    pub fn from_docker_config(json: &str) -> StoreResult<Self> {
        let config: DockerConfig = serde_json::from_str(json)
            .map_err(|e| StoreError::malformed(format!("docker config: {e}")))?;

        let mut by_domain = BTreeMap::new();
        for (domain, auth) in config.auths {
            let credential = match (auth.username, auth.password, auth.auth) {
                (Some(username), Some(password), _) => RegistryCredential { username, password },
                (_, _, Some(encoded)) => decode_auth(&domain, &encoded)?,
                _ => {
                    return Err(StoreError::malformed(format!(
                        "docker config entry for '{domain}' has no credentials"
                    )));
                }
            };
            by_domain.insert(domain, credential);
        }
        Ok(Self { by_domain })
    }
}

fn decode_auth(domain: &str, encoded: &str) -> StoreResult<RegistryCredential> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| StoreError::malformed(format!("auth for '{domain}': {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| StoreError::malformed(format!("auth for '{domain}': {e}")))?;
    let (username, password) = text.split_once(':').ok_or_else(|| {
        StoreError::malformed(format!("auth for '{domain}' is not username:password"))
    })?;
    Ok(RegistryCredential::new(username, password))
}

/// Secret store lookup for pull secrets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credentials held by a secret. `Ok(None)` when the secret does not exist.
    async fn lookup(&self, secret: &SecretRef) -> StoreResult<Option<RegistryCredentials>>;
}

/// In-memory credential store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    secrets: RwLock<HashMap<SecretRef, RegistryCredentials>>,
    unavailable: RwLock<Option<String>>,
}

impl InMemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a secret.
    pub async fn insert(&self, secret: SecretRef, credentials: RegistryCredentials) {
        self.secrets.write().await.insert(secret, credentials);
    }

    /// Make every lookup fail with `reason`, or succeed again with `None`.
    pub async fn set_unavailable(&self, reason: Option<String>) {
        *self.unavailable.write().await = reason;
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn lookup(&self, secret: &SecretRef) -> StoreResult<Option<RegistryCredentials>> {
        if let Some(reason) = self.unavailable.read().await.as_ref() {
            return Err(StoreError::backend(reason.clone()));
        }
        Ok(self.secrets.read().await.get(secret).cloned())
    }
}
