//! Bytecode location: image references, pull credentials and file paths.

use std::fmt;
use std::sync::{Arc, LazyLock};

use bpfsync_core::{BytecodeImage, BytecodeSource, Error, Result};
use bpfsync_daemon::{ImageLocation, Location};
use regex::Regex;
use tracing::debug;

use crate::credentials::CredentialStore;

/// Domain assumed for references without one.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Key credential stores use for the default registry.
pub const DEFAULT_INDEX_DOMAIN: &str = "https://index.docker.io/v1/";

const NAME_TOTAL_LENGTH_MAX: usize = 255;

static REFERENCE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let domain_component = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
    let domain = format!(r"{domain_component}(?:\.{domain_component})*(?::[0-9]+)?");
    let path_component = r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*";
    let name = format!(r"(?:{domain}/)?{path_component}(?:/{path_component})*");
    let tag = r"[\w][\w.-]{0,127}";
    let digest = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9A-Fa-f]{32,}";
    Regex::new(&format!(r"^({name})(?::({tag}))?(?:@({digest}))?$")).ok()
});

/// A registry image reference in canonical form: `domain/path[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse a fully qualified reference.
    ///
    /// The reference must already be canonical: `nginx` is rejected, while
    /// `docker.io/library/nginx` is accepted.
    ///
    /// # Errors
    /// `InvalidReference` if the grammar does not match, the name is too long
    /// or the reference is not canonical.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::invalid_reference(reference, reason);

        let regex = REFERENCE
            .as_ref()
            .ok_or_else(|| invalid("reference grammar unavailable"))?;
        let captures = regex
            .captures(reference)
            .ok_or_else(|| invalid("invalid reference format"))?;
        let name = captures
            .get(1)
            .map(|m| m.as_str())
            .ok_or_else(|| invalid("repository name missing"))?;
        if name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(invalid("repository name too long"));
        }

        let (domain, path) = split_domain(name);
        let parsed = Self {
            domain,
            path,
            tag: captures.get(2).map(|m| m.as_str().to_string()),
            digest: captures.get(3).map(|m| m.as_str().to_string()),
        };

        if parsed.to_string() != reference {
            return Err(invalid("repository name must be canonical"));
        }
        Ok(parsed)
    }

    /// Registry domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path within the registry.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if any.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Domain under which credential stores file this registry.
    #[must_use]
    pub fn credential_domain(&self) -> &str {
        credential_domain(&self.domain)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Map the default registry alias to the key credential stores use for it.
#[must_use]
pub fn credential_domain(domain: &str) -> &str {
    if domain.is_empty() || domain == DEFAULT_DOMAIN {
        DEFAULT_INDEX_DOMAIN
    } else {
        domain
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (domain, remainder) = match name.split_once('/') {
        Some((first, rest))
            if first == "localhost"
                || first.contains(['.', ':'])
                || first.chars().any(|c| c.is_ascii_uppercase()) =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };
    if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        return (domain, format!("library/{remainder}"));
    }
    (domain, remainder)
}

/// Resolves bytecode sources into daemon load locations.
///
/// Credentials are fetched per call and never cached.
#[derive(Clone)]
pub struct BytecodeLocator {
    credentials: Arc<dyn CredentialStore>,
}

impl BytecodeLocator {
    /// Locator backed by a credential store.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Location without credentials, for comparison with what the daemon
    /// reports. Validates image references.
    ///
    /// # Errors
    /// `InvalidReference` for an unparseable image reference.
    pub fn describe(&self, source: &BytecodeSource) -> Result<Location> {
        match source {
            BytecodeSource::Image(image) => {
                ImageReference::parse(&image.url)?;
                Ok(Location::Image(bare_image(image)))
            }
            BytecodeSource::Path(path) => Ok(Location::File(path.display().to_string())),
        }
    }

    /// Location to load from, with credentials for the image's registry.
    ///
    /// # Errors
    /// - `InvalidReference` for an unparseable image reference
    /// - `CredentialLookupFailed` if the secret store errors
    /// - `NoCredentialsFound` if the referenced secret does not exist
    pub async fn locate(&self, source: &BytecodeSource) -> Result<Location> {
        let BytecodeSource::Image(image) = source else {
            return self.describe(source);
        };
        let reference = ImageReference::parse(&image.url)?;
        let mut location = bare_image(image);

        if let Some(secret) = &image.pull_secret {
            let credentials = self
                .credentials
                .lookup(secret)
                .await
                .map_err(|e| {
                    Error::credential_lookup_failed(&secret.name, &secret.namespace, e.to_string())
                })?
                .ok_or_else(|| Error::no_credentials_found(&secret.name, &secret.namespace))?;

            let domain = reference.credential_domain();
            match credentials.for_domain(domain) {
                Some(credential) => {
                    location.username = Some(credential.username.clone());
                    location.password = Some(credential.password.clone());
                }
                None => debug!(%secret, domain, "Pull secret holds no entry for registry"),
            }
        }

        Ok(Location::Image(location))
    }
}

fn bare_image(image: &BytecodeImage) -> ImageLocation {
    ImageLocation {
        url: image.url.clone(),
        image_pull_policy: image.pull_policy.wire_code(),
        username: None,
        password: None,
    }
}
