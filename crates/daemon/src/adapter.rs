//! Typed wrapper over the daemon's Load, Unload and List calls.

use std::collections::HashMap;
use std::sync::Arc;

use bpfsync_core::{
    Error, IDENTITY_METADATA_KEY, KernelId, LogicalIdentity, MapTable, ProgramType, Result,
};
use tracing::{debug, info, instrument};

use crate::maps::MapDiscovery;
use crate::messages::{KernelInfo, ListRequest, ListResult, LoadRequest, UnloadRequest};
use crate::rpc::DaemonRpc;

/// A program the daemon has just loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedProgram {
    pub kernel_id: KernelId,
    pub info: KernelInfo,
    /// `None` when the daemon has not materialised a pin directory.
    pub maps: Option<MapTable>,
}

/// What the daemon holds for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    NotLoaded,
    Loaded(Box<ListResult>),
}

/// Daemon client adapter.
///
/// Converts RPC failures into the core error taxonomy and enforces the
/// identity-metadata contract on everything the daemon returns.
#[derive(Clone)]
pub struct DaemonAdapter {
    rpc: Arc<dyn DaemonRpc>,
    maps: MapDiscovery,
}

impl DaemonAdapter {
    /// Create an adapter over a raw RPC client.
    pub fn new(rpc: Arc<dyn DaemonRpc>, maps: MapDiscovery) -> Self {
        Self { rpc, maps }
    }

    /// Map discovery used after loads.
    #[must_use]
    pub const fn map_discovery(&self) -> &MapDiscovery {
        &self.maps
    }

    /// Load a program and discover its maps.
    ///
    /// The request metadata must already carry the identity key. Failures are
    /// reported once; nothing is retried here.
    ///
    /// # Errors
    /// - `MissingIdentityMetadata` if the request lacks the identity key
    /// - `LoadFailed` if the daemon call fails
    /// - `FilesystemError` if map discovery fails
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn load(&self, request: LoadRequest) -> Result<LoadedProgram> {
        if request.identity().is_none() {
            return Err(Error::missing_identity_metadata(format!(
                "load request for '{}' lacks '{IDENTITY_METADATA_KEY}'",
                request.name
            )));
        }

        let info = self
            .rpc
            .load(request)
            .await
            .map_err(|e| Error::load_failed(e.to_string()))?;
        let kernel_id = info.kernel_id();
        info!(%kernel_id, "Program loaded");

        let maps = self.discover_maps(kernel_id).await?;
        Ok(LoadedProgram {
            kernel_id,
            info,
            maps,
        })
    }

    /// Unload a program.
    ///
    /// # Errors
    /// `UnloadFailed` if the daemon call fails.
    #[instrument(skip(self))]
    pub async fn unload(&self, kernel_id: KernelId) -> Result<()> {
        self.rpc
            .unload(UnloadRequest {
                id: kernel_id.get(),
            })
            .await
            .map_err(|e| Error::unload_failed(kernel_id.get(), e.to_string()))?;
        info!("Program unloaded");
        Ok(())
    }

    /// Daemon-managed programs of one type, keyed by identity.
    ///
    /// # Errors
    /// - `Rpc` if the call fails
    /// - `MissingIdentityMetadata` if any entry lacks a well-formed identity
    /// - `AmbiguousIdentity` if two entries share an identity
    pub async fn list_managed(
        &self,
        program_type: ProgramType,
    ) -> Result<HashMap<LogicalIdentity, ListResult>> {
        let results = self
            .rpc
            .list(ListRequest::managed(program_type))
            .await
            .map_err(|e| Error::rpc(e.to_string()))?;

        let mut out = HashMap::with_capacity(results.len());
        for result in results {
            let identity = identity_of(&result)?;
            if out.insert(identity, result).is_some() {
                return Err(Error::ambiguous_identity(identity, 2));
            }
        }
        debug!(%program_type, count = out.len(), "Listed managed programs");
        Ok(out)
    }

    /// The program carrying `identity`, if loaded.
    ///
    /// # Errors
    /// - `Rpc` if the call fails
    /// - `AmbiguousIdentity` if more than one program carries it
    pub async fn get_by_identity(&self, identity: LogicalIdentity) -> Result<Observed> {
        let mut results = self
            .rpc
            .list(ListRequest::matching(
                IDENTITY_METADATA_KEY,
                identity.to_string(),
            ))
            .await
            .map_err(|e| Error::rpc(e.to_string()))?;

        match results.len() {
            0 => Ok(Observed::NotLoaded),
            1 => Ok(results
                .pop()
                .map_or(Observed::NotLoaded, |r| Observed::Loaded(Box::new(r)))),
            count => Err(Error::ambiguous_identity(identity, count)),
        }
    }

    /// Every program the daemon reports, unfiltered.
    ///
    /// # Errors
    /// `Rpc` if the call fails.
    pub async fn list_all(&self) -> Result<Vec<ListResult>> {
        self.rpc
            .list(ListRequest::all())
            .await
            .map_err(|e| Error::rpc(e.to_string()))
    }

    /// Map table of a loaded program, read off the blocking pool.
    ///
    /// # Errors
    /// `FilesystemError` on any failure other than an absent directory.
    pub async fn discover_maps(&self, kernel_id: KernelId) -> Result<Option<MapTable>> {
        let maps = self.maps.clone();
        tokio::task::spawn_blocking(move || maps.discover(kernel_id))
            .await
            .map_err(|e| Error::filesystem(self.maps.program_dir(kernel_id), e.to_string()))?
    }
}

fn identity_of(result: &ListResult) -> Result<LogicalIdentity> {
    let raw = result.identity().ok_or_else(|| {
        Error::missing_identity_metadata(format!(
            "program {} has no '{IDENTITY_METADATA_KEY}' metadata",
            result.info.id
        ))
    })?;
    raw.parse().map_err(|_| {
        Error::missing_identity_metadata(format!(
            "program {} carries malformed identity '{raw}'",
            result.info.id
        ))
    })
}
