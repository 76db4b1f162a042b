//! In-memory daemon for tests and dry runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{RpcError, StatusCode};
use crate::messages::{
    DaemonRequest, DaemonResponse, KernelInfo, ListRequest, ListResult, Location, LoadRequest,
    UnloadRequest,
};
use crate::rpc::{DaemonRpc, expect_listed, expect_loaded, expect_unloaded};

/// Number of calls the daemon has served, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub load: usize,
    pub unload: usize,
    pub list: usize,
}

impl CallCounts {
    /// Load and unload calls; lists do not mutate the daemon.
    #[must_use]
    pub const fn mutations(&self) -> usize {
        self.load.saturating_add(self.unload)
    }
}

struct Entry {
    result: ListResult,
    managed: bool,
}

struct PinConfig {
    root: PathBuf,
    map_names: Vec<String>,
}

#[derive(Default)]
struct State {
    last_id: u32,
    programs: BTreeMap<u32, Entry>,
    calls: CallCounts,
    failing_loads: u32,
    failing_unloads: u32,
    failing_lists: u32,
    pins: Option<PinConfig>,
}

impl State {
    fn next_id(&mut self) -> Option<u32> {
        self.last_id = self.last_id.checked_add(1)?;
        Some(self.last_id)
    }
}

/// A program table held in memory, answering the daemon protocol.
///
/// Assigns increasing kernel ids, honours list filters, counts calls and can
/// be told to fail upcoming calls. Optionally materialises map pin files under
/// a root directory the way the real daemon does.
#[derive(Default)]
pub struct InMemoryDaemon {
    state: Mutex<State>,
}

impl InMemoryDaemon {
    /// Create an empty daemon.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin one file per map name under `<root>/<kernel id>/` on every load.
    #[must_use]
    pub fn with_map_pins(self, root: impl Into<PathBuf>, map_names: &[&str]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.pins = Some(PinConfig {
                root: root.into(),
                map_names: map_names.iter().map(|n| (*n).to_string()).collect(),
            });
        }
        self
    }

    fn state(&self) -> Option<MutexGuard<'_, State>> {
        self.state.lock().ok()
    }

    /// Calls served so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.state().map(|s| s.calls).unwrap_or_default()
    }

    /// Forget call counts.
    pub fn reset_calls(&self) {
        if let Some(mut state) = self.state() {
            state.calls = CallCounts::default();
        }
    }

    /// Snapshot of every resident program, ordered by kernel id.
    #[must_use]
    pub fn programs(&self) -> Vec<ListResult> {
        self.state()
            .map(|s| s.programs.values().map(|e| e.result.clone()).collect())
            .unwrap_or_default()
    }

    /// Fail the next `times` load calls.
    pub fn fail_loads(&self, times: u32) {
        if let Some(mut state) = self.state() {
            state.failing_loads = times;
        }
    }

    /// Fail the next `times` unload calls.
    pub fn fail_unloads(&self, times: u32) {
        if let Some(mut state) = self.state() {
            state.failing_unloads = times;
        }
    }

    /// Fail the next `times` list calls.
    pub fn fail_lists(&self, times: u32) {
        if let Some(mut state) = self.state() {
            state.failing_lists = times;
        }
    }

    /// Make a program resident as if loaded, bypassing validation.
    ///
    /// `managed` marks whether the daemon itself loaded it. Returns the
    /// assigned kernel id.
    pub fn insert(&self, mut result: ListResult, managed: bool) -> Option<u32> {
        let mut state = self.state()?;
        let id = state.next_id()?;
        result.info.id = id;
        state.programs.insert(id, Entry { result, managed });
        Some(id)
    }

    /// Reassign fresh kernel ids to every resident program, as a daemon
    /// restart that reloads its programs would.
    pub fn churn_ids(&self) {
        if let Some(mut state) = self.state() {
            let entries: Vec<Entry> = std::mem::take(&mut state.programs).into_values().collect();
            for mut entry in entries {
                let Some(id) = state.next_id() else { return };
                entry.result.info.id = id;
                state.programs.insert(id, entry);
            }
        }
    }

    /// Answer one protocol request.
    pub fn handle(&self, request: DaemonRequest) -> DaemonResponse {
        let Some(mut state) = self.state() else {
            return DaemonResponse::error(StatusCode::Internal, "daemon state poisoned");
        };
        match request {
            DaemonRequest::Load(request) => load(&mut state, request),
            DaemonRequest::Unload(request) => unload(&mut state, request),
            DaemonRequest::List(request) => list(&mut state, &request),
        }
    }
}

fn load(state: &mut State, request: LoadRequest) -> DaemonResponse {
    state.calls.load = state.calls.load.saturating_add(1);
    if state.failing_loads > 0 {
        state.failing_loads = state.failing_loads.saturating_sub(1);
        return DaemonResponse::error(StatusCode::Unavailable, "injected load failure");
    }
    if request.name.is_empty() {
        return DaemonResponse::error(StatusCode::InvalidArgument, "program name is empty");
    }
    let Some(id) = state.next_id() else {
        return DaemonResponse::error(StatusCode::Internal, "kernel id space exhausted");
    };

    let map_ids = match &state.pins {
        Some(pins) => match pin_maps(pins, id) {
            Ok(ids) => ids,
            Err(message) => return DaemonResponse::error(StatusCode::Internal, message),
        },
        None => Vec::new(),
    };

    let info = KernelInfo {
        id,
        name: request.name.clone(),
        program_type: request.program_type,
        loaded_at: Utc::now().to_rfc3339(),
        tag: format!("{:016x}", u64::from(id).wrapping_mul(0x9e37_79b9_7f4a_7c15)),
        gpl_compatible: true,
        map_ids,
        btf_id: id,
        bytes_xlated: 96,
        jited: true,
        bytes_jited: 64,
        bytes_memlock: 4096,
        verified_insns: 12,
    };

    let location = match request.location {
        Location::Image(image) => Location::Image(image.without_credentials()),
        file @ Location::File(_) => file,
    };

    state.programs.insert(
        id,
        Entry {
            result: ListResult {
                info: info.clone(),
                location: Some(location),
                metadata: request.metadata,
                global_data: request.global_data,
                map_owner_id: request.map_owner_id,
            },
            managed: true,
        },
    );
    DaemonResponse::Loaded(info)
}

fn pin_maps(pins: &PinConfig, id: u32) -> Result<Vec<u32>, String> {
    let dir = pins.root.join(id.to_string());
    std::fs::create_dir_all(&dir).map_err(|e| format!("creating {}: {e}", dir.display()))?;
    let base = id.saturating_mul(100);
    pins.map_names
        .iter()
        .zip(1u32..)
        .map(|(name, offset)| {
            let path = dir.join(name);
            std::fs::write(&path, b"").map_err(|e| format!("pinning {}: {e}", path.display()))?;
            Ok(base.saturating_add(offset))
        })
        .collect()
}

fn unload(state: &mut State, request: UnloadRequest) -> DaemonResponse {
    state.calls.unload = state.calls.unload.saturating_add(1);
    if state.failing_unloads > 0 {
        state.failing_unloads = state.failing_unloads.saturating_sub(1);
        return DaemonResponse::error(StatusCode::Unavailable, "injected unload failure");
    }
    if state.programs.remove(&request.id).is_none() {
        return DaemonResponse::error(
            StatusCode::NotFound,
            format!("no program with id {}", request.id),
        );
    }
    if let Some(pins) = &state.pins {
        let _ = std::fs::remove_dir_all(pins.root.join(request.id.to_string()));
    }
    DaemonResponse::Unloaded
}

fn list(state: &mut State, request: &ListRequest) -> DaemonResponse {
    state.calls.list = state.calls.list.saturating_add(1);
    if state.failing_lists > 0 {
        state.failing_lists = state.failing_lists.saturating_sub(1);
        return DaemonResponse::error(StatusCode::Unavailable, "injected list failure");
    }
    let managed_only = request.daemon_managed_only.unwrap_or(false);
    let results = state
        .programs
        .values()
        .filter(|e| !managed_only || e.managed)
        .filter(|e| {
            request
                .program_type
                .is_none_or(|code| e.result.info.program_type == code)
        })
        .filter(|e| {
            request
                .match_metadata
                .iter()
                .all(|(k, v)| e.result.metadata.get(k) == Some(v))
        })
        .map(|e| e.result.clone())
        .collect();
    DaemonResponse::Listed(results)
}

#[async_trait]
impl DaemonRpc for InMemoryDaemon {
    async fn load(&self, request: LoadRequest) -> Result<KernelInfo, RpcError> {
        expect_loaded(self.handle(DaemonRequest::Load(request)))
    }

    async fn unload(&self, request: UnloadRequest) -> Result<(), RpcError> {
        expect_unloaded(self.handle(DaemonRequest::Unload(request)))
    }

    async fn list(&self, request: ListRequest) -> Result<Vec<ListResult>, RpcError> {
        expect_listed(self.handle(DaemonRequest::List(request)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn load_request(name: &str, program_type: u32) -> LoadRequest {
        LoadRequest {
            location: Location::File("/bin/true".to_string()),
            name: name.to_string(),
            program_type,
            metadata: BTreeMap::new(),
            global_data: BTreeMap::new(),
            map_owner_id: None,
        }
    }

    #[tokio::test]
    async fn test_load_assigns_increasing_ids() {
        let daemon = InMemoryDaemon::new();
        let a = daemon.load(load_request("a", 2)).await.unwrap();
        let b = daemon.load(load_request("b", 2)).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(daemon.calls().load, 2);
    }

    #[tokio::test]
    async fn test_list_filters_by_type_and_metadata() {
        let daemon = InMemoryDaemon::new();
        let mut tagged = load_request("tagged", 6);
        tagged.metadata.insert("k".to_string(), "v".to_string());
        daemon.load(tagged).await.unwrap();
        daemon.load(load_request("other", 2)).await.unwrap();

        let xdp = daemon
            .list(ListRequest {
                program_type: Some(6),
                ..ListRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(xdp.len(), 1);

        let matched = daemon.list(ListRequest::matching("k", "v")).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched.first().map(|r| r.info.name.as_str()), Some("tagged"));
    }

    #[tokio::test]
    async fn test_unload_unknown_id_is_not_found() {
        let daemon = InMemoryDaemon::new();
        let err = daemon.unload(UnloadRequest { id: 9 }).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Status {
                code: StatusCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let daemon = InMemoryDaemon::new();
        daemon.fail_loads(1);
        assert!(daemon.load(load_request("a", 2)).await.is_err());
        assert!(daemon.load(load_request("a", 2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_managed_only_hides_foreign_programs() {
        let daemon = InMemoryDaemon::new();
        daemon.insert(
            ListResult {
                info: KernelInfo {
                    program_type: 6,
                    ..KernelInfo::default()
                },
                location: None,
                metadata: BTreeMap::new(),
                global_data: BTreeMap::new(),
                map_owner_id: None,
            },
            false,
        );
        let all = daemon.list(ListRequest::all()).await.unwrap();
        assert_eq!(all.len(), 1);
        let managed = daemon
            .list(ListRequest::managed(bpfsync_core::ProgramType::Xdp))
            .await
            .unwrap();
        assert!(managed.is_empty());
    }

    #[tokio::test]
    async fn test_churn_ids_keeps_programs() {
        let daemon = InMemoryDaemon::new();
        let before = daemon.load(load_request("a", 2)).await.unwrap();
        daemon.churn_ids();
        let programs = daemon.programs();
        assert_eq!(programs.len(), 1);
        assert_ne!(programs.first().map(|p| p.info.id), Some(before.id));
    }
}
