//! Discovery of map pins the daemon creates for loaded programs.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bpfsync_core::{Error, KernelId, MapTable, Result};
use tracing::debug;
use walkdir::WalkDir;

/// Default root of the daemon's map pin filesystem.
pub const DEFAULT_MAP_ROOT: &str = "/run/bpfd/fs/maps";

/// Reads `<root>/<kernel id>/` to find a program's pinned maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDiscovery {
    root: PathBuf,
}

impl Default for MapDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_ROOT)
    }
}

impl MapDiscovery {
    /// Discover under a given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pin root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pin directory of one program.
    #[must_use]
    pub fn program_dir(&self, kernel_id: KernelId) -> PathBuf {
        self.root.join(kernel_id.to_string())
    }

    /// Map name to pin path for a program.
    ///
    /// Returns `Ok(None)` when the program directory does not exist (nothing
    /// pinned yet) and `Ok(Some(empty))` when it exists without maps.
    ///
    /// # Errors
    /// `FilesystemError` for any failure other than the directory being absent.
    pub fn discover(&self, kernel_id: KernelId) -> Result<Option<MapTable>> {
        let dir = self.program_dir(kernel_id);

        match std::fs::symlink_metadata(&dir) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %dir.display(), "Program map path does not exist");
                return Ok(None);
            }
            Err(e) => return Err(Error::filesystem(&dir, e.to_string())),
        }

        let mut maps = MapTable::new();
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // Removed between the existence check and the walk.
                Err(e)
                    if e.depth() == 0
                        && e.io_error().map(std::io::Error::kind) == Some(ErrorKind::NotFound) =>
                {
                    return Ok(None);
                }
                Err(e) => {
                    let path = e.path().map_or_else(|| dir.clone(), Path::to_path_buf);
                    return Err(Error::filesystem(path, e.to_string()));
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            maps.insert(name, entry.into_path());
        }

        Ok(Some(maps))
    }
}
