use std::path::{Path, PathBuf};

/// A path to a filesystem entry that gets unlinked when this structure is dropped.
///
/// Used for the listening socket's bind path: the endpoint owns the path's lifetime
/// for as long as the socket is alive.
pub struct UnlinkOnDrop {
    path: PathBuf,
}

impl UnlinkOnDrop {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for UnlinkOnDrop {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::warn!("failed to unlink socket path {}: {err}", self.path.display());
        }
    }
}
