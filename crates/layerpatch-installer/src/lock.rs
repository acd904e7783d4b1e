use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{io_error, Phase, PatchError};
use crate::layout::InstallationLayout;

/// Exclusive advisory lock over one installation, released on drop.
#[derive(Debug)]
pub struct InstallationLock {
    _file: File,
    path: PathBuf,
}

impl InstallationLock {
    pub fn acquire(layout: &InstallationLayout, wait: bool) -> Result<Self, PatchError> {
        let path = layout.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(Phase::Validating, parent.display()))?;
        }

        // The lock file is never unlinked: removing a file another process still
        // holds would let a third process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error(Phase::Validating, path.display()))?;

        if wait {
            file.lock_exclusive()
                .map_err(io_error(Phase::Validating, path.display()))?;
        } else if file.try_lock_exclusive().is_err() {
            return Err(PatchError::Locked { path });
        }

        debug!(path = %path.display(), "installation lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
