use crate::constants::dirs;
use crate::errors::DomainError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Directory-presence lock on a working directory.
///
/// The marker is removed on drop. A marker left behind by a killed process is
/// not detected as stale and has to be removed by hand.
#[derive(Debug)]
pub struct ExecutionLock {
    marker: PathBuf,
    released: bool,
}

impl ExecutionLock {
    pub fn marker_path(working_dir: &Path) -> PathBuf {
        working_dir.join(dirs::LOCK)
    }

    pub fn acquire(working_dir: &Path) -> Result<Self, DomainError> {
        let marker = Self::marker_path(working_dir);
        match std::fs::create_dir(&marker) {
            Ok(()) => {
                tracing::debug!("Acquired execution lock at '{}'", marker.display());
                Ok(Self {
                    marker,
                    released: false,
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(DomainError::AlreadyLocked(working_dir.to_path_buf()))
            }
            Err(source) => Err(DomainError::LockIo {
                path: marker,
                source,
            }),
        }
    }

    pub fn is_locked(working_dir: &Path) -> bool {
        Self::marker_path(working_dir).is_dir()
    }

    pub fn path(&self) -> &Path {
        &self.marker
    }

    pub fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        remove_marker(&self.marker)
    }
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_marker(&self.marker) {
            tracing::warn!(
                "Failed to remove lock marker '{}': {}",
                self.marker.display(),
                e
            );
        }
    }
}

fn remove_marker(marker: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
