//! Scratch directories for staged content.

use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::swap::remove_path;

/// A scratch directory that new content is materialized in before it is
/// promoted.
///
/// Creating a staging tree removes whatever an earlier, interrupted operation
/// left at the same location. The directory (or what is left of it after
/// promotion) is removed when the value is dropped, on success and on
/// failure alike.
#[derive(Debug)]
pub struct StagingTree {
    path: PathBuf,
}

impl StagingTree {
    /// Creates an empty staging directory at `path`.
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if fs::symlink_metadata(&path).is_ok() {
            remove_path(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// The staging directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingTree {
    fn drop(&mut self) {
        if fs::symlink_metadata(&self.path).is_err() {
            return;
        }
        if let Err(err) = remove_path(&self.path) {
            tracing::warn!(
                "failed to remove staging directory {}: {err}",
                self.path.display()
            );
        }
    }
}
