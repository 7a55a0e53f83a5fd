//! Promotion of staged content into its final location.
//!
//! A swap moves the old content aside, moves the staged content into place and
//! finally removes the old content. Renames are only atomic when the staged
//! path, the destination and the aside location live on the same filesystem;
//! callers are expected to stage next to the destination. If a rename is not
//! possible the content is copied instead, which is reported as
//! [`SwapMethod::Copy`] because an observer may see a partially copied
//! destination while it runs.

use std::fmt;
use std::fmt::Formatter;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs_err as fs;

/// How the staged content ended up at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapMethod {
    /// The staged content was renamed onto the destination in a single
    /// filesystem operation.
    Rename,

    /// Renaming was not possible so the staged content was copied and then
    /// removed. The destination was not replaced atomically.
    Copy,
}

impl fmt::Display for SwapMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SwapMethod::Rename => write!(f, "rename"),
            SwapMethod::Copy => write!(f, "copy"),
        }
    }
}

/// An error that can occur while swapping content into place.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// There is nothing to promote.
    #[error("the staged content at {0} does not exist")]
    MissingStaged(PathBuf),

    /// A leftover from an earlier swap could not be removed. Nothing was
    /// changed yet.
    #[error("failed to remove the stale aside location {0}")]
    ClearAside(PathBuf, #[source] std::io::Error),

    /// The old content could neither be moved aside nor removed. The
    /// destination may be partially removed.
    #[error("failed to move the old content at {0} out of the way")]
    MoveAside(PathBuf, #[source] std::io::Error),

    /// The staged content could neither be renamed nor copied into place.
    #[error("failed to promote {staged} to {destination}")]
    Promote {
        /// The staged content.
        staged: PathBuf,
        /// The final location.
        destination: PathBuf,
        /// The error of the copy fallback.
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Directory,
    File,
}

/// Replaces the directory at `destination` with the directory at `staged`.
///
/// `aside` is a scratch location the old directory is renamed to. It should be
/// on the same filesystem as `destination` and is removed before and after the
/// swap.
///
/// If the staged content cannot be promoted the old content is renamed back
/// from `aside`. When the old content could not be moved aside in the first
/// place it was deleted instead, and a failed promotion then leaves the
/// destination empty.
pub fn swap_directory(
    staged: &Path,
    destination: &Path,
    aside: &Path,
) -> Result<SwapMethod, SwapError> {
    swap(staged, destination, aside, Kind::Directory)
}

/// Replaces the file at `destination` with the file at `staged`, see
/// [`swap_directory`].
pub fn swap_file(staged: &Path, destination: &Path, aside: &Path) -> Result<SwapMethod, SwapError> {
    swap(staged, destination, aside, Kind::File)
}

fn swap(
    staged: &Path,
    destination: &Path,
    aside: &Path,
    kind: Kind,
) -> Result<SwapMethod, SwapError> {
    swap_with(staged, destination, aside, |staged, destination| {
        promote(staged, destination, kind)
    })
}

fn swap_with(
    staged: &Path,
    destination: &Path,
    aside: &Path,
    promote: impl FnOnce(&Path, &Path) -> std::io::Result<SwapMethod>,
) -> Result<SwapMethod, SwapError> {
    if fs::symlink_metadata(staged).is_err() {
        return Err(SwapError::MissingStaged(staged.to_path_buf()));
    }

    if exists(aside) {
        remove_path(aside).map_err(|err| SwapError::ClearAside(aside.to_path_buf(), err))?;
    }

    // Step 1: get the old content out of the way.
    let mut moved_aside = false;
    if exists(destination) {
        if let Some(parent) = aside.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                tracing::debug!("could not create {} ({err})", parent.display());
            }
        }
        match fs::rename(destination, aside) {
            Ok(()) => moved_aside = true,
            Err(err) => {
                tracing::debug!(
                    "could not move {} aside ({err}), removing it instead",
                    destination.display()
                );
                remove_path(destination)
                    .map_err(|err| SwapError::MoveAside(destination.to_path_buf(), err))?;
            }
        }
    }

    // Step 2: promote the staged content.
    let method = match promote(staged, destination) {
        Ok(method) => method,
        Err(err) => {
            if moved_aside {
                restore(aside, destination);
            }
            return Err(SwapError::Promote {
                staged: staged.to_path_buf(),
                destination: destination.to_path_buf(),
                source: err,
            });
        }
    };

    // Step 3: the old content is no longer needed.
    if moved_aside {
        if let Err(err) = remove_path(aside) {
            tracing::warn!("failed to remove {}: {err}", aside.display());
        }
    }

    Ok(method)
}

fn promote(staged: &Path, destination: &Path, kind: Kind) -> std::io::Result<SwapMethod> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(staged, destination) {
        Ok(()) => return Ok(SwapMethod::Rename),
        Err(err) => tracing::debug!(
            "could not rename {} to {} ({err}), copying instead",
            staged.display(),
            destination.display()
        ),
    }

    let copied = match kind {
        Kind::Directory => copy_tree(staged, destination),
        Kind::File => fs::copy(staged, destination).map(|_| ()),
    };
    if let Err(err) = copied {
        if exists(destination) {
            let _ = remove_path(destination);
        }
        return Err(err);
    }

    if let Err(err) = remove_path(staged) {
        tracing::warn!("failed to remove {}: {err}", staged.display());
    }
    Ok(SwapMethod::Copy)
}

/// Puts the old content back after a failed promotion.
fn restore(aside: &Path, destination: &Path) {
    if exists(destination) {
        if let Err(err) = remove_path(destination) {
            tracing::warn!(
                "failed to clear {} before restoring the old content: {err}",
                destination.display()
            );
            return;
        }
    }
    if let Err(err) = fs::rename(aside, destination) {
        tracing::warn!(
            "failed to restore the old content of {} from {}: {err}",
            destination.display(),
            aside.display()
        );
    }
}

/// Recursively copies the directory `source` to `destination`. Symlinks are
/// copied as the files or directories they point to.
pub fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in walkdir::WalkDir::new(source)
        .min_depth(1)
        .follow_links(true)
    {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| std::io::Error::new(ErrorKind::InvalidInput, err))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Removes a file, a symlink or a whole directory tree.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Like [`Path::exists`] but also true for dangling symlinks.
fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
