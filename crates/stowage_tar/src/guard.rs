//! Containment checks for archive entry names.
//!
//! Resolving a name happens in two layers. A cheap syntactic check rejects
//! absolute names and names with a `..` segment. The authoritative check then
//! canonicalizes the candidate path (following any symlinked ancestors that
//! already exist on disk) and requires the result to be a strict descendant of
//! the canonical destination root.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use fs_err as fs;

use crate::ArchiveError;

/// A canonicalized destination directory that archive entries are resolved
/// against.
#[derive(Debug, Clone)]
pub struct DestinationRoot {
    root: PathBuf,
}

impl DestinationRoot {
    /// Creates the destination directory if it does not exist yet and
    /// canonicalizes it.
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        fs::create_dir_all(path).map_err(ArchiveError::CouldNotCreateDestination)?;
        let root = fs::canonicalize(path).map_err(ArchiveError::CouldNotCreateDestination)?;
        Ok(Self { root })
    }

    /// Uses an existing directory as destination root.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        Ok(Self {
            root: fs::canonicalize(path)?,
        })
    }

    /// The canonical path of the root.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolves `raw_name` inside this root.
    ///
    /// Fails with [`ArchiveError::PathTraversal`] if the name is absolute,
    /// contains a `..` segment, or resolves (through symlinks) to a location
    /// that is not strictly below the root.
    pub fn resolve(&self, raw_name: &str) -> Result<PathBuf, ArchiveError> {
        let relative = check_name(raw_name)?;
        let candidate = self.root.join(relative);
        let Some(resolved) = canonicalize_lenient(&candidate)? else {
            return Err(traversal(raw_name));
        };
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(traversal(raw_name));
        }
        Ok(resolved)
    }
}

/// Resolves `raw_name` inside the existing directory `root`.
///
/// This canonicalizes `root` on every call, use [`DestinationRoot`] when
/// resolving many names against the same root.
pub fn resolve(root: &Path, raw_name: &str) -> Result<PathBuf, ArchiveError> {
    DestinationRoot::open(root)?.resolve(raw_name)
}

/// Syntactic part of the containment check. Returns the name as a relative
/// path without `.` components.
pub fn check_name(raw_name: &str) -> Result<PathBuf, ArchiveError> {
    let name = strip_current_dir(raw_name);
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return Err(traversal(raw_name));
    }
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(traversal(raw_name));
    }

    let mut relative = PathBuf::with_capacity(name.len());
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(traversal(raw_name));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(traversal(raw_name));
    }
    Ok(relative)
}

/// Removes any number of leading `./` from an archive name.
pub fn strip_current_dir(name: &str) -> &str {
    let mut name = name;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name
}

fn traversal(raw_name: &str) -> ArchiveError {
    if raw_name.is_empty() {
        ArchiveError::PathTraversal(String::from("<empty>"))
    } else {
        ArchiveError::PathTraversal(raw_name.to_owned())
    }
}

/// Canonicalizes the longest existing ancestor of `path` and appends the
/// missing components. Returns `None` if an ancestor is a dangling symlink,
/// creating anything below it would write wherever the link points.
fn canonicalize_lenient(path: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        match fs::canonicalize(current) {
            Ok(mut resolved) => {
                for part in missing.iter().rev() {
                    resolved.push(part);
                }
                return Ok(Some(resolved));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if fs::symlink_metadata(current).is_ok() {
                    return Ok(None);
                }
                let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
                    return Err(err);
                };
                missing.push(name.to_owned());
                current = parent;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case("file.txt", "file.txt")]
    #[case("./file.txt", "file.txt")]
    #[case("././nested/dir/file.txt", "nested/dir/file.txt")]
    #[case("dir/", "dir")]
    #[case("..hidden/file", "..hidden/file")]
    fn test_resolve_inside_root(#[case] name: &str, #[case] expected: &str) {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = DestinationRoot::create(temp_dir.path()).unwrap();
        let resolved = root.resolve(name).unwrap();
        assert_eq!(resolved, root.path().join(expected));
    }

    #[rstest]
    #[case("../../etc/passwd")]
    #[case("/etc/passwd")]
    #[case("data/../../escape")]
    #[case("data/..")]
    #[case("..")]
    #[case(".")]
    #[case("./")]
    #[case("")]
    fn test_resolve_rejects(#[case] name: &str) {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = DestinationRoot::create(temp_dir.path()).unwrap();
        assert_matches!(root.resolve(name), Err(ArchiveError::PathTraversal(_)));
    }

    #[test]
    fn test_free_function_uses_existing_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let resolved = resolve(temp_dir.path(), "a/b").unwrap();
        assert!(resolved.ends_with("a/b"));
        assert!(resolve(&temp_dir.path().join("missing"), "a").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_ancestor_escaping_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outside = temp_dir.path().join("outside");
        let dest = temp_dir.path().join("dest");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::os::unix::fs::symlink(&outside, dest.join("link")).unwrap();

        let root = DestinationRoot::open(&dest).unwrap();
        assert_matches!(
            root.resolve("link/passwd"),
            Err(ArchiveError::PathTraversal(name)) if name == "link/passwd"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_ancestor() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dest = temp_dir.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("nowhere"), dest.join("link")).unwrap();

        let root = DestinationRoot::open(&dest).unwrap();
        assert_matches!(root.resolve("link/file"), Err(ArchiveError::PathTraversal(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_is_allowed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dest = temp_dir.path().join("dest");
        std::fs::create_dir_all(dest.join("real")).unwrap();
        std::os::unix::fs::symlink(dest.join("real"), dest.join("alias")).unwrap();

        let root = DestinationRoot::open(&dest).unwrap();
        let resolved = root.resolve("alias/file").unwrap();
        assert_eq!(resolved, root.path().join("real/file"));
    }
}
