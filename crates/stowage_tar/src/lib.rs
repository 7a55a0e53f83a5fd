#![deny(missing_docs)]

//! Streaming reader and writer for the tar container used by backups and
//! bundled payloads.
//!
//! The reader accepts raw tar, gzip compressed tar and zip archives and picks
//! the right decoder by sniffing the first bytes of the stream. Every entry
//! name is checked against the destination root before anything is written,
//! see [`guard`].

pub mod guard;
pub mod header;
pub mod read;
pub mod stream;
pub mod write;

pub use read::{ArchiveFormat, EntryAction, EntryOutcome, ExtractOptions, ExtractSummary};

/// An error that can occur while reading or writing an archive.
#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
pub enum ArchiveError {
    #[error("an io error occurred")]
    IoError(#[from] std::io::Error),

    #[error("could not create the destination path")]
    CouldNotCreateDestination(#[source] std::io::Error),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("unexpected end of stream: expected {expected} bytes but only {actual} were available")]
    TruncatedStream { expected: u64, actual: u64 },

    #[error("blocked archive path: {0}")]
    PathTraversal(String),

    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            // The zip reader does not say how much it wanted.
            zip::result::ZipError::Io(err) => stream::truncated_or_io(err, 0, 0),
            err => ArchiveError::InvalidArchive(format!("unable to read zip archive: {err}")),
        }
    }
}

/// The kind of item stored in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file with a body.
    File,
    /// A directory marker without a body.
    Directory,
}

/// A single logical item of an archive.
///
/// Entries are produced lazily while reading and are not retained. `path` is
/// the name as stored in the archive with a leading `./` removed; it has not
/// been checked for containment yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Slash separated path relative to the archive root.
    pub path: String,
    /// Whether this is a file or a directory.
    pub kind: EntryKind,
    /// Size of the body in bytes, always zero for directories.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::{Error, ErrorKind};
    use zip::result::ZipError;

    #[test]
    fn test_zip_errors_map_to_archive_errors() {
        assert_matches!(
            ArchiveError::from(ZipError::Io(Error::from(ErrorKind::UnexpectedEof))),
            ArchiveError::TruncatedStream { .. }
        );
        assert_matches!(
            ArchiveError::from(ZipError::Io(Error::from(ErrorKind::PermissionDenied))),
            ArchiveError::IoError(_)
        );
        assert_matches!(
            ArchiveError::from(ZipError::InvalidArchive("bad".into())),
            ArchiveError::InvalidArchive(_)
        );
    }
}
