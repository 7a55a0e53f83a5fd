#![deny(missing_docs)]

//! Export and import of the persistent application state.
//!
//! A backup is a gzip compressed tar archive with a single root folder
//! ([`BACKUP_ROOT`]) that holds the config file and a copy of the data
//! directory. Imports accept that layout as well as zip archives and
//! archives without the root folder. Imported content is staged first and
//! swapped into place only after the archive was read completely.

use std::path::PathBuf;
use std::sync::Arc;

use stowage_install::{AppPaths, SwapError};
use stowage_tar::ArchiveError;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

mod export;
mod import;
pub mod progress;

pub use export::ExportSummary;
pub use import::{map_backup_path, ImportSummary};
pub use progress::{percent_of, BackupProgress, ProgressReporter, WatchReporter};

/// The name of the root folder of an exported archive.
pub const BACKUP_ROOT: &str = "st_backup";

/// An error that can occur during export or import.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Neither a config file nor any data exists.
    #[error("nothing to export")]
    NothingToExport,

    /// The archive contains neither a config file nor a data directory.
    #[error("no recognizable data found in archive, make sure you selected a valid backup (.tar.gz or .zip)")]
    NoRecognizableData,

    /// Reading or writing the archive failed.
    #[error(transparent)]
    Archive(ArchiveError),

    /// Replacing the live content failed.
    #[error(transparent)]
    Swap(#[from] SwapError),

    /// An io error occurred.
    #[error("{0}")]
    IoError(String, #[source] std::io::Error),

    /// The finished archive could not be moved to its destination.
    #[error("failed to write {0}")]
    Persist(PathBuf, #[source] std::io::Error),

    /// The operation was cancelled. Live content was not changed.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<ArchiveError> for BackupError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Cancelled => BackupError::Cancelled,
            err => BackupError::Archive(err),
        }
    }
}

/// Exports and imports the state of one installation.
///
/// Mutating operations take an [`stowage_install::OperationPermit`] so they
/// never run concurrently with each other or with payload installs.
#[derive(Clone)]
pub struct Backup {
    paths: AppPaths,
    reporter: Option<Arc<dyn ProgressReporter>>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup")
            .field("paths", &self.paths)
            .field("reporter", &self.reporter.is_some())
            .finish_non_exhaustive()
    }
}

impl Backup {
    /// Creates a backup handle for the installation at `paths`.
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            reporter: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Sets the reporter that receives progress.
    #[must_use]
    pub fn with_reporter(self, reporter: impl ProgressReporter + 'static) -> Self {
        Self {
            reporter: Some(Arc::new(reporter)),
            ..self
        }
    }

    /// Sets the token that aborts running operations.
    #[must_use]
    pub fn with_cancellation(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }

    /// The layout of the installation.
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    fn reporter(&self) -> Option<&dyn ProgressReporter> {
        self.reporter.as_deref()
    }
}

/// Runs `f` on tokio's blocking pool. A task that was cancelled by the
/// runtime yields [`BackupError::Cancelled`], a panic is resumed.
async fn run_blocking_task<T, F>(f: F) -> Result<T, BackupError>
where
    F: FnOnce() -> Result<T, BackupError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f)
        .await
        .map_err(JoinError::try_into_panic)
    {
        Ok(result) => result,
        Err(Err(_err)) => Err(BackupError::Cancelled),
        Err(Ok(payload)) => std::panic::resume_unwind(payload),
    }
}
