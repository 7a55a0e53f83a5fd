use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::Ordering;

use fs_err as fs;
use stowage_install::{swap_directory, swap_file, OperationPermit, StagingTree};
use stowage_tar::read::extract;
use stowage_tar::stream::CountingReader;
use stowage_tar::{ArchiveFormat, EntryAction, EntryKind, ExtractOptions};

use crate::progress::{percent_of, ProgressThrottle};
use crate::{run_blocking_task, Backup, BackupError, BACKUP_ROOT};

/// The staged location of the config file, relative to the staging root.
const STAGED_CONFIG: &str = "config/config.yaml";

/// The staged location of the data directory, relative to the staging root.
const STAGED_DATA: &str = "data";

/// What an import restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    /// The container format of the archive.
    pub format: ArchiveFormat,
    /// Whether the config file was replaced.
    pub config: bool,
    /// Whether the data directory was replaced.
    pub data: bool,
    /// Entries that were ignored because they are neither config nor data.
    pub skipped: usize,
}

/// Maps a path inside a backup archive to its staged location.
///
/// The backup root folder and a leading `./` are optional. `config.yaml` and
/// `config/config.yaml` are the config file, everything in `data/` is user
/// data. All other entries are skipped.
pub fn map_backup_path(path: &str, kind: EntryKind) -> EntryAction {
    let path = path.trim_start_matches("./").trim_end_matches('/');
    let path = if path == BACKUP_ROOT {
        ""
    } else {
        path.strip_prefix(BACKUP_ROOT)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(path)
    };

    match (path, kind) {
        ("", _) => EntryAction::Skip,
        ("config.yaml" | "config/config.yaml", EntryKind::File) => {
            EntryAction::Extract(String::from(STAGED_CONFIG))
        }
        ("data", EntryKind::Directory) => EntryAction::Extract(String::from(STAGED_DATA)),
        (path, _) if path.starts_with("data/") => EntryAction::Extract(path.to_owned()),
        _ => EntryAction::Skip,
    }
}

impl Backup {
    /// Restores a backup read from `input`.
    ///
    /// The archive is extracted into a staging directory first. Only when it
    /// was read completely are the config file and the data directory swapped
    /// into place, so a broken or cancelled import leaves the live content
    /// untouched. `content_length` is the size of `input` in bytes if known,
    /// it is used to compute percentages.
    #[tracing::instrument(skip_all, fields(files_dir = %self.paths.files_dir().display()))]
    pub fn import(
        &self,
        _permit: &OperationPermit,
        input: impl Read,
        content_length: Option<u64>,
    ) -> Result<ImportSummary, BackupError> {
        let mut throttle = ProgressThrottle::new(self.reporter());
        throttle.report("Preparing import", None, false);

        let staging_path = self.paths.scratch("import");
        let staging = StagingTree::create(&staging_path).map_err(|err| {
            BackupError::IoError(format!("failed to create {}", staging_path.display()), err)
        })?;

        let total = content_length.filter(|&len| len > 0);
        let input = CountingReader::new(input);
        let counter = input.counter();
        throttle.report("Extracting", total.and_then(|total| percent_of(0, total)), true);

        let options = ExtractOptions::default()
            .with_cancellation(self.cancellation.clone())
            .with_path_mapper(map_backup_path);
        let extracted = extract(input, staging.path(), &options, |_, _| {
            let read = counter.load(Ordering::Relaxed);
            let percent = total.and_then(|total| percent_of(read, total));
            throttle.report("Extracting", percent, false);
        })?;
        tracing::debug!(
            "extracted {} entries from {} archive, skipped {}",
            extracted.applied,
            extracted.format,
            extracted.skipped
        );

        let staged_config = staging.path().join(STAGED_CONFIG);
        let staged_data = staging.path().join(STAGED_DATA);
        let has_config = staged_config.is_file();
        let has_data = staged_data.is_dir();
        if !has_config && !has_data {
            return Err(BackupError::NoRecognizableData);
        }

        // Nothing live has changed up to here. Once swapping starts it is not
        // interrupted.
        if self.cancellation.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        throttle.report("Applying", None, false);

        let data_dir = self.paths.data_dir();
        if has_data {
            let method = swap_directory(
                &staged_data,
                &data_dir,
                &self.paths.scratch("import_data_old"),
            )?;
            tracing::debug!("restored {} ({method})", data_dir.display());
        } else {
            fs::create_dir_all(&data_dir).map_err(|err| {
                BackupError::IoError(format!("failed to create {}", data_dir.display()), err)
            })?;
        }

        if has_config {
            let config_dir = self.paths.config_dir();
            fs::create_dir_all(&config_dir).map_err(|err| {
                BackupError::IoError(format!("failed to create {}", config_dir.display()), err)
            })?;
            let config_file = self.paths.config_file();
            let method = swap_file(
                &staged_config,
                &config_file,
                &self.paths.scratch("import_config_old.yaml"),
            )?;
            tracing::debug!("restored {} ({method})", config_file.display());
        }
        drop(staging);

        throttle.report("Import complete", Some(100), true);
        tracing::info!(
            "imported backup (config: {has_config}, data: {has_data}, skipped {} entries)",
            extracted.skipped
        );
        Ok(ImportSummary {
            format: extracted.format,
            config: has_config,
            data: has_data,
            skipped: extracted.skipped,
        })
    }

    /// Imports the archive at `source`. Its size drives the progress.
    pub fn import_from_path(
        &self,
        permit: &OperationPermit,
        source: &Path,
    ) -> Result<ImportSummary, BackupError> {
        let file = fs::File::open(source)
            .map_err(|err| BackupError::IoError(format!("failed to open {}", source.display()), err))?;
        let content_length = file.metadata().ok().map(|metadata| metadata.len());
        self.import(permit, BufReader::new(file), content_length)
    }

    /// Runs [`Backup::import_from_path`] on the blocking thread pool.
    pub async fn import_from_path_async(
        &self,
        permit: OperationPermit,
        source: impl AsRef<Path>,
    ) -> Result<ImportSummary, BackupError> {
        let backup = self.clone();
        let source = source.as_ref().to_path_buf();
        run_blocking_task(move || backup.import_from_path(&permit, &source)).await
    }
}
