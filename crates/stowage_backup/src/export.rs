use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use fs_err as fs;
use stowage_install::OperationPermit;
use stowage_tar::write::TarWriter;

use crate::progress::{percent_of, ProgressThrottle};
use crate::{run_blocking_task, Backup, BackupError, BACKUP_ROOT};

/// What an export wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    /// Whether the config file was included.
    pub config: bool,
    /// Whether the data directory was included.
    pub data: bool,
    /// The number of file bytes archived, before compression.
    pub bytes: u64,
}

impl Backup {
    /// Writes a gzip compressed backup of the config file and the data
    /// directory to `output`.
    ///
    /// Fails with [`BackupError::NothingToExport`] before writing anything if
    /// there is neither a config file nor a non-empty data directory.
    #[tracing::instrument(skip_all, fields(files_dir = %self.paths.files_dir().display()))]
    pub fn export(
        &self,
        _permit: &OperationPermit,
        output: impl Write,
    ) -> Result<ExportSummary, BackupError> {
        let mut throttle = ProgressThrottle::new(self.reporter());
        throttle.report("Preparing export", None, true);

        let config_file = self.paths.config_file();
        let data_dir = self.paths.data_dir();
        let config_len = fs::metadata(&config_file)
            .ok()
            .filter(std::fs::Metadata::is_file)
            .map(|metadata| metadata.len());
        let has_data = data_dir.is_dir() && !is_empty_dir(&data_dir)?;
        if config_len.is_none() && !has_data {
            return Err(BackupError::NothingToExport);
        }

        let data_size = if data_dir.is_dir() {
            tree_size(&data_dir)?
        } else {
            0
        };
        let total = config_len.unwrap_or(0) + data_size;
        tracing::debug!("exporting {total} bytes");

        let encoder = GzEncoder::new(output, Compression::default());
        let mut writer = TarWriter::new(encoder).with_cancellation(self.cancellation.clone());

        let mut copied = 0u64;
        throttle.report("Exporting", percent_of(0, total), false);
        let mut on_bytes = |len: u64| {
            copied += len;
            throttle.report("Exporting", percent_of(copied, total), false);
        };

        writer.append_dir(BACKUP_ROOT, now())?;
        if config_len.is_some() {
            writer.append_file(
                &format!("{BACKUP_ROOT}/config.yaml"),
                &config_file,
                &mut on_bytes,
            )?;
        }
        if data_dir.is_dir() {
            let data_name = format!("{BACKUP_ROOT}/data");
            let mtime = fs::metadata(&data_dir)
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .map_or_else(now, seconds_since_epoch);
            writer.append_dir(&data_name, mtime)?;
            writer.append_tree(&data_dir, &data_name, &mut on_bytes)?;
        }

        let encoder = writer.finish()?;
        let mut output = encoder
            .finish()
            .map_err(|err| BackupError::IoError(String::from("failed to finish the archive"), err))?;
        output
            .flush()
            .map_err(|err| BackupError::IoError(String::from("failed to flush the archive"), err))?;

        throttle.report("Export completed", Some(100), true);
        tracing::info!("exported {copied} bytes");
        Ok(ExportSummary {
            config: config_len.is_some(),
            data: data_dir.is_dir(),
            bytes: copied,
        })
    }

    /// Exports to the file at `destination`.
    ///
    /// The archive is written to a temporary file next to the destination and
    /// only moved there once it is complete, a failed export leaves nothing
    /// behind.
    pub fn export_to_path(
        &self,
        permit: &OperationPermit,
        destination: &Path,
    ) -> Result<ExportSummary, BackupError> {
        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp_file = tempfile::NamedTempFile::new_in(parent).map_err(|err| {
            BackupError::IoError(
                format!("failed to create a temporary file in {}", parent.display()),
                err,
            )
        })?;

        let summary = self.export(permit, BufWriter::new(temp_file.as_file()))?;
        temp_file
            .persist(destination)
            .map_err(|err| BackupError::Persist(destination.to_path_buf(), err.error))?;
        Ok(summary)
    }

    /// Runs [`Backup::export_to_path`] on the blocking thread pool.
    pub async fn export_to_path_async(
        &self,
        permit: OperationPermit,
        destination: impl AsRef<Path>,
    ) -> Result<ExportSummary, BackupError> {
        let backup = self.clone();
        let destination = destination.as_ref().to_path_buf();
        run_blocking_task(move || backup.export_to_path(&permit, &destination)).await
    }
}

fn is_empty_dir(path: &Path) -> Result<bool, BackupError> {
    let mut entries = fs::read_dir(path)
        .map_err(|err| BackupError::IoError(format!("failed to read {}", path.display()), err))?;
    Ok(entries.next().is_none())
}

/// The summed size of all regular files below `root`.
fn tree_size(root: &Path) -> Result<u64, BackupError> {
    let mut total = 0;
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|err| {
            BackupError::IoError(format!("failed to walk {}", root.display()), err.into())
        })?;
        if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(|err| {
                BackupError::IoError(
                    format!("failed to read metadata of {}", entry.path().display()),
                    err.into(),
                )
            })?;
            total += metadata.len();
        }
    }
    Ok(total)
}

fn now() -> u64 {
    seconds_since_epoch(SystemTime::now())
}

fn seconds_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
