//! The on-disk layout of an installation.

use std::path::{Path, PathBuf};

use fs_err as fs;

/// The on-disk layout of an installation. Every location is derived from a
/// single files root.
///
/// Scratch locations live below [`AppPaths::tmp_dir`], which is inside the
/// files root, so that promoting staged content is a rename on the same
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    files_dir: PathBuf,
}

impl AppPaths {
    /// Derives the layout from `files_dir`.
    pub fn new(files_dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: files_dir.into(),
        }
    }

    /// The root of everything.
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// The installed payload.
    pub fn app_dir(&self) -> PathBuf {
        self.files_dir.join("app")
    }

    /// Log files of the application.
    pub fn logs_dir(&self) -> PathBuf {
        self.files_dir.join("logs")
    }

    /// The directory holding the persistent config file.
    pub fn config_dir(&self) -> PathBuf {
        self.files_dir.join("config")
    }

    /// The persistent config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.yaml")
    }

    /// The persistent user data.
    pub fn data_dir(&self) -> PathBuf {
        self.files_dir.join("data")
    }

    /// Scratch space for staging.
    pub fn tmp_dir(&self) -> PathBuf {
        self.files_dir.join("tmp")
    }

    /// A named location below [`AppPaths::tmp_dir`].
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.tmp_dir().join(name)
    }

    /// Creates the logs, config, data and tmp directories if they are missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            self.logs_dir(),
            self.config_dir(),
            self.data_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
