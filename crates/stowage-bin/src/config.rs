//! Settings of the command line tool.
//!
//! Values come from an optional TOML file and can be overridden on the
//! command line or through `STOWAGE_*` environment variables.

use std::path::{Path, PathBuf};

use fs_err as fs;
use miette::{Context, IntoDiagnostic};
use serde::Deserialize;
use stowage_install::{AppPaths, PayloadOptions};

/// The name of the file that records installed payload versions, relative to
/// the files directory.
const MARKER_FILE_NAME: &str = "payload-state.json";

/// The contents of the config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub files_dir: Option<PathBuf>,

    #[serde(default)]
    pub assets_dir: Option<PathBuf>,

    /// The file that must exist at the root of the payload.
    #[serde(default)]
    pub entry_point: Option<String>,

    /// Files a user supplied payload must contain.
    #[serde(default)]
    pub required_files: Option<Vec<String>>,
}

impl ConfigFile {
    /// Parses the config file at `path`.
    pub fn from_path(path: &Path) -> miette::Result<Self> {
        let content = fs::read_to_string(path).into_diagnostic()?;
        toml::from_str(&content)
            .into_diagnostic()
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub paths: AppPaths,
    pub assets_dir: Option<PathBuf>,
    pub payload: PayloadOptions,
}

impl Settings {
    /// Combines the config file with the values from the command line.
    ///
    /// An explicitly passed config file must exist, the default one is
    /// optional.
    pub fn resolve(
        config_path: Option<&Path>,
        files_dir: Option<PathBuf>,
        assets_dir: Option<PathBuf>,
    ) -> miette::Result<Self> {
        let file = match config_path {
            Some(path) => ConfigFile::from_path(path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => ConfigFile::from_path(&path)?,
                _ => ConfigFile::default(),
            },
        };
        Self::from_config(file, files_dir, assets_dir)
    }

    fn from_config(
        file: ConfigFile,
        files_dir: Option<PathBuf>,
        assets_dir: Option<PathBuf>,
    ) -> miette::Result<Self> {
        let files_dir = files_dir
            .or(file.files_dir)
            .or_else(default_files_dir)
            .ok_or_else(|| {
                miette::miette!("could not determine the files directory, pass --files-dir")
            })?;

        let defaults = PayloadOptions::default();
        let payload = PayloadOptions {
            entry_point: file.entry_point.unwrap_or(defaults.entry_point),
            required_files: file.required_files.unwrap_or(defaults.required_files),
        };

        Ok(Self {
            paths: AppPaths::new(files_dir),
            assets_dir: assets_dir.or(file.assets_dir),
            payload,
        })
    }

    /// The file that stores the installed payload version.
    pub fn marker_file(&self) -> PathBuf {
        self.paths.files_dir().join(MARKER_FILE_NAME)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stowage").join("config.toml"))
}

fn default_files_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("stowage"))
}
