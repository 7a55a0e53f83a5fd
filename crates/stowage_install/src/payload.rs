//! Installation of the bundled application payload.
//!
//! The assets directory ships a `manifest.json` and a tar bundle. The bundle is
//! extracted into a staging directory and promoted to [`AppPaths::app_dir`]
//! whenever the manifest declares a payload version that differs from the one
//! recorded in the [`VersionStore`], or when the entry point is missing. A user
//! supplied archive can replace the bundled payload, see
//! [`PayloadInstaller::install_custom`].
//!
//! The config file and the data directory live outside the payload so they
//! survive replacing it. After every install they are linked into the
//! payload.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs_err as fs;
use serde::{Deserialize, Deserializer, Serialize};
use stowage_tar::read::extract;
use stowage_tar::{ArchiveError, ExtractOptions};
use tokio_util::sync::CancellationToken;

use crate::gate::OperationPermit;
use crate::paths::AppPaths;
use crate::staging::StagingTree;
use crate::store::{StoreError, VersionStore};
use crate::swap::{remove_path, swap_directory, SwapError};

/// The store key of the installed payload version.
pub const PAYLOAD_VERSION_KEY: &str = "payload_version";

/// The store key of the flag that marks a user supplied payload.
pub const CUSTOM_INSTALLED_KEY: &str = "custom_installed";

/// The name of the manifest in the assets directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Bundle names in order of preference.
pub const BUNDLE_FILE_NAMES: [&str; 2] = ["bundle.tar.gz", "bundle.tar"];

/// An error that can occur while installing a payload.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The payload is not installed and there is no bundle to install it from.
    #[error("no payload bundle found in {0}")]
    MissingBundle(PathBuf),

    /// The archive does not contain the entry point.
    #[error("{0} not found in the archive")]
    MissingEntryPoint(String),

    /// The archive does not contain a file every payload must have.
    #[error("{0} not found in the archive, this does not look like a valid payload")]
    MissingRequiredFile(String),

    /// Reading the archive failed.
    #[error(transparent)]
    Archive(ArchiveError),

    /// Promoting the extracted payload failed.
    #[error(transparent)]
    Swap(#[from] SwapError),

    /// Reading or writing the markers failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The manifest could not be parsed.
    #[error("failed to parse {0}")]
    Manifest(PathBuf, #[source] serde_json::Error),

    /// An io error occurred.
    #[error("{0}")]
    IoError(String, #[source] std::io::Error),

    /// The installation was cancelled before anything was changed.
    #[error("the installation was cancelled")]
    Cancelled,
}

impl From<ArchiveError> for InstallError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Cancelled => InstallError::Cancelled,
            err => InstallError::Archive(err),
        }
    }
}

/// Describes the bundled payload, read from `manifest.json`.
///
/// Empty or blank values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadManifest {
    /// The version of the bundle as a whole. Drives re-extraction.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub payload_version: Option<String>,

    /// The version of the application in the bundle.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub app_version: Option<String>,

    /// The commit the application was built from.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub app_commit: Option<String>,

    /// The version of the runtime that executes the entry point.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub runtime_version: Option<String>,

    /// The commit the runtime was built from.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub runtime_commit: Option<String>,

    /// The release tag of the runtime.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub runtime_tag: Option<String>,

    /// The SHA256 of the bundle.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub bundle_sha256: Option<String>,
}

fn blank_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|value| !value.trim().is_empty()))
}

impl PayloadManifest {
    /// Reads the manifest at `path`.
    pub fn from_path(path: &Path) -> Result<Self, InstallError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| InstallError::IoError(format!("failed to read {}", path.display()), err))?;
        serde_json::from_str(&contents)
            .map_err(|err| InstallError::Manifest(path.to_path_buf(), err))
    }
}

/// What a payload must look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadOptions {
    /// The file that must exist at the root of an installed payload.
    pub entry_point: String,

    /// Additional files a user supplied payload must contain.
    pub required_files: Vec<String>,
}

impl Default for PayloadOptions {
    fn default() -> Self {
        Self {
            entry_point: String::from("server.js"),
            required_files: vec![String::from("package.json")],
        }
    }
}

/// The effective locations after an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadLayout {
    /// The installed payload.
    pub app_dir: PathBuf,

    /// The entry point inside the payload.
    pub app_entry: PathBuf,

    /// Log files of the application.
    pub logs_dir: PathBuf,

    /// The config file. This is the persistent location if it could be linked
    /// into the payload, otherwise the location inside the payload.
    pub config_file: PathBuf,

    /// The data directory, chosen like `config_file`.
    pub data_dir: PathBuf,

    /// Whether the payload was (re)extracted by this call.
    pub payload_updated: bool,

    /// The version of the bundled payload, if known.
    pub payload_version: Option<String>,
}

/// The state of the installed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadStatus {
    /// There is no entry point.
    NotInstalled,

    /// The bundled payload is installed.
    Installed {
        /// The recorded version of the installed bundle.
        version: Option<String>,
    },

    /// A user supplied payload is installed.
    Custom,
}

/// Installs and replaces the application payload.
pub struct PayloadInstaller {
    paths: AppPaths,
    assets_dir: PathBuf,
    options: PayloadOptions,
    store: Arc<dyn VersionStore>,
    cancellation: CancellationToken,
}

impl PayloadInstaller {
    /// Installs from the bundle in `assets_dir` into the layout of `paths`.
    pub fn new(
        paths: AppPaths,
        assets_dir: impl Into<PathBuf>,
        store: impl VersionStore + 'static,
    ) -> Self {
        Self {
            paths,
            assets_dir: assets_dir.into(),
            options: PayloadOptions::default(),
            store: Arc::new(store),
            cancellation: CancellationToken::new(),
        }
    }

    /// Sets what a payload must look like.
    #[must_use]
    pub fn with_options(self, options: PayloadOptions) -> Self {
        Self { options, ..self }
    }

    /// Sets the token that aborts extraction. A cancelled installation never
    /// touches the installed payload.
    #[must_use]
    pub fn with_cancellation(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }

    /// The layout this installer works on.
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// The entry point of the installed payload.
    pub fn app_entry(&self) -> PathBuf {
        self.paths.app_dir().join(&self.options.entry_point)
    }

    /// Reads the manifest from the assets directory. A missing or unreadable
    /// manifest yields `None`.
    pub fn manifest(&self) -> Option<PayloadManifest> {
        let path = self.assets_dir.join(MANIFEST_FILE_NAME);
        if !path.is_file() {
            return None;
        }
        match PayloadManifest::from_path(&path) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                tracing::warn!("ignoring manifest: {err}");
                None
            }
        }
    }

    /// The bundle in the assets directory, compressed bundles first.
    pub fn bundle_path(&self) -> Option<PathBuf> {
        BUNDLE_FILE_NAMES
            .iter()
            .map(|name| self.assets_dir.join(name))
            .find(|path| path.is_file())
    }

    /// Reports what is currently installed.
    pub fn status(&self) -> Result<PayloadStatus, InstallError> {
        if !self.app_entry().is_file() {
            return Ok(PayloadStatus::NotInstalled);
        }
        if self.is_custom()? {
            return Ok(PayloadStatus::Custom);
        }
        Ok(PayloadStatus::Installed {
            version: self.store.get(PAYLOAD_VERSION_KEY)?,
        })
    }

    fn is_custom(&self) -> Result<bool, InstallError> {
        Ok(self.store.get(CUSTOM_INSTALLED_KEY)?.as_deref() == Some("true"))
    }

    /// Makes sure the bundled payload is installed and up to date.
    ///
    /// A user supplied payload is left alone as long as its entry point
    /// exists. On failure the version marker and the installed payload are
    /// unchanged.
    #[tracing::instrument(skip_all, fields(files_dir = %self.paths.files_dir().display()))]
    pub fn ensure_installed(&self, _permit: &OperationPermit) -> Result<PayloadLayout, InstallError> {
        let app_entry = self.app_entry();

        if self.is_custom()? && app_entry.is_file() {
            tracing::debug!("a custom payload is installed, skipping the bundle");
            return self.finish_layout(false, None);
        }

        let payload_version = self.manifest().and_then(|manifest| manifest.payload_version);
        let mut payload_updated = false;
        match self.bundle_path() {
            Some(bundle) => {
                let installed_version = self.store.get(PAYLOAD_VERSION_KEY)?;
                if payload_version.is_none()
                    || installed_version != payload_version
                    || !app_entry.is_file()
                {
                    tracing::info!(
                        "installing payload {} (installed: {})",
                        payload_version.as_deref().unwrap_or("<unversioned>"),
                        installed_version.as_deref().unwrap_or("<none>"),
                    );
                    self.install_bundle(&bundle)?;
                    self.store.remove(CUSTOM_INSTALLED_KEY)?;
                    if let Some(version) = &payload_version {
                        self.store.set(PAYLOAD_VERSION_KEY, version)?;
                    }
                    payload_updated = true;
                }
            }
            None if !app_entry.is_file() => {
                return Err(InstallError::MissingBundle(self.assets_dir.clone()));
            }
            None => {}
        }

        self.finish_layout(payload_updated, payload_version)
    }

    fn install_bundle(&self, bundle: &Path) -> Result<(), InstallError> {
        let staging = self.create_staging("payload_new")?;
        let file = fs::File::open(bundle).map_err(|err| {
            InstallError::IoError(format!("failed to open {}", bundle.display()), err)
        })?;
        let options = ExtractOptions::default().with_cancellation(self.cancellation.clone());
        extract(std::io::BufReader::new(file), staging.path(), &options, |_, _| {})?;

        let root = self.find_payload_root(staging.path())?;
        self.promote(&root, "payload_old")
    }

    /// Installs a user supplied payload from an archive in any supported
    /// format.
    ///
    /// The archive must contain the entry point, either at its root or in a
    /// single top level directory, and every required file next to it.
    /// `on_progress` receives short status messages.
    #[tracing::instrument(skip_all, fields(files_dir = %self.paths.files_dir().display()))]
    pub fn install_custom(
        &self,
        _permit: &OperationPermit,
        archive: impl Read,
        mut on_progress: impl FnMut(&str),
    ) -> Result<PayloadLayout, InstallError> {
        on_progress("Extracting archive");
        let staging = self.create_staging("custom_extract")?;
        let options = ExtractOptions::default().with_cancellation(self.cancellation.clone());
        extract(archive, staging.path(), &options, |_, _| {})?;

        let root = self.find_payload_root(staging.path())?;
        for required in &self.options.required_files {
            if !root.join(required).exists() {
                return Err(InstallError::MissingRequiredFile(required.clone()));
            }
        }

        on_progress("Installing");
        self.promote(&root, "custom_old")?;
        drop(staging);

        let layout = self.finish_layout(true, None)?;
        self.store.set(CUSTOM_INSTALLED_KEY, "true")?;
        self.store.remove(PAYLOAD_VERSION_KEY)?;
        tracing::info!("installed custom payload");
        on_progress("Done");
        Ok(layout)
    }

    /// Like [`PayloadInstaller::install_custom`] with the archive at `path`.
    pub fn install_custom_from_path(
        &self,
        permit: &OperationPermit,
        path: &Path,
        on_progress: impl FnMut(&str),
    ) -> Result<PayloadLayout, InstallError> {
        let file = fs::File::open(path)
            .map_err(|err| InstallError::IoError(format!("failed to open {}", path.display()), err))?;
        self.install_custom(permit, std::io::BufReader::new(file), on_progress)
    }

    /// Removes a user supplied payload and installs the bundled one again.
    /// User data is not touched.
    #[tracing::instrument(skip_all)]
    pub fn reset_to_default(&self, permit: &OperationPermit) -> Result<PayloadLayout, InstallError> {
        self.store.remove(CUSTOM_INSTALLED_KEY)?;
        self.store.remove(PAYLOAD_VERSION_KEY)?;
        let app_dir = self.paths.app_dir();
        if fs::symlink_metadata(&app_dir).is_ok() {
            remove_path(&app_dir).map_err(|err| {
                InstallError::IoError(format!("failed to remove {}", app_dir.display()), err)
            })?;
        }
        self.ensure_installed(permit)
    }

    fn create_staging(&self, name: &str) -> Result<StagingTree, InstallError> {
        let path = self.paths.scratch(name);
        StagingTree::create(&path).map_err(|err| {
            InstallError::IoError(format!("failed to create {}", path.display()), err)
        })
    }

    /// The directory in `extracted` that holds the entry point: either
    /// `extracted` itself or one of its direct subdirectories, as produced by
    /// archives that wrap everything in a top level folder.
    fn find_payload_root(&self, extracted: &Path) -> Result<PathBuf, InstallError> {
        let entry_point = &self.options.entry_point;
        if extracted.join(entry_point).is_file() {
            return Ok(extracted.to_path_buf());
        }

        let mut children = fs::read_dir(extracted)
            .map_err(|err| {
                InstallError::IoError(format!("failed to list {}", extracted.display()), err)
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        children.sort();
        children
            .into_iter()
            .find(|child| child.join(entry_point).is_file())
            .ok_or_else(|| InstallError::MissingEntryPoint(entry_point.clone()))
    }

    /// Swaps `root` into the app directory. Cancellation is honoured up to
    /// this point, never during the swap.
    fn promote(&self, root: &Path, aside: &str) -> Result<(), InstallError> {
        if self.cancellation.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let method = swap_directory(root, &self.paths.app_dir(), &self.paths.scratch(aside))?;
        tracing::debug!("promoted payload using {method}");
        Ok(())
    }

    fn finish_layout(
        &self,
        payload_updated: bool,
        payload_version: Option<String>,
    ) -> Result<PayloadLayout, InstallError> {
        self.paths.ensure_directories().map_err(|err| {
            InstallError::IoError(
                format!("failed to create directories in {}", self.paths.files_dir().display()),
                err,
            )
        })?;

        let app_dir = self.paths.app_dir();
        let config_file = ensure_link(&app_dir.join("config.yaml"), &self.paths.config_file());
        let data_dir = ensure_link(&app_dir.join("data"), &self.paths.data_dir());
        Ok(PayloadLayout {
            app_entry: self.app_entry(),
            app_dir,
            logs_dir: self.paths.logs_dir(),
            config_file,
            data_dir,
            payload_updated,
            payload_version,
        })
    }
}

/// Points `link` at `target` and returns the path that should be used.
///
/// Real content at `link` is moved to `target` if `target` does not exist yet,
/// otherwise it is removed. If the link cannot be created `link` itself is
/// returned and the content stays inside the payload.
pub fn ensure_link(link: &Path, target: &Path) -> PathBuf {
    match try_link(link, target) {
        Ok(true) => target.to_path_buf(),
        Ok(false) => link.to_path_buf(),
        Err(err) => {
            tracing::debug!(
                "could not link {} to {} ({err}), using it in place",
                link.display(),
                target.display()
            );
            link.to_path_buf()
        }
    }
}

fn try_link(link: &Path, target: &Path) -> std::io::Result<bool> {
    if let Ok(metadata) = fs::symlink_metadata(link) {
        if metadata.file_type().is_symlink() {
            if fs::read_link(link)? == target {
                return Ok(true);
            }
            remove_path(link)?;
        } else if fs::symlink_metadata(target).is_err() {
            if let Err(err) = fs::rename(link, target) {
                tracing::debug!("could not migrate {} ({err}), removing it", link.display());
                remove_path(link)?;
            }
        } else {
            remove_path(link)?;
        }
    }

    create_symlink(target, link)?;
    Ok(fs::symlink_metadata(link)?.file_type().is_symlink())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    fs_err::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        fs_err::os::windows::fs::symlink_dir(target, link)
    } else {
        fs_err::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tracing_test::traced_test;

    #[rstest]
    #[case(r#"{"payload_version": "7", "app_version": "1.2.3"}"#, Some("7"), Some("1.2.3"))]
    #[case(r#"{"payload_version": "", "app_version": "  "}"#, None, None)]
    #[case(r#"{"runtime_tag": "v20"}"#, None, None)]
    fn test_manifest_blank_fields(
        #[case] json: &str,
        #[case] payload_version: Option<&str>,
        #[case] app_version: Option<&str>,
    ) {
        let manifest: PayloadManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.payload_version.as_deref(), payload_version);
        assert_eq!(manifest.app_version.as_deref(), app_version);
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_link_migrates_real_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let link = temp_dir.path().join("app/data");
        let target = temp_dir.path().join("data");
        std::fs::create_dir_all(&link).unwrap();
        std::fs::write(link.join("chat.json"), "{}").unwrap();

        assert_eq!(ensure_link(&link, &target), target);
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(target.join("chat.json")).unwrap(), "{}");
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_link_keeps_existing_target() {
        let temp_dir = tempfile::tempdir().unwrap();
        let link = temp_dir.path().join("app/config.yaml");
        let target = temp_dir.path().join("config/config.yaml");
        std::fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&link, "bundled").unwrap();
        std::fs::write(&target, "user").unwrap();

        assert_eq!(ensure_link(&link, &target), target);
        assert_eq!(std::fs::read_to_string(&link).unwrap(), "user");

        // Linking again is a no-op.
        assert_eq!(ensure_link(&link, &target), target);
    }

    #[test]
    #[traced_test]
    fn test_ensure_link_falls_back_in_place() {
        let temp_dir = tempfile::tempdir().unwrap();
        // The parent of the link does not exist, so no link can be created.
        let link = temp_dir.path().join("missing/config.yaml");
        let target = temp_dir.path().join("config.yaml");
        assert_eq!(ensure_link(&link, &target), link);
        assert!(logs_contain("using it in place"));
    }
}
