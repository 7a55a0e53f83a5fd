pub mod export;
pub mod import;
pub mod install;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use miette::IntoDiagnostic;
use stowage_backup::{Backup, BackupProgress, ProgressReporter};
use stowage_install::{JsonFileStore, OperationGate, OperationPermit, PayloadInstaller};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::global_multi_progress;

/// Everything a command needs.
pub struct Context {
    pub settings: Settings,
    pub cancellation: CancellationToken,
    gate: OperationGate,
}

impl Context {
    pub fn new(settings: Settings, cancellation: CancellationToken) -> Self {
        Self {
            settings,
            cancellation,
            gate: OperationGate::new(),
        }
    }

    /// Takes the operation slot. Only one command runs per process, so this
    /// never has to wait.
    pub fn permit(&self) -> miette::Result<OperationPermit> {
        self.gate.try_acquire().into_diagnostic()
    }

    /// A backup handle that reports to a fresh progress bar.
    pub fn backup(&self, progress_bar: &ProgressBar) -> Backup {
        Backup::new(self.settings.paths.clone())
            .with_cancellation(self.cancellation.clone())
            .with_reporter(ProgressBarReporter::new(progress_bar.clone()))
    }

    /// The payload installer for the configured assets directory.
    pub fn installer(&self) -> miette::Result<PayloadInstaller> {
        let assets_dir = self.settings.assets_dir.clone().ok_or_else(|| {
            miette::miette!("no assets directory configured, pass --assets-dir")
        })?;
        Ok(PayloadInstaller::new(
            self.settings.paths.clone(),
            assets_dir,
            JsonFileStore::new(self.settings.marker_file()),
        )
        .with_options(self.settings.payload.clone())
        .with_cancellation(self.cancellation.clone()))
    }
}

/// Forwards backup progress to an indicatif progress bar.
pub struct ProgressBarReporter {
    progress_bar: ProgressBar,
}

impl ProgressBarReporter {
    pub fn new(progress_bar: ProgressBar) -> Self {
        Self { progress_bar }
    }
}

impl ProgressReporter for ProgressBarReporter {
    fn on_progress(&self, progress: &BackupProgress) {
        self.progress_bar.set_message(progress.message.clone());
        match progress.percent {
            Some(percent) => self.progress_bar.set_position(u64::from(percent)),
            None => self.progress_bar.tick(),
        }
    }
}

/// Adds a percentage bar to the global multi progress.
pub fn percent_progress_bar(prefix: &'static str) -> miette::Result<ProgressBar> {
    let style = ProgressStyle::with_template(
        "{spinner:.green} {prefix:12!} [{elapsed_precise}] [{bar:30.bright.yellow/dim.white}] {pos:>3}% {wide_msg}",
    )
    .into_diagnostic()?
    .progress_chars("━━╾─");
    Ok(global_multi_progress().add(
        ProgressBar::new(100)
            .with_style(style)
            .with_prefix(prefix),
    ))
}

/// Adds a spinner with a message to the global multi progress.
pub fn spinner(prefix: &'static str) -> miette::Result<ProgressBar> {
    let style = ProgressStyle::with_template("{spinner:.green} {prefix:12!} {wide_msg}")
        .into_diagnostic()?;
    let progress_bar = global_multi_progress().add(
        ProgressBar::new_spinner()
            .with_style(style)
            .with_prefix(prefix),
    );
    progress_bar.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(progress_bar)
}

/// Runs blocking work on the blocking thread pool.
pub async fn run_blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> miette::Result<T>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .into_diagnostic()?
        .into_diagnostic()
}
