use std::path::PathBuf;

use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use miette::IntoDiagnostic;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;
mod writer;

/// Returns a global instance of [`indicatif::MultiProgress`].
///
/// Log lines are written through the same instance so they do not tear
/// progress bars apart.
pub fn global_multi_progress() -> MultiProgress {
    static GLOBAL_MP: Lazy<MultiProgress> = Lazy::new(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(20));
        mp
    });
    GLOBAL_MP.clone()
}

/// Back up, restore and install application state
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// The config file to read, defaults to `stowage/config.toml` in the user
    /// config directory
    #[clap(long, global = true, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,

    /// The root directory of the installation
    #[clap(long, global = true, env = "STOWAGE_FILES_DIR")]
    files_dir: Option<PathBuf>,

    /// The directory holding the bundled payload and its manifest
    #[clap(long, global = true, env = "STOWAGE_ASSETS_DIR")]
    assets_dir: Option<PathBuf>,

    /// Log debug output
    #[clap(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write a backup of the config file and the data directory
    Export(commands::export::Opt),

    /// Restore a backup
    Import(commands::import::Opt),

    /// Install or update the bundled payload
    Install,

    /// Replace the payload with a user supplied archive
    InstallCustom(commands::install::CustomOpt),

    /// Remove a user supplied payload and install the bundled one again
    Reset,

    /// Show what is installed
    Status,
}

/// Entry point of the `stowage` cli.
#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .into_diagnostic()?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer::IndicatifWriter::new(global_multi_progress()))
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()?;

    let settings = config::Settings::resolve(
        cli.config.as_deref(),
        cli.files_dir,
        cli.assets_dir,
    )?;

    // The first Ctrl-C aborts the running operation between two chunks.
    let cancellation = CancellationToken::new();
    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancelling...");
                cancellation.cancel();
            }
        }
    });

    let context = commands::Context::new(settings, cancellation);
    match cli.command {
        Commands::Export(opt) => commands::export::export(&context, opt).await,
        Commands::Import(opt) => commands::import::import(&context, opt).await,
        Commands::Install => commands::install::install(&context).await,
        Commands::InstallCustom(opt) => commands::install::install_custom(&context, opt).await,
        Commands::Reset => commands::install::reset(&context).await,
        Commands::Status => commands::status::status(&context),
    }
}
