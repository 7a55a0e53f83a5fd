use std::path::PathBuf;

use miette::{Context as _, IntoDiagnostic};

use super::{percent_progress_bar, Context};

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// The backup to restore, a `.tar.gz`, `.tar` or `.zip` file
    #[clap(required = true)]
    archive: PathBuf,
}

pub async fn import(context: &Context, opt: Opt) -> miette::Result<()> {
    let permit = context.permit()?;
    let progress_bar = percent_progress_bar("import")?;
    let result = context
        .backup(&progress_bar)
        .import_from_path_async(permit, &opt.archive)
        .await;
    progress_bar.finish_and_clear();

    let summary = result
        .into_diagnostic()
        .with_context(|| format!("failed to import {}", opt.archive.display()))?;
    let restored = match (summary.config, summary.data) {
        (true, true) => "config and data",
        (true, false) => "config",
        _ => "data",
    };
    println!(
        "{} Restored {restored} from {} archive",
        console::style(console::Emoji("✔", "")).green(),
        summary.format
    );
    if summary.skipped > 0 {
        tracing::info!("ignored {} unrecognized entries", summary.skipped);
    }
    Ok(())
}
