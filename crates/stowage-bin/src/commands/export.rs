use std::path::PathBuf;

use miette::{Context as _, IntoDiagnostic};

use super::{percent_progress_bar, Context};

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// Where to write the backup, usually a `.tar.gz` file
    #[clap(required = true)]
    output: PathBuf,
}

pub async fn export(context: &Context, opt: Opt) -> miette::Result<()> {
    let permit = context.permit()?;
    let progress_bar = percent_progress_bar("export")?;
    let result = context
        .backup(&progress_bar)
        .export_to_path_async(permit, &opt.output)
        .await;
    progress_bar.finish_and_clear();

    let summary = result
        .into_diagnostic()
        .with_context(|| format!("failed to export to {}", opt.output.display()))?;
    println!(
        "{} Exported {} to {}",
        console::style(console::Emoji("✔", "")).green(),
        indicatif::HumanBytes(summary.bytes),
        opt.output.display()
    );
    Ok(())
}
