use std::path::PathBuf;

use miette::Context as _;
use stowage_install::PayloadLayout;

use super::{run_blocking, spinner, Context};

#[derive(Debug, clap::Parser)]
pub struct CustomOpt {
    /// The archive holding the payload (`.zip`, `.tar.gz` or `.tar`)
    #[clap(required = true)]
    archive: PathBuf,
}

pub async fn install(context: &Context) -> miette::Result<()> {
    let permit = context.permit()?;
    let installer = context.installer()?;
    let progress_bar = spinner("install")?;
    progress_bar.set_message("Checking payload");
    let result = run_blocking(move || installer.ensure_installed(&permit)).await;
    progress_bar.finish_and_clear();

    let layout = result.context("failed to install the payload")?;
    print_layout(&layout);
    Ok(())
}

pub async fn install_custom(context: &Context, opt: CustomOpt) -> miette::Result<()> {
    let permit = context.permit()?;
    let installer = context.installer()?;
    let progress_bar = spinner("install")?;
    let result = run_blocking({
        let progress_bar = progress_bar.clone();
        let archive = opt.archive.clone();
        move || {
            installer.install_custom_from_path(&permit, &archive, |message| {
                progress_bar.set_message(message.to_owned());
            })
        }
    })
    .await;
    progress_bar.finish_and_clear();

    let layout = result.with_context(|| format!("failed to install {}", opt.archive.display()))?;
    print_layout(&layout);
    Ok(())
}

pub async fn reset(context: &Context) -> miette::Result<()> {
    let permit = context.permit()?;
    let installer = context.installer()?;
    let progress_bar = spinner("reset")?;
    progress_bar.set_message("Restoring the bundled payload");
    let result = run_blocking(move || installer.reset_to_default(&permit)).await;
    progress_bar.finish_and_clear();

    let layout = result.context("failed to reset the payload")?;
    print_layout(&layout);
    Ok(())
}

fn print_layout(layout: &PayloadLayout) {
    let check = console::style(console::Emoji("✔", "")).green();
    if layout.payload_updated {
        match &layout.payload_version {
            Some(version) => println!("{check} Installed payload version {version}"),
            None => println!("{check} Installed payload"),
        }
    } else {
        println!("{check} Payload is up to date");
    }
    println!("  entry point: {}", layout.app_entry.display());
    println!("  config:      {}", layout.config_file.display());
    println!("  data:        {}", layout.data_dir.display());
}
