use miette::IntoDiagnostic;
use stowage_install::PayloadStatus;

use super::Context;

pub fn status(context: &Context) -> miette::Result<()> {
    let paths = &context.settings.paths;
    println!("files: {}", paths.files_dir().display());

    match context.installer() {
        Ok(installer) => {
            let status = match installer.status().into_diagnostic()? {
                PayloadStatus::NotInstalled => String::from("not installed"),
                PayloadStatus::Installed {
                    version: Some(version),
                } => format!("version {version}"),
                PayloadStatus::Installed { version: None } => String::from("installed"),
                PayloadStatus::Custom => String::from("custom"),
            };
            println!("payload: {status}");
            if let Some(manifest) = installer.manifest() {
                if let Some(version) = manifest.payload_version {
                    println!("bundled: version {version}");
                }
            }
        }
        Err(err) => tracing::debug!("not reporting payload status: {err}"),
    }

    println!(
        "config: {}",
        if paths.config_file().is_file() {
            "present"
        } else {
            "missing"
        }
    );
    println!(
        "data: {}",
        if paths.data_dir().is_dir() {
            "present"
        } else {
            "missing"
        }
    );
    Ok(())
}
