use std::io::{Cursor, Write};
use std::path::PathBuf;

use assert_matches::assert_matches;
use stowage_install::{
    AppPaths, InstallError, JsonFileStore, MemoryStore, OperationGate, PayloadInstaller,
    PayloadStatus, VersionStore,
};
use stowage_tar::write::TarWriter;
use tokio_util::sync::CancellationToken;

fn tar(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = TarWriter::new(Vec::new());
    for (name, content) in entries {
        if let Some(dir) = name.strip_suffix('/') {
            writer.append_dir(dir, 0).unwrap();
        } else {
            writer
                .append_data(
                    name,
                    content.len() as u64,
                    0,
                    &mut Cursor::new(content.as_bytes()),
                    |_| {},
                )
                .unwrap();
        }
    }
    writer.finish().unwrap()
}

fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar(entries)).unwrap();
    encoder.finish().unwrap()
}

fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

struct Fixture {
    _temp_dir: tempfile::TempDir,
    paths: AppPaths,
    assets: PathBuf,
    store_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(temp_dir.path().join("files"));
        let assets = temp_dir.path().join("assets");
        let store_path = temp_dir.path().join("state/payload.json");
        std::fs::create_dir_all(&assets).unwrap();
        Self {
            _temp_dir: temp_dir,
            paths,
            assets,
            store_path,
        }
    }

    fn publish(&self, version: &str, entries: &[(&str, &str)]) {
        std::fs::write(
            self.assets.join("manifest.json"),
            format!(r#"{{"payload_version": "{version}", "app_version": "1.0.0"}}"#),
        )
        .unwrap();
        std::fs::write(self.assets.join("bundle.tar.gz"), tar_gz(entries)).unwrap();
    }

    fn installer(&self) -> PayloadInstaller {
        PayloadInstaller::new(
            self.paths.clone(),
            &self.assets,
            JsonFileStore::new(&self.store_path),
        )
    }

    fn app_file(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.paths.app_dir().join(name)).ok()
    }
}

fn bundle_v1() -> Vec<(&'static str, &'static str)> {
    vec![
        ("st/", ""),
        ("st/server.js", "console.log('v1')"),
        ("st/package.json", "{}"),
        ("st/config.yaml", "port: 8000\n"),
        ("st/data/", ""),
        ("st/data/default-user/readme.txt", "bundled"),
    ]
}

#[test]
fn test_fresh_install_and_upgrade() {
    let fixture = Fixture::new();
    fixture.publish("1", &bundle_v1());
    let gate = OperationGate::new();
    let permit = gate.try_acquire().unwrap();
    let installer = fixture.installer();
    assert_eq!(installer.status().unwrap(), PayloadStatus::NotInstalled);

    let layout = installer.ensure_installed(&permit).unwrap();
    assert!(layout.payload_updated);
    assert_eq!(layout.payload_version.as_deref(), Some("1"));
    assert_eq!(layout.app_entry, fixture.paths.app_dir().join("server.js"));
    assert_eq!(fixture.app_file("server.js").as_deref(), Some("console.log('v1')"));
    assert_eq!(
        installer.status().unwrap(),
        PayloadStatus::Installed {
            version: Some(String::from("1"))
        }
    );

    #[cfg(unix)]
    {
        // The bundled config moved to the persistent location, which is
        // linked into the payload.
        assert_eq!(layout.config_file, fixture.paths.config_file());
        assert_eq!(layout.data_dir, fixture.paths.data_dir());
        assert_eq!(
            std::fs::read_to_string(fixture.paths.config_file()).unwrap(),
            "port: 8000\n"
        );
        assert!(std::fs::symlink_metadata(fixture.paths.app_dir().join("data"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    // Same version again, nothing to do.
    let layout = installer.ensure_installed(&permit).unwrap();
    assert!(!layout.payload_updated);

    // A new version replaces the payload but keeps user data.
    std::fs::write(fixture.paths.data_dir().join("chat.json"), "{}").unwrap();
    fixture.publish(
        "2",
        &[("server.js", "console.log('v2')"), ("package.json", "{}")],
    );
    let layout = installer.ensure_installed(&permit).unwrap();
    assert!(layout.payload_updated);
    assert_eq!(fixture.app_file("server.js").as_deref(), Some("console.log('v2')"));
    assert!(fixture.paths.data_dir().join("chat.json").exists());
    assert!(!fixture.paths.scratch("payload_new").exists());
    assert!(!fixture.paths.scratch("payload_old").exists());
    assert_eq!(
        JsonFileStore::new(&fixture.store_path)
            .get("payload_version")
            .unwrap()
            .as_deref(),
        Some("2")
    );
}

#[test]
fn test_missing_entry_point_reextracts() {
    let fixture = Fixture::new();
    fixture.publish("1", &bundle_v1());
    let permit = OperationGate::new().try_acquire().unwrap();
    let installer = fixture.installer();
    installer.ensure_installed(&permit).unwrap();

    std::fs::remove_file(fixture.paths.app_dir().join("server.js")).unwrap();
    let layout = installer.ensure_installed(&permit).unwrap();
    assert!(layout.payload_updated);
    assert!(fixture.paths.app_dir().join("server.js").is_file());
}

#[test]
fn test_missing_bundle() {
    let fixture = Fixture::new();
    let permit = OperationGate::new().try_acquire().unwrap();
    assert_matches!(
        fixture.installer().ensure_installed(&permit),
        Err(InstallError::MissingBundle(_))
    );
}

#[test]
fn test_broken_bundle_keeps_installed_payload() {
    let fixture = Fixture::new();
    fixture.publish("1", &bundle_v1());
    let permit = OperationGate::new().try_acquire().unwrap();
    let installer = fixture.installer();
    installer.ensure_installed(&permit).unwrap();

    fixture.publish("2", &[("README.md", "no entry point here")]);
    assert_matches!(
        installer.ensure_installed(&permit),
        Err(InstallError::MissingEntryPoint(name)) if name == "server.js"
    );
    assert_eq!(fixture.app_file("server.js").as_deref(), Some("console.log('v1')"));
    assert_eq!(
        installer.status().unwrap(),
        PayloadStatus::Installed {
            version: Some(String::from("1"))
        }
    );
    assert!(!fixture.paths.scratch("payload_new").exists());
}

#[test]
fn test_cancelled_install_changes_nothing() {
    let fixture = Fixture::new();
    fixture.publish("1", &bundle_v1());
    let cancellation = CancellationToken::new();
    cancellation.cancel();
    let installer = fixture.installer().with_cancellation(cancellation);
    let permit = OperationGate::new().try_acquire().unwrap();

    assert_matches!(installer.ensure_installed(&permit), Err(InstallError::Cancelled));
    assert!(!fixture.paths.app_dir().exists());
    assert_eq!(installer.status().unwrap(), PayloadStatus::NotInstalled);
}

#[test]
fn test_custom_install_and_reset() {
    let fixture = Fixture::new();
    fixture.publish("1", &bundle_v1());
    let permit = OperationGate::new().try_acquire().unwrap();
    let installer = fixture.installer();
    installer.ensure_installed(&permit).unwrap();

    // Archives downloaded from a forge wrap everything in one folder.
    let archive = zip_archive(&[
        ("app-main/server.js", "console.log('custom')"),
        ("app-main/package.json", "{}"),
    ]);
    let mut messages = Vec::new();
    installer
        .install_custom(&permit, Cursor::new(archive), |message| {
            messages.push(message.to_owned());
        })
        .unwrap();
    assert_eq!(messages.last().map(String::as_str), Some("Done"));
    assert_eq!(installer.status().unwrap(), PayloadStatus::Custom);
    assert_eq!(fixture.app_file("server.js").as_deref(), Some("console.log('custom')"));
    assert!(!fixture.paths.scratch("custom_extract").exists());

    // The bundle does not override a custom payload.
    let layout = installer.ensure_installed(&permit).unwrap();
    assert!(!layout.payload_updated);
    assert_eq!(fixture.app_file("server.js").as_deref(), Some("console.log('custom')"));

    let layout = installer.reset_to_default(&permit).unwrap();
    assert!(layout.payload_updated);
    assert_eq!(fixture.app_file("server.js").as_deref(), Some("console.log('v1')"));
    assert_eq!(
        installer.status().unwrap(),
        PayloadStatus::Installed {
            version: Some(String::from("1"))
        }
    );
}

#[test]
fn test_custom_install_requires_files() {
    let fixture = Fixture::new();
    fixture.publish("1", &bundle_v1());
    let permit = OperationGate::new().try_acquire().unwrap();
    let installer = PayloadInstaller::new(fixture.paths.clone(), &fixture.assets, MemoryStore::default());
    installer.ensure_installed(&permit).unwrap();

    let archive = tar(&[("server.js", "console.log('custom')")]);
    assert_matches!(
        installer.install_custom(&permit, Cursor::new(archive), |_| {}),
        Err(InstallError::MissingRequiredFile(name)) if name == "package.json"
    );
    assert_eq!(fixture.app_file("server.js").as_deref(), Some("console.log('v1')"));
    assert!(!fixture.paths.scratch("custom_extract").exists());
    assert_ne!(installer.status().unwrap(), PayloadStatus::Custom);
}

#[test]
fn test_custom_install_rejects_traversal() {
    let fixture = Fixture::new();
    let permit = OperationGate::new().try_acquire().unwrap();
    let installer = fixture.installer();

    let archive = tar(&[("server.js", "x"), ("../../outside.js", "x")]);
    let result = installer.install_custom(&permit, Cursor::new(archive), |_| {});
    assert_matches!(result, Err(InstallError::Archive(_)));
    assert!(!fixture.paths.app_dir().exists());
    assert!(!fixture.paths.files_dir().join("outside.js").exists());
}
