//! End-to-end package creation with stub tools

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use airpack_core::{
    ChecksumManifest, CoreError, NoProgress, PackageDefinition, extract_archive,
    read_package_definition,
};
use airpack_packager::{
    CreateOptions, CreateOutput, MIGRATIONS, PackageCreator, PackagerError, RetryPolicy,
};
use common::{FailingSbom, HI_SHA, RecordingPuller, toolchain, write_package};

fn web_package(shasum: &str, version: &str) -> String {
    format!(
        r#"kind: AirpackPackageConfig
metadata:
  name: demo
  version: {version}
components:
  - name: web
    files:
      - source: a.txt
        target: /opt/a.txt
        shasum: "{shasum}"
    images:
      - nginx:1.25
      - docker.io/library/nginx:1.25
"#
    )
}

fn options(base: &Path, output: &Path) -> CreateOptions {
    CreateOptions {
        base_dir: base.to_path_buf(),
        output: output.to_string_lossy().into_owned(),
        architecture: "amd64".to_string(),
        skip_sbom: true,
        ..Default::default()
    }
}

fn creator(options: CreateOptions, puller: Arc<RecordingPuller>) -> PackageCreator {
    PackageCreator::new(options, toolchain(), puller).with_retry(RetryPolicy::immediate(1))
}

async fn create_archive(base: &Path, output: &Path) -> std::path::PathBuf {
    let puller = Arc::new(RecordingPuller::default());
    match creator(options(base, output), puller)
        .create(&NoProgress)
        .await
        .unwrap()
    {
        CreateOutput::Archive { path, parts } => {
            assert!(parts.is_empty());
            path
        }
        other => panic!("expected an archive, got {:?}", other),
    }
}

#[tokio::test]
async fn create_writes_checksummed_archive() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_package(base.path(), &web_package(HI_SHA, "1.0.0"), &[("a.txt", "hi")]);

    let puller = Arc::new(RecordingPuller::default());
    let output = creator(options(base.path(), out.path()), puller.clone())
        .create(&NoProgress)
        .await
        .unwrap();

    let archive = match output {
        CreateOutput::Archive { path, .. } => path,
        other => panic!("expected an archive, got {:?}", other),
    };
    assert_eq!(
        archive.file_name().unwrap().to_string_lossy(),
        "airpack-package-demo-amd64-1.0.0.tar.gz"
    );
    assert_eq!(puller.pulled(), vec!["docker.io/library/nginx:1.25"]);

    let contents = TempDir::new().unwrap();
    extract_archive(&archive, contents.path()).unwrap();
    let pkg = PackageDefinition::load(contents.path()).unwrap();
    let checksums = ChecksumManifest::load(contents.path()).unwrap();

    assert_eq!(pkg.metadata.architecture, "amd64");
    assert_eq!(pkg.build.migrations, MIGRATIONS);
    assert_eq!(pkg.metadata.aggregate_checksum, checksums.aggregate());
    assert!(
        checksums
            .entries
            .iter()
            .any(|e| e.path == "components/web.tar")
    );
    assert!(checksums.verify(contents.path()).unwrap().valid);
    assert!(contents.path().join("images/index.json").is_file());
    assert!(!contents.path().join("components/web").exists());
}

#[tokio::test]
async fn aggregate_tracks_component_content() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let out_a = TempDir::new().unwrap();
    let out_b = TempDir::new().unwrap();
    write_package(first.path(), &web_package(HI_SHA, "1.0.0"), &[("a.txt", "hi")]);
    write_package(second.path(), &web_package("", "1.0.0"), &[("a.txt", "bye")]);

    let a = read_package_definition(&create_archive(first.path(), out_a.path()).await).unwrap();
    let b = read_package_definition(&create_archive(second.path(), out_b.path()).await).unwrap();
    assert_ne!(a.metadata.aggregate_checksum, b.metadata.aggregate_checksum);
}

#[tokio::test]
async fn checksum_mismatch_fails_the_build() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_package(base.path(), &web_package("deadbeef", "1.0.0"), &[("a.txt", "hi")]);

    let err = creator(
        options(base.path(), out.path()),
        Arc::new(RecordingPuller::default()),
    )
    .create(&NoProgress)
    .await
    .unwrap_err();

    match err {
        PackagerError::Component { name, source } => {
            assert_eq!(name, "web");
            assert!(matches!(*source, PackagerError::IntegrityCheckFailed { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn split_archive_writes_parts() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let yaml = r#"kind: AirpackPackageConfig
metadata:
  name: big
  version: 1.0.0
  uncompressed: true
components:
  - name: blob
    files:
      - source: blob.bin
        target: /opt/blob.bin
"#;
    let blob: String = (0..(3 * 1024 * 1024)).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    write_package(base.path(), yaml, &[("blob.bin", &blob)]);

    let options = CreateOptions {
        max_package_size_mb: 1,
        ..options(base.path(), out.path())
    };
    let output = creator(options, Arc::new(RecordingPuller::default()))
        .create(&NoProgress)
        .await
        .unwrap();

    let CreateOutput::Archive { path, parts } = output else {
        panic!("expected an archive");
    };
    assert!(parts.len() > 2);
    assert!(!path.exists());
    assert!(parts[0].to_string_lossy().ends_with(".part000"));

    let pkg = read_package_definition(&parts[0]).unwrap();
    assert_eq!(pkg.metadata.name, "big");
}

#[tokio::test]
async fn differential_drops_shipped_images() {
    let previous = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_package(
        previous.path(),
        r#"kind: AirpackPackageConfig
metadata:
  name: demo
  version: 1.0.0
components:
  - name: web
    images:
      - nginx:1.25
      - busybox:latest
  - name: legacy
    images:
      - redis:7.2
"#,
        &[],
    );
    write_package(
        base.path(),
        r#"kind: AirpackPackageConfig
metadata:
  name: demo
  version: 1.1.0
components:
  - name: web
    images:
      - nginx:1.25
      - busybox:latest
      - alpine:3.19
"#,
        &[],
    );

    let puller = Arc::new(RecordingPuller::default());
    let options = CreateOptions {
        differential: Some(previous.path().to_path_buf()),
        ..options(base.path(), out.path())
    };
    let output = creator(options, puller.clone()).create(&NoProgress).await.unwrap();

    let mut pulled = puller.pulled();
    pulled.sort();
    assert_eq!(
        pulled,
        vec!["docker.io/library/alpine:3.19", "docker.io/library/busybox:latest"]
    );
    let CreateOutput::Archive { path, .. } = output else {
        panic!("expected an archive");
    };
    assert_eq!(
        path.file_name().unwrap().to_string_lossy(),
        "airpack-package-demo-amd64-1.0.0-differential-1.1.0.tar.gz"
    );
    let pkg = read_package_definition(&path).unwrap();
    assert!(pkg.build.differential);
    assert_eq!(pkg.build.differential_package_version, "1.0.0");
    assert_eq!(pkg.build.differential_missing, vec!["legacy"]);
}

#[tokio::test]
async fn differential_requires_distinct_versions() {
    let previous = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let yaml = "kind: AirpackPackageConfig\nmetadata:\n  name: demo\n  version: 1.0.0\n";
    write_package(previous.path(), yaml, &[]);
    write_package(base.path(), yaml, &[]);

    let options = CreateOptions {
        differential: Some(previous.path().to_path_buf()),
        ..options(base.path(), out.path())
    };
    let err = creator(options, Arc::new(RecordingPuller::default()))
        .create(&NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PackagerError::Core(CoreError::DifferentialSameVersion { .. })
    ));
}

#[tokio::test]
async fn differential_requires_versions() {
    let previous = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let yaml = "kind: AirpackPackageConfig\nmetadata:\n  name: demo\n";
    write_package(previous.path(), yaml, &[]);
    write_package(base.path(), yaml, &[]);

    let options = CreateOptions {
        differential: Some(previous.path().to_path_buf()),
        ..options(base.path(), out.path())
    };
    let err = creator(options, Arc::new(RecordingPuller::default()))
        .create(&NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PackagerError::Core(CoreError::DifferentialNoVersion)
    ));
}

#[tokio::test]
async fn checksums_file_lists_shipped_files() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let yaml = r#"kind: AirpackPackageConfig
metadata:
  name: plain
  version: 0.1.0
components:
  - name: docs
    files:
      - source: a.txt
        target: /opt/a.txt
"#;
    write_package(base.path(), yaml, &[("a.txt", "hi")]);
    let archive = create_archive(base.path(), out.path()).await;

    let contents = TempDir::new().unwrap();
    extract_archive(&archive, contents.path()).unwrap();
    let checksums = fs::read_to_string(contents.path().join("checksums.txt")).unwrap();
    let paths: Vec<&str> = checksums
        .lines()
        .map(|line| line.split_once("  ").unwrap().1)
        .collect();
    assert_eq!(paths, vec!["components/docs.tar"]);
    assert!(checksums.starts_with(&format!("{}  ", airpack_core::hash_file(
        &contents.path().join("components/docs.tar")
    ).unwrap())));
}

#[tokio::test]
async fn images_are_pulled_for_package_architecture() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_package(base.path(), &web_package(HI_SHA, "1.0.0"), &[("a.txt", "hi")]);

    let puller = Arc::new(RecordingPuller::default());
    let options = CreateOptions {
        architecture: "arm64".to_string(),
        ..options(base.path(), out.path())
    };
    let output = creator(options, puller.clone()).create(&NoProgress).await.unwrap();

    assert_eq!(puller.architectures(), vec!["arm64"]);
    let CreateOutput::Archive { path, .. } = output else {
        panic!("expected an archive");
    };
    assert_eq!(
        path.file_name().unwrap().to_string_lossy(),
        "airpack-package-demo-arm64-1.0.0.tar.gz"
    );
}

#[tokio::test]
async fn sbom_failure_does_not_fail_the_build() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_package(base.path(), &web_package(HI_SHA, "1.0.0"), &[("a.txt", "hi")]);

    let options = CreateOptions {
        skip_sbom: false,
        ..options(base.path(), out.path())
    };
    let tools = airpack_packager::Toolchain {
        sbom: Arc::new(FailingSbom),
        ..toolchain()
    };
    let output = PackageCreator::new(options, tools, Arc::new(RecordingPuller::default()))
        .with_retry(RetryPolicy::immediate(1))
        .create(&NoProgress)
        .await
        .unwrap();

    let CreateOutput::Archive { path, .. } = output else {
        panic!("expected an archive");
    };
    let contents = TempDir::new().unwrap();
    extract_archive(&path, contents.path()).unwrap();
    assert!(contents.path().join("components/web.tar").is_file());
    assert!(!contents.path().join("sboms.tar").exists());
}
