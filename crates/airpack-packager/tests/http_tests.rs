//! HTTP sources against a mock server

mod common;

use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use airpack_core::{ChartSpec, NoProgress, read_package_definition};
use airpack_packager::{
    ChartPackager, CreateOptions, CreateOutput, DefaultChartPackager, HttpFetcher, PackageCreator,
    PackagerError, ResolveOptions, Resolver, RetryPolicy,
};
use common::{HI_SHA, RecordingPuller, StubGit, toolchain, write_package};

async fn server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/a.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/moved/a.txt"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/files/a.txt"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    server
}

fn resolver(base: &std::path::Path) -> Resolver {
    Resolver::new(base, Arc::new(StubGit)).unwrap()
}

#[tokio::test]
async fn download_with_checksum() {
    let server = server().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out/a.txt");

    resolver(dir.path())
        .resolve(
            &format!("{}/files/a.txt", server.uri()),
            &dest,
            &ResolveOptions::default().checksum(HI_SHA),
        )
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(&dest).unwrap(), "hi");
}

#[tokio::test]
async fn download_follows_redirects() {
    let server = server().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("a.txt");

    resolver(dir.path())
        .resolve(
            &format!("{}/moved/a.txt", server.uri()),
            &dest,
            &ResolveOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(&dest).unwrap(), "hi");
}

#[tokio::test]
async fn download_reports_status() {
    let server = server().await;
    let dir = TempDir::new().unwrap();

    let err = resolver(dir.path())
        .resolve(
            &format!("{}/missing.txt", server.uri()),
            &dir.path().join("missing.txt"),
            &ResolveOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PackagerError::Http { status: 404, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn download_with_wrong_checksum_leaves_nothing() {
    let server = server().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("a.txt");

    let err = resolver(dir.path())
        .resolve(
            &format!("{}/files/a.txt", server.uri()),
            &dest,
            &ResolveOptions::default().checksum("deadbeef"),
        )
        .await
        .unwrap_err();
    match err {
        PackagerError::IntegrityCheckFailed { expected, actual, .. } => {
            assert_eq!(expected, "deadbeef");
            assert_eq!(actual, HI_SHA);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn package_with_remote_file() {
    let server = server().await;
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_package(
        base.path(),
        &format!(
            r#"kind: AirpackPackageConfig
metadata:
  name: remote
  version: 1.0.0
components:
  - name: tools
    files:
      - source: {}/files/a.txt
        target: /usr/local/bin/a
        shasum: "{HI_SHA}"
        executable: true
"#,
            server.uri()
        ),
        &[],
    );

    let options = CreateOptions {
        base_dir: base.path().to_path_buf(),
        output: out.path().to_string_lossy().into_owned(),
        architecture: "amd64".to_string(),
        skip_sbom: true,
        ..Default::default()
    };
    let output = PackageCreator::new(options, toolchain(), Arc::new(RecordingPuller::default()))
        .with_retry(RetryPolicy::immediate(1))
        .create(&NoProgress)
        .await
        .unwrap();

    let CreateOutput::Archive { path, .. } = output else {
        panic!("expected an archive");
    };
    let pkg = read_package_definition(&path).unwrap();
    assert!(pkg.component("tools").unwrap().files[0].executable);
}

async fn chart_repository(digest: &str) -> MockServer {
    let server = MockServer::start().await;
    let index = format!(
        r#"apiVersion: v1
entries:
  podinfo:
    - name: podinfo
      version: 6.4.0
      urls:
        - podinfo-6.4.0.tgz
      digest: {digest}
    - name: podinfo
      version: 6.3.0
      urls:
        - podinfo-6.3.0.tgz
"#
    );
    Mock::given(method("GET"))
        .and(path("/charts/index.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/charts/podinfo-6.4.0.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn repo_chart(server: &MockServer, version: &str) -> ChartSpec {
    ChartSpec {
        name: "web".to_string(),
        repo_name: "podinfo".to_string(),
        url: format!("{}/charts", server.uri()),
        version: version.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn chart_from_repository_index() {
    let server = chart_repository(HI_SHA).await;
    let dir = TempDir::new().unwrap();
    let packager = DefaultChartPackager::new(HttpFetcher::new().unwrap(), Arc::new(StubGit));

    let output = packager
        .package(&repo_chart(&server, "6.4.0"), dir.path(), &dir.path().join("charts"))
        .await
        .unwrap();

    assert_eq!(output, dir.path().join("charts/web-6.4.0.tgz"));
    assert_eq!(fs::read_to_string(&output).unwrap(), "hi");
}

#[tokio::test]
async fn chart_with_wrong_digest_is_rejected() {
    let server = chart_repository(&"0".repeat(64)).await;
    let dir = TempDir::new().unwrap();
    let packager = DefaultChartPackager::new(HttpFetcher::new().unwrap(), Arc::new(StubGit));

    let err = packager
        .package(&repo_chart(&server, "6.4.0"), dir.path(), dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, PackagerError::IntegrityCheckFailed { .. }));
    assert!(!dir.path().join("web-6.4.0.tgz").exists());
}

#[tokio::test]
async fn chart_version_missing_from_index() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/charts/index.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("apiVersion: v1\nentries: {}\n"))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let packager = DefaultChartPackager::new(HttpFetcher::new().unwrap(), Arc::new(StubGit));

    let err = packager
        .package(&repo_chart(&server, "9.9.9"), dir.path(), dir.path())
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("9.9.9"));
}
