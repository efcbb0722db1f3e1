//! Component imports, local and through a registry

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use airpack_core::{NoProgress, PackageDefinition, read_package_definition};
use airpack_oci::{MemoryRegistry, OciCache, OciReference, OciRemote, Registry};
use airpack_packager::{
    CreateOptions, CreateOutput, PackageCreator, PackageDistributor, PackagerError, PublishOptions,
    RetryPolicy, verify_package,
};
use common::{HI_SHA, RecordingPuller, StubGit, toolchain, write_package};

const SKELETON_REF: &str = "oci://registry.test/skeletons/lib:1.0.0-skeleton";

fn options(base: &Path, output: &Path) -> CreateOptions {
    CreateOptions {
        base_dir: base.to_path_buf(),
        output: output.to_string_lossy().into_owned(),
        architecture: "amd64".to_string(),
        skip_sbom: true,
        ..Default::default()
    }
}

struct Fixture {
    registry: Arc<MemoryRegistry>,
    cache: TempDir,
    out: TempDir,
    puller: Arc<RecordingPuller>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            registry: Arc::new(MemoryRegistry::new()),
            cache: TempDir::new().unwrap(),
            out: TempDir::new().unwrap(),
            puller: Arc::new(RecordingPuller::default()),
        }
    }

    fn registry(&self) -> Arc<dyn Registry> {
        self.registry.clone()
    }

    fn creator(&self, base: &Path) -> PackageCreator {
        PackageCreator::new(options(base, self.out.path()), toolchain(), self.puller.clone())
            .with_registry(self.registry(), OciCache::open(self.cache.path()).unwrap())
            .with_retry(RetryPolicy::immediate(1))
    }

    async fn publish_library(&self) {
        let lib = TempDir::new().unwrap();
        write_package(
            lib.path(),
            &format!(
                r#"kind: AirpackPackageConfig
metadata:
  name: lib
  version: 1.0.0
variables:
  - name: DOMAIN
    default: example.com
components:
  - name: web
    description: web server files
    files:
      - source: a.txt
        target: /opt/a.txt
        shasum: "{HI_SHA}"
  - name: cfg
    images:
      - redis:7.2
"#
            ),
            &[("a.txt", "hi")],
        );

        let published = PackageDistributor::new(self.registry(), Arc::new(StubGit))
            .publish(
                &PublishOptions {
                    source: lib.path().to_path_buf(),
                    repository: "oci://registry.test/skeletons".to_string(),
                    ..Default::default()
                },
                &NoProgress,
            )
            .await
            .unwrap();
        assert_eq!(published.reference, SKELETON_REF);
    }
}

async fn create(creator: PackageCreator) -> airpack_packager::Result<PackageDefinition> {
    match creator.create(&NoProgress).await? {
        CreateOutput::Archive { path, .. } => Ok(read_package_definition(&path)?),
        other => panic!("expected an archive, got {:?}", other),
    }
}

#[tokio::test]
async fn local_import_rebases_paths_and_merges_variables() {
    let root = TempDir::new().unwrap();
    let head = root.path().join("app");
    write_package(
        &head,
        r#"kind: AirpackPackageConfig
metadata:
  name: app
  version: 1.0.0
components:
  - name: web
    required: true
    import:
      path: ../shared
"#,
        &[],
    );
    write_package(
        &root.path().join("shared"),
        &format!(
            r#"kind: AirpackPackageConfig
metadata:
  name: shared
variables:
  - name: DOMAIN
    default: example.com
components:
  - name: web
    description: shared web files
    files:
      - source: a.txt
        target: /opt/a.txt
        shasum: "{HI_SHA}"
"#
        ),
        &[("a.txt", "hi")],
    );

    let fixture = Fixture::new();
    let pkg = create(fixture.creator(&head)).await.unwrap();

    let web = pkg.component("web").unwrap();
    assert!(web.import.is_empty());
    assert_eq!(web.required, Some(true));
    assert_eq!(web.description.as_deref(), Some("shared web files"));
    assert_eq!(web.files[0].source, "../shared/a.txt");
    assert_eq!(pkg.variables.len(), 1);
    assert_eq!(pkg.variables[0].name, "DOMAIN");
}

#[tokio::test]
async fn import_chain_keeps_content_of_every_package() {
    let root = TempDir::new().unwrap();
    write_package(
        &root.path().join("app"),
        r#"kind: AirpackPackageConfig
metadata:
  name: app
  version: 1.0.0
components:
  - name: web
    images:
      - busybox:latest
    import:
      path: ../mid
"#,
        &[],
    );
    write_package(
        &root.path().join("mid"),
        &format!(
            r#"kind: AirpackPackageConfig
metadata:
  name: mid
components:
  - name: web
    description: mid layer
    images:
      - mid-only:1.0
    files:
      - source: mid.txt
        target: /opt/mid.txt
        shasum: "{HI_SHA}"
    actions:
      onCreate:
        before:
          - cmd: echo mid
    import:
      path: ../leaf
"#
        ),
        &[("mid.txt", "hi")],
    );
    write_package(
        &root.path().join("leaf"),
        &format!(
            r#"kind: AirpackPackageConfig
metadata:
  name: leaf
components:
  - name: web
    description: leaf layer
    images:
      - leaf:1.0
    files:
      - source: a.txt
        target: /opt/a.txt
        shasum: "{HI_SHA}"
"#
        ),
        &[("a.txt", "hi")],
    );

    let fixture = Fixture::new();
    let pkg = create(fixture.creator(&root.path().join("app"))).await.unwrap();

    let web = pkg.component("web").unwrap();
    assert!(web.import.is_empty());
    assert_eq!(web.description.as_deref(), Some("mid layer"));
    let sources: Vec<&str> = web.files.iter().map(|f| f.source.as_str()).collect();
    assert_eq!(sources, vec!["../leaf/a.txt", "../mid/mid.txt"]);
    assert_eq!(web.images, vec!["leaf:1.0", "mid-only:1.0", "busybox:latest"]);
    assert_eq!(web.actions.on_create.before[0].dir.as_deref(), Some("../mid"));

    let mut pulled = fixture.puller.pulled();
    pulled.sort();
    assert_eq!(
        pulled,
        vec![
            "docker.io/library/busybox:latest",
            "docker.io/library/leaf:1.0",
            "docker.io/library/mid-only:1.0",
        ]
    );
}

#[tokio::test]
async fn invalid_imported_package_is_rejected() {
    let root = TempDir::new().unwrap();
    write_package(
        root.path(),
        r#"kind: AirpackPackageConfig
metadata:
  name: app
components:
  - name: web
    import:
      path: child
"#,
        &[],
    );
    write_package(
        &root.path().join("child"),
        "kind: AirpackPackageConfig\nmetadata:\n  name: child\ncomponents:\n  - name: web\n  - name: web\n",
        &[],
    );

    let fixture = Fixture::new();
    let err = create(fixture.creator(root.path())).await.unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn local_import_cycle_is_rejected() {
    let root = TempDir::new().unwrap();
    write_package(
        root.path(),
        r#"kind: AirpackPackageConfig
metadata:
  name: app
components:
  - name: web
    import:
      path: child
"#,
        &[],
    );
    write_package(
        &root.path().join("child"),
        r#"kind: AirpackPackageConfig
metadata:
  name: child
components:
  - name: web
    import:
      path: ..
"#,
        &[],
    );

    let fixture = Fixture::new();
    let err = create(fixture.creator(root.path())).await.unwrap_err();
    match err {
        PackagerError::ImportCycle { chain } => assert!(chain.starts_with("web -> child")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn missing_imported_component_is_reported() {
    let root = TempDir::new().unwrap();
    write_package(
        root.path(),
        r#"kind: AirpackPackageConfig
metadata:
  name: app
components:
  - name: web
    import:
      path: child
      name: api
"#,
        &[],
    );
    write_package(
        &root.path().join("child"),
        "kind: AirpackPackageConfig\nmetadata:\n  name: child\ncomponents:\n  - name: web\n",
        &[],
    );

    let fixture = Fixture::new();
    let err = create(fixture.creator(root.path())).await.unwrap_err();
    assert!(matches!(
        err,
        PackagerError::ImportedComponentNotFound { ref name, .. } if name == "api"
    ));
}

#[tokio::test]
async fn remote_import_uses_published_skeleton() {
    let fixture = Fixture::new();
    fixture.publish_library().await;

    let head = TempDir::new().unwrap();
    write_package(
        head.path(),
        &format!(
            r#"kind: AirpackPackageConfig
metadata:
  name: app
  version: 2.0.0
components:
  - name: web
    import:
      url: {SKELETON_REF}
  - name: cache
    import:
      name: cfg
      url: {SKELETON_REF}
"#
        ),
        &[],
    );

    let pkg = create(fixture.creator(head.path())).await.unwrap();

    let web = pkg.component("web").unwrap();
    assert!(web.import.is_empty());
    assert_eq!(web.description.as_deref(), Some("web server files"));
    assert_eq!(web.files[0].shasum, HI_SHA);
    assert!(web.files[0].source.ends_with("files/0/a.txt"));

    // cfg has no packaged files, so it composes from an empty cache directory
    let cache = pkg.component("cache").unwrap();
    assert_eq!(cache.images, vec!["redis:7.2"]);
    assert_eq!(fixture.puller.pulled(), vec!["docker.io/library/redis:7.2"]);
    assert_eq!(pkg.variables[0].name, "DOMAIN");
}

#[tokio::test]
async fn remote_import_fetches_each_blob_once() {
    let fixture = Fixture::new();
    fixture.publish_library().await;

    let head = TempDir::new().unwrap();
    write_package(
        head.path(),
        &format!(
            "kind: AirpackPackageConfig\nmetadata:\n  name: app\ncomponents:\n  - name: web\n    import:\n      url: {SKELETON_REF}\n"
        ),
        &[],
    );

    create(fixture.creator(head.path())).await.unwrap();
    create(fixture.creator(head.path())).await.unwrap();

    let reference = OciReference::parse(SKELETON_REF).unwrap();
    let root = OciRemote::new(fixture.registry(), reference)
        .fetch_root()
        .await
        .unwrap();
    let digest = root.locate("components/web.tar").digest;
    assert_eq!(fixture.registry.fetch_count(&digest), 1);
}

#[tokio::test]
async fn created_package_from_remote_import_verifies() {
    let fixture = Fixture::new();
    fixture.publish_library().await;

    let head = TempDir::new().unwrap();
    write_package(
        head.path(),
        &format!(
            "kind: AirpackPackageConfig\nmetadata:\n  name: app\n  version: 2.0.0\ncomponents:\n  - name: web\n    import:\n      url: {SKELETON_REF}\n"
        ),
        &[],
    );

    let CreateOutput::Archive { path, .. } = fixture.creator(head.path()).create(&NoProgress).await.unwrap()
    else {
        panic!("expected an archive");
    };
    let report = verify_package(&path, None).unwrap();
    assert!(report.is_valid());
}

#[tokio::test]
async fn nested_remote_import_is_rejected() {
    let fixture = Fixture::new();
    let nested = "oci://registry.test/skeletons/nested:1.0.0-skeleton";

    let build = TempDir::new().unwrap();
    write_package(
        build.path(),
        r#"kind: AirpackPackageConfig
metadata:
  name: nested
  version: 1.0.0
components:
  - name: web
    import:
      url: oci://registry.test/skeletons/lib:1.0.0-skeleton
"#,
        &[("checksums.txt", "")],
    );
    let pkg = PackageDefinition::load(build.path()).unwrap();
    OciRemote::new(fixture.registry(), OciReference::parse(nested).unwrap())
        .publish_dir(build.path(), &pkg, &NoProgress)
        .await
        .unwrap();

    let head = TempDir::new().unwrap();
    write_package(
        head.path(),
        &format!(
            "kind: AirpackPackageConfig\nmetadata:\n  name: app\ncomponents:\n  - name: web\n    import:\n      url: {nested}\n"
        ),
        &[],
    );

    let err = create(fixture.creator(head.path())).await.unwrap_err();
    assert!(matches!(err, PackagerError::NestedRemoteImport { .. }));
    insta::assert_snapshot!(
        err.to_string(),
        @"Component web imports oci://registry.test/skeletons/nested:1.0.0-skeleton, whose component itself declares a remote import; nested remote imports are not supported"
    );
}

#[tokio::test]
async fn unpublished_skeleton_is_a_configuration_error() {
    let fixture = Fixture::new();
    let head = TempDir::new().unwrap();
    write_package(
        head.path(),
        &format!(
            "kind: AirpackPackageConfig\nmetadata:\n  name: app\ncomponents:\n  - name: web\n    import:\n      url: {SKELETON_REF}\n"
        ),
        &[],
    );

    let err = create(fixture.creator(head.path())).await.unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("does not exist"));
    assert!(fs::read_dir(fixture.out.path()).unwrap().next().is_none());
}
