//! Content resolution: local paths, HTTP downloads and git repositories
//!
//! Everything is materialized into a staging directory next to the
//! destination, checked, and only then renamed into place. A failed or
//! cancelled resolve leaves no partial file behind.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;
use walkdir::WalkDir;

use airpack_core::archive::extract_entry;
use airpack_core::checksums::hash_file;
use airpack_core::differential::split_repo_ref;

use crate::error::{PackagerError, Result};
use crate::tools::GitClient;

const MAX_REDIRECTS: u32 = 10;

/// Where content comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local(PathBuf),
    Http(Url),
    Git { url: String, reference: Option<String> },
}

/// Whether a string is an http(s) URL
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn is_git_url(source: &str) -> bool {
    let (url, _) = split_repo_ref(source);
    url.ends_with(".git") || source.starts_with("git://") || source.starts_with("ssh://")
}

impl Source {
    /// Classify a source string; relative local paths resolve against `base`
    pub fn parse(source: &str, base: &Path) -> Result<Self> {
        if is_git_url(source) {
            let (url, reference) = split_repo_ref(source);
            return Ok(Source::Git {
                url: url.to_string(),
                reference: reference.map(str::to_string),
            });
        }
        if is_url(source) {
            let url = Url::parse(source)
                .map_err(|e| PackagerError::config(format!("invalid URL {}: {}", source, e)))?;
            return Ok(Source::Http(url));
        }
        if source.contains("://") {
            return Err(PackagerError::config(format!(
                "unsupported source scheme: {}",
                source
            )));
        }
        let path = Path::new(source);
        Ok(Source::Local(if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }))
    }
}

/// Options for one resolve call
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Expected SHA-256 of the materialized file
    pub checksum: Option<String>,
    /// Entry to take out of an archive source
    pub extract_path: Option<String>,
    /// Mark the result executable
    pub executable: bool,
}

impl ResolveOptions {
    pub fn checksum(mut self, checksum: &str) -> Self {
        self.checksum = (!checksum.is_empty()).then(|| checksum.to_string());
        self
    }

    pub fn extract_path(mut self, path: &str) -> Self {
        self.extract_path = (!path.is_empty()).then(|| path.to_string());
        self
    }

    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }
}

/// HTTP downloader with manual redirect handling
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PackagerError::Network {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let network = |url: &str, e: &dyn std::fmt::Display| PackagerError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };

        let mut current = url.to_string();
        let mut redirects = 0;
        loop {
            let response = self
                .client
                .get(&current)
                .send()
                .await
                .map_err(|e| network(&current, &e))?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(network(url, &format!("too many redirects (max {})", MAX_REDIRECTS)));
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| network(&current, &"redirect without Location header"))?;
                let next = Url::parse(&current)
                    .and_then(|base| base.join(location))
                    .map_err(|e| network(&current, &e))?;
                tracing::debug!(from = %current, to = %next, "following redirect");
                current = next.to_string();
                continue;
            }

            if !status.is_success() {
                return Err(PackagerError::Http {
                    url: current,
                    status: status.as_u16(),
                });
            }
            return Ok(response);
        }
    }

    /// Read a whole response body into memory
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        let bytes = response.bytes().await.map_err(|e| PackagerError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    /// Stream a URL into `dest`
    pub async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self.get(url).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| PackagerError::io(dest, e))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PackagerError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| PackagerError::io(dest, e))?;
        }
        file.flush().await.map_err(|e| PackagerError::io(dest, e))?;
        tracing::debug!(url = %url, dest = %dest.display(), "downloaded");
        Ok(())
    }
}

/// Resolves sources into destinations
pub struct Resolver {
    base: PathBuf,
    http: HttpFetcher,
    git: Arc<dyn GitClient>,
    cancel: CancellationToken,
}

impl Resolver {
    /// Resolver for a package rooted at `base`
    pub fn new(base: impl Into<PathBuf>, git: Arc<dyn GitClient>) -> Result<Self> {
        Ok(Self {
            base: base.into(),
            http: HttpFetcher::new()?,
            git,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    pub fn git(&self) -> &Arc<dyn GitClient> {
        &self.git
    }

    /// Materialize `source` at `dest`
    ///
    /// An existing destination is replaced. With a checksum, the content is
    /// rejected before it reaches `dest` when its SHA-256 differs.
    pub async fn resolve(&self, source: &str, dest: &Path, options: &ResolveOptions) -> Result<()> {
        let parsed = Source::parse(source, &self.base)?;
        let parent = dest
            .parent()
            .ok_or_else(|| PackagerError::config(format!("invalid destination {}", dest.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| PackagerError::io(parent, e))?;

        let staging = tempfile::Builder::new()
            .prefix(".resolve-")
            .tempdir_in(parent)
            .map_err(|e| PackagerError::io(parent, e))?;
        let staged = staging.path().join(
            dest.file_name()
                .ok_or_else(|| PackagerError::config(format!("invalid destination {}", dest.display())))?,
        );

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(PackagerError::Cancelled),
            result = self.materialize(&parsed, source, staging.path(), &staged, options) => result?,
        }

        if let Some(expected) = &options.checksum {
            if staged.is_dir() {
                return Err(PackagerError::config(format!(
                    "a checksum was declared for {} but it resolved to a directory",
                    source
                )));
            }
            let actual = hash_file(&staged)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(PackagerError::IntegrityCheckFailed {
                    source_ref: source.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        set_mode(&staged, if options.executable || staged.is_dir() { 0o700 } else { 0o600 })?;

        remove_existing(dest)?;
        std::fs::rename(&staged, dest).map_err(|e| PackagerError::io(dest, e))?;
        Ok(())
    }

    async fn materialize(
        &self,
        parsed: &Source,
        source: &str,
        staging: &Path,
        staged: &Path,
        options: &ResolveOptions,
    ) -> Result<()> {
        match parsed {
            Source::Local(path) => {
                if !path.exists() {
                    return Err(PackagerError::io(
                        path,
                        std::io::Error::new(std::io::ErrorKind::NotFound, "source does not exist"),
                    ));
                }
                match &options.extract_path {
                    Some(entry) => extract_entry(path, entry, staged)?,
                    None => copy_path(path, staged)?,
                }
            }
            Source::Http(url) => match &options.extract_path {
                Some(entry) => {
                    let name = url
                        .path_segments()
                        .and_then(|mut s| s.next_back())
                        .filter(|s| !s.is_empty())
                        .unwrap_or("download");
                    let archive = staging.join(format!("archive-{}", name));
                    self.http.download(url.as_str(), &archive).await?;
                    extract_entry(&archive, entry, staged)?;
                }
                None => self.http.download(url.as_str(), staged).await?,
            },
            Source::Git { url, reference } => {
                if options.extract_path.is_some() {
                    return Err(PackagerError::config(format!(
                        "extractPath is not supported for git source {}",
                        source
                    )));
                }
                self.git
                    .clone_repo(url, reference.as_deref(), staged)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Copy a file or a directory tree
pub(crate) fn copy_path(src: &Path, dest: &Path) -> Result<()> {
    let meta = std::fs::metadata(src).map_err(|e| PackagerError::io(src, e))?;
    if !meta.is_dir() {
        std::fs::copy(src, dest).map_err(|e| PackagerError::io(src, e))?;
        return Ok(());
    }

    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| PackagerError::config(format!("failed to walk {}: {}", src.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PackagerError::config(e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| PackagerError::io(&target, e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| PackagerError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

pub(crate) fn remove_existing(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PackagerError::io(path, e)),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path).map_err(|e| PackagerError::io(path, e))
    } else {
        std::fs::remove_file(path).map_err(|e| PackagerError::io(path, e))
    }
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| PackagerError::io(path, e))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::GitCli;
    use tempfile::TempDir;

    const HI_SHA: &str = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";

    fn resolver(base: &Path) -> Resolver {
        Resolver::new(base, Arc::new(GitCli)).unwrap()
    }

    #[test]
    fn test_parse_sources() {
        let base = Path::new("/pkg");
        assert_eq!(
            Source::parse("files/a.txt", base).unwrap(),
            Source::Local(PathBuf::from("/pkg/files/a.txt"))
        );
        assert!(matches!(
            Source::parse("https://example.com/a.txt", base).unwrap(),
            Source::Http(_)
        ));
        assert_eq!(
            Source::parse("https://github.com/org/repo.git@v1.0.0", base).unwrap(),
            Source::Git {
                url: "https://github.com/org/repo.git".to_string(),
                reference: Some("v1.0.0".to_string()),
            }
        );
        assert!(Source::parse("ftp://example.com/a", base).is_err());
    }

    #[tokio::test]
    async fn test_local_copy_with_checksum() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let dest = dir.path().join("out/files/0/a.txt");

        resolver(dir.path())
            .resolve("a.txt", &dest, &ResolveOptions::default().checksum(HI_SHA))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hi");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let dest = dir.path().join("out/a.txt");

        let err = resolver(dir.path())
            .resolve("a.txt", &dest, &ResolveOptions::default().checksum("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, PackagerError::IntegrityCheckFailed { .. }));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_executable_and_directory_modes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tool.sh"), "#!/bin/sh\n").unwrap();
        std::fs::create_dir_all(dir.path().join("tree/sub")).unwrap();
        std::fs::write(dir.path().join("tree/sub/x"), "x").unwrap();

        let r = resolver(dir.path());
        let tool = dir.path().join("out/tool.sh");
        r.resolve("tool.sh", &tool, &ResolveOptions::default().executable(true))
            .await
            .unwrap();
        let tree = dir.path().join("out/tree");
        r.resolve("tree", &tree, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(tree.join("sub/x")).unwrap(), "x");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode(&tool), 0o700);
            assert_eq!(mode(&tree), 0o700);
        }
    }

    #[tokio::test]
    async fn test_resolve_overwrites_existing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "new").unwrap();
        let dest = dir.path().join("out/a.txt");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, "old").unwrap();

        resolver(dir.path())
            .resolve("a.txt", &dest, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_missing_local_source() {
        let dir = TempDir::new().unwrap();
        let err = resolver(dir.path())
            .resolve("nope.txt", &dir.path().join("out/nope.txt"), &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }
}
