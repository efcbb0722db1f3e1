//! Shared fixtures: stub tools, a recording image puller and package writers

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use airpack_core::layout::ImagePaths;
use airpack_core::{ChartSpec, ImageRef};
use airpack_packager::{
    ChartPackager, GitClient, ImagePuller, KustomizeBuilder, PulledImage, Result, SbomCataloger,
    Toolchain,
};

/// sha256 of "hi"
pub const HI_SHA: &str = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";

pub struct StubGit;

#[async_trait]
impl GitClient for StubGit {
    async fn clone_repo(&self, url: &str, _reference: Option<&str>, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        fs::write(dest.join("README.md"), url)?;
        Ok(())
    }
}

pub struct StubKustomize;

#[async_trait]
impl KustomizeBuilder for StubKustomize {
    async fn build(&self, dir: &Path, dest: &Path, _allow_any_directory: bool) -> Result<()> {
        fs::write(dest, format!("# built from {}\n", dir.display()))?;
        Ok(())
    }
}

pub struct StubCharts;

#[async_trait]
impl ChartPackager for StubCharts {
    async fn package(&self, chart: &ChartSpec, _base: &Path, charts_dir: &Path) -> Result<PathBuf> {
        let out = charts_dir.join(format!("{}-{}.tgz", chart.name, chart.version));
        fs::write(&out, "chart")?;
        Ok(out)
    }
}

pub struct NoSbom;

#[async_trait]
impl SbomCataloger for NoSbom {
    async fn catalog(
        &self,
        _base: &Path,
        _components: &BTreeMap<String, Vec<PathBuf>>,
        _images: &[ImageRef],
        _output: &Path,
    ) -> Result<()> {
        Ok(())
    }
}

/// Cataloger that always fails, as syft does without a docker daemon
pub struct FailingSbom;

#[async_trait]
impl SbomCataloger for FailingSbom {
    async fn catalog(
        &self,
        _base: &Path,
        _components: &BTreeMap<String, Vec<PathBuf>>,
        _images: &[ImageRef],
        output: &Path,
    ) -> Result<()> {
        Err(airpack_packager::PackagerError::Tool {
            tool: "syft",
            target: output.display().to_string(),
            message: "exit status 1".to_string(),
        })
    }
}

pub fn toolchain() -> Toolchain {
    Toolchain {
        git: Arc::new(StubGit),
        kustomize: Arc::new(StubKustomize),
        charts: Arc::new(StubCharts),
        sbom: Arc::new(NoSbom),
    }
}

/// Records every pull without touching a registry
#[derive(Default)]
pub struct RecordingPuller {
    pulled: Mutex<Vec<String>>,
    architectures: Mutex<Vec<String>>,
}

impl RecordingPuller {
    pub fn pulled(&self) -> Vec<String> {
        self.pulled.lock().unwrap().clone()
    }

    /// Architecture requested for each pull
    pub fn architectures(&self) -> Vec<String> {
        self.architectures.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImagePuller for RecordingPuller {
    async fn pull(&self, image: &ImageRef, architecture: &str, _layout: &ImagePaths) -> Result<PulledImage> {
        self.pulled.lock().unwrap().push(image.to_string());
        self.architectures.lock().unwrap().push(architecture.to_string());
        Ok(PulledImage {
            image: image.clone(),
            manifest_digest: format!("sha256:{}", HI_SHA),
            manifest_size: 2,
            has_layers: false,
        })
    }
}

/// Write `airpack.yaml` and extra files into `dir`
pub fn write_package(dir: &Path, yaml: &str, files: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("airpack.yaml"), yaml).unwrap();
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}
