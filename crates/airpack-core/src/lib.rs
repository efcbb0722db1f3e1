//! Airpack Core - package model and on-disk formats for airgap packages
//!
//! This crate provides the synchronous building blocks shared by the build
//! pipeline and the registry transport:
//! - `PackageDefinition`: the `airpack.yaml` model and its validation
//! - `ImageRef`: normalized container image references
//! - `PackagePaths` / `ComponentPaths`: the build directory layout
//! - `ChecksumManifest`: `checksums.txt` and the aggregate checksum
//! - archive, split and signing helpers for the final artifact

pub mod archive;
pub mod checksums;
pub mod config;
pub mod differential;
pub mod error;
pub mod image;
pub mod layout;
pub mod package;
pub mod progress;
pub mod signing;
pub mod split;

pub use archive::{
    archive_component, archive_dir, archive_name, create_package_archive, extract_archive,
    extract_entry, extract_stripped, read_package_definition,
};
pub use checksums::{ChecksumManifest, VerificationResult, hash_bytes, hash_file};
pub use config::Config;
pub use differential::DifferentialData;
pub use error::{CoreError, Result};
pub use image::{ImageRef, unique_images};
pub use layout::{ComponentPaths, PackagePaths};
pub use package::{
    Action, ActionDefaults, ActionSet, ChartSpec, Component, ComponentFile, ComponentImport,
    DataInjection, ManifestSpec, PACKAGE_YAML, PackageDefinition, PackageKind, PackageMetadata,
};
pub use progress::{NoProgress, Progress};
