//! Airpack Packager - the package build pipeline
//!
//! This crate turns an `airpack.yaml` into a package:
//! - `Resolver`: materializes local, HTTP and git sources with checksum gates
//! - `ComponentAssembler`: builds one component directory with its actions
//! - `ImageAggregator`: pulls the deduplicated image list with bounded retry
//! - `Composer`: flattens component import chains, local or from a registry
//! - `helm`: charts from Helm repositories and `oci://` references
//! - `PackageCreator`: the create pipeline, from definition to archive
//! - `PackageDistributor`: publish, skeleton publish and pull
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use airpack_core::progress::LogProgress;
//! use airpack_oci::{Credentials, OciDistributionRegistry, RemoteOptions};
//! use airpack_packager::{CreateOptions, PackageCreator, RegistryImagePuller, Toolchain};
//!
//! # async fn example() -> airpack_packager::Result<()> {
//! let registry = Arc::new(OciDistributionRegistry::new(
//!     &RemoteOptions::default(),
//!     Credentials::Anonymous,
//! ));
//! let options = CreateOptions {
//!     base_dir: "./my-package".into(),
//!     output: "./dist".to_string(),
//!     architecture: "amd64".to_string(),
//!     ..Default::default()
//! };
//! let creator = PackageCreator::new(
//!     options,
//!     Toolchain::system(registry.clone())?,
//!     Arc::new(RegistryImagePuller::new(registry)),
//! );
//! let output = creator.create(&LogProgress).await?;
//! println!("{:?}", output);
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod assembler;
pub mod composer;
pub mod creator;
pub mod distribution;
pub mod error;
pub mod helm;
pub mod images;
pub mod inspect;
pub mod resolver;
pub mod tools;

pub use actions::ActionRunner;
pub use assembler::ComponentAssembler;
pub use composer::{Composer, ImportChain, RemoteImports};
pub use creator::{
    AssemblyReport, ComponentExtension, CreateOptions, CreateOutput, MIGRATIONS, PackageCreator,
};
pub use distribution::{PackageDistributor, PublishOptions, PublishedPackage, PullOptions};
pub use error::{PackagerError, Result};
pub use images::{
    ImageAggregator, ImagePuller, PulledImage, RegistryImagePuller, RetryPolicy, collect_images,
};
pub use inspect::{SignatureStatus, VerifyReport, inspect_package, verify_package};
pub use resolver::{HttpFetcher, ResolveOptions, Resolver, Source};
pub use tools::{
    ChartPackager, DefaultChartPackager, FileListCataloger, GitCli, GitClient, KustomizeBuilder,
    KustomizeCli, SbomCataloger, Toolchain,
};
