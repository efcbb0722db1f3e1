//! Create command - build a package from an airpack.yaml

use console::style;
use std::sync::Arc;

use airpack_packager::{CreateOptions, CreateOutput, PackageCreator, RegistryImagePuller, Toolchain};

use super::{cache, cancel_on_ctrl_c, registry, signing_password};
use crate::display::SpinnerProgress;
use crate::error::Result;
use crate::util::{format_size, parse_key_values};
use crate::{Context, CreateArgs};

pub async fn run(ctx: &Context, args: &CreateArgs) -> Result<()> {
    let options = CreateOptions {
        base_dir: args.dir.clone(),
        output: args.output.clone(),
        max_package_size_mb: args.max_package_size,
        signing_key: args.signing.signing_key.clone(),
        signing_key_password: signing_password(&args.signing)?,
        differential: args.differential.clone(),
        skip_sbom: args.skip_sbom,
        registry_overrides: parse_key_values(&args.registry_overrides)?,
        architecture: args
            .architecture
            .clone()
            .unwrap_or_else(|| ctx.config.architecture.clone()),
        tmp_dir: ctx.config.tmp_dir.clone(),
        oci_concurrency: args.oci_concurrency.unwrap_or(ctx.config.oci_concurrency),
    };

    let registry = registry(ctx, args.insecure);
    let creator = PackageCreator::new(
        options,
        Toolchain::system(registry.clone())?,
        Arc::new(RegistryImagePuller::new(registry.clone())),
    )
    .with_registry(registry, cache(ctx)?)
    .with_cancellation(cancel_on_ctrl_c());

    let output = {
        let progress = SpinnerProgress::new();
        creator.create(&progress).await?
    };

    println!();
    match output {
        CreateOutput::Archive { path, parts } if parts.is_empty() => {
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            println!(
                "{} {} ({})",
                style("Created").green().bold(),
                path.display(),
                format_size(size)
            );
        }
        CreateOutput::Archive { parts, .. } => {
            println!(
                "{} package in {} parts",
                style("Created").green().bold(),
                parts.len()
            );
            for part in &parts {
                println!("  {}", part.display());
            }
        }
        CreateOutput::Published { reference, digest } => {
            println!("{} {}", style("Published").green().bold(), reference);
            println!("  {}: {}", style("Digest").dim(), digest);
        }
    }
    Ok(())
}
