//! Publish command - push an archive, or a directory as a skeleton

use console::style;
use std::path::Path;
use std::sync::Arc;

use airpack_packager::{GitCli, PackageDistributor, PublishOptions};

use super::{cache, cancel_on_ctrl_c, registry, signing_password};
use crate::display::SpinnerProgress;
use crate::error::{CliError, Result};
use crate::{Context, SigningArgs};

pub async fn run(
    ctx: &Context,
    source: &Path,
    repository: &str,
    signing: &SigningArgs,
    insecure: bool,
) -> Result<()> {
    if !source.exists() {
        return Err(CliError::configuration(format!(
            "{} does not exist",
            source.display()
        )));
    }

    let options = PublishOptions {
        source: source.to_path_buf(),
        repository: repository.to_string(),
        signing_key: signing.signing_key.clone(),
        signing_key_password: signing_password(signing)?,
        concurrency: ctx.config.oci_concurrency,
    };
    let distributor = PackageDistributor::new(registry(ctx, insecure), Arc::new(GitCli))
        .with_cache(cache(ctx)?)
        .with_cancellation(cancel_on_ctrl_c());

    let published = {
        let progress = SpinnerProgress::new();
        distributor.publish(&options, &progress).await?
    };

    let what = if source.is_dir() { "skeleton" } else { "package" };
    println!();
    println!(
        "{} {} {}",
        style("Published").green().bold(),
        what,
        published.reference
    );
    println!("  {}: {}", style("Digest").dim(), published.digest);
    Ok(())
}
