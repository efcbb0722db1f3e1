//! Pull command - fetch a published package into an archive

use console::style;
use std::path::Path;
use std::sync::Arc;

use airpack_packager::{GitCli, PackageDistributor, PullOptions};

use super::{cancel_on_ctrl_c, registry};
use crate::Context;
use crate::display::SpinnerProgress;
use crate::error::Result;

pub async fn run(ctx: &Context, reference: &str, output: &Path, insecure: bool) -> Result<()> {
    std::fs::create_dir_all(output)?;

    let options = PullOptions {
        reference: reference.to_string(),
        output_dir: output.to_path_buf(),
        concurrency: ctx.config.oci_concurrency,
    };
    let distributor = PackageDistributor::new(registry(ctx, insecure), Arc::new(GitCli))
        .with_cancellation(cancel_on_ctrl_c());

    let archive = {
        let progress = SpinnerProgress::new();
        distributor.pull(&options, &progress).await?
    };

    println!();
    println!("{} {}", style("Pulled").green().bold(), archive.display());
    Ok(())
}
