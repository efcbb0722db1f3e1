//! Inspect command - view the definition of a package without extracting it

use console::style;
use std::path::Path;

use airpack_packager::inspect_package;

use crate::error::Result;
use crate::util::truncate_hash;

pub fn run(archive: &Path, raw: bool) -> Result<()> {
    let pkg = inspect_package(archive)?;

    if raw {
        print!("{}", pkg.to_yaml()?);
        return Ok(());
    }

    let meta = &pkg.metadata;
    println!(
        "{} {} {}",
        style("Package").cyan().bold(),
        meta.name,
        if meta.version.is_empty() { "(unversioned)" } else { meta.version.as_str() }
    );
    if let Some(description) = &meta.description {
        println!("  {}", description);
    }
    println!();

    println!("  {}: {}", style("Architecture").dim(), pkg.architecture());
    if !pkg.build.timestamp.is_empty() {
        println!(
            "  {}: {} by {}@{}",
            style("Built").dim(),
            pkg.build.timestamp,
            pkg.build.user,
            pkg.build.terminal
        );
    }
    if !pkg.build.version.is_empty() {
        println!("  {}: {}", style("Builder").dim(), pkg.build.version);
    }
    if pkg.build.differential {
        println!(
            "  {}: against {}",
            style("Differential").dim(),
            pkg.build.differential_package_version
        );
    }
    if !meta.aggregate_checksum.is_empty() {
        println!(
            "  {}: {}...",
            style("Checksum").dim(),
            truncate_hash(&meta.aggregate_checksum, 16)
        );
    }
    println!();

    println!("{}:", style("Components").bold());
    for component in &pkg.components {
        let required = if component.required == Some(true) { " (required)" } else { "" };
        println!("  {}{}", style(&component.name).green(), required);
        if let Some(description) = &component.description {
            println!("    {}", style(description).dim());
        }
        if !component.images.is_empty() {
            println!("    images: {}", component.images.len());
        }
        if !component.files.is_empty() {
            println!("    files: {}", component.files.len());
        }
        if !component.charts.is_empty() {
            println!("    charts: {}", component.charts.len());
        }
    }

    if !pkg.variables.is_empty() {
        println!();
        println!("{}:", style("Variables").bold());
        for variable in &pkg.variables {
            println!("  {}", variable.name);
        }
    }
    Ok(())
}
