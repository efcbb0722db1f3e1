//! Verify command - check package integrity and signature

use console::style;
use std::path::Path;

use airpack_packager::{SignatureStatus, verify_package};

use crate::error::{CliError, Result};
use crate::util::truncate_hash;

pub fn run(archive: &Path, key: Option<&Path>) -> Result<()> {
    if !archive.exists() {
        return Err(CliError::configuration(format!(
            "Package not found: {}",
            archive.display()
        )));
    }

    println!("{} {}", style("Verifying").cyan().bold(), archive.display());
    println!();

    let report = verify_package(archive, key)?;

    println!("{}:", style("Integrity check").bold());
    if report.checksums.valid {
        println!("  {} All file checksums match", style("[OK]").green().bold());
    } else {
        println!("  {} Checksum verification failed", style("[FAIL]").red().bold());
        for mismatch in &report.checksums.mismatched {
            println!(
                "    {} {}: expected {}, got {}",
                style("-").red(),
                mismatch.path,
                truncate_hash(&mismatch.expected, 16),
                truncate_hash(&mismatch.actual, 16)
            );
        }
        for missing in &report.checksums.missing {
            println!("    {} {}: missing from package", style("-").red(), missing);
        }
    }

    if report.aggregate_matches {
        println!("  {} Aggregate checksum matches", style("[OK]").green().bold());
    } else {
        println!(
            "  {} checksums.txt does not match the aggregate checksum",
            style("[FAIL]").red().bold()
        );
    }

    println!();
    println!("{}:", style("Signature check").bold());
    match &report.signature {
        SignatureStatus::Verified(_) => {
            println!("  {} {}", style("[OK]").green().bold(), report.signature)
        }
        SignatureStatus::NotVerified => println!(
            "  {} {} (use --key to check it)",
            style("[SKIP]").yellow().bold(),
            report.signature
        ),
        SignatureStatus::Unsigned => {
            println!("  {} {}", style("[SKIP]").yellow().bold(), report.signature)
        }
    }

    if !report.is_valid() {
        return Err(CliError::integrity(format!(
            "{} {} is corrupt or was modified",
            report.definition.metadata.name,
            archive.display()
        )));
    }

    println!();
    println!("{}", style("Package verified.").green());
    Ok(())
}
