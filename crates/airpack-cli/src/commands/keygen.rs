//! Keygen command - generate signing keys

use console::style;
use std::path::{Path, PathBuf};

use airpack_core::signing::generate_keypair;

use crate::error::{CliError, Result};

/// Secret key file name inside the key directory
pub const SECRET_KEY_FILE: &str = "airpack.key";
/// Public key file name inside the key directory
pub const PUBLIC_KEY_FILE: &str = "airpack.pub";

/// Default directory for airpack keys
#[must_use]
pub fn default_key_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".airpack"))
        .unwrap_or_else(|| PathBuf::from(".airpack"))
}

pub fn run(output_dir: Option<&Path>, force: bool, no_password: bool) -> Result<()> {
    let key_dir = output_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(default_key_dir);

    let secret_key_path = key_dir.join(SECRET_KEY_FILE);
    let public_key_path = key_dir.join(PUBLIC_KEY_FILE);

    if !force && (secret_key_path.exists() || public_key_path.exists()) {
        return Err(CliError::configuration_with_help(
            format!("Keys already exist at {}", key_dir.display()),
            "Use --force to overwrite them.",
        ));
    }

    std::fs::create_dir_all(&key_dir)?;

    println!("{}", style("Generating signing keys...").cyan().bold());
    println!();

    let password = if no_password { None } else { prompt_password()? };
    let keys = generate_keypair(password.as_deref())?;

    std::fs::write(&public_key_path, &keys.public_key)?;
    std::fs::write(&secret_key_path, &keys.secret_key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&secret_key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("  {} {}", style("Secret key").green().bold(), secret_key_path.display());
    println!("  {} {}", style("Public key").green().bold(), public_key_path.display());
    println!();

    if password.is_some() {
        println!("{}", style("Secret key is password-protected.").dim());
    } else {
        println!(
            "{}",
            style("Warning: Secret key is NOT password-protected.").yellow()
        );
    }

    println!();
    println!("{}:", style("To sign a package").bold());
    println!(
        "  airpack package create . --signing-key {}",
        secret_key_path.display()
    );
    println!();
    println!("{}:", style("To verify it").bold());
    println!(
        "  airpack package verify <archive> --key {}",
        public_key_path.display()
    );

    Ok(())
}

/// Ask for a password twice; an empty answer means no password
fn prompt_password() -> Result<Option<String>> {
    let read = |prompt: &str| {
        rpassword::prompt_password(prompt)
            .map_err(|e| CliError::configuration(format!("cannot read password: {}", e)))
    };

    let password = read("Enter password to protect secret key (leave empty for no password): ")?;
    if password.is_empty() {
        return Ok(None);
    }
    if password != read("Confirm password: ")? {
        return Err(CliError::configuration("Passwords do not match"));
    }
    Ok(Some(password))
}
