//! Detached minisign signatures over the package definition

use minisign::{KeyPair, PublicKey, PublicKeyBox, SecretKey, SecretKeyBox, SignatureBox};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

fn signing_error(context: &str, e: impl std::fmt::Display) -> CoreError {
    CoreError::Signing {
        message: format!("{}: {}", context, e),
    }
}

/// Load a minisign secret key from a file
///
/// Unencrypted keys load without a password; encrypted keys need one.
pub fn load_secret_key(key_path: &Path, password: Option<&str>) -> Result<SecretKey> {
    let key_content = std::fs::read_to_string(key_path).map_err(|e| CoreError::io(key_path, e))?;

    let sk_box = SecretKeyBox::from_string(&key_content)
        .map_err(|e| signing_error("Failed to parse secret key", e))?;

    if let Ok(sk) = sk_box.clone().into_unencrypted_secret_key() {
        return Ok(sk);
    }

    let password = password.ok_or_else(|| CoreError::Signing {
        message: format!(
            "secret key {} is encrypted and no password was given",
            key_path.display()
        ),
    })?;
    sk_box
        .into_secret_key(Some(password.to_string()))
        .map_err(|e| signing_error("Failed to decrypt key", e))
}

/// Whether the key at `key_path` needs a password
pub fn is_encrypted(key_path: &Path) -> Result<bool> {
    let key_content = std::fs::read_to_string(key_path).map_err(|e| CoreError::io(key_path, e))?;
    let sk_box = SecretKeyBox::from_string(&key_content)
        .map_err(|e| signing_error("Failed to parse secret key", e))?;
    Ok(sk_box.into_unencrypted_secret_key().is_err())
}

/// Load a minisign public key from a file
pub fn load_public_key(key_path: &Path) -> Result<PublicKey> {
    let content = std::fs::read_to_string(key_path).map_err(|e| CoreError::io(key_path, e))?;
    PublicKeyBox::from_string(&content)
        .map_err(|e| signing_error("Failed to parse public key", e))?
        .into_public_key()
        .map_err(|e| signing_error("Invalid public key", e))
}

/// Sign `file` and write the detached signature to `sig_path`
pub fn sign_file(file: &Path, sig_path: &Path, sk: &SecretKey, trusted_comment: &str) -> Result<PathBuf> {
    let data = std::fs::read(file).map_err(|e| CoreError::io(file, e))?;
    let mut cursor = Cursor::new(&data);

    let signature_box = minisign::sign(None, sk, &mut cursor, Some(trusted_comment), None)
        .map_err(|e| signing_error("Failed to sign", e))?;

    std::fs::write(sig_path, signature_box.to_string()).map_err(|e| CoreError::io(sig_path, e))?;
    tracing::debug!(file = %file.display(), signature = %sig_path.display(), "signed");
    Ok(sig_path.to_path_buf())
}

/// Verify the detached signature of `file`, returning the trusted comment
pub fn verify_file(file: &Path, sig_path: &Path, pk: &PublicKey) -> Result<String> {
    let sig_content = std::fs::read_to_string(sig_path).map_err(|e| CoreError::io(sig_path, e))?;
    let sig_box = SignatureBox::from_string(&sig_content)
        .map_err(|e| signing_error("Failed to parse signature", e))?;

    let data = std::fs::read(file).map_err(|e| CoreError::io(file, e))?;
    let mut cursor = Cursor::new(&data);
    minisign::verify(pk, &sig_box, &mut cursor, true, false, false)
        .map_err(|e| signing_error("Signature verification failed", e))?;

    Ok(sig_box.trusted_comment().unwrap_or_default())
}

/// Generated key material in minisign's text format
pub struct GeneratedKeys {
    pub public_key: String,
    pub secret_key: String,
}

/// Generate a key pair, encrypted when a non-empty password is given
pub fn generate_keypair(password: Option<&str>) -> Result<GeneratedKeys> {
    let password = password.filter(|p| !p.is_empty());

    let KeyPair { pk, sk } = match password {
        Some(pw) => KeyPair::generate_encrypted_keypair(Some(pw.to_string())),
        None => KeyPair::generate_unencrypted_keypair(),
    }
    .map_err(|e| signing_error("Failed to generate key pair", e))?;

    let pk_box = pk
        .to_box()
        .map_err(|e| signing_error("Failed to create public key box", e))?;
    let sk_box = sk
        .to_box(Some("airpack secret key"))
        .map_err(|e| signing_error("Failed to create secret key box", e))?;

    Ok(GeneratedKeys {
        public_key: pk_box.to_string(),
        secret_key: sk_box.to_string(),
    })
}
