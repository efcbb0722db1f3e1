//! CLI commands

pub mod create;
pub mod inspect;
pub mod keygen;
pub mod publish;
pub mod pull;
pub mod verify;

use std::sync::Arc;

use airpack_core::signing;
use airpack_oci::{Credentials, OciCache, OciDistributionRegistry, Registry, RemoteOptions};
use tokio_util::sync::CancellationToken;

use crate::error::{CliError, Result};
use crate::{Context, SigningArgs};

/// Registry client with the local Docker credentials
pub(crate) fn registry(ctx: &Context, insecure: bool) -> Arc<dyn Registry> {
    let mut options = RemoteOptions::from_config(&ctx.config);
    options.insecure |= insecure;
    let credentials = Credentials::from_docker_config().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "ignoring unreadable Docker credentials");
        Credentials::Anonymous
    });
    Arc::new(OciDistributionRegistry::new(&options, credentials))
}

pub(crate) fn cache(ctx: &Context) -> Result<OciCache> {
    Ok(OciCache::open(ctx.config.oci_cache())?)
}

/// Password for the signing key, prompted for when the key is encrypted
pub(crate) fn signing_password(args: &SigningArgs) -> Result<Option<String>> {
    let Some(key) = &args.signing_key else {
        return Ok(None);
    };
    if args.signing_key_password.is_some() {
        return Ok(args.signing_key_password.clone());
    }
    if !signing::is_encrypted(key)? {
        return Ok(None);
    }
    let password = rpassword::prompt_password(format!("Password for {}: ", key.display()))
        .map_err(|e| CliError::configuration(format!("cannot read password: {}", e)))?;
    Ok(Some(password))
}

/// Token cancelled on the first Ctrl-C
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cleaning up");
            child.cancel();
        }
    });
    token
}
