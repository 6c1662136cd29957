//! On-disk identity bootstrap.
//!
//! Loads the node identity from `identity.secret`, keeping
//! `identity.public` reconciled with its public projection, or generates
//! and persists a fresh identity on first start. The secret file is
//! permission-locked to owner-only access immediately after writing.

use std::path::Path;

use tokio::fs;
use tracing::{info, warn};

use ethermesh_core::Identity;

use crate::error::NodeError;

pub const IDENTITY_SECRET_FILE: &str = "identity.secret";
pub const IDENTITY_PUBLIC_FILE: &str = "identity.public";

/// Load the identity from `home`, or generate and persist a new one.
///
/// If `identity.secret` parses but `identity.public` disagrees with its
/// public projection (or is missing), the public file is rewritten from
/// the secret. Returns the identity and whether it was freshly generated.
pub async fn load_or_generate(home: &Path) -> Result<(Identity, bool), NodeError> {
    let secret_path = home.join(IDENTITY_SECRET_FILE);
    let public_path = home.join(IDENTITY_PUBLIC_FILE);

    if let Ok(serialized) = fs::read_to_string(&secret_path).await {
        match Identity::from_string(&serialized) {
            Ok(identity) if identity.has_private_key() => {
                let expected = identity.to_public_string();
                let on_disk = fs::read_to_string(&public_path).await.unwrap_or_default();
                if on_disk != expected {
                    fs::write(&public_path, &expected)
                        .await
                        .map_err(|_| NodeError::HomeNotWritable(IDENTITY_PUBLIC_FILE))?;
                    info!("rewrote {IDENTITY_PUBLIC_FILE} to match {IDENTITY_SECRET_FILE}");
                }
                lock_down(&secret_path).await?;
                return Ok((identity, false));
            }
            Ok(_) => warn!("{IDENTITY_SECRET_FILE} has no private key, regenerating"),
            Err(e) => warn!("{IDENTITY_SECRET_FILE} unreadable ({e}), regenerating"),
        }
    }

    info!("no identity found, generating one... this might take a moment...");
    let identity = Identity::generate();
    info!("generated new identity: {}", identity.address());

    let secret = identity
        .to_secret_string()
        .ok_or(NodeError::HomeNotWritable(IDENTITY_SECRET_FILE))?;
    fs::write(&secret_path, &secret)
        .await
        .map_err(|_| NodeError::HomeNotWritable(IDENTITY_SECRET_FILE))?;
    fs::write(&public_path, identity.to_public_string())
        .await
        .map_err(|_| NodeError::HomeNotWritable(IDENTITY_PUBLIC_FILE))?;
    lock_down(&secret_path).await?;

    Ok((identity, true))
}

/// Restrict a secret file to owner-only access.
pub async fn lock_down(path: &Path) -> Result<(), NodeError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
