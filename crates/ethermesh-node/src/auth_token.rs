//! The local control-channel shared secret.
//!
//! `authtoken.secret` is a 24-character token drawn from `[A-Za-z0-9]`
//! with a cryptographically secure random source. Both the node's control
//! server and the companion CLI hash it with SHA-256 to derive the
//! control-channel key.

use std::path::Path;

use rand::rngs::OsRng;
use rand::Rng;
use tokio::fs;
use tracing::info;

use ethermesh_core::constants::AUTH_TOKEN_LENGTH;

use crate::error::NodeError;
use crate::identity_store::lock_down;

pub const AUTH_TOKEN_FILE: &str = "authtoken.secret";

const TOKEN_ALPHABET: &[u8; 62] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Load `authtoken.secret` from `home`, generating and persisting a fresh
/// token if it does not exist. The file is locked to owner-only access.
pub async fn load_or_generate(home: &Path) -> Result<String, NodeError> {
    let path = home.join(AUTH_TOKEN_FILE);

    let token = match fs::read_to_string(&path).await {
        Ok(existing) if !existing.is_empty() => existing,
        _ => {
            let token = generate_token();
            fs::write(&path, &token)
                .await
                .map_err(|_| NodeError::HomeNotWritable(AUTH_TOKEN_FILE))?;
            info!("generated new {AUTH_TOKEN_FILE}");
            token
        }
    };
    lock_down(&path).await?;
    Ok(token)
}

fn generate_token() -> String {
    (0..AUTH_TOKEN_LENGTH)
        .map(|_| TOKEN_ALPHABET[OsRng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_has_expected_shape() {
        for _ in 0..32 {
            let token = generate_token();
            assert_eq!(token.len(), AUTH_TOKEN_LENGTH);
            assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn tokens_are_not_repeated() {
        assert_ne!(generate_token(), generate_token());
    }

    #[tokio::test]
    async fn cold_start_writes_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let token = load_or_generate(dir.path()).await.unwrap();
        let on_disk = std::fs::read_to_string(dir.path().join(AUTH_TOKEN_FILE)).unwrap();
        assert_eq!(token, on_disk);
        assert_eq!(token.len(), AUTH_TOKEN_LENGTH);
    }

    #[tokio::test]
    async fn existing_token_is_reused_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(AUTH_TOKEN_FILE), "operator-chosen-token").unwrap();
        let token = load_or_generate(dir.path()).await.unwrap();
        assert_eq!(token, "operator-chosen-token");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn token_file_is_mode_locked() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        load_or_generate(dir.path()).await.unwrap();
        let mode = std::fs::metadata(dir.path().join(AUTH_TOKEN_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
