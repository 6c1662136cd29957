//! Node identity key management.
//!
//! An [`Identity`] is the long-lived Ed25519 keypair a node is known by.
//! It has two text serializations: a *secret* form carrying the private
//! key (persisted as `identity.secret`) and a *public* form derivable from
//! it (persisted as `identity.public`). The overlay [`Address`] is derived
//! from the public key.
//!
//! # Text format
//!
//! ```text
//! <address-hex>:0:<public-key-hex>[:<secret-key-hex>]
//! ```
//!
//! The `0` is the key type, reserved for future algorithms.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::address::Address;
use crate::error::CoreError;

/// Key type tag used in the text serializations.
const KEY_TYPE: &str = "0";

/// A node identity with an optional private half.
///
/// A full identity (with the private key) can sign; a public-only identity
/// can only verify and be addressed.
#[derive(Clone)]
pub struct Identity {
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
    address: Address,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("has_private_key", &self.has_private_key())
            .finish()
    }
}

impl Identity {
    /// Generate a new random identity.
    #[must_use]
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        let address = Address::from_public_key(verifying.as_bytes());
        Self {
            signing: Some(signing),
            verifying,
            address,
        }
    }

    /// Parse either serialized form.
    ///
    /// The embedded address must match the one derived from the public key,
    /// and in the secret form the public key must match the private key.
    pub fn from_string(s: &str) -> Result<Self, CoreError> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(CoreError::InvalidIdentity(format!(
                "expected 3 or 4 fields, got {}",
                fields.len()
            )));
        }
        if fields[1] != KEY_TYPE {
            return Err(CoreError::InvalidIdentity(format!(
                "unknown key type {:?}",
                fields[1]
            )));
        }

        let claimed: Address = fields[0].parse()?;
        let public_bytes: [u8; 32] = decode_key(fields[2], "public key")?;
        let verifying = VerifyingKey::from_bytes(&public_bytes)
            .map_err(|_| CoreError::InvalidIdentity("malformed public key".into()))?;

        let address = Address::from_public_key(verifying.as_bytes());
        if address != claimed {
            return Err(CoreError::InvalidIdentity(
                "address does not match public key".into(),
            ));
        }

        let signing = if fields.len() == 4 {
            let secret_bytes: [u8; 32] = decode_key(fields[3], "secret key")?;
            let signing = SigningKey::from_bytes(&secret_bytes);
            if signing.verifying_key() != verifying {
                return Err(CoreError::InvalidIdentity(
                    "public key does not match secret key".into(),
                ));
            }
            Some(signing)
        } else {
            None
        };

        Ok(Self {
            signing,
            verifying,
            address,
        })
    }

    /// The overlay address derived from the public key.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the private key is present.
    #[must_use]
    pub fn has_private_key(&self) -> bool {
        self.signing.is_some()
    }

    /// The public serialization.
    #[must_use]
    pub fn to_public_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.address,
            KEY_TYPE,
            hex::encode(self.verifying.as_bytes())
        )
    }

    /// The secret serialization, or `None` for a public-only identity.
    #[must_use]
    pub fn to_secret_string(&self) -> Option<String> {
        let signing = self.signing.as_ref()?;
        Some(format!(
            "{}:{}",
            self.to_public_string(),
            hex::encode(signing.to_bytes())
        ))
    }

    /// This identity with the private key stripped.
    #[must_use]
    pub fn public_projection(&self) -> Self {
        Self {
            signing: None,
            verifying: self.verifying,
            address: self.address,
        }
    }

    /// Sign `data`, or `None` for a public-only identity.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> Option<[u8; 64]> {
        self.signing.as_ref().map(|k| k.sign(data).to_bytes())
    }

    /// Verify a signature made by this identity.
    #[must_use]
    pub fn verify(&self, data: &[u8], signature: &[u8; 64]) -> bool {
        let signature = Signature::from_bytes(signature);
        self.verifying.verify(data, &signature).is_ok()
    }
}

fn decode_key(hex_str: &str, what: &str) -> Result<[u8; 32], CoreError> {
    let bytes =
        hex::decode(hex_str).map_err(|_| CoreError::InvalidIdentity(format!("bad {what} hex")))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::InvalidIdentity(format!("bad {what} length")))
}
