//! Key material and secrets for both halves of the router.
//!
//! Every secret comes from a file on disk or from the Linux kernel keyring;
//! see [`crate::config::SecretSource`].

pub mod keyring;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::SecretSource;

/// Raw bytes of a secret.  A file path wins over a keyring entry when both
/// are set.
pub fn read_secret(source: &SecretSource) -> Result<Vec<u8>> {
    if let Some(ref path) = source.path {
        return std::fs::read(path).with_context(|| format!("failed to read secret from {path}"));
    }
    if let Some(ref name) = source.keyring {
        return keyring::read_secret(name)
            .with_context(|| format!("failed to read secret '{name}' from kernel keyring"));
    }
    bail!("no secret source configured")
}

/// Load a private key from its configured source.
pub fn load_key_pair(source: &SecretSource) -> Result<KeyPair> {
    if let Some(ref path) = source.path {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load private key from {path}"))?;
        info!(path = %path, "loaded private key from file");
        return Ok(key);
    }

    let pem = read_secret(source)?;
    let pem = String::from_utf8(pem).context("private key in keyring is not UTF-8")?;
    let key = russh_keys::decode_secret_key(&pem, None)
        .context("failed to decode private key from keyring")?;
    info!(key_name = ?source.keyring, "loaded private key from kernel keyring");
    Ok(key)
}

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used by
/// `ssh-keygen -l`).
pub fn fingerprint_of(key: &PublicKey) -> String {
    let blob_b64 = key.public_key_base64();
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .unwrap_or_default();
    fingerprint_of_blob(&blob)
}

/// Fingerprint of a raw public-key blob.
pub fn fingerprint_of_blob(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_fingerprint_matches_ssh_keygen_format() {
        // sha256("") in unpadded base64.
        assert_eq!(
            fingerprint_of_blob(b""),
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn generated_key_fingerprint_is_stable() {
        let pair = KeyPair::generate_ed25519();
        let public = pair.clone_public_key().unwrap();
        let a = fingerprint_of(&public);
        let b = fingerprint_of(&public);
        assert!(a.starts_with("SHA256:"));
        assert_eq!(a, b);
    }

    #[test]
    fn empty_source_is_an_error() {
        assert!(load_key_pair(&SecretSource::default()).is_err());
        assert!(read_secret(&SecretSource::default()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let source = SecretSource {
            path: Some("/nonexistent/ssh-router/key".to_string()),
            keyring: None,
        };
        let err = load_key_pair(&source).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/ssh-router/key"));
    }

    #[test]
    fn secret_file_is_read_verbatim() {
        let path = std::env::temp_dir().join(format!("ssh-router-secret-{}", std::process::id()));
        std::fs::write(&path, b"hunter2\n").unwrap();
        let source = SecretSource {
            path: Some(path.to_string_lossy().into_owned()),
            keyring: Some("ignored".to_string()),
        };
        let secret = read_secret(&source).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(secret, b"hunter2\n");
    }

    #[test]
    fn missing_keyring_entry_is_an_error() {
        let source = SecretSource {
            path: None,
            keyring: Some("ssh-router-test:absent".to_string()),
        };
        let err = read_secret(&source).unwrap_err();
        assert!(format!("{err:#}").contains("ssh-router-test:absent"));
    }
}
