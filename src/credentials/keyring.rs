//! Secrets held in the Linux kernel keyring.
//!
//! A deployment can provision the host key, the client key and the resolver
//! secret as `user` keys (`keyctl padd user <description> @s`) and reference
//! them by description instead of leaving them on disk.

use linux_keyutils::{KeyError, KeyRing, KeyRingIdentifier};
use thiserror::Error;
use tracing::debug;

/// Keyrings searched for a description, in order.
const SEARCHED: [KeyRingIdentifier; 2] = [KeyRingIdentifier::Session, KeyRingIdentifier::User];

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("no key {0:?} in the session or user keyring")]
    NotFound(String),

    #[error("key {description:?} could not be read: {cause:?}")]
    Unreadable { description: String, cause: KeyError },
}

/// Payload of the first key matching `description`.
pub fn read_secret(description: &str) -> Result<Vec<u8>, KeyringError> {
    for id in SEARCHED {
        let ring = match KeyRing::from_special_id(id, false) {
            Ok(ring) => ring,
            Err(e) => {
                debug!(keyring = ?id, error = ?e, "keyring unavailable");
                continue;
            }
        };
        let Ok(key) = ring.search(description) else {
            continue;
        };
        return key.read_to_vec().map_err(|cause| KeyringError::Unreadable {
            description: description.to_string(),
            cause,
        });
    }
    Err(KeyringError::NotFound(description.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_names_the_description() {
        let err = read_secret("ssh-router-test:absent").unwrap_err();
        assert!(matches!(err, KeyringError::NotFound(ref d) if d == "ssh-router-test:absent"));
        assert!(err.to_string().contains("ssh-router-test:absent"));
    }
}
