//! Encrypted on-disk keystore for the node's ed25519 identity key.
//!
//! The signing key is sealed with AES-256-GCM under a key derived from the
//! passphrase with Argon2id. The file also records the derived ledger
//! address so operators can read it without the passphrase.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use ed25519_dalek::SigningKey;
use lipchain_types::Address;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const KEYSTORE_VERSION: u8 = 1;
const KDF_LABEL: &str = "argon2id-v1";

#[derive(Debug, Serialize, Deserialize)]
pub struct Keystore {
    pub version: u8,
    pub address: String,
    pub kdf: String,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Decrypted identity: the ledger address and its signing key.
pub struct Identity {
    pub address: Address,
    pub signing_key: SigningKey,
}

impl Keystore {
    /// Generate a fresh key, seal it, and write the keystore file.
    pub fn create(path: &Path, passphrase: &str) -> Result<Identity> {
        if path.exists() {
            bail!("keystore {} already exists", path.display());
        }

        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let address = Address::from_pubkey(&signing_key.verifying_key().to_bytes());

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = derive_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| anyhow!("cipher init failed: {err}"))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), seed.as_slice())
            .map_err(|err| anyhow!("keystore encryption failed: {err}"))?;

        let keystore = Keystore {
            version: KEYSTORE_VERSION,
            address: address.to_string(),
            kdf: KDF_LABEL.to_string(),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&keystore)?)?;
        fs::rename(&tmp, path)?;

        Ok(Identity {
            address,
            signing_key,
        })
    }

    /// Load and decrypt an existing keystore file.
    pub fn load(path: &Path, passphrase: &str) -> Result<Identity> {
        let raw =
            fs::read(path).with_context(|| format!("reading keystore {}", path.display()))?;
        let keystore: Keystore = serde_json::from_slice(&raw)?;
        if keystore.version != KEYSTORE_VERSION {
            bail!("unsupported keystore version {}", keystore.version);
        }

        let salt = hex::decode(&keystore.salt).context("keystore salt")?;
        let nonce = hex::decode(&keystore.nonce).context("keystore nonce")?;
        let ciphertext = hex::decode(&keystore.ciphertext).context("keystore ciphertext")?;
        if nonce.len() != 12 {
            bail!("keystore nonce must be 12 bytes");
        }

        let key = derive_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| anyhow!("cipher init failed: {err}"))?;
        let seed = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| anyhow!("keystore decryption failed (wrong passphrase?)"))?;
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("keystore holds a malformed key"))?;

        let signing_key = SigningKey::from_bytes(&seed);
        let address = Address::from_pubkey(&signing_key.verifying_key().to_bytes());
        if keystore.address != address.to_string() {
            bail!("keystore address does not match the decrypted key");
        }
        Ok(Identity {
            address,
            signing_key,
        })
    }

    /// Load the identity, creating the keystore first if it is missing.
    pub fn load_or_create(path: &Path, passphrase: &str) -> Result<Identity> {
        if path.exists() {
            Self::load(path, passphrase)
        } else {
            Self::create(path, passphrase)
        }
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|err| anyhow!("key derivation failed: {err}"))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");
        let created = Keystore::create(&path, "hunter2").unwrap();
        let loaded = Keystore::load(&path, "hunter2").unwrap();
        assert_eq!(created.address, loaded.address);
        assert_eq!(
            created.signing_key.to_bytes(),
            loaded.signing_key.to_bytes()
        );
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");
        Keystore::create(&path, "hunter2").unwrap();
        assert!(Keystore::load(&path, "hunter3").is_err());
    }

    #[test]
    fn load_or_create_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");
        let first = Keystore::load_or_create(&path, "pw").unwrap();
        let second = Keystore::load_or_create(&path, "pw").unwrap();
        assert_eq!(first.address, second.address);
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");
        Keystore::create(&path, "pw").unwrap();
        assert!(Keystore::create(&path, "pw").is_err());
    }
}
