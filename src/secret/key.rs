//! Key descriptors and the vault factory registry.
//!
//! A [`Key`] is a serialized, tagged description of the cryptographic scheme
//! protecting a vault, together with that scheme's parameters. Crypto
//! backends register a factory for the descriptor variants they understand;
//! [`new_vault`] dispatches on the tag and hands the descriptor to the first
//! factory that takes it.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use anyhow::Context;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::secret::{Error, Vault, pgp, secretbox};

/// A key descriptor: which scheme protects the vault, and with what
/// parameters. The variants are closed within a process; new backends extend
/// dispatch through [`register`] at startup.
#[derive(Clone, Serialize, Deserialize)]
pub enum Key {
    /// Scrypt-derived key-encryption key wrapping a random entry-encryption
    /// key, NaCl-secretbox-style entry sealing.
    Secretbox(SecretboxKey),
    /// A passphrase-locked OpenPGP entity holding the private key material.
    Pgp(PgpKey),
}

/// Parameters of the secretbox scheme.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretboxKey {
    /// The entry-encryption key, sealed under the passphrase-derived KEK.
    /// 48 bytes: a 32-byte key plus the 16-byte AEAD tag.
    pub encrypted_key: Vec<u8>,
    /// The 24-byte nonce the EK was sealed under.
    pub encrypted_key_nonce: Vec<u8>,
    /// Scrypt salt.
    pub salt: Vec<u8>,
    /// Scrypt CPU/memory cost; must be a power of two.
    pub n: u64,
    /// Scrypt block size.
    pub r: u32,
    /// Scrypt parallelism.
    pub p: u32,
}

/// Parameters of the PGP scheme.
#[derive(Clone, Serialize, Deserialize)]
pub struct PgpKey {
    /// A binary OpenPGP transferable secret key, its secret key material
    /// locked with the vault passphrase.
    pub serialized_entity: Vec<u8>,
}

impl Key {
    /// Serializes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(postcard::to_allocvec(self).context("could not serialize key")?)
    }

    /// Parses a descriptor previously produced by [`Key::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the bytes do not parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(postcard::from_bytes(bytes).context("could not parse key")?)
    }

    /// Reads a descriptor from a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes =
            fs::read(path).with_context(|| format!("could not read key file {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    /// Writes the descriptor to a file, readable only by the owning user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the file cannot be written.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, self.to_bytes()?)
            .with_context(|| format!("could not write key file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("could not restrict key file {}", path.display()))?;
        }
        Ok(())
    }
}

/// A factory that may be able to produce a vault from a key descriptor.
///
/// Returns `Ok(None)` when it does not recognize the descriptor, and an
/// error when it recognizes the descriptor but finds it invalid.
pub type VaultFactory = fn(&Path, &Key) -> Result<Option<Box<dyn Vault>>, Error>;

static FACTORIES: Lazy<RwLock<Vec<VaultFactory>>> =
    Lazy::new(|| RwLock::new(vec![secretbox::vault_from_key, pgp::vault_from_key]));

/// Registers an additional vault factory. Should be called during process
/// initialization, before any call to [`new_vault`].
pub fn register(factory: VaultFactory) {
    FACTORIES
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(factory);
}

/// Creates a vault from the given key descriptor, reading encrypted data
/// from `location` (whose meaning is key-type specific; for the built-in
/// backends it is the entry base directory).
///
/// # Errors
///
/// Returns [`Error::UnrecognizedKeyType`] if no registered factory accepts
/// the descriptor, and the factory's error if one does but rejects it.
pub fn new_vault(location: impl Into<PathBuf>, key: &Key) -> Result<Box<dyn Vault>, Error> {
    let location = location.into();
    let factories = FACTORIES.read().unwrap_or_else(PoisonError::into_inner);
    for factory in factories.iter() {
        if let Some(vault) = factory(&location, key)? {
            return Ok(vault);
        }
    }
    Err(Error::UnrecognizedKeyType)
}
