//! Secretbox-style encryption backend.
//!
//! The vault passphrase is stretched with scrypt into a key-encryption key,
//! which unwraps a random 32-byte entry-encryption key carried (sealed) in
//! the key descriptor. Entries are sealed individually with
//! XChaCha20-Poly1305 under fresh random 24-byte nonces, with the entry name
//! bound as associated data so a ciphertext moved to another name no longer
//! authenticates. Efficient and secure, but not compatible with other
//! password managers.

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use scrypt::Params as ScryptParams;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::secret::{
    Error, Store, Vault,
    file::{Crypter, FileStore},
    key::{Key, SecretboxKey},
};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const EXTENSION: &str = ".harp";

/// On-disk record for a single sealed entry.
#[derive(Serialize, Deserialize)]
struct EntryRecord {
    encrypted_content: Vec<u8>,
    nonce: [u8; NONCE_SIZE],
}

/// Vault factory for [`Key::Secretbox`] descriptors.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the descriptor's fields have unusable
/// sizes or parameters.
pub(crate) fn vault_from_key(location: &Path, key: &Key) -> Result<Option<Box<dyn Vault>>, Error> {
    let Key::Secretbox(key) = key else {
        return Ok(None);
    };
    if key.encrypted_key.len() != KEY_SIZE + TAG_SIZE {
        return Err(anyhow!("unexpected size for encrypted_key").into());
    }
    if key.encrypted_key_nonce.len() != NONCE_SIZE {
        return Err(anyhow!("unexpected size for encrypted_key_nonce").into());
    }
    if !key.n.is_power_of_two() {
        return Err(anyhow!("scrypt parameter n must be a power of two").into());
    }
    let log_n = u8::try_from(key.n.trailing_zeros())
        .map_err(|_| anyhow!("scrypt parameter n is out of range"))?;
    let mut encrypted_key_nonce = [0u8; NONCE_SIZE];
    encrypted_key_nonce.copy_from_slice(&key.encrypted_key_nonce);
    Ok(Some(Box::new(SecretboxVault {
        base_dir: location.to_path_buf(),
        encrypted_key: key.encrypted_key.clone(),
        encrypted_key_nonce,
        salt: key.salt.clone(),
        log_n,
        r: key.r,
        p: key.p,
    })))
}

/// Generates a fresh secretbox key descriptor: a random entry-encryption
/// key sealed under the scrypt-derived KEK for `passphrase`.
///
/// # Errors
///
/// Returns [`Error::Internal`] for invalid scrypt parameters.
pub fn generate(passphrase: &str, log_n: u8, r: u32, p: u32) -> Result<Key, Error> {
    let mut salt = vec![0u8; 32];
    OsRng.fill_bytes(&mut salt);
    let kek = derive_kek(passphrase, &salt, log_n, r, p)?;

    let entry_key = Zeroizing::new({
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        key
    });
    let mut encrypted_key_nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut encrypted_key_nonce);

    let cipher = XChaCha20Poly1305::new_from_slice(kek.as_ref())
        .map_err(|_| anyhow!("could not build cipher for key-encryption key"))?;
    let encrypted_key = cipher
        .encrypt(
            XNonce::from_slice(&encrypted_key_nonce),
            entry_key.as_slice(),
        )
        .map_err(|_| anyhow!("could not seal entry-encryption key"))?;

    Ok(Key::Secretbox(SecretboxKey {
        encrypted_key,
        encrypted_key_nonce: encrypted_key_nonce.to_vec(),
        salt,
        n: 1u64 << log_n,
        r,
        p,
    }))
}

fn derive_kek(
    passphrase: &str,
    salt: &[u8],
    log_n: u8,
    r: u32,
    p: u32,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, Error> {
    let params = ScryptParams::new(log_n, r, p, KEY_SIZE)
        .map_err(|err| anyhow!("invalid scrypt parameters: {err}"))?;
    let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, kek.as_mut())
        .map_err(|err| anyhow!("could not derive key-encryption key: {err}"))?;
    Ok(kek)
}

/// A [`Vault`] whose entry-encryption key is wrapped under a
/// passphrase-derived KEK.
struct SecretboxVault {
    base_dir: PathBuf,

    // Encrypted entry-encryption key (EK), and the nonce it was sealed under.
    encrypted_key: Vec<u8>,
    encrypted_key_nonce: [u8; NONCE_SIZE],

    // Scrypt parameters for the key-encryption key (KEK).
    salt: Vec<u8>,
    log_n: u8,
    r: u32,
    p: u32,
}

impl Vault for SecretboxVault {
    fn unlock(&self, passphrase: &str) -> Result<Box<dyn Store>, Error> {
        let kek = derive_kek(passphrase, &self.salt, self.log_n, self.r, self.p)?;

        // Unwrap the EK using the derived KEK. An authentication failure
        // here means the passphrase was wrong.
        let cipher = XChaCha20Poly1305::new_from_slice(kek.as_ref())
            .map_err(|_| anyhow!("could not build cipher for key-encryption key"))?;
        let unwrapped = Zeroizing::new(
            cipher
                .decrypt(
                    XNonce::from_slice(&self.encrypted_key_nonce),
                    self.encrypted_key.as_slice(),
                )
                .map_err(|_| Error::WrongPassphrase)?,
        );
        let mut entry_key = Zeroizing::new([0u8; KEY_SIZE]);
        entry_key.copy_from_slice(&unwrapped);

        Ok(Box::new(FileStore::new(
            &self.base_dir,
            EXTENSION,
            Box::new(SecretboxCrypter { key: entry_key }),
        )))
    }
}

struct SecretboxCrypter {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl SecretboxCrypter {
    fn cipher(&self) -> Result<XChaCha20Poly1305, Error> {
        XChaCha20Poly1305::new_from_slice(self.key.as_ref())
            .map_err(|_| anyhow!("could not build entry cipher").into())
    }
}

impl Crypter for SecretboxCrypter {
    fn encrypt(&self, entry_name: &str, content: &str) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let encrypted_content = self
            .cipher()?
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: content.as_bytes(),
                    aad: entry_name.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("could not seal entry content"))?;
        Ok(postcard::to_allocvec(&EntryRecord {
            encrypted_content,
            nonce,
        })
        .context("could not serialize entry record")?)
    }

    fn decrypt(&self, entry_name: &str, ciphertext: &[u8]) -> Result<String, Error> {
        let record: EntryRecord =
            postcard::from_bytes(ciphertext).context("could not parse entry record")?;
        let content = self
            .cipher()?
            .decrypt(
                XNonce::from_slice(&record.nonce),
                Payload {
                    msg: &record.encrypted_content,
                    aad: entry_name.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("could not authenticate entry content"))?;
        Ok(String::from_utf8(content).context("entry content is not valid UTF-8")?)
    }
}
