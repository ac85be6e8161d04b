//! OpenPGP encryption backend.
//!
//! The key descriptor carries a transferable secret key whose secret
//! material is locked with the vault passphrase. Unlocking decrypts the
//! primary key and every subkey; a failure on any of them is treated as a
//! wrong passphrase. Entries are stored as OpenPGP messages encrypted to
//! the entity's storage-encryption keys and signed by its signing key;
//! decryption refuses to return plaintext unless the signature verifies.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use sequoia_openpgp::{
    Cert, Fingerprint, KeyHandle, Packet,
    crypto::{Password, SessionKey},
    packet::{PKESK, SKESK},
    parse::{
        Parse,
        stream::{
            DecryptionHelper, DecryptorBuilder, MessageLayer, MessageStructure,
            VerificationHelper,
        },
    },
    policy::StandardPolicy,
    serialize::stream::{Encryptor2, LiteralWriter, Message, Signer},
    types::SymmetricAlgorithm,
};

use crate::secret::{
    Error, Store, Vault,
    file::{Crypter, FileStore},
    key::Key,
};

const EXTENSION: &str = ".gpg";

/// Vault factory for [`Key::Pgp`] descriptors.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the serialized entity does not parse or
/// carries no secret key material.
pub(crate) fn vault_from_key(location: &Path, key: &Key) -> Result<Option<Box<dyn Vault>>, Error> {
    let Key::Pgp(key) = key else {
        return Ok(None);
    };
    let cert = Cert::from_bytes(&key.serialized_entity)
        .map_err(|err| anyhow!("could not parse key entity: {err}"))?;
    if !cert.is_tsk() {
        return Err(anyhow!("key entity carries no secret key material").into());
    }
    Ok(Some(Box::new(PgpVault {
        base_dir: location.to_path_buf(),
        cert,
    })))
}

/// A [`Vault`] backed by a passphrase-locked OpenPGP entity.
struct PgpVault {
    base_dir: PathBuf,
    cert: Cert,
}

impl Vault for PgpVault {
    fn unlock(&self, passphrase: &str) -> Result<Box<dyn Store>, Error> {
        let password = Password::from(passphrase);

        // Decrypt the primary key and every subkey. Any failure means the
        // passphrase is wrong.
        let primary = self
            .cert
            .primary_key()
            .key()
            .clone()
            .parts_into_secret()
            .map_err(|_| anyhow!("primary key carries no secret material"))?
            .decrypt_secret(&password)
            .map_err(|_| Error::WrongPassphrase)?;
        let mut packets: Vec<Packet> = vec![primary.into()];
        for subkey in self.cert.keys().subkeys().secret() {
            let key = subkey
                .key()
                .clone()
                .decrypt_secret(&password)
                .map_err(|_| Error::WrongPassphrase)?;
            packets.push(key.into());
        }
        let cert = self
            .cert
            .clone()
            .insert_packets(packets)
            .map_err(|err| anyhow!("could not assemble unlocked entity: {err}"))?;

        Ok(Box::new(FileStore::new(
            &self.base_dir,
            EXTENSION,
            Box::new(PgpCrypter { cert }),
        )))
    }
}

/// Encrypts entries to (and signs them with) a decrypted OpenPGP entity.
struct PgpCrypter {
    cert: Cert,
}

impl Crypter for PgpCrypter {
    fn encrypt(&self, _entry_name: &str, content: &str) -> Result<Vec<u8>, Error> {
        let policy = StandardPolicy::new();
        let recipients: Vec<_> = self
            .cert
            .keys()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_storage_encryption()
            .collect();
        if recipients.is_empty() {
            return Err(anyhow!("entity has no storage-encryption key").into());
        }
        let signing_key = self
            .cert
            .keys()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .secret()
            .next()
            .ok_or_else(|| anyhow!("entity has no signing key"))?
            .key()
            .clone();
        let signer = signing_key
            .into_keypair()
            .map_err(|err| anyhow!("could not build signing keypair: {err}"))?;

        let mut ciphertext = Vec::new();
        let message = Message::new(&mut ciphertext);
        let message = Encryptor2::for_recipients(message, recipients)
            .build()
            .map_err(|err| anyhow!("could not start encryption: {err}"))?;
        let message = Signer::new(message, signer)
            .build()
            .map_err(|err| anyhow!("could not start signing: {err}"))?;
        let mut message = LiteralWriter::new(message)
            .build()
            .map_err(|err| anyhow!("could not start message body: {err}"))?;
        message
            .write_all(content.as_bytes())
            .context("could not write encrypted content")?;
        message
            .finalize()
            .map_err(|err| anyhow!("could not finish encrypted content: {err}"))?;
        Ok(ciphertext)
    }

    fn decrypt(&self, _entry_name: &str, ciphertext: &[u8]) -> Result<String, Error> {
        let policy = StandardPolicy::new();
        let helper = EntityHelper { cert: &self.cert };
        let mut decryptor = DecryptorBuilder::from_bytes(ciphertext)
            .map_err(|err| anyhow!("could not read message: {err}"))?
            .with_policy(&policy, None, helper)
            .map_err(|err| anyhow!("could not decrypt message: {err}"))?;
        let mut content = Vec::new();
        decryptor
            .read_to_end(&mut content)
            .context("could not read message body")?;
        Ok(String::from_utf8(content).context("entry content is not valid UTF-8")?)
    }
}

/// Decrypts with the entity's secret keys and accepts only messages carrying
/// a valid signature from the entity.
struct EntityHelper<'a> {
    cert: &'a Cert,
}

impl VerificationHelper for EntityHelper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> sequoia_openpgp::Result<Vec<Cert>> {
        Ok(vec![self.cert.clone()])
    }

    fn check(&mut self, structure: MessageStructure) -> sequoia_openpgp::Result<()> {
        for layer in structure {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(Result::is_ok) {
                    return Ok(());
                }
            }
        }
        Err(anyhow!("no valid signature from the vault entity"))
    }
}

impl DecryptionHelper for EntityHelper<'_> {
    fn decrypt<D>(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        mut decrypt: D,
    ) -> sequoia_openpgp::Result<Option<Fingerprint>>
    where
        D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
    {
        for pkesk in pkesks {
            for key in self.cert.keys().secret() {
                let Ok(mut keypair) = key.key().clone().into_keypair() else {
                    continue;
                };
                if let Some((algorithm, session_key)) = pkesk.decrypt(&mut keypair, sym_algo) {
                    if decrypt(algorithm, &session_key) {
                        return Ok(Some(key.key().fingerprint()));
                    }
                }
            }
        }
        Err(anyhow!("no usable decryption key for message"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sequoia_openpgp::{cert::CertBuilder, serialize::SerializeInto};

    use super::*;
    use crate::secret::key::PgpKey;

    fn locked_entity(passphrase: &str) -> Vec<u8> {
        let (cert, _revocation) = CertBuilder::new()
            .add_userid("vault@example.com")
            .add_signing_subkey()
            .add_storage_encryption_subkey()
            .set_password(Some(Password::from(passphrase)))
            .generate()
            .unwrap();
        cert.as_tsk().to_vec().unwrap()
    }

    fn new_vault(dir: &Path, serialized_entity: Vec<u8>) -> Box<dyn Vault> {
        let key = Key::Pgp(PgpKey { serialized_entity });
        vault_from_key(dir, &key).unwrap().unwrap()
    }

    #[test]
    fn wrong_passphrase_fails_to_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let vault = new_vault(dir.path(), locked_entity("password"));
        assert!(matches!(
            vault.unlock("wrong"),
            Err(Error::WrongPassphrase)
        ));
    }

    #[test]
    fn entries_roundtrip_as_signed_messages() {
        let dir = tempfile::tempdir().unwrap();
        let vault = new_vault(dir.path(), locked_entity("password"));
        let store = vault.unlock("password").unwrap();

        store.put("/mail/login", "user: bob").unwrap();
        assert_eq!(store.get("/mail/login").unwrap(), "user: bob");
        assert_eq!(store.list().unwrap(), vec!["/mail/login".to_string()]);
        assert!(dir.path().join("mail/login.gpg").is_file());
    }

    #[test]
    fn unsigned_messages_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let serialized = locked_entity("password");
        let vault = new_vault(dir.path(), serialized.clone());
        let store = vault.unlock("password").unwrap();

        // Encrypt directly to the entity without signing and plant the
        // result where the store expects an entry.
        let cert = Cert::from_bytes(&serialized).unwrap();
        let policy = StandardPolicy::new();
        let recipients: Vec<_> = cert
            .keys()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_storage_encryption()
            .collect();
        let mut ciphertext = Vec::new();
        let message = Message::new(&mut ciphertext);
        let message = Encryptor2::for_recipients(message, recipients)
            .build()
            .unwrap();
        let mut message = LiteralWriter::new(message).build().unwrap();
        message.write_all(b"forged").unwrap();
        message.finalize().unwrap();
        std::fs::write(dir.path().join("planted.gpg"), &ciphertext).unwrap();

        assert!(matches!(store.get("/planted"), Err(Error::Internal(_))));
    }

    #[test]
    fn garbage_entity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = Key::Pgp(PgpKey {
            serialized_entity: vec![0x42; 16],
        });
        assert!(matches!(
            vault_from_key(dir.path(), &key),
            Err(Error::Internal(_))
        ));
    }
}
