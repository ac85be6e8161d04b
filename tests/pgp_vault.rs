//! End-to-end exercises of the PGP vault through the key registry.

#![allow(clippy::unwrap_used)]

use oubliette::secret::{
    Error,
    key::{self, Key, PgpKey},
};
use sequoia_openpgp::{cert::CertBuilder, crypto::Password, serialize::SerializeInto};

const PASSPHRASE: &str = "password";

fn locked_entity() -> Vec<u8> {
    let (cert, _revocation) = CertBuilder::new()
        .add_userid("vault@example.com")
        .add_signing_subkey()
        .add_storage_encryption_subkey()
        .set_password(Some(Password::from(PASSPHRASE)))
        .generate()
        .unwrap();
    cert.as_tsk().to_vec().unwrap()
}

#[test]
fn vault_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = Key::Pgp(PgpKey {
        serialized_entity: locked_entity(),
    });

    let key_path = dir.path().join("vault.key");
    descriptor.store(&key_path).unwrap();
    let descriptor = Key::load(&key_path).unwrap();

    let base_dir = dir.path().join("entries");
    std::fs::create_dir(&base_dir).unwrap();
    let vault = key::new_vault(&base_dir, &descriptor).unwrap();

    assert!(matches!(
        vault.unlock("wrong"),
        Err(Error::WrongPassphrase)
    ));

    let store = vault.unlock(PASSPHRASE).unwrap();
    store.put("/mail/login", "user: bob\npass: sekrit").unwrap();
    assert_eq!(
        store.get("/mail/login").unwrap(),
        "user: bob\npass: sekrit"
    );
    assert_eq!(store.list().unwrap(), vec!["/mail/login".to_string()]);
    assert!(base_dir.join("mail/login.gpg").is_file());

    store.delete("/mail/login").unwrap();
    assert!(store.list().unwrap().is_empty());
    assert!(matches!(store.get("/mail/login"), Err(Error::NoEntry)));
    assert!(!base_dir.join("mail").exists());
}
