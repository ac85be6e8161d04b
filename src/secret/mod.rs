//! Standard interface to serialized secret data.
//!
//! A [`Vault`] is a passphrase-locked collection of secret entries. Unlocking
//! it yields a [`Store`], a key-value view where keys are absolute
//! slash-separated paths (`/path/to/entry-name`) and values are opaque entry
//! content. Store implementations always protect entry content at rest, but
//! may store entry names in the clear.
//!
//! Stores are safe for concurrent use but provide no transactionality: an
//! update implemented as a `get` followed by a `put` may overwrite
//! intervening changes by another caller.

use thiserror::Error as ThisError;

pub mod file;
pub mod key;
pub mod pgp;
pub mod secretbox;

/// Errors surfaced by vaults and stores.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The passphrase did not authenticate against the vault key.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// No entry exists with the requested name.
    #[error("no such entry")]
    NoEntry,

    /// The entry name is empty or resolves outside the store's base
    /// directory.
    #[error("invalid entry name")]
    InvalidEntry,

    /// No registered backend accepts the key descriptor.
    #[error("unrecognized key type")]
    UnrecognizedKeyType,

    /// I/O, serialization, or unexpected cryptographic failure. Opaque to
    /// callers.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A passphrase-locked vault of secret data. Implementations are safe for
/// concurrent use.
pub trait Vault: Send + Sync {
    /// Attempts to open the vault. On success, a [`Store`] owning the
    /// unlocked key material is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPassphrase`] if the passphrase does not
    /// authenticate, and [`Error::Internal`] for everything else.
    fn unlock(&self, passphrase: &str) -> Result<Box<dyn Store>, Error>;
}

/// A serialized store of secret entries. Implementations are safe for
/// concurrent use.
pub trait Store: Send + Sync {
    /// Returns the names of all entries in the store, as absolute
    /// slash-separated paths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the store cannot be enumerated.
    fn list(&self) -> Result<Vec<String>, Error>;

    /// Gets an entry's content given its name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEntry`] if there is no entry with the given name.
    fn get(&self, entry: &str) -> Result<String, Error>;

    /// Creates or replaces an entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEntry`] for unusable names and
    /// [`Error::Internal`] if the entry cannot be persisted.
    fn put(&self, entry: &str, content: &str) -> Result<(), Error>;

    /// Removes an entry by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEntry`] if there is no entry with the given name.
    fn delete(&self, entry: &str) -> Result<(), Error>;
}
