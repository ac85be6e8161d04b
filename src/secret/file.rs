//! Directory-backed store implementation.
//!
//! [`FileStore`] keeps one regular file per entry under a base directory,
//! delegating content protection to a [`Crypter`]. Updates are atomic on
//! POSIX systems: content is written to a temporary file in the target
//! directory and renamed into place, so concurrent readers observe either
//! the old or the new ciphertext, never a partial file.

use std::{
    ffi::OsString,
    fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, anyhow};
use walkdir::WalkDir;

use crate::secret::{Error, Store};

/// Determines how a [`FileStore`] protects file content on disk.
///
/// The entry name is passed alongside the content so implementations can
/// bind ciphertext to its location.
pub trait Crypter: Send + Sync {
    /// Encrypts `content` into the ciphertext that will be written to disk
    /// for the entry named `entry_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if sealing fails.
    fn encrypt(&self, entry_name: &str, content: &str) -> Result<Vec<u8>, Error>;

    /// Decrypts `ciphertext` as read from disk for the entry named
    /// `entry_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the ciphertext does not authenticate
    /// or cannot be parsed.
    fn decrypt(&self, entry_name: &str, ciphertext: &[u8]) -> Result<String, Error>;
}

/// A [`Store`] holding each entry in its own encrypted file.
pub struct FileStore {
    base_dir: PathBuf,
    extension: String,
    crypter: Box<dyn Crypter>,
}

impl FileStore {
    /// Creates a store rooted at `base_dir`. Entry files carry `extension`
    /// (a leading dot is added when missing) and are protected by `crypter`.
    pub fn new(base_dir: impl Into<PathBuf>, extension: &str, crypter: Box<dyn Crypter>) -> Self {
        let extension = if extension.is_empty() || extension.starts_with('.') {
            extension.to_string()
        } else {
            format!(".{extension}")
        };
        Self {
            base_dir: base_dir.into(),
            extension,
            crypter,
        }
    }

    /// Resolves an entry name to its backing file, refusing names that are
    /// empty or that would resolve outside the base directory.
    fn entry_filename(&self, entry: &str) -> Result<PathBuf, Error> {
        if entry.is_empty() {
            return Err(Error::InvalidEntry);
        }
        let mut path = self.base_dir.clone();
        for component in Path::new(entry).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => path.push(part),
                Component::ParentDir | Component::Prefix(_) => return Err(Error::InvalidEntry),
            }
        }
        if path == self.base_dir || !path.starts_with(&self.base_dir) {
            return Err(Error::InvalidEntry);
        }
        let mut file_name = OsString::from(path.file_name().ok_or(Error::InvalidEntry)?);
        file_name.push(&self.extension);
        path.set_file_name(file_name);
        Ok(path)
    }
}

impl Store for FileStore {
    fn list(&self) -> Result<Vec<String>, Error> {
        let mut entries = Vec::new();
        for dirent in WalkDir::new(&self.base_dir) {
            let dirent = dirent
                .with_context(|| format!("could not walk {}", self.base_dir.display()))?;
            if !dirent.file_type().is_file() {
                continue;
            }
            let relative = dirent
                .path()
                .strip_prefix(&self.base_dir)
                .with_context(|| format!("could not relativize {}", dirent.path().display()))?;
            let Some(relative) = relative.to_str() else {
                return Err(anyhow!("entry filename {} is not valid UTF-8", relative.display()).into());
            };
            if let Some(entry) = relative.strip_suffix(&self.extension) {
                entries.push(format!("/{entry}"));
            }
        }
        Ok(entries)
    }

    fn get(&self, entry: &str) -> Result<String, Error> {
        let filename = self.entry_filename(entry)?;
        let ciphertext = match fs::read(&filename) {
            Ok(ciphertext) => ciphertext,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(Error::NoEntry),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("could not read {}", filename.display()))
                    .into());
            }
        };
        self.crypter.decrypt(entry, &ciphertext)
    }

    fn put(&self, entry: &str, content: &str) -> Result<(), Error> {
        let ciphertext = self.crypter.encrypt(entry, content)?;
        let filename = self.entry_filename(entry)?;
        let entry_dir = filename
            .parent()
            .ok_or_else(|| anyhow!("entry {entry:?} has no parent directory"))?;

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(entry_dir)
            .with_context(|| format!("could not create directory {}", entry_dir.display()))?;

        // The temporary file is removed on drop if anything below fails.
        let mut temp = tempfile::Builder::new()
            .prefix(".oubliette_tmp_")
            .tempfile_in(entry_dir)
            .with_context(|| format!("could not create temporary file in {}", entry_dir.display()))?;
        temp.write_all(&ciphertext)
            .context("could not write encrypted content")?;
        temp.persist(&filename).map_err(|err| {
            anyhow::Error::new(err.error)
                .context(format!("could not rename into {}", filename.display()))
        })?;
        Ok(())
    }

    fn delete(&self, entry: &str) -> Result<(), Error> {
        let filename = self.entry_filename(entry)?;
        match fs::remove_file(&filename) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(Error::NoEntry),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("could not delete {}", filename.display()))
                    .into());
            }
        }

        // Prune directories the delete left empty, up to (and not including)
        // the base directory.
        let mut current = filename.parent();
        while let Some(dir) = current {
            if dir == self.base_dir || !dir.starts_with(&self.base_dir) {
                break;
            }
            let mut contents = fs::read_dir(dir)
                .with_context(|| format!("could not read directory {}", dir.display()))?;
            if contents.next().is_some() {
                break;
            }
            fs::remove_dir(dir)
                .with_context(|| format!("could not delete directory {}", dir.display()))?;
            current = dir.parent();
        }
        Ok(())
    }
}
