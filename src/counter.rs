//! Persistent tracking of authenticator counters.
//!
//! [`CounterStore`] maps an opaque handle to a `u32` counter and serializes
//! every change to disk before acknowledging it. The file is rewritten
//! whole through a temporary file and an atomic rename, so a crash leaves
//! either the previous or the new map, never a torn one.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::{PoisonError, RwLock},
};

use anyhow::{Context, Result, anyhow};
use tracing::info;

/// A crash-safe `handle → u32` map. A counter of 0 is equivalent to the
/// handle being absent. Safe for concurrent use.
pub struct CounterStore {
    inner: RwLock<Inner>,
}

struct Inner {
    counters: BTreeMap<String, u32>,
    path: Option<PathBuf>,
}

impl CounterStore {
    /// Opens (or creates) the counter file at `path`. The file is rewritten
    /// immediately so that an unwritable location fails here rather than at
    /// the first authentication.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be parsed or the file
    /// cannot be (re)written.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let counters = match fs::read(&path) {
            Ok(bytes) => postcard::from_bytes(&bytes).context("could not parse counter file")?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "creating counter file");
                BTreeMap::new()
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context("could not read counter file"));
            }
        };
        let inner = Inner {
            counters,
            path: Some(path),
        };
        inner.write_file().context("could not write counter file")?;
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Creates a counter store with no backing file. Intended for tests and
    /// for deployments that choose not to persist counters.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner {
                counters: BTreeMap::new(),
                path: None,
            }),
        }
    }

    /// Gets the counter associated with `handle`, or 0 if there is none.
    #[must_use]
    pub fn get(&self, handle: &str) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .counters
            .get(handle)
            .copied()
            .unwrap_or(0)
    }

    /// Sets the counter associated with `handle`, deleting it when `value`
    /// is 0. The map and the backing file change together: if the file
    /// write fails, the in-memory value is rolled back and the store is
    /// left unmodified.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be rewritten.
    pub fn set(&self, handle: &str, value: u32) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let previous = inner.counters.get(handle).copied();
        if value == 0 {
            inner.counters.remove(handle);
        } else {
            inner.counters.insert(handle.to_string(), value);
        }
        if let Err(err) = inner.write_file() {
            match previous {
                Some(previous) => inner.counters.insert(handle.to_string(), previous),
                None => inner.counters.remove(handle),
            };
            return Err(err.context("could not write counter file"));
        }
        Ok(())
    }
}

impl Inner {
    fn write_file(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = postcard::to_allocvec(&self.counters).context("could not serialize counters")?;
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("counter file {} has no parent directory", path.display()))?;

        // The temporary file is removed on drop if anything below fails.
        let mut temp = tempfile::Builder::new()
            .prefix(".oubliette_ctr_")
            .tempfile_in(dir)
            .with_context(|| format!("could not create temporary file in {}", dir.display()))?;
        temp.write_all(&bytes).context("could not write counters")?;
        temp.as_file().sync_all().context("could not sync counters")?;
        temp.persist(path).map_err(|err| {
            anyhow::Error::new(err.error).context(format!("could not rename into {}", path.display()))
        })?;
        Ok(())
    }
}
