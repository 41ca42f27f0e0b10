//! JSON-file state store with atomic writes.

use std::fs::File;
use std::io::{ErrorKind, Write as _};
use std::path::PathBuf;

use tracing::warn;

use carehub_app::ports::StateStore;
use carehub_domain::error::StorageError;

/// One JSON file per key under a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a partial blob. Loads degrade to "absent" on any
/// read failure; the engine constructs a fresh default in that case.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| StorageError::new("init", err))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            warn!(key, "rejecting storage key with unsupported characters");
            return None;
        }
        Some(self.root.join(format!("{key}.json")))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!(key, error = %err, "state blob unreadable; treating as absent");
                None
            }
        }
    }

    fn save(
        &mut self,
        key: &str,
        value: &[u8],
        required_for_each_execution: bool,
    ) -> Result<(), StorageError> {
        let path = self.path_for(key).ok_or_else(|| {
            StorageError::new(
                "save",
                std::io::Error::new(ErrorKind::InvalidInput, format!("invalid key {key:?}")),
            )
        })?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp).map_err(|err| StorageError::new("save", err))?;
            file.write_all(value)
                .map_err(|err| StorageError::new("save", err))?;
            if required_for_each_execution {
                file.sync_all().map_err(|err| StorageError::new("save", err))?;
            }
        }
        std::fs::rename(&tmp, &path).map_err(|err| StorageError::new("save", err))
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        // Renames become durable once the directory entry is synced.
        let dir = File::open(&self.root).map_err(|err| StorageError::new("flush", err))?;
        dir.sync_all().map_err(|err| StorageError::new("flush", err))
    }
}
