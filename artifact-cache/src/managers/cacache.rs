use std::path::PathBuf;

use crate::attributes::{unix_millis, CacheEntry, CacheEntryAttributes};
use crate::error::Result;
use crate::job::CacheManager;
use crate::managers::Store;

/// Implements [`CacheManager`] with
/// [`cacache`](https://github.com/zkat/cacache-rs) as the backend.
#[derive(Debug, Clone)]
pub struct CACacheManager {
    /// Directory where the cache will be stored.
    pub path: PathBuf,
}

impl Default for CACacheManager {
    fn default() -> Self {
        Self { path: PathBuf::from("./artifact-cacache") }
    }
}

impl CACacheManager {
    /// Clears out the entire cache.
    pub fn clear(&self) -> Result<()> {
        cacache::clear_sync(&self.path)?;
        Ok(())
    }
}

impl CacheManager for CACacheManager {
    fn get(
        &self,
        key: &str,
    ) -> Result<Option<(CacheEntry, CacheEntryAttributes)>> {
        let store: Store = match cacache::read_sync(&self.path, key) {
            Ok(data) => bincode::deserialize(&data)?,
            Err(cacache::Error::EntryNotFound(_, _)) => return Ok(None),
            Err(error) => return Err(Box::new(error)),
        };
        Ok(Some((store.entry, store.attributes)))
    }

    fn put(
        &self,
        key: &str,
        entry: CacheEntry,
        mut attributes: CacheEntryAttributes,
    ) -> Result<CacheEntryAttributes> {
        attributes.mark_created(unix_millis());
        let data = bincode::serialize(&Store {
            entry,
            attributes: attributes.clone(),
        })?;
        cacache::write_sync(&self.path, key, data)?;
        Ok(attributes)
    }

    fn delete(&self, key: &str) -> Result<()> {
        match cacache::remove_sync(&self.path, key) {
            Ok(()) => Ok(()),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(()),
            Err(error) => Err(Box::new(error)),
        }
    }
}
