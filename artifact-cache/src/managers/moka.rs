use std::fmt;
use std::sync::Arc;

use moka::sync::Cache;

use crate::attributes::{unix_millis, CacheEntry, CacheEntryAttributes};
use crate::error::Result;
use crate::job::CacheManager;
use crate::managers::Store;

/// Implements [`CacheManager`] with [`moka`](https://github.com/moka-rs/moka)
/// as an in-memory backend.
///
/// Clones share the underlying cache.
#[derive(Clone)]
pub struct MokaManager {
    /// The instance of `moka::sync::Cache`.
    pub cache: Cache<String, Arc<Vec<u8>>>,
}

impl MokaManager {
    /// Create a manager over an existing cache instance.
    pub fn new(cache: Cache<String, Arc<Vec<u8>>>) -> Self {
        Self { cache }
    }

    /// Clears out the entire cache.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for MokaManager {
    fn default() -> Self {
        Self::new(Cache::new(1024))
    }
}

impl fmt::Debug for MokaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaManager").finish_non_exhaustive()
    }
}

impl CacheManager for MokaManager {
    fn get(
        &self,
        key: &str,
    ) -> Result<Option<(CacheEntry, CacheEntryAttributes)>> {
        match self.cache.get(key) {
            Some(data) => {
                let store: Store = bincode::deserialize(&data)?;
                Ok(Some((store.entry, store.attributes)))
            }
            None => Ok(None),
        }
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
        self.cache.insert(key.to_owned(), Arc::new(data));
        Ok(attributes)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key);
        Ok(())
    }
}
