#[cfg(feature = "manager-cacache")]
pub(crate) mod cacache;

#[cfg(feature = "manager-moka")]
pub(crate) mod moka;

#[cfg(any(feature = "manager-cacache", feature = "manager-moka"))]
mod store {
    use serde::{Deserialize, Serialize};

    use crate::attributes::{CacheEntry, CacheEntryAttributes};

    /// The record the reference managers persist per key.
    #[derive(Debug, Serialize, Deserialize)]
    pub(crate) struct Store {
        pub(crate) entry: CacheEntry,
        pub(crate) attributes: CacheEntryAttributes,
    }
}

#[cfg(any(feature = "manager-cacache", feature = "manager-moka"))]
pub(crate) use store::Store;
