#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A concurrent, revalidating HTTP object cache for remote binary
//! artifacts such as map tiles and attribution blobs.
//!
//! Many concurrent submitters share at most one in-flight fetch per URL;
//! cached entries are revalidated with conditional GETs (`If-Modified-Since`
//! / `If-None-Match`), falling back to `HEAD` probes against origins that
//! answer full responses despite matching validators. Work runs on a
//! bounded pool whose queue drains newest-first, because the user is most
//! likely waiting for what they most recently requested.
//!
//! ## Features
//!
//! The following features are available. By default `manager-cacache` is
//! enabled.
//!
//! - `manager-cacache` (default): enable [cacache](https://github.com/zkat/cacache-rs),
//!   a high-performance disk cache, backend manager.
//! - `manager-moka` (disabled): enable [moka](https://github.com/moka-rs/moka),
//!   a high-performance in-memory cache, backend manager.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use artifact_cache::{
//!     ArtifactCache, ArtifactSource, CACacheManager, CacheEntry,
//!     CacheEntryAttributes, LoadListener, LoadResult,
//! };
//! use url::Url;
//!
//! #[derive(Debug)]
//! struct Tile { z: u32, x: u32, y: u32 }
//!
//! impl ArtifactSource for Tile {
//!     fn url(&self) -> Option<Url> {
//!         Url::parse(&format!(
//!             "https://tiles.example.org/{}/{}/{}.png",
//!             self.z, self.x, self.y
//!         ))
//!         .ok()
//!     }
//! }
//!
//! #[derive(Debug)]
//! struct Print;
//!
//! impl LoadListener for Print {
//!     fn loading_finished(
//!         &self,
//!         entry: Option<&CacheEntry>,
//!         _attributes: Option<&CacheEntryAttributes>,
//!         result: LoadResult,
//!     ) {
//!         println!("{result:?}: {} bytes", entry.map_or(0, |e| e.content().len()));
//!     }
//! }
//!
//! # fn run(transport: Arc<dyn artifact_cache::Transport>) -> Result<(), artifact_cache::SubmitError> {
//! let cache = ArtifactCache::new(
//!     Arc::new(CACacheManager::default()),
//!     transport,
//! );
//! let job = cache.job(Tile { z: 1, x: 0, y: 0 });
//! job.submit(Arc::new(Print), false)?;
//! # Ok(())
//! # }
//! ```

mod attributes;
mod config;
mod context;
mod error;
mod fetcher;
mod job;
mod managers;
mod policy;
mod pool;
mod transport;

use std::fmt;
use std::sync::Arc;

pub use attributes::{unix_millis, CacheEntry, CacheEntryAttributes};
pub use config::{FetchOptions, PoolOptions, ResponsePolicy, DEFAULT_ACCEPT};
pub use context::{InProgressRegistry, LoaderContext, OriginProfile};
pub use error::{BoxError, Result, SubmitError};
pub use job::{
    ArtifactSource, CacheManager, LoadJob, LoadListener, LoadResult,
};
pub use policy::{
    freshness, within_absolute_limit, Freshness, ABSOLUTE_EXPIRE,
    DEFAULT_EXPIRE, ORIGIN_EXPIRE_CAP,
};
pub use pool::{PoolTask, WorkerPool};
pub use transport::{
    Transport, TransportError, TransportRequest, TransportResponse,
};

#[cfg(feature = "manager-cacache")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-cacache")))]
pub use managers::cacache::CACacheManager;

#[cfg(feature = "manager-moka")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
pub use managers::moka::MokaManager;

/// Bundles the collaborators every job needs: the backend, the transport,
/// the shared dedup/origin context, the worker pool and the HTTP options.
pub struct ArtifactCache {
    manager: Arc<dyn CacheManager>,
    transport: Arc<dyn Transport>,
    context: Arc<LoaderContext>,
    pool: Arc<WorkerPool>,
    options: FetchOptions,
}

impl ArtifactCache {
    /// Create a cache with default HTTP options and pool sizing.
    pub fn new(
        manager: Arc<dyn CacheManager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_options(
            manager,
            transport,
            FetchOptions::default(),
            PoolOptions::default(),
        )
    }

    /// Create a cache with explicit HTTP options and pool sizing.
    pub fn with_options(
        manager: Arc<dyn CacheManager>,
        transport: Arc<dyn Transport>,
        options: FetchOptions,
        pool: PoolOptions,
    ) -> Self {
        Self {
            manager,
            transport,
            context: Arc::new(LoaderContext::new()),
            pool: Arc::new(WorkerPool::new(pool)),
            options,
        }
    }

    /// Build a job for one artifact. The job captures the current time; its
    /// freshness decisions are made against that instant.
    pub fn job(&self, source: impl ArtifactSource + 'static) -> Arc<LoadJob> {
        Arc::new(LoadJob::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.transport),
            Arc::clone(&self.context),
            Arc::clone(&self.pool),
            self.options.clone(),
            Arc::new(source),
            unix_millis(),
        ))
    }

    /// Cancel every job still queued (not running); each fans out
    /// [`LoadResult::Canceled`] to its listeners. Returns how many were
    /// cancelled.
    pub fn cancel_outstanding_tasks(&self) -> usize {
        self.pool.cancel_outstanding()
    }

    /// The shared dedup/origin state, mainly useful for diagnostics.
    pub fn context(&self) -> &Arc<LoaderContext> {
        &self.context
    }
}

impl fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("context", &self.context)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
