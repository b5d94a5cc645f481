//! One submission's life: cache lookup, conditional fetch, stale fallback,
//! listener fan-out.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, trace, warn};
use url::Url;

use crate::attributes::{CacheEntry, CacheEntryAttributes};
use crate::config::FetchOptions;
use crate::context::LoaderContext;
use crate::error::{Result, SubmitError};
use crate::fetcher::{FetchOutcome, Fetcher};
use crate::policy::{self, Freshness};
use crate::pool::{PoolTask, WorkerPool};

/// How a submission ended, from the listener's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadResult {
    /// An entry (fresh, revalidated, stale-fallback or negatively cached)
    /// is available.
    Success,
    /// Nothing could be served.
    Failure,
    /// The job was cancelled before a worker picked it up.
    Canceled,
}

/// Receives the outcome of a submission, exactly once per accepted
/// [`LoadJob::submit`].
pub trait LoadListener: Send + Sync {
    /// Called with whatever the job ended up with. `entry` and
    /// `attributes` are `None` when nothing was retrieved (cancellation,
    /// or a failure with an empty cache).
    fn loading_finished(
        &self,
        entry: Option<&CacheEntry>,
        attributes: Option<&CacheEntryAttributes>,
        result: LoadResult,
    );
}

/// The capabilities a concrete artifact kind supplies to a job: where it
/// lives, how it is keyed, and how fetched bytes become an entry.
pub trait ArtifactSource: Send + Sync {
    /// The remote URL, or `None` when one cannot be derived (which makes
    /// [`LoadJob::submit`] fail with [`SubmitError::MissingUrl`]).
    fn url(&self) -> Option<Url>;

    /// The backend key. Defaults to the URL string.
    fn cache_key(&self) -> String {
        self.url().map(|url| url.to_string()).unwrap_or_default()
    }

    /// Wrap fetched bytes into an entry. Override to validate or transform
    /// content before it is stored.
    fn create_entry(&self, content: Vec<u8>) -> CacheEntry {
        CacheEntry::new(content)
    }

    /// The key under which origin compliance is tracked. Defaults to the
    /// host name.
    fn server_key(&self, url: &Url) -> String {
        url.host_str().unwrap_or_default().to_owned()
    }
}

/// The pluggable key→(entry, attributes) store.
///
/// Implementations must be thread-safe with atomic per-key `get`/`put`, and
/// must stamp [`CacheEntryAttributes::mark_created`] when persisting.
pub trait CacheManager: Send + Sync {
    /// Attempt to pull a cached entry and its attributes.
    fn get(&self, key: &str)
        -> Result<Option<(CacheEntry, CacheEntryAttributes)>>;
    /// Persist an entry, returning the attributes as stored (with the
    /// persistence time stamped in).
    fn put(
        &self,
        key: &str,
        entry: CacheEntry,
        attributes: CacheEntryAttributes,
    ) -> Result<CacheEntryAttributes>;
    /// Remove a record.
    fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
struct JobState {
    entry: Option<CacheEntry>,
    attributes: Option<CacheEntryAttributes>,
    looked_up: bool,
}

type FinishedHook = Box<dyn Fn() + Send + Sync>;

/// One artifact's load orchestration.
///
/// A job is shared between submitters and the worker pool; submit it
/// through an `Arc`. The same job may be submitted several times — later
/// submitters attach as listeners to the in-flight work unless they force
/// a refetch.
pub struct LoadJob {
    manager: Arc<dyn CacheManager>,
    transport: Arc<dyn crate::transport::Transport>,
    context: Arc<LoaderContext>,
    pool: Arc<WorkerPool>,
    options: FetchOptions,
    source: Arc<dyn ArtifactSource>,
    now: u64,
    force: AtomicBool,
    url: OnceLock<Option<Url>>,
    cache_key: OnceLock<String>,
    dedup_key: OnceLock<String>,
    state: Mutex<JobState>,
    finished_hook: Mutex<Option<FinishedHook>>,
}

impl LoadJob {
    pub(crate) fn new(
        manager: Arc<dyn CacheManager>,
        transport: Arc<dyn crate::transport::Transport>,
        context: Arc<LoaderContext>,
        pool: Arc<WorkerPool>,
        options: FetchOptions,
        source: Arc<dyn ArtifactSource>,
        now: u64,
    ) -> Self {
        Self {
            manager,
            transport,
            context,
            pool,
            options,
            source,
            now,
            force: AtomicBool::new(false),
            url: OnceLock::new(),
            cache_key: OnceLock::new(),
            dedup_key: OnceLock::new(),
            state: Mutex::new(JobState::default()),
            finished_hook: Mutex::new(None),
        }
    }

    /// Register `listener` for this artifact and schedule work if needed.
    ///
    /// The first submitter for a URL schedules the job; later submitters
    /// only attach, unless `force` is set, which always enqueues (and makes
    /// the run bypass the freshness check and transport-side caching).
    pub fn submit(
        self: &Arc<Self>,
        listener: Arc<dyn LoadListener>,
        force: bool,
    ) -> std::result::Result<(), SubmitError> {
        let url = self.url().ok_or(SubmitError::MissingUrl)?;
        // The dedup key is pinned here so a source with an unstable URL
        // derivation cannot lose the drain in finish_loading.
        let key = self
            .dedup_key
            .get_or_init(|| url.to_string())
            .clone();
        let first = self.context.in_progress().register(&key, listener);
        if force {
            self.force.store(true, Ordering::SeqCst);
        }
        if first || force {
            trace!(url = %key, first, force, "scheduling load");
            self.pool.execute(self.clone());
        } else {
            trace!(url = %key, "attached to in-flight load");
        }
        Ok(())
    }

    /// Synchronous cache-only lookup; never schedules work or touches the
    /// network.
    pub fn get(&self) -> Option<(CacheEntry, CacheEntryAttributes)> {
        self.ensure_cache_element();
        let state = self.state.lock().unwrap();
        state.entry.clone().zip(state.attributes.clone())
    }

    /// Register a callback invoked after every run, whatever the outcome.
    pub fn on_finished(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.finished_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// The entry retrieved by the most recent run, if any.
    pub fn cache_entry(&self) -> Option<CacheEntry> {
        self.state.lock().unwrap().entry.clone()
    }

    /// The attributes retrieved by the most recent run, if any.
    pub fn attributes(&self) -> Option<CacheEntryAttributes> {
        self.state.lock().unwrap().attributes.clone()
    }

    fn url(&self) -> Option<Url> {
        self.url.get_or_init(|| self.source.url()).clone()
    }

    fn cache_key(&self) -> &str {
        self.cache_key.get_or_init(|| self.source.cache_key())
    }

    fn ensure_cache_element(&self) {
        let mut state = self.state.lock().unwrap();
        if state.looked_up {
            return;
        }
        state.looked_up = true;
        match self.manager.get(self.cache_key()) {
            Ok(Some((entry, attributes))) => {
                state.entry = Some(entry);
                state.attributes = Some(attributes);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%error, key = self.cache_key(), "cache lookup failed, treating as miss");
            }
        }
    }

    fn finish_loading(&self, result: LoadResult) {
        let Some(key) = self.dedup_key.get() else {
            warn!("finishing a job that was never submitted");
            return;
        };
        let Some(listeners) = self.context.in_progress().drain(key) else {
            warn!(url = %key, "no listeners to notify, was the job drained twice?");
            return;
        };
        // Clone out of the state so listeners may call back into the job.
        let (entry, attributes) = {
            let state = self.state.lock().unwrap();
            (state.entry.clone(), state.attributes.clone())
        };
        trace!(url = %key, ?result, listeners = listeners.len(), "fanning out");
        for listener in listeners {
            listener.loading_finished(
                entry.as_ref(),
                attributes.as_ref(),
                result,
            );
        }
    }

    fn run_finished_hook(&self) {
        if let Some(hook) = &*self.finished_hook.lock().unwrap() {
            hook();
        }
    }
}

impl PoolTask for LoadJob {
    fn run(&self) {
        let Some(url) = self.url() else {
            // submit() rejects url-less jobs, so this is a scheduling bug.
            warn!("job has no url, reporting failure");
            self.finish_loading(LoadResult::Failure);
            self.run_finished_hook();
            return;
        };
        debug!(%url, "processing load");
        self.ensure_cache_element();
        let force = self.force.load(Ordering::SeqCst);

        if !force {
            let mut state = self.state.lock().unwrap();
            if let (Some(entry), Some(attributes)) =
                (&state.entry, &state.attributes)
            {
                match policy::freshness(attributes, self.now) {
                    Freshness::Fresh if entry.is_loadable() => {
                        drop(state);
                        trace!(%url, "serving fresh cached entry");
                        self.finish_loading(LoadResult::Success);
                        self.run_finished_hook();
                        return;
                    }
                    Freshness::Unusable => {
                        debug!(%url, "evicting entry past the absolute age limit");
                        if let Err(error) =
                            self.manager.delete(self.cache_key())
                        {
                            warn!(%error, "failed to evict expired entry");
                        }
                        state.entry = None;
                        state.attributes = None;
                    }
                    _ => {}
                }
            }
        }

        let cached = {
            let state = self.state.lock().unwrap();
            state.entry.clone().zip(state.attributes.clone())
        };
        let fetcher = Fetcher {
            transport: self.transport.as_ref(),
            source: self.source.as_ref(),
            options: &self.options,
            origins: self.context.origins(),
            now: self.now,
        };
        let outcome = fetcher.fetch(&url, cached.as_ref(), force);

        let result = match outcome {
            FetchOutcome::Fetched { entry, attributes } => {
                let stored = match self.manager.put(
                    self.cache_key(),
                    entry.clone(),
                    attributes.clone(),
                ) {
                    Ok(stored) => stored,
                    Err(error) => {
                        // Serve what we fetched even if persisting failed.
                        warn!(%error, %url, "failed to persist fetched entry");
                        attributes
                    }
                };
                let mut state = self.state.lock().unwrap();
                state.entry = Some(entry);
                state.attributes = Some(stored);
                LoadResult::Success
            }
            FetchOutcome::NotModified => LoadResult::Success,
            FetchOutcome::Failed { attributes } => {
                let mut state = self.state.lock().unwrap();
                // Judge the stale fallback by the attributes that describe
                // the stored entry, not by the failure's.
                let stale_usable = match (&state.entry, &state.attributes) {
                    (Some(entry), Some(stored)) => {
                        entry.is_loadable()
                            && policy::within_absolute_limit(
                                stored, self.now,
                            )
                    }
                    _ => false,
                };
                if let Some(attributes) = attributes {
                    state.attributes = Some(attributes);
                }
                if stale_usable {
                    debug!(%url, "fetch failed, serving stale entry");
                    LoadResult::Success
                } else {
                    debug!(%url, "fetch failed with nothing to fall back on");
                    LoadResult::Failure
                }
            }
        };

        self.finish_loading(result);
        self.run_finished_hook();
    }

    fn cancelled(&self) {
        trace!("load cancelled before it started");
        self.finish_loading(LoadResult::Canceled);
    }
}

impl fmt::Debug for LoadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadJob")
            .field("url", &self.url.get())
            .field("now", &self.now)
            .field("force", &self.force.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
