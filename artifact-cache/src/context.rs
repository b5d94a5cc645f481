//! Shared per-process state: the in-progress submission registry and the
//! per-origin conditional-GET compliance profile.
//!
//! Both are injected into jobs through one [`LoaderContext`] value rather
//! than living in statics, so independent caches (and tests) never observe
//! each other.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::job::LoadListener;

/// Process-wide mapping from URL to the listeners awaiting the outcome of
/// the first-submitted job for that URL.
///
/// All operations serialize on a single mutex; the critical sections are
/// tiny compared to the network latency they guard against duplicating.
#[derive(Default)]
pub struct InProgressRegistry {
    listeners: Mutex<HashMap<String, Vec<Arc<dyn LoadListener>>>>,
}

impl InProgressRegistry {
    /// Add `listener` to the set at `key`, returning `true` iff the set was
    /// just created — the caller is the first submitter and must schedule
    /// the work.
    pub fn register(&self, key: &str, listener: Arc<dyn LoadListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        match listeners.get_mut(key) {
            Some(waiting) => {
                waiting.push(listener);
                false
            }
            None => {
                listeners.insert(key.to_owned(), vec![listener]);
                true
            }
        }
    }

    /// Remove and return the listener set at `key`.
    ///
    /// If `register` returned `true` for a key, every control-flow exit of
    /// the owning job must eventually drain it.
    pub fn drain(&self, key: &str) -> Option<Vec<Arc<dyn LoadListener>>> {
        self.listeners.lock().unwrap().remove(key)
    }

    /// Number of URLs with outstanding submissions.
    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// `true` when no submission is outstanding.
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }
}

impl fmt::Debug for InProgressRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProgressRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

/// Origins observed to ignore conditional GETs.
///
/// Once a host is flagged it stays flagged for the process lifetime; such
/// origins are revalidated with HEAD probes instead.
#[derive(Debug, Default)]
pub struct OriginProfile {
    non_compliant: Mutex<HashSet<String>>,
}

impl OriginProfile {
    /// `true` when `host` should be revalidated with a HEAD probe.
    pub fn needs_head_probe(&self, host: &str) -> bool {
        self.non_compliant.lock().unwrap().contains(host)
    }

    /// Record that `host` returned a full response despite matching
    /// validators.
    pub fn mark_non_compliant(&self, host: &str) {
        self.non_compliant.lock().unwrap().insert(host.to_owned());
    }
}

/// The shared state a [`LoadJob`](crate::LoadJob) needs beyond its own
/// collaborators.
#[derive(Debug, Default)]
pub struct LoaderContext {
    in_progress: InProgressRegistry,
    origins: OriginProfile,
}

impl LoaderContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The submission registry.
    pub fn in_progress(&self) -> &InProgressRegistry {
        &self.in_progress
    }

    /// The per-origin compliance profile.
    pub fn origins(&self) -> &OriginProfile {
        &self.origins
    }
}
