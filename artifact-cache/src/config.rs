//! Configuration for the HTTP side of a job and for the worker pool.

use std::time::Duration;

use http::HeaderMap;

/// `Accept` value sent when the caller does not override it.
pub const DEFAULT_ACCEPT: &str =
    "text/html, image/png, image/jpeg, image/gif, */*";

/// Options governing a job's HTTP exchanges.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Time allowed for establishing a connection.
    pub connect_timeout: Duration,
    /// Time allowed for reading a response.
    pub read_timeout: Duration,
    /// Extra request headers, merged after the default `Accept`.
    pub headers: Vec<(String, String)>,
    /// Base delay between 503 retries; the same magnitude again is added as
    /// random jitter per sleep.
    pub backoff_base: Duration,
    /// Predicates deciding how responses are cached.
    pub response_policy: ResponsePolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            headers: Vec::new(),
            backoff_base: Duration::from_secs(5),
            response_policy: ResponsePolicy::default(),
        }
    }
}

/// Predicates deciding whether a response body is worth storing, and
/// whether a bodiless outcome should be negatively cached.
///
/// These are configuration rather than behavior of the
/// [`ArtifactSource`](crate::ArtifactSource) so one source type can be
/// reused under different caching regimes.
#[derive(Debug, Copy, Clone)]
pub struct ResponsePolicy {
    /// Is this response loadable content? Default: non-empty body with a
    /// status below 400.
    pub is_loadable: fn(&HeaderMap, u16, &[u8]) -> bool,
    /// Should a non-loadable response be cached as an empty entry?
    /// Default: status below 500.
    pub cache_as_empty: fn(u16) -> bool,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            is_loadable: default_is_loadable,
            cache_as_empty: default_cache_as_empty,
        }
    }
}

fn default_is_loadable(_headers: &HeaderMap, code: u16, body: &[u8]) -> bool {
    !body.is_empty() && code < 400
}

fn default_cache_as_empty(code: u16) -> bool {
    code < 500
}

/// Sizing of the [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Copy, Clone)]
pub struct PoolOptions {
    /// Threads kept alive even when idle.
    pub core_threads: usize,
    /// Upper bound on concurrently running workers.
    pub max_threads: usize,
    /// How long a surplus worker lingers idle before exiting.
    pub keep_alive: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            core_threads: 2,
            max_threads: 10,
            keep_alive: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_predicates() {
        let policy = ResponsePolicy::default();
        let headers = HeaderMap::new();
        assert!((policy.is_loadable)(&headers, 200, b"tile"));
        assert!(!(policy.is_loadable)(&headers, 200, b""));
        assert!(!(policy.is_loadable)(&headers, 404, b"gone"));
        assert!((policy.cache_as_empty)(404));
        assert!((policy.cache_as_empty)(499));
        assert!(!(policy.cache_as_empty)(503));
    }
}
