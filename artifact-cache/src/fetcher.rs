//! The HTTP validation state machine: HEAD preflight for non-compliant
//! origins, conditional GET, redirect following, 503 backoff, and the
//! disposition of whatever finally comes back.

use std::time::Duration;

use http::header::{
    ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
};
use http::{HeaderMap, Method};
use rand::Rng;
use tracing::{debug, trace, warn};
use url::Url;

use crate::attributes::{
    format_http_date, header_date_ms, CacheEntry, CacheEntryAttributes,
};
use crate::config::{FetchOptions, DEFAULT_ACCEPT};
use crate::context::OriginProfile;
use crate::job::ArtifactSource;
use crate::policy::ABSOLUTE_EXPIRE;
use crate::transport::{
    Transport, TransportError, TransportRequest, TransportResponse,
};

/// How many 302 responses are followed before the last one is taken as the
/// final answer.
const MAX_REDIRECTS: usize = 5;

/// How many fresh attempts are made against an origin answering 503.
const MAX_UNAVAILABLE_RETRIES: usize = 5;

/// What one network interaction produced.
#[derive(Debug)]
pub(crate) enum FetchOutcome {
    /// New data (possibly an empty negative-cache entry) to persist.
    Fetched {
        /// The entry to store and serve.
        entry: CacheEntry,
        /// Attributes parsed from the final response.
        attributes: CacheEntryAttributes,
    },
    /// The cached entry was revalidated; the cache stays untouched.
    NotModified,
    /// Nothing usable was fetched; the caller decides on a stale fallback.
    Failed {
        /// Attributes describing the failure, when one was observed.
        attributes: Option<CacheEntryAttributes>,
    },
}

/// Borrows everything one network interaction needs.
pub(crate) struct Fetcher<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) source: &'a dyn ArtifactSource,
    pub(crate) options: &'a FetchOptions,
    pub(crate) origins: &'a OriginProfile,
    pub(crate) now: u64,
}

impl Fetcher<'_> {
    /// Run the validation protocol for `url` against the origin.
    pub(crate) fn fetch(
        &self,
        url: &Url,
        cached: Option<&(CacheEntry, CacheEntryAttributes)>,
        force: bool,
    ) -> FetchOutcome {
        let loadable = cached.filter(|(entry, _)| entry.is_loadable());
        let host = self.source.server_key(url);

        if !force {
            if let Some((_, attributes)) = loadable {
                if self.origins.needs_head_probe(&host) {
                    match self.head_probe(url, attributes) {
                        Ok(true) => {
                            debug!(%url, "HEAD probe confirmed the cached entry");
                            return FetchOutcome::NotModified;
                        }
                        Ok(false) => {
                            trace!(%url, "HEAD probe disagreed, downloading");
                        }
                        Err(error) => return self.failure(error, cached),
                    }
                }
            }
        }

        let request = self.conditional_get(
            url,
            loadable.map(|(_, attributes)| attributes),
            force,
        );
        let mut response = match self.exchange(&request) {
            Ok(response) => response,
            Err(error) => return self.failure(error, cached),
        };
        for _ in 0..MAX_UNAVAILABLE_RETRIES {
            if response.status != 503 {
                break;
            }
            self.backoff();
            response = match self.exchange(&request) {
                Ok(response) => response,
                Err(error) => return self.failure(error, cached),
            };
        }

        if let Some((_, attributes)) = loadable {
            if response.status != 304 {
                self.check_conditional_compliance(&host, attributes, &response);
            }
        }
        if response.status == 304 {
            debug!(%url, "origin revalidated the cached entry");
            return FetchOutcome::NotModified;
        }

        let TransportResponse { status, headers, body } = response;
        let mut attributes =
            CacheEntryAttributes::from_response(&headers, self.now);
        attributes.response_code = status;
        let body = if status == 200 { body } else { Vec::new() };
        self.disposition(attributes, body, &headers)
    }

    /// Revalidate a flagged origin without downloading the body. The cached
    /// entry holds iff the etags match, or the origin's `Last-Modified` is
    /// no newer than what we stored.
    fn head_probe(
        &self,
        url: &Url,
        attributes: &CacheEntryAttributes,
    ) -> Result<bool, TransportError> {
        trace!(%url, "probing origin with HEAD");
        let request = self.request(Method::HEAD, url.clone(), true);
        let response = self.exchange(&request)?;
        if attributes.etag.is_some()
            && attributes.etag.as_deref() == response.header(ETAG.as_str())
        {
            return Ok(true);
        }
        let last_modified = header_date_ms(&response.headers, LAST_MODIFIED);
        Ok(last_modified != 0
            && last_modified <= attributes.last_modification)
    }

    /// One logical exchange: execute the descriptor and chase up to
    /// [`MAX_REDIRECTS`] 302 responses, releasing each response before the
    /// next attempt. A missing or unusable `Location` ends the chase with
    /// the redirect itself as the final response.
    fn exchange(
        &self,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = request.clone();
        let mut response = self.transport.execute(&request)?;
        let mut redirects = 0;
        while response.status == 302 && redirects < MAX_REDIRECTS {
            let Some(location) = response.header(LOCATION.as_str()) else {
                break;
            };
            let target = match request.url.join(location) {
                Ok(target) => target,
                Err(error) => {
                    warn!(%error, location, "unusable redirect target");
                    break;
                }
            };
            trace!(from = %request.url, to = %target, "following redirect");
            request.url = target;
            redirects += 1;
            response = self.transport.execute(&request)?;
        }
        Ok(response)
    }

    /// Base descriptor shared by probes and downloads.
    fn request(
        &self,
        method: Method,
        url: Url,
        use_cache: bool,
    ) -> TransportRequest {
        let mut headers =
            vec![(ACCEPT.as_str().to_owned(), DEFAULT_ACCEPT.to_owned())];
        headers.extend(self.options.headers.iter().cloned());
        TransportRequest {
            method,
            url,
            headers,
            connect_timeout: self.options.connect_timeout,
            read_timeout: self.options.read_timeout,
            use_cache,
        }
    }

    /// The GET descriptor, carrying validators for whatever we have cached.
    fn conditional_get(
        &self,
        url: &Url,
        attributes: Option<&CacheEntryAttributes>,
        force: bool,
    ) -> TransportRequest {
        let mut request = self.request(Method::GET, url.clone(), !force);
        if let Some(attributes) = attributes {
            if self.now.saturating_sub(attributes.last_modification)
                <= ABSOLUTE_EXPIRE
            {
                request.headers.push((
                    IF_MODIFIED_SINCE.as_str().to_owned(),
                    format_http_date(attributes.last_modification),
                ));
            }
            if let Some(etag) = &attributes.etag {
                request.headers.push((
                    IF_NONE_MATCH.as_str().to_owned(),
                    etag.clone(),
                ));
            }
        }
        request
    }

    /// A full response despite matching validators means the origin does
    /// not honor conditional GETs; flag it so future jobs probe with HEAD.
    fn check_conditional_compliance(
        &self,
        host: &str,
        attributes: &CacheEntryAttributes,
        response: &TransportResponse,
    ) {
        let etag_match = attributes.etag.is_some()
            && attributes.etag.as_deref() == response.header(ETAG.as_str());
        let response_modified =
            header_date_ms(&response.headers, LAST_MODIFIED);
        let modified_match = response_modified != 0
            && response_modified == attributes.last_modification;
        if etag_match || modified_match {
            debug!(
                host,
                "origin ignores conditional requests, switching to HEAD probes"
            );
            self.origins.mark_non_compliant(host);
        }
    }

    fn disposition(
        &self,
        attributes: CacheEntryAttributes,
        body: Vec<u8>,
        headers: &HeaderMap,
    ) -> FetchOutcome {
        let code = attributes.response_code;
        let policy = &self.options.response_policy;
        if (policy.is_loadable)(headers, code, &body) {
            trace!(code, bytes = body.len(), "storing fetched artifact");
            FetchOutcome::Fetched {
                entry: self.source.create_entry(body),
                attributes,
            }
        } else if (policy.cache_as_empty)(code) {
            debug!(code, "negatively caching non-loadable response");
            FetchOutcome::Fetched {
                entry: self.source.create_entry(Vec::new()),
                attributes,
            }
        } else {
            debug!(code, "response neither loadable nor cacheable");
            FetchOutcome::Failed { attributes: Some(attributes) }
        }
    }

    /// Map a transport-level failure onto the cache. A `NotFound` is as
    /// authoritative as an HTTP 404; an I/O failure is not, so a loadable
    /// cached entry survives it for stale serving.
    fn failure(
        &self,
        error: TransportError,
        cached: Option<&(CacheEntry, CacheEntryAttributes)>,
    ) -> FetchOutcome {
        let policy = &self.options.response_policy;
        let base = cached
            .map(|(_, attributes)| attributes.clone())
            .unwrap_or_default();
        let message = error.to_string();
        match error {
            TransportError::NotFound => {
                let mut attributes = base;
                attributes.response_code = 404;
                attributes.error_message = Some(message);
                debug!("resource missing at origin");
                if (policy.is_loadable)(&HeaderMap::new(), 404, &[])
                    || (policy.cache_as_empty)(404)
                {
                    FetchOutcome::Fetched {
                        entry: self.source.create_entry(Vec::new()),
                        attributes,
                    }
                } else {
                    FetchOutcome::Failed { attributes: Some(attributes) }
                }
            }
            TransportError::Io(_) => {
                let mut attributes = base;
                attributes.response_code = 499;
                attributes.error_message = Some(message);
                let has_loadable =
                    cached.map_or(false, |(entry, _)| entry.is_loadable());
                if has_loadable {
                    debug!("transport failure, cached entry kept for stale serving");
                    FetchOutcome::Failed { attributes: Some(attributes) }
                } else if (policy.is_loadable)(&HeaderMap::new(), 499, &[])
                    || (policy.cache_as_empty)(499)
                {
                    FetchOutcome::Fetched {
                        entry: self.source.create_entry(Vec::new()),
                        attributes,
                    }
                } else {
                    FetchOutcome::Failed { attributes: Some(attributes) }
                }
            }
            TransportError::Other(_) => {
                warn!(error = %message, "unexpected transport failure");
                FetchOutcome::Failed { attributes: None }
            }
        }
    }

    fn backoff(&self) {
        let base = self.options.backoff_base;
        let jitter_cap = base.as_millis().max(1) as u64;
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        let wait = base + Duration::from_millis(jitter);
        debug!(
            wait_ms = wait.as_millis() as u64,
            "origin unavailable, backing off"
        );
        std::thread::sleep(wait);
    }
}
