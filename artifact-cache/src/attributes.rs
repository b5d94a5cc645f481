use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::header::{CACHE_CONTROL, ETAG, EXPIRES};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::policy::ORIGIN_EXPIRE_CAP;

/// A cached artifact: opaque content bytes identified by a cache key.
///
/// An entry with empty content is a negatively cached result (the origin
/// answered, but with nothing worth serving); only a non-empty entry is
/// considered loadable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    content: Vec<u8>,
}

impl CacheEntry {
    /// Create an entry holding `content`.
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }

    /// Create a negatively cached (empty) entry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The raw content bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Consume the entry, returning the content bytes.
    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    /// `true` iff this entry carries content that can be served.
    pub fn is_loadable(&self) -> bool {
        !self.content.is_empty()
    }
}

/// Sidecar metadata stored next to a [`CacheEntry`].
///
/// All times are milliseconds since the Unix epoch. `expiration_time == 0`
/// means the origin provided no usable expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryAttributes {
    /// When the entry was persisted; stamped by the [`CacheManager`] at
    /// `put` via [`CacheEntryAttributes::mark_created`].
    ///
    /// [`CacheManager`]: crate::CacheManager
    pub create_time: u64,
    /// When the owning job observed the response these attributes came from.
    pub last_modification: u64,
    /// Absolute expiry from `Expires` or `Cache-Control: max-age`.
    pub expiration_time: u64,
    /// Entity tag of the stored representation, if the origin sent one.
    pub etag: Option<String>,
    /// Final HTTP status after redirect and backoff resolution; `499` marks
    /// a transport I/O failure.
    pub response_code: u16,
    /// Human-readable description of what went wrong, if anything did.
    pub error_message: Option<String>,
}

impl CacheEntryAttributes {
    /// Build attributes from a response header view.
    ///
    /// The expiry is taken from `Expires` when parseable, otherwise from the
    /// first well-formed `max-age` token of `Cache-Control`; malformed
    /// integers are silently ignored. The response code is left for the
    /// caller to fill in once redirects and retries have settled.
    pub fn from_response(headers: &HeaderMap, now: u64) -> Self {
        let mut expiration_time = headers
            .get(EXPIRES)
            .and_then(|value| value.to_str().ok())
            .map(http_date_ms)
            .unwrap_or(0);
        if expiration_time == 0 {
            if let Some(cache_control) =
                headers.get(CACHE_CONTROL).and_then(|value| value.to_str().ok())
            {
                for token in cache_control.split(',') {
                    if let Some(value) = token.trim().strip_prefix("max-age=")
                    {
                        if let Ok(seconds) = value.trim().parse::<u64>() {
                            expiration_time =
                                now + seconds.saturating_mul(1000);
                            break;
                        }
                    }
                }
            }
        }
        Self {
            create_time: 0,
            last_modification: now,
            expiration_time,
            etag: headers
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            response_code: 0,
            error_message: None,
        }
    }

    /// Stamp the persistence time and clamp the expiry to
    /// `create_time + ORIGIN_EXPIRE_CAP`.
    ///
    /// [`CacheManager`](crate::CacheManager) implementations must call this
    /// when persisting; origins frequently send implausible far-future
    /// `Expires` values.
    pub fn mark_created(&mut self, create_time: u64) {
        self.create_time = create_time;
        if self.expiration_time != 0 {
            self.expiration_time = self
                .expiration_time
                .min(create_time.saturating_add(ORIGIN_EXPIRE_CAP));
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parse an HTTP date string to ms since the epoch; 0 when unparseable.
pub(crate) fn http_date_ms(value: &str) -> u64 {
    httpdate::parse_http_date(value)
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Read a header as an HTTP date in ms since the epoch; 0 when absent or
/// unparseable.
pub(crate) fn header_date_ms(
    headers: &HeaderMap,
    name: http::header::HeaderName,
) -> u64 {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(http_date_ms)
        .unwrap_or(0)
}

/// Format ms since the epoch as an HTTP date for request headers.
pub(crate) fn format_http_date(ms: u64) -> String {
    httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_millis(ms))
}
