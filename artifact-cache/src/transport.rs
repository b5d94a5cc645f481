//! The contract between the cache core and whatever performs HTTP I/O.
//!
//! Each network attempt is described by an immutable [`TransportRequest`];
//! the core drives redirects and retries itself by issuing further
//! descriptors, so implementations must not follow redirects on their own.

use std::time::Duration;

use http::{HeaderMap, Method};
use url::Url;

/// An immutable description of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// `GET` for downloads, `HEAD` for origin probes.
    pub method: Method,
    /// Where to send the request.
    pub url: Url,
    /// Request headers, in insertion order.
    pub headers: Vec<(String, String)>,
    /// Time allowed for establishing the connection.
    pub connect_timeout: Duration,
    /// Time allowed for the response.
    pub read_timeout: Duration,
    /// When `false` the implementation must defeat any transport-side
    /// caching it would otherwise apply.
    pub use_cache: bool,
}

/// What came back from one exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body; empty for `HEAD` exchanges.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Read a header as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Ways an exchange can fail before producing a status line.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The resource does not exist; handled like an HTTP 404.
    #[error("resource not found")]
    NotFound,
    /// Connection, timeout or read failure; recorded as status 499.
    #[error("i/o failure: {0}")]
    Io(String),
    /// Anything else; reported as a failure without touching the cache.
    #[error("{0}")]
    Other(String),
}

/// Executes [`TransportRequest`]s. Implementations must be shareable
/// across worker threads.
pub trait Transport: Send + Sync {
    /// Perform one exchange, without following redirects.
    fn execute(
        &self,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError>;
}
