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
//! The blocking [`reqwest`] transport for
//! [`artifact-cache`](artifact_cache).
//!
//! Redirects are disabled on the client: the cache core follows them
//! itself so it can cap the hop count and re-send validators per attempt.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use artifact_cache::ArtifactCache;
//! use artifact_cache_reqwest::ReqwestTransport;
//! # use artifact_cache::CacheManager;
//!
//! # fn run(manager: Arc<dyn CacheManager>) -> Result<ArtifactCache, reqwest::Error> {
//! let transport = ReqwestTransport::new(Duration::from_secs(15))?;
//! let cache = ArtifactCache::new(manager, Arc::new(transport));
//! # Ok(cache)
//! # }
//! ```

use http::header::{CACHE_CONTROL, PRAGMA};
use http::Method;
use reqwest::blocking::Client;
use reqwest::redirect;
use tracing::trace;

use artifact_cache::{Transport, TransportError, TransportRequest, TransportResponse};

/// A [`Transport`] backed by a shared [`reqwest::blocking::Client`].
#[derive(Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a transport with the given connection timeout.
    ///
    /// The connection timeout is a property of the underlying client, so it
    /// is fixed here rather than read per descriptor; the read timeout is
    /// honored per exchange.
    pub fn new(
        connect_timeout: std::time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client. The client must not follow redirects.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn execute(
        &self,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        trace!(method = %request.method, url = %request.url, "executing exchange");
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .timeout(request.read_timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.use_cache {
            builder = builder
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache");
        }
        let response = builder.send().map_err(to_transport_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = if request.method == Method::HEAD {
            Vec::new()
        } else {
            response.bytes().map_err(to_transport_error)?.to_vec()
        };
        Ok(TransportResponse { status, headers, body })
    }
}

fn to_transport_error(error: reqwest::Error) -> TransportError {
    if error.is_builder() {
        TransportError::Other(error.to_string())
    } else {
        TransportError::Io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use artifact_cache::{
        ArtifactCache, ArtifactSource, CacheEntry, CacheEntryAttributes,
        LoadListener, LoadResult, MokaManager,
    };
    use mockito::{mock, server_url, Matcher};
    use url::Url;

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new(Duration::from_secs(5)).unwrap()
    }

    fn descriptor(method: Method, url: &str) -> TransportRequest {
        TransportRequest {
            method,
            url: Url::parse(url).unwrap(),
            headers: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            use_cache: true,
        }
    }

    #[derive(Debug)]
    struct PathSource(String);

    impl ArtifactSource for PathSource {
        fn url(&self) -> Option<Url> {
            Url::parse(&format!("{}{}", server_url(), self.0)).ok()
        }
    }

    struct ChannelListener(mpsc::Sender<(Option<Vec<u8>>, LoadResult)>);

    impl LoadListener for ChannelListener {
        fn loading_finished(
            &self,
            entry: Option<&CacheEntry>,
            _attributes: Option<&CacheEntryAttributes>,
            result: LoadResult,
        ) {
            self.0
                .send((entry.map(|entry| entry.content().to_vec()), result))
                .ok();
        }
    }

    #[test]
    fn plain_exchange() {
        let m = mock("GET", "/plain.png")
            .with_status(200)
            .with_header("etag", "\"abc\"")
            .with_body("tile")
            .create();
        let response = transport()
            .execute(&descriptor(
                Method::GET,
                &format!("{}/plain.png", server_url()),
            ))
            .unwrap();
        m.assert();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"tile");
        assert_eq!(response.header("etag"), Some("\"abc\""));
    }

    #[test]
    fn head_exchange_has_no_body() {
        let m = mock("HEAD", "/probe.png")
            .with_status(200)
            .with_header("last-modified", "Mon, 18 Jul 2016 16:06:00 GMT")
            .create();
        let response = transport()
            .execute(&descriptor(
                Method::HEAD,
                &format!("{}/probe.png", server_url()),
            ))
            .unwrap();
        m.assert();
        assert!(response.body.is_empty());
        assert!(response.header("last-modified").is_some());
    }

    #[test]
    fn redirects_are_not_followed() {
        let m = mock("GET", "/moved.png")
            .with_status(302)
            .with_header("location", "/elsewhere.png")
            .create();
        let response = transport()
            .execute(&descriptor(
                Method::GET,
                &format!("{}/moved.png", server_url()),
            ))
            .unwrap();
        m.assert();
        assert_eq!(response.status, 302);
        assert_eq!(response.header("location"), Some("/elsewhere.png"));
    }

    #[test]
    fn force_defeats_transport_caching() {
        let m = mock("GET", "/forced.png")
            .match_header("cache-control", "no-cache")
            .match_header("pragma", "no-cache")
            .with_status(200)
            .with_body("fresh")
            .create();
        let mut request = descriptor(
            Method::GET,
            &format!("{}/forced.png", server_url()),
        );
        request.use_cache = false;
        let response = transport().execute(&request).unwrap();
        m.assert();
        assert_eq!(response.body, b"fresh");
    }

    #[test]
    fn connection_failure_maps_to_io() {
        // A port nothing listens on.
        let error = transport()
            .execute(&descriptor(Method::GET, "http://127.0.0.1:9/x.png"))
            .unwrap_err();
        assert!(matches!(error, TransportError::Io(_)));
    }

    #[test]
    fn end_to_end_download_then_revalidation() {
        // Without validators the origin answers in full; with them, 304.
        let full = mock("GET", "/tile.png")
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_header("etag", "\"v1\"")
            .with_header("cache-control", "max-age=0")
            .with_body("tile-content")
            .expect(1)
            .create();
        let revalidated = mock("GET", "/tile.png")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .expect(1)
            .create();

        let cache = ArtifactCache::new(
            Arc::new(MokaManager::default()),
            Arc::new(transport()),
        );

        let (sender, notifications) = mpsc::channel();
        cache
            .job(PathSource("/tile.png".into()))
            .submit(Arc::new(ChannelListener(sender)), false)
            .unwrap();
        let (entry, result) =
            notifications.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(result, LoadResult::Success);
        assert_eq!(entry.as_deref(), Some(&b"tile-content"[..]));
        full.assert();

        // max-age=0 has the entry stale by the time a later job looks.
        std::thread::sleep(Duration::from_millis(10));
        let (sender, notifications) = mpsc::channel();
        cache
            .job(PathSource("/tile.png".into()))
            .submit(Arc::new(ChannelListener(sender)), false)
            .unwrap();
        let (entry, result) =
            notifications.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(result, LoadResult::Success);
        assert_eq!(entry.as_deref(), Some(&b"tile-content"[..]));
        revalidated.assert();
    }
}
