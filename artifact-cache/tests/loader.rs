//! End-to-end scenarios: jobs driven through the real pool and registry
//! against in-process fakes for the transport and the backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use artifact_cache::{
    unix_millis, ArtifactCache, ArtifactSource, CacheEntry,
    CacheEntryAttributes, CacheManager, FetchOptions, LoadListener,
    LoadResult, PoolOptions, Result, SubmitError, Transport, TransportError,
    TransportRequest, TransportResponse, DEFAULT_EXPIRE,
};
use http::HeaderMap;
use url::Url;

const TILE_URL: &str = "http://tiles.example.org/7/42/17.png";

#[derive(Default)]
struct MemoryManager {
    store: Mutex<HashMap<String, (CacheEntry, CacheEntryAttributes)>>,
    puts: AtomicUsize,
}

impl MemoryManager {
    fn preload(
        &self,
        key: &str,
        content: &[u8],
        attributes: CacheEntryAttributes,
    ) {
        self.store.lock().unwrap().insert(
            key.to_owned(),
            (CacheEntry::new(content.to_vec()), attributes),
        );
    }

    fn content(&self, key: &str) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .get(key)
            .map(|(entry, _)| entry.content().to_vec())
    }

    fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl CacheManager for MemoryManager {
    fn get(
        &self,
        key: &str,
    ) -> Result<Option<(CacheEntry, CacheEntryAttributes)>> {
        Ok(self.store.lock().unwrap().get(key).cloned())
    }

    fn put(
        &self,
        key: &str,
        entry: CacheEntry,
        mut attributes: CacheEntryAttributes,
    ) -> Result<CacheEntryAttributes> {
        attributes.mark_created(unix_millis());
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.store
            .lock()
            .unwrap()
            .insert(key.to_owned(), (entry, attributes.clone()));
        Ok(attributes)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.store.lock().unwrap().remove(key);
        Ok(())
    }
}

type Exchange = std::result::Result<TransportResponse, TransportError>;

#[derive(Default)]
struct FakeTransport {
    script: Mutex<Vec<Exchange>>,
    requests: Mutex<Vec<TransportRequest>>,
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl FakeTransport {
    fn push(&self, exchange: Exchange) {
        self.script.lock().unwrap().push(exchange);
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Make exchanges wait for a message before answering, so a test can
    /// line up submissions while the worker sits inside the transport.
    /// Returns the release sender and a receiver signalled on entry.
    fn gate(&self) -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (release_tx, release_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
        (release_tx, entered_rx)
    }
}

impl Transport for FakeTransport {
    fn execute(&self, request: &TransportRequest) -> Exchange {
        if let Some((entered, release)) = &*self.gate.lock().unwrap() {
            entered.send(()).ok();
            release.recv_timeout(Duration::from_secs(5)).ok();
        }
        self.requests.lock().unwrap().push(request.clone());
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Err(TransportError::Other("unscripted exchange".into()))
        } else {
            script.remove(0)
        }
    }
}

fn response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Exchange {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
    }
    Ok(TransportResponse { status, headers: map, body: body.to_vec() })
}

type Notification = (Option<Vec<u8>>, Option<CacheEntryAttributes>, LoadResult);

struct ChannelListener(mpsc::Sender<Notification>);

impl LoadListener for ChannelListener {
    fn loading_finished(
        &self,
        entry: Option<&CacheEntry>,
        attributes: Option<&CacheEntryAttributes>,
        result: LoadResult,
    ) {
        self.0
            .send((
                entry.map(|entry| entry.content().to_vec()),
                attributes.cloned(),
                result,
            ))
            .ok();
    }
}

fn listener() -> (Arc<ChannelListener>, mpsc::Receiver<Notification>) {
    let (sender, receiver) = mpsc::channel();
    (Arc::new(ChannelListener(sender)), receiver)
}

fn await_notification(receiver: &mpsc::Receiver<Notification>) -> Notification {
    receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("job never fanned out")
}

#[derive(Debug)]
struct StaticSource(&'static str);

impl ArtifactSource for StaticSource {
    fn url(&self) -> Option<Url> {
        Url::parse(self.0).ok()
    }
}

#[derive(Debug)]
struct NoUrlSource;

impl ArtifactSource for NoUrlSource {
    fn url(&self) -> Option<Url> {
        None
    }
}

struct Fixture {
    manager: Arc<MemoryManager>,
    transport: Arc<FakeTransport>,
    cache: ArtifactCache,
    now: u64,
}

impl Fixture {
    fn new() -> Self {
        Self::with_pool(PoolOptions::default())
    }

    fn with_pool(pool: PoolOptions) -> Self {
        let manager = Arc::new(MemoryManager::default());
        let transport = Arc::new(FakeTransport::default());
        let options = FetchOptions {
            backoff_base: Duration::from_millis(5),
            ..Default::default()
        };
        let cache = ArtifactCache::with_options(
            manager.clone(),
            transport.clone(),
            options,
            pool,
        );
        Self { manager, transport, cache, now: unix_millis() }
    }

    fn fresh_attributes(&self) -> CacheEntryAttributes {
        CacheEntryAttributes {
            create_time: self.now - 1_000,
            last_modification: self.now - 1_000,
            expiration_time: self.now + 100_000,
            response_code: 200,
            ..Default::default()
        }
    }

    fn stale_attributes(&self, etag: Option<&str>) -> CacheEntryAttributes {
        CacheEntryAttributes {
            create_time: self.now - DEFAULT_EXPIRE - 60_000,
            last_modification: self.now - DEFAULT_EXPIRE - 60_000,
            expiration_time: 0,
            etag: etag.map(str::to_owned),
            response_code: 200,
            ..Default::default()
        }
    }
}

#[test]
fn fresh_cache_hit_makes_no_exchanges() {
    let fixture = Fixture::new();
    fixture.manager.preload(TILE_URL, b"hello", fixture.fresh_attributes());

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    job.submit(listener, false).unwrap();

    let (entry, _, result) = await_notification(&notifications);
    assert_eq!(result, LoadResult::Success);
    assert_eq!(entry.as_deref(), Some(&b"hello"[..]));
    assert_eq!(fixture.transport.calls(), 0);
}

#[test]
fn stale_entry_is_revalidated_with_304() {
    let fixture = Fixture::new();
    fixture.manager.preload(
        TILE_URL,
        b"hello",
        fixture.stale_attributes(Some("\"abc\"")),
    );
    fixture.transport.push(response(304, &[], b""));

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    job.submit(listener, false).unwrap();

    let (entry, _, result) = await_notification(&notifications);
    assert_eq!(result, LoadResult::Success);
    assert_eq!(entry.as_deref(), Some(&b"hello"[..]));
    // The cache was not rewritten, only revalidated.
    assert_eq!(fixture.manager.puts(), 0);
    let requests = fixture.transport.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("if-none-match") && value == "\"abc\""
    }));
}

#[test]
fn non_compliant_origin_is_learned() {
    let fixture = Fixture::new();
    fixture.manager.preload(
        TILE_URL,
        b"hello",
        fixture.stale_attributes(Some("\"abc\"")),
    );
    fixture.transport.push(response(200, &[("etag", "\"abc\"")], b"X"));

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    job.submit(listener, false).unwrap();

    let (entry, _, result) = await_notification(&notifications);
    assert_eq!(result, LoadResult::Success);
    assert_eq!(entry.as_deref(), Some(&b"X"[..]));
    assert_eq!(fixture.manager.content(TILE_URL).as_deref(), Some(&b"X"[..]));
    assert!(fixture
        .cache
        .context()
        .origins()
        .needs_head_probe("tiles.example.org"));
}

#[test]
fn concurrent_submissions_share_one_exchange() {
    let fixture = Fixture::new();
    let (release, _entered) = fixture.transport.gate();
    fixture.transport.push(response(200, &[], b"Y"));

    let (first, first_rx) = listener();
    let (second, second_rx) = listener();
    let (third, third_rx) = listener();
    let job = fixture.cache.job(StaticSource(TILE_URL));
    job.submit(first, false).unwrap();
    // Later submitters attach to the in-flight load, whether they share the
    // job object or not.
    fixture
        .cache
        .job(StaticSource(TILE_URL))
        .submit(second, false)
        .unwrap();
    fixture
        .cache
        .job(StaticSource(TILE_URL))
        .submit(third, false)
        .unwrap();
    release.send(()).unwrap();

    for notifications in [&first_rx, &second_rx, &third_rx] {
        let (entry, _, result) = await_notification(notifications);
        assert_eq!(result, LoadResult::Success);
        assert_eq!(entry.as_deref(), Some(&b"Y"[..]));
    }
    assert_eq!(fixture.transport.calls(), 1);
}

#[test]
fn transport_failure_serves_stale_with_error_attributes() {
    let fixture = Fixture::new();
    fixture.manager.preload(TILE_URL, b"old", fixture.stale_attributes(None));
    fixture
        .transport
        .push(Err(TransportError::Io("connection reset".into())));

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    job.submit(listener, false).unwrap();

    let (entry, attributes, result) = await_notification(&notifications);
    assert_eq!(result, LoadResult::Success);
    assert_eq!(entry.as_deref(), Some(&b"old"[..]));
    let attributes = attributes.expect("failure attributes");
    assert_eq!(attributes.response_code, 499);
    assert!(attributes
        .error_message
        .as_deref()
        .unwrap()
        .contains("connection reset"));
    // The stale entry itself was not clobbered.
    assert_eq!(
        fixture.manager.content(TILE_URL).as_deref(),
        Some(&b"old"[..])
    );
}

#[test]
fn persistent_unavailability_backs_off_then_fails() {
    let fixture = Fixture::new();
    for _ in 0..6 {
        fixture.transport.push(response(503, &[], b""));
    }

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    let started = Instant::now();
    job.submit(listener, false).unwrap();

    let (entry, attributes, result) = await_notification(&notifications);
    assert_eq!(result, LoadResult::Failure);
    assert!(entry.is_none());
    assert_eq!(attributes.unwrap().response_code, 503);
    assert_eq!(fixture.transport.calls(), 6);
    // Five sleeps of at least backoff_base each.
    assert!(started.elapsed() >= Duration::from_millis(25));
}

#[test]
fn persistent_unavailability_still_serves_stale() {
    let fixture = Fixture::new();
    fixture.manager.preload(TILE_URL, b"old", fixture.stale_attributes(None));
    for _ in 0..6 {
        fixture.transport.push(response(503, &[], b""));
    }

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    job.submit(listener, false).unwrap();

    let (entry, _, result) = await_notification(&notifications);
    assert_eq!(result, LoadResult::Success);
    assert_eq!(entry.as_deref(), Some(&b"old"[..]));
}

#[test]
fn force_bypasses_a_fresh_entry() {
    let fixture = Fixture::new();
    fixture.manager.preload(TILE_URL, b"hello", fixture.fresh_attributes());
    fixture.transport.push(response(200, &[], b"new"));

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    job.submit(listener, true).unwrap();

    let (entry, _, result) = await_notification(&notifications);
    assert_eq!(result, LoadResult::Success);
    assert_eq!(entry.as_deref(), Some(&b"new"[..]));
    let requests = fixture.transport.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].use_cache);
}

#[test]
fn each_submission_is_notified_exactly_once() {
    let fixture = Fixture::new();
    fixture.transport.push(response(200, &[], b"tile"));

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (listener, notifications) = listener();
    job.submit(listener, false).unwrap();

    await_notification(&notifications);
    assert!(notifications.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn missing_url_is_rejected_at_submission() {
    let fixture = Fixture::new();
    let job = fixture.cache.job(NoUrlSource);
    let (listener, _notifications) = listener();
    assert_eq!(
        job.submit(listener, false),
        Err(SubmitError::MissingUrl)
    );
    assert_eq!(fixture.transport.calls(), 0);
}

#[test]
fn queued_jobs_can_be_cancelled() {
    let fixture = Fixture::with_pool(PoolOptions {
        core_threads: 1,
        max_threads: 1,
        keep_alive: Duration::from_millis(50),
    });
    let (release, entered) = fixture.transport.gate();
    fixture.transport.push(response(200, &[], b"A"));

    let (running, running_rx) = listener();
    fixture
        .cache
        .job(StaticSource("http://tiles.example.org/a.png"))
        .submit(running, false)
        .unwrap();

    // Wait until the lone worker is inside the transport, so the next job
    // is guaranteed to queue behind it.
    entered
        .recv_timeout(Duration::from_secs(5))
        .expect("first job never reached the transport");

    let (queued, queued_rx) = listener();
    fixture
        .cache
        .job(StaticSource("http://tiles.example.org/b.png"))
        .submit(queued, false)
        .unwrap();

    assert_eq!(fixture.cache.cancel_outstanding_tasks(), 1);
    let (entry, attributes, result) = await_notification(&queued_rx);
    assert_eq!(result, LoadResult::Canceled);
    assert!(entry.is_none());
    assert!(attributes.is_none());

    // The running job is unaffected and completes normally.
    release.send(()).unwrap();
    let (entry, _, result) = await_notification(&running_rx);
    assert_eq!(result, LoadResult::Success);
    assert_eq!(entry.as_deref(), Some(&b"A"[..]));
}

#[test]
fn cache_only_lookup_never_schedules() {
    let fixture = Fixture::new();
    fixture.manager.preload(TILE_URL, b"hello", fixture.fresh_attributes());

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (entry, attributes) = job.get().expect("cached entry");
    assert_eq!(entry.content(), b"hello");
    assert_eq!(attributes.response_code, 200);
    assert_eq!(fixture.transport.calls(), 0);

    let empty = fixture
        .cache
        .job(StaticSource("http://tiles.example.org/none.png"));
    assert!(empty.get().is_none());
    assert_eq!(fixture.transport.calls(), 0);
}

#[test]
fn completion_hook_runs_after_fanout() {
    let fixture = Fixture::new();
    fixture.transport.push(response(200, &[], b"tile"));

    let job = fixture.cache.job(StaticSource(TILE_URL));
    let (hook_tx, hook_rx) = mpsc::channel();
    job.on_finished(move || {
        hook_tx.send(()).ok();
    });
    let (listener, notifications) = listener();
    job.submit(listener, false).unwrap();

    await_notification(&notifications);
    hook_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("completion hook never ran");
}
