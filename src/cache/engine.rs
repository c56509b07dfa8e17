//! Strategy engine: decides per request whether to answer from the entry
//! store, the network, or both.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use super::key::CacheKey;
use super::traits::{CacheVersion, Entry, EntryStore};
use crate::error::{Error, Result};
use crate::http::{Request, Response, ResponseSource, Strategy};
use crate::network::Fetcher;

type Populate = Shared<BoxFuture<'static, Result<Response>>>;

/// Tuning for the strategy engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Upper bound on a foreground network call
  pub network_timeout: Duration,
  /// Request headers that split cache keys
  pub vary_headers: Vec<String>,
  /// Cached page served to HTML navigations that cannot be answered
  pub offline_page: Option<Url>,
  /// At most one concurrent network populate per key
  pub dedupe_inflight: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      network_timeout: Duration::from_secs(10),
      vary_headers: Vec::new(),
      offline_page: None,
      dedupe_inflight: true,
    }
  }
}

/// Strategy engine over an entry store and a network fetcher.
///
/// Every public method resolves to a `Response`; failures become fallback
/// responses and never escape.
pub struct StrategyEngine<S: EntryStore> {
  store: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  version: watch::Receiver<Option<CacheVersion>>,
  config: Arc<EngineConfig>,
  inflight: Arc<Mutex<HashMap<String, Populate>>>,
}

impl<S: EntryStore + 'static> StrategyEngine<S> {
  /// Create an engine that stores under whichever version `version` reports as active.
  pub fn new(
    store: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    version: watch::Receiver<Option<CacheVersion>>,
    config: EngineConfig,
  ) -> Self {
    Self {
      store,
      fetcher,
      version,
      config: Arc::new(config),
      inflight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Dispatch a request to the strategy chosen by the caller's router.
  pub async fn handle(&self, req: &Request, strategy: Strategy) -> Response {
    if !req.is_cacheable() {
      debug!(method = %req.method, url = %req.url, "bypassing cache for non-GET request");
      return match self.fetch_with_timeout(req).await {
        Ok(resp) => resp,
        Err(e) => Response::no_content(&req.url, &e),
      };
    }

    debug!(url = %req.url, %strategy, "handling request");
    match strategy {
      Strategy::CacheFirst => self.cache_first(req).await,
      Strategy::NetworkFirst => self.network_first(req).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(req).await,
    }
  }

  /// Serve from cache when present and refresh in the background; otherwise
  /// go to the network and fall back to an offline response.
  pub async fn cache_first(&self, req: &Request) -> Response {
    let key = self.key(req);
    let version = self.active_version();

    if let Some(entry) = self.lookup(version.as_ref(), &key) {
      self.spawn_refresh(req, &key);
      return entry.to_response();
    }

    match self.populate(req, &key).await {
      Ok(resp) => resp,
      Err(e) => {
        warn!(url = %req.url, error = %e, "cache miss and network failed, serving offline fallback");
        self.offline_fallback(req, version.as_ref())
      }
    }
  }

  /// Prefer the network; fall back to cache on failure.
  pub async fn network_first(&self, req: &Request) -> Response {
    let key = self.key(req);
    let version = self.active_version();

    let failure = match self.fetch_with_timeout(req).await {
      Ok(resp) if resp.is_success() => {
        self.store_response(version.as_ref(), &key, &resp);
        return resp;
      }
      Ok(resp) => {
        // Error status: prefer a cached copy, otherwise pass it through.
        if let Some(entry) = self.lookup(version.as_ref(), &key) {
          debug!(url = %req.url, status = resp.status, "remote rejected, serving cached copy");
          return entry.to_response();
        }
        return resp;
      }
      Err(e) => e,
    };

    match self.lookup(version.as_ref(), &key) {
      Some(entry) => {
        debug!(url = %req.url, error = %failure, "network failed, serving cached copy");
        entry.to_response()
      }
      None => {
        warn!(url = %req.url, error = %failure, "no content available from network or cache");
        Response::no_content(&req.url, &failure)
      }
    }
  }

  /// Answer from cache immediately when possible while a single network
  /// fetch refreshes the entry.
  pub async fn stale_while_revalidate(&self, req: &Request) -> Response {
    let key = self.key(req);
    let version = self.active_version();

    if let Some(entry) = self.lookup(version.as_ref(), &key) {
      self.spawn_refresh(req, &key);
      return entry.to_response();
    }

    // Nothing cached: the one fetch both populates the store and answers.
    match self.populate(req, &key).await {
      Ok(resp) => resp,
      Err(e) => {
        warn!(url = %req.url, error = %e, "nothing cached and network failed");
        Response::no_content(&req.url, &e)
      }
    }
  }

  /// Compute the cache key for a request.
  pub fn key(&self, req: &Request) -> CacheKey {
    CacheKey::from_request(req, &self.config.vary_headers)
  }

  fn active_version(&self) -> Option<CacheVersion> {
    self.version.borrow().clone()
  }

  /// Read-side storage failures are treated as a miss.
  fn lookup(&self, version: Option<&CacheVersion>, key: &CacheKey) -> Option<Entry> {
    let version = version?;
    match self.store.get(version, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "entry store read failed, treating as miss");
        None
      }
    }
  }

  async fn fetch_with_timeout(&self, req: &Request) -> Result<Response> {
    let timeout = self.config.network_timeout;
    match tokio::time::timeout(timeout, self.fetcher.fetch(req)).await {
      Ok(result) => result.map(|resp| resp.with_source(ResponseSource::Network)),
      Err(_) => Err(Error::Timeout(timeout)),
    }
  }

  /// Persist a successful response. Failures are logged and swallowed.
  fn store_response(&self, version: Option<&CacheVersion>, key: &CacheKey, resp: &Response) {
    if !resp.is_success() {
      debug!(key = %key, status = resp.status, "not caching error response");
      return;
    }
    let Some(version) = version else {
      debug!(key = %key, "no active cache version, response not stored");
      return;
    };
    if let Err(e) = self.store.put(version, &Entry::from_response(key.clone(), resp)) {
      warn!(key = %key, %version, error = %e, "failed to store response");
    }
  }

  /// Fetch and store, sharing one in-flight fetch per key when enabled.
  fn populate(&self, req: &Request, key: &CacheKey) -> BoxFuture<'static, Result<Response>> {
    let engine = self.clone();
    let req = req.clone();
    let store_key = key.clone();
    let version = self.active_version();

    let task = async move {
      let result = engine.fetch_with_timeout(&req).await;
      if let Ok(resp) = &result {
        engine.store_response(version.as_ref(), &store_key, resp);
      }
      result
    };

    if !self.config.dedupe_inflight {
      return task.boxed();
    }

    let fingerprint = key.fingerprint().to_string();
    let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = inflight.get(&fingerprint) {
      debug!(key = %key, "joining in-flight fetch");
      return existing.clone().boxed();
    }

    let registry = Arc::clone(&self.inflight);
    let slot = fingerprint.clone();
    let shared = async move {
      let result = task.await;
      registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&slot);
      result
    }
    .boxed()
    .shared();

    inflight.insert(fingerprint, shared.clone());
    shared.boxed()
  }

  /// Detached refresh: never joined, its outcome only touches the store.
  fn spawn_refresh(&self, req: &Request, key: &CacheKey) {
    let refresh = self.populate(req, key);
    let url = req.url.clone();

    tokio::spawn(async move {
      match refresh.await {
        Ok(resp) if resp.is_success() => debug!(%url, "background refresh stored"),
        Ok(resp) => debug!(%url, status = resp.status, "background refresh got error status"),
        Err(e) if e.is_network() => debug!(%url, error = %e, "background refresh could not reach the network"),
        Err(e) => warn!(%url, error = %e, "background refresh failed"),
      }
    });
  }

  fn offline_fallback(&self, req: &Request, version: Option<&CacheVersion>) -> Response {
    if !req.accepts_html() {
      return Response::offline_error(&req.url);
    }

    if let Some(page) = &self.config.offline_page {
      let page_key = CacheKey::new("GET", page, Vec::new());
      if let Some(entry) = self.lookup(version, &page_key) {
        return entry.to_response().with_source(ResponseSource::Fallback);
      }
    }
    Response::offline_page()
  }
}

impl<S: EntryStore> Clone for StrategyEngine<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      fetcher: Arc::clone(&self.fetcher),
      version: self.version.clone(),
      config: Arc::clone(&self.config),
      inflight: Arc::clone(&self.inflight),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::http::{FALLBACK_HEADER, STATUS_UNAVAILABLE};
  use crate::testing::FakeFetcher;

  const HOME: &str = "https://app.example/";
  const API: &str = "https://app.example/api/items";

  struct Harness {
    engine: StrategyEngine<SqliteStorage>,
    store: Arc<SqliteStorage>,
    fetcher: Arc<FakeFetcher>,
    version: CacheVersion,
    _tx: watch::Sender<Option<CacheVersion>>,
  }

  fn harness(config: EngineConfig) -> Harness {
    let store = Arc::new(SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())));
    let fetcher = FakeFetcher::new();
    let version = CacheVersion::from("v1");
    let (tx, rx) = watch::channel(Some(version.clone()));
    let engine = StrategyEngine::new(store.clone(), fetcher.clone(), rx, config);
    Harness {
      engine,
      store,
      fetcher,
      version,
      _tx: tx,
    }
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  impl Harness {
    fn seed(&self, url: &str, body: &str) {
      let req = get(url);
      let key = self.engine.key(&req);
      let resp = Response::new(200, vec![], body.as_bytes().to_vec());
      self
        .store
        .put(&self.version, &Entry::from_response(key, &resp))
        .unwrap();
    }

    fn stored_body(&self, url: &str) -> Option<Vec<u8>> {
      let key = self.engine.key(&get(url));
      self.store.get(&self.version, &key).unwrap().map(|e| e.body)
    }

    async fn wait_for_body(&self, url: &str, body: &str) {
      for _ in 0..100 {
        if self.stored_body(url).as_deref() == Some(body.as_bytes()) {
          return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
      panic!("store never reflected {:?} for {}", body, url);
    }
  }

  #[tokio::test]
  async fn test_cache_first_hit_does_not_wait_for_network() {
    let h = harness(EngineConfig::default());
    h.seed(HOME, "cached");
    h.fetcher.respond(HOME, 200, "fresh");
    let gate = h.fetcher.close_gate();

    let resp = tokio::time::timeout(Duration::from_millis(200), h.engine.cache_first(&get(HOME)))
      .await
      .expect("cache hit must not wait on the network");

    assert_eq!(resp.body, b"cached");
    assert_eq!(resp.source, ResponseSource::Cache);

    gate.add_permits(1);
    h.wait_for_body(HOME, "fresh").await;
  }

  #[tokio::test]
  async fn test_cache_first_background_failure_keeps_entry() {
    let h = harness(EngineConfig::default());
    h.seed(HOME, "cached");
    h.fetcher.fail(HOME);

    let resp = h.engine.cache_first(&get(HOME)).await;
    assert_eq!(resp.body, b"cached");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.stored_body(HOME).as_deref(), Some(&b"cached"[..]));
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let h = harness(EngineConfig::default());
    h.fetcher.respond(HOME, 200, "fresh");

    let resp = h.engine.cache_first(&get(HOME)).await;

    assert_eq!(resp.body, b"fresh");
    assert_eq!(resp.source, ResponseSource::Network);
    assert_eq!(h.stored_body(HOME).as_deref(), Some(&b"fresh"[..]));
  }

  #[tokio::test]
  async fn test_error_status_is_passed_through_but_not_cached() {
    let h = harness(EngineConfig::default());
    h.fetcher.respond(API, 500, "boom");

    let resp = h.engine.cache_first(&get(API)).await;

    assert_eq!(resp.status, 500);
    assert!(h.stored_body(API).is_none());
  }

  #[tokio::test]
  async fn test_cache_first_offline_fallbacks_by_content_type() {
    let h = harness(EngineConfig::default());

    let page = h
      .engine
      .cache_first(&get(HOME).with_header("Accept", "text/html,application/xhtml+xml"))
      .await;
    assert_eq!(page.status, STATUS_UNAVAILABLE);
    assert_eq!(page.header(FALLBACK_HEADER), Some("offline-page"));

    let generic = h.engine.cache_first(&get(API)).await;
    assert_eq!(generic.status, STATUS_UNAVAILABLE);
    assert_eq!(generic.header(FALLBACK_HEADER), Some("offline"));
  }

  #[tokio::test]
  async fn test_cache_first_serves_cached_offline_page() {
    let offline = "https://app.example/offline.html";
    let h = harness(EngineConfig {
      offline_page: Some(Url::parse(offline).unwrap()),
      ..EngineConfig::default()
    });
    h.seed(offline, "<p>saved offline page</p>");

    let resp = h
      .engine
      .cache_first(&get("https://app.example/settings").with_header("accept", "text/html"))
      .await;

    assert_eq!(resp.body, b"<p>saved offline page</p>");
    assert_eq!(resp.source, ResponseSource::Fallback);
  }

  #[tokio::test]
  async fn test_network_first_prefers_network_over_stale_entry() {
    let h = harness(EngineConfig::default());
    h.seed(API, "stale");
    h.fetcher.respond(API, 200, "fresh");

    let resp = h.engine.network_first(&get(API)).await;

    assert_eq!(resp.body, b"fresh");
    assert_eq!(h.stored_body(API).as_deref(), Some(&b"fresh"[..]));
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let h = harness(EngineConfig::default());
    h.seed(API, "stale");
    h.fetcher.fail(API);

    let resp = h.engine.network_first(&get(API)).await;

    assert_eq!(resp.body, b"stale");
    assert_eq!(resp.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_network_first_server_error_prefers_cache() {
    let h = harness(EngineConfig::default());
    h.seed(API, "stale");
    h.fetcher.respond(API, 503, "maintenance");

    let resp = h.engine.network_first(&get(API)).await;
    assert_eq!(resp.body, b"stale");
  }

  #[tokio::test]
  async fn test_network_first_timeout_without_cache_is_no_content() {
    let h = harness(EngineConfig {
      network_timeout: Duration::from_millis(50),
      ..EngineConfig::default()
    });
    h.fetcher.hang(API);

    let resp = h.engine.network_first(&get(API)).await;

    assert_eq!(resp.status, STATUS_UNAVAILABLE);
    assert_eq!(resp.header(FALLBACK_HEADER), Some("no-content-available"));
    assert!(String::from_utf8_lossy(&resp.body).contains("timed out after 50ms"));
  }

  #[tokio::test]
  async fn test_swr_returns_cached_then_refreshes_store() {
    let h = harness(EngineConfig::default());
    h.seed(API, "old");
    h.fetcher.respond(API, 200, "new");
    let gate = h.fetcher.close_gate();

    let resp = tokio::time::timeout(
      Duration::from_millis(200),
      h.engine.stale_while_revalidate(&get(API)),
    )
    .await
    .expect("cached entry must be returned without waiting");
    assert_eq!(resp.body, b"old");

    // Refresh is still held at the gate, so the store is unchanged.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.stored_body(API).as_deref(), Some(&b"old"[..]));

    gate.add_permits(1);
    h.wait_for_body(API, "new").await;
  }

  #[tokio::test]
  async fn test_swr_miss_uses_a_single_fetch() {
    let h = harness(EngineConfig::default());
    h.fetcher.respond(API, 200, "first");

    let resp = h.engine.stale_while_revalidate(&get(API)).await;

    assert_eq!(resp.body, b"first");
    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.stored_body(API).as_deref(), Some(&b"first"[..]));
  }

  #[tokio::test]
  async fn test_swr_miss_offline_is_no_content() {
    let h = harness(EngineConfig::default());

    let resp = h.engine.stale_while_revalidate(&get(API)).await;
    assert_eq!(resp.header(FALLBACK_HEADER), Some("no-content-available"));
  }

  #[tokio::test]
  async fn test_concurrent_misses_share_one_fetch() {
    let h = harness(EngineConfig::default());
    h.fetcher.respond(HOME, 200, "shared");
    let gate = h.fetcher.close_gate();

    let release = async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      gate.add_permits(10);
    };
    let req = get(HOME);
    let (a, b, _) = tokio::join!(h.engine.cache_first(&req), h.engine.cache_first(&req), release);

    assert_eq!(a.body, b"shared");
    assert_eq!(b.body, b"shared");
    assert_eq!(h.fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_misses_without_dedupe_last_writer_wins() {
    let h = harness(EngineConfig {
      dedupe_inflight: false,
      ..EngineConfig::default()
    });
    h.fetcher.respond(HOME, 200, "either");
    let gate = h.fetcher.close_gate();

    let release = async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      gate.add_permits(10);
    };
    let req = get(HOME);
    let (a, b, _) = tokio::join!(h.engine.cache_first(&req), h.engine.cache_first(&req), release);

    assert_eq!(a.body, b"either");
    assert_eq!(b.body, b"either");
    assert_eq!(h.fetcher.calls(), 2);
    assert_eq!(h.store.count(&h.version).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_non_get_requests_bypass_cache() {
    let h = harness(EngineConfig::default());
    h.fetcher.respond(API, 201, "created");

    let req = Request::new("POST", Url::parse(API).unwrap());
    let resp = h.engine.handle(&req, Strategy::CacheFirst).await;

    assert_eq!(resp.status, 201);
    assert!(h.stored_body(API).is_none());
  }

  #[tokio::test]
  async fn test_head_request_never_replaces_get_entry() {
    let h = harness(EngineConfig::default());
    h.seed(HOME, "full page");
    h.fetcher.respond(HOME, 200, "");

    let head = Request::new("HEAD", Url::parse(HOME).unwrap());
    for strategy in [Strategy::NetworkFirst, Strategy::CacheFirst, Strategy::StaleWhileRevalidate] {
      let resp = h.engine.handle(&head, strategy).await;
      assert_eq!(resp.source, ResponseSource::Network);
    }

    let resp = h.engine.handle(&get(HOME), Strategy::CacheFirst).await;
    assert_eq!(resp.source, ResponseSource::Cache);
    assert_eq!(resp.body, b"full page");
    assert_eq!(h.store.count(&h.version).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_nothing_is_stored_without_active_version() {
    let store = Arc::new(SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())));
    let fetcher = FakeFetcher::new();
    fetcher.respond(HOME, 200, "fresh");
    let (_tx, rx) = watch::channel(None);
    let engine = StrategyEngine::new(store.clone(), fetcher, rx, EngineConfig::default());

    let resp = engine.cache_first(&get(HOME)).await;

    assert_eq!(resp.body, b"fresh");
    assert!(store.list_versions().unwrap().is_empty());
  }
}
