//! Offline cache manager.
//!
//! Handles the two lifecycle events of the site's offline worker:
//! - `install`: skip waiting and take control right away
//! - `fetch`: stale-while-revalidate against the named store, seeding the
//!   precache manifest when the network is unreachable

mod event;
mod lifecycle;
mod manifest;
#[cfg(test)]
pub(crate) mod testing;

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheResult, CacheStorage, Caches, NamedCache};
use crate::net::{Fetcher, Request, Response};

pub use event::{FetchEvent, FetchOutcome, InstallEvent, Lifetime};
pub use lifecycle::{InstallHandler, Registration, WorkerState};
pub use manifest::{PrecacheManifest, DEFAULT_PRECACHE};

/// Store name used when none is configured.
pub const DEFAULT_CACHE_NAME: &str = "cache";

/// Whether a request is handled by the manager at all.
pub fn is_interceptable(url: &Url) -> bool {
  matches!(url.scheme(), "http" | "https")
}

/// Cache-first request handler with background revalidation.
pub struct OfflineCacheManager<S: CacheStorage, F: Fetcher> {
  caches: Caches<S>,
  fetcher: Arc<F>,
  manifest: Arc<PrecacheManifest>,
  cache_name: Arc<str>,
  /// Site the manifest paths resolve against; no reseed when unset
  origin: Option<Url>,
}

impl<S: CacheStorage, F: Fetcher> OfflineCacheManager<S, F> {
  pub fn new(caches: Caches<S>, fetcher: F) -> Self {
    Self {
      caches,
      fetcher: Arc::new(fetcher),
      manifest: Arc::new(PrecacheManifest::default()),
      cache_name: Arc::from(DEFAULT_CACHE_NAME),
      origin: None,
    }
  }

  pub fn with_manifest(mut self, manifest: PrecacheManifest) -> Self {
    self.manifest = Arc::new(manifest);
    self
  }

  pub fn with_cache_name(mut self, name: &str) -> Self {
    self.cache_name = Arc::from(name);
    self
  }

  pub fn with_origin(mut self, origin: Option<Url>) -> Self {
    self.origin = origin;
    self
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn manifest(&self) -> &PrecacheManifest {
    &self.manifest
  }

  pub fn caches(&self) -> &Caches<S> {
    &self.caches
  }

  /// Open the manager's named store.
  pub fn cache(&self) -> Result<NamedCache<S>> {
    self.caches.open(&self.cache_name)
  }

  /// Handle a fetch event. Requests outside http(s) are left alone.
  pub fn on_fetch(&self, event: &mut FetchEvent) -> Result<()> {
    if !is_interceptable(&event.request().url) {
      debug!(url = %event.request().url, "Not intercepting non-http request");
      return Ok(());
    }

    let this = self.clone();
    let request = event.request().clone();
    let lifetime = event.lifetime();
    event.respond_with(async move { this.respond(request, lifetime).await })
  }

  /// Create a fetch event for `request` and run it through `on_fetch`.
  pub fn dispatch_fetch(&self, request: Request) -> Result<FetchEvent> {
    let mut event = FetchEvent::new(request);
    self.on_fetch(&mut event)?;
    Ok(event)
  }

  /// Fetch the whole precache manifest and store it. All-or-nothing.
  pub async fn precache(&self, base: &Url) -> Result<usize> {
    let requests = self.manifest.resolve(base)?;
    let cache = self.cache()?;
    cache.add_all(self.fetcher.as_ref(), &requests).await?;
    info!(count = requests.len(), cache = %self.cache_name, "Precached manifest");
    Ok(requests.len())
  }

  async fn respond(self, request: Request, lifetime: Lifetime) -> Result<CacheResult<Response>> {
    let cache = self.cache()?;

    let cached = match cache.match_request(&request) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, "Cache lookup failed, treating as miss: {}", e);
        None
      }
    };

    let network = tokio::spawn(
      self
        .clone()
        .revalidate(cache, request.clone(), lifetime.clone()),
    );

    match cached {
      Some(hit) => {
        debug!(url = %request.url, "Serving from cache");
        let url = request.url.clone();
        lifetime.wait_until(async move {
          if let Err(e) = network.await {
            warn!(url = %url, "Revalidation task failed: {}", e);
          }
        });
        let cached_at = hit.cached_at;
        Ok(CacheResult::from_cache(hit.into_response(), cached_at))
      }
      None => {
        let response = network
          .await
          .map_err(|e| eyre!("Network task for {} failed: {}", request.url, e))??;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  /// Live fetch. Success refreshes the store in the background. Failure is
  /// passed on, after starting a background precache seed of the site origin
  /// when one is configured.
  async fn revalidate(
    self,
    cache: NamedCache<S>,
    request: Request,
    lifetime: Lifetime,
  ) -> Result<Response> {
    let result = self.fetcher.fetch(&request).await;
    match result {
      Ok(response) => {
        let copy = response.clone();
        lifetime.wait_until(async move {
          match cache.put(&request, &copy) {
            Ok(()) => debug!(url = %request.url, status = copy.status, "Cache updated"),
            Err(e) => debug!(url = %request.url, "Cache update skipped: {}", e),
          }
        });
        Ok(response)
      }
      Err(e) => {
        warn!(url = %request.url, "Error in fetch(): {}", e);
        match self.origin.clone() {
          Some(base) => {
            let this = self.clone();
            lifetime.wait_until(async move {
              if let Err(e) = this.precache(&base).await {
                warn!("Precache after fetch failure did not complete: {}", e);
              }
            });
          }
          None => warn!(url = %request.url, "No site origin configured, skipping precache"),
        }
        Err(e)
      }
    }
  }
}

impl<S: CacheStorage, F: Fetcher> InstallHandler for OfflineCacheManager<S, F> {
  fn on_install(&self, event: &InstallEvent) {
    event.skip_waiting();
    info!("Latest version installed!");
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for OfflineCacheManager<S, F> {
  fn clone(&self) -> Self {
    Self {
      caches: self.caches.clone(),
      fetcher: Arc::clone(&self.fetcher),
      manifest: Arc::clone(&self.manifest),
      cache_name: Arc::clone(&self.cache_name),
      origin: self.origin.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::testing::ScriptedFetcher;
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage, RequestKey, SqliteStorage};
  use std::time::Duration;

  const HOME: &str = "https://example.org/";

  fn manager(fetcher: &Arc<ScriptedFetcher>) -> OfflineCacheManager<MemoryStorage, Arc<ScriptedFetcher>> {
    OfflineCacheManager::new(Caches::new(MemoryStorage::new()), Arc::clone(fetcher))
  }

  fn page(url: &str, body: &str) -> Response {
    Response {
      status: 200,
      status_text: "OK".into(),
      url: url.into(),
      headers: Vec::new(),
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_interceptable_schemes() {
    assert!(is_interceptable(&Url::parse("http://example.org/").unwrap()));
    assert!(is_interceptable(&Url::parse("https://example.org/").unwrap()));
    assert!(!is_interceptable(&Url::parse("data:text/plain,hi").unwrap()));
    assert!(!is_interceptable(&Url::parse("chrome-extension://abc/x.js").unwrap()));
    assert!(!is_interceptable(&Url::parse("httpx://example.org/").unwrap()));
  }

  #[tokio::test]
  async fn test_non_http_request_passes_through() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager(&fetcher);

    let mut event = manager
      .dispatch_fetch(Request::get("data:text/plain,hello").unwrap())
      .unwrap();

    assert!(!event.is_intercepted());
    assert!(event.response().await.is_none());
    event.settled().await;
    assert!(fetcher.calls().is_empty());
    assert!(manager.caches.names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cache_hit_does_not_wait_for_network() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager(&fetcher);
    let request = Request::get(HOME).unwrap();
    manager.cache().unwrap().put(&request, &page(HOME, "cached")).unwrap();

    let release = fetcher.hold(HOME);
    let mut event = manager.dispatch_fetch(request.clone()).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(1), event.response())
      .await
      .expect("cache hit waited on the network")
      .unwrap()
      .unwrap();
    assert_eq!(outcome.source, CacheSource::Cache);
    assert_eq!(outcome.data.body, b"cached".to_vec());

    // Revalidation lands after the network answers
    release.notify_one();
    event.settled().await;
    let stored = manager.cache().unwrap().match_request(&request).unwrap().unwrap();
    assert_eq!(stored.body, format!("{HOME} #1").into_bytes());
  }

  #[tokio::test]
  async fn test_miss_returns_network_response_and_stores_copy() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager(&fetcher);
    let request = Request::get("https://example.org/about").unwrap();

    let mut event = manager.dispatch_fetch(request.clone()).unwrap();
    let outcome = event.response().await.unwrap().unwrap();
    event.settled().await;

    assert_eq!(outcome.source, CacheSource::Network);
    assert_eq!(outcome.data.body, b"https://example.org/about #1".to_vec());

    let stored = manager.cache().unwrap().match_request(&request).unwrap().unwrap();
    assert_eq!(stored.into_response(), outcome.data);
  }

  #[tokio::test]
  async fn test_repeated_fetch_keeps_one_entry() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager(&fetcher);
    let request = Request::get("https://example.org/about").unwrap();

    for _ in 0..2 {
      let mut event = manager.dispatch_fetch(request.clone()).unwrap();
      event.response().await.unwrap().unwrap();
      event.settled().await;
    }

    let keys = manager.cache().unwrap().keys().unwrap();
    assert_eq!(keys, vec![RequestKey::from_request(&request)]);
    let stored = manager.cache().unwrap().match_request(&request).unwrap().unwrap();
    assert_eq!(stored.body, b"https://example.org/about #2".to_vec());
  }

  #[tokio::test]
  async fn test_miss_with_network_failure_seeds_manifest() {
    let fetcher = Arc::new(ScriptedFetcher::new().failing("https://example.org/about"));
    let manager = manager(&fetcher).with_origin(Some(Url::parse(HOME).unwrap()));

    let mut event = manager
      .dispatch_fetch(Request::get("https://example.org/about").unwrap())
      .unwrap();
    let outcome = event.response().await.unwrap();
    assert!(outcome.is_err());

    event.settled().await;
    let urls: Vec<String> = manager
      .cache()
      .unwrap()
      .keys()
      .unwrap()
      .into_iter()
      .map(|k| k.url)
      .collect();
    assert_eq!(urls.len(), DEFAULT_PRECACHE.len());
    for path in DEFAULT_PRECACHE {
      let expected = Url::parse(HOME).unwrap().join(path).unwrap().to_string();
      assert!(urls.contains(&expected), "missing {expected}");
    }
  }

  #[tokio::test]
  async fn test_hit_with_network_failure_still_serves_cache() {
    let fetcher = Arc::new(ScriptedFetcher::new().failing(HOME));
    let manager = manager(&fetcher).with_origin(Some(Url::parse("https://site.test/").unwrap()));
    let request = Request::get(HOME).unwrap();
    manager.cache().unwrap().put(&request, &page(HOME, "cached")).unwrap();

    let mut event = manager.dispatch_fetch(request.clone()).unwrap();
    let outcome = event.response().await.unwrap().unwrap();
    event.settled().await;

    assert_eq!(outcome.source, CacheSource::Cache);
    assert_eq!(outcome.data.body, b"cached".to_vec());
    // Manifest resolved against the configured origin
    assert!(fetcher
      .calls()
      .contains(&"https://site.test/assets/css/main.css".to_string()));
    assert_eq!(manager.cache().unwrap().keys().unwrap().len(), 1 + DEFAULT_PRECACHE.len());
  }

  #[tokio::test]
  async fn test_cross_origin_failure_seeds_site_origin() {
    let fetcher = Arc::new(ScriptedFetcher::new().failing("https://cdn.other.net/lib.js"));
    let manager = manager(&fetcher).with_origin(Some(Url::parse(HOME).unwrap()));

    let mut event = manager
      .dispatch_fetch(Request::get("https://cdn.other.net/lib.js").unwrap())
      .unwrap();
    assert!(event.response().await.unwrap().is_err());
    event.settled().await;

    let foreign: Vec<String> = fetcher
      .calls()
      .into_iter()
      .filter(|url| url.starts_with("https://cdn.other.net/"))
      .collect();
    assert_eq!(foreign, vec!["https://cdn.other.net/lib.js".to_string()]);
    assert_eq!(manager.cache().unwrap().keys().unwrap().len(), DEFAULT_PRECACHE.len());
  }

  #[tokio::test]
  async fn test_failure_without_origin_skips_seed() {
    let fetcher = Arc::new(ScriptedFetcher::new().failing("https://cdn.other.net/lib.js"));
    let manager = manager(&fetcher);

    let mut event = manager
      .dispatch_fetch(Request::get("https://cdn.other.net/lib.js").unwrap())
      .unwrap();
    assert!(event.response().await.unwrap().is_err());
    event.settled().await;

    assert_eq!(fetcher.calls(), vec!["https://cdn.other.net/lib.js".to_string()]);
    assert!(manager.cache().unwrap().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_fetches_keep_one_entry_per_identity() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = OfflineCacheManager::new(
      Caches::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::clone(&fetcher),
    );
    let urls = [
      "https://example.org/",
      "https://example.org/about",
      "https://example.org/assets/css/main.css",
    ];

    let mut events = Vec::new();
    for _ in 0..10 {
      for url in &urls {
        events.push(manager.dispatch_fetch(Request::get(url).unwrap()).unwrap());
      }
    }
    for event in &mut events {
      assert!(event.response().await.unwrap().is_ok());
    }
    for event in &events {
      event.settled().await;
    }

    let cache = manager.cache().unwrap();
    let mut keys: Vec<String> = cache.keys().unwrap().into_iter().map(|k| k.url).collect();
    keys.sort();
    let mut expected: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
    expected.sort();
    assert_eq!(keys, expected);
    assert_eq!(fetcher.calls().len(), 30);
  }

  struct PanickingFetcher;

  impl Fetcher for PanickingFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      panic!("fetcher crashed on {}", request.url)
    }
  }

  #[tokio::test]
  async fn test_hit_survives_crashed_revalidation() {
    let manager = OfflineCacheManager::new(Caches::new(MemoryStorage::new()), PanickingFetcher);
    let request = Request::get(HOME).unwrap();
    manager.cache().unwrap().put(&request, &page(HOME, "cached")).unwrap();

    let mut event = manager.dispatch_fetch(request.clone()).unwrap();
    let outcome = event.response().await.unwrap().unwrap();
    event.settled().await;

    assert_eq!(outcome.source, CacheSource::Cache);
    let stored = manager.cache().unwrap().match_request(&request).unwrap().unwrap();
    assert_eq!(stored.body, b"cached".to_vec());
  }

  #[tokio::test]
  async fn test_seed_failure_is_not_surfaced() {
    let fetcher = Arc::new(ScriptedFetcher::new().offline());
    let manager = manager(&fetcher).with_origin(Some(Url::parse(HOME).unwrap()));

    let mut event = manager.dispatch_fetch(Request::get(HOME).unwrap()).unwrap();
    assert!(event.response().await.unwrap().is_err());
    event.settled().await;

    assert!(manager.cache().unwrap().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_non_get_is_served_but_not_stored() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager(&fetcher);
    let request = Request::new(reqwest::Method::POST, Url::parse(HOME).unwrap());

    let mut event = manager.dispatch_fetch(request).unwrap();
    let outcome = event.response().await.unwrap().unwrap();
    event.settled().await;

    assert_eq!(outcome.source, CacheSource::Network);
    assert!(manager.cache().unwrap().keys().unwrap().is_empty());
  }

  #[test]
  fn test_install_forces_activation() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let mut registration = Registration::new();
    registration.install("previous", &manager(&fetcher));
    registration.open_client();

    let state = registration.install("latest", &manager(&fetcher));

    assert_eq!(state, WorkerState::Activated);
    assert_eq!(registration.active().map(|v| v.label.as_str()), Some("latest"));
    assert!(registration.waiting().is_none());
  }

  #[tokio::test]
  async fn test_custom_cache_name_and_manifest() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager(&fetcher)
      .with_cache_name("site-v2")
      .with_manifest(PrecacheManifest::new(vec!["/".into(), "/about".into()]));

    let count = manager.precache(&Url::parse(HOME).unwrap()).await.unwrap();

    assert_eq!(count, 2);
    assert_eq!(manager.cache_name(), "site-v2");
    assert_eq!(manager.caches.names().unwrap(), vec!["site-v2".to_string()]);
  }
}
