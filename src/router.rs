//! Request classification and the per-class caching strategies.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStore, CachedResponse, Generation, RequestKey, Served};
use crate::net::{Destination, Network, Request, Response};

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Data endpoints: network first, cache as offline fallback
  Api,
  /// Navigations: cache first, revalidated in the background
  Page,
  /// Styles, scripts and images: cache first, filled on miss
  StaticAsset,
  /// Everything else goes straight to the network
  Other,
}

/// Classifies requests by URL pattern, then by declared destination.
#[derive(Debug, Clone)]
pub struct Classifier {
  api_patterns: Vec<String>,
}

impl Classifier {
  pub fn new(api_patterns: Vec<String>) -> Self {
    Self { api_patterns }
  }

  /// API patterns win over destination, so a document request to an API URL
  /// is `Api`. Non-HTTP schemes are never cached.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if !matches!(request.url.scheme(), "http" | "https") {
      return RequestClass::Other;
    }

    let path = request.url.path();
    if path.starts_with("/api/") || self.api_patterns.iter().any(|p| path.contains(p.as_str())) {
      return RequestClass::Api;
    }

    match request.destination {
      Destination::Document => RequestClass::Page,
      Destination::Style | Destination::Script | Destination::Image => RequestClass::StaticAsset,
      Destination::Empty => RequestClass::Other,
    }
  }
}

/// Routes requests through the cache stores of one generation.
pub struct Router<N: Network> {
  storage: Arc<dyn CacheStore>,
  network: Arc<N>,
  generation: Generation,
  classifier: Classifier,
  default_page: Url,
  /// Page revalidations still in flight, shared by every clone
  background: Arc<Mutex<JoinSet<()>>>,
}

impl<N: Network> Router<N> {
  pub fn new(
    storage: Arc<dyn CacheStore>,
    network: Arc<N>,
    generation: Generation,
    classifier: Classifier,
    default_page: Url,
  ) -> Self {
    Self {
      storage,
      network,
      generation,
      classifier,
      default_page,
      background: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Same router, serving another generation's stores.
  pub fn for_generation(&self, generation: Generation) -> Self {
    Self {
      generation,
      ..self.clone()
    }
  }

  /// Wait for every background revalidation started so far, including
  /// ones spawned while waiting. Hosts call this before shutting down the
  /// runtime so refreshed pages are not lost.
  pub async fn settle(&self) {
    loop {
      let mut pending = self.take_background();
      if pending.is_empty() {
        break;
      }
      while let Some(result) = pending.join_next().await {
        if let Err(e) = result {
          warn!(error = %e, "Background revalidation did not finish");
        }
      }
    }
  }

  fn take_background(&self) -> JoinSet<()> {
    let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut *background)
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    self.classifier.classify(request)
  }

  /// Forward without touching the cache stores.
  pub async fn passthrough(&self, request: &Request) -> Served {
    self.handle_other(request).await
  }

  /// Produce a response for `request`. Never fails: every strategy ends in
  /// a cached, fresh or synthesized response.
  pub async fn handle(&self, request: &Request) -> Served {
    let class = self.classify(request);
    debug!(method = %request.method, url = %request.url, ?class, "Routing request");

    match class {
      RequestClass::Api => self.handle_api(request).await,
      RequestClass::Page => self.handle_page(request).await,
      RequestClass::StaticAsset => self.handle_static(request).await,
      RequestClass::Other => self.handle_other(request).await,
    }
  }

  /// Network first; the dynamic store keeps the last answer for offline use.
  /// Mutations are never answered from the cache.
  async fn handle_api(&self, request: &Request) -> Served {
    let key = RequestKey::from(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(&self.generation.dynamic_store(), &key, &response);
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "API fetch failed, trying cache");
        match self.lookup(&key) {
          Some(cached) => Served::from_cache(cached),
          None => Served::synthesized(offline_api_response()),
        }
      }
    }
  }

  /// Cache first; a hit is returned at once while a detached task refreshes
  /// the dynamic store.
  async fn handle_page(&self, request: &Request) -> Served {
    let key = RequestKey::from(request);

    if let Some(cached) = self.lookup(&key) {
      self.revalidate(request.clone(), key);
      return Served::from_cache(cached);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(&self.generation.dynamic_store(), &key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Page fetch failed, serving default page");
        match self.lookup(&RequestKey::get(&self.default_page)) {
          Some(cached) => Served::from_cache(cached),
          None => Served::synthesized(offline_text_response()),
        }
      }
    }
  }

  async fn handle_static(&self, request: &Request) -> Served {
    let key = RequestKey::from(request);

    if let Some(cached) = self.lookup(&key) {
      return Served::from_cache(cached);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(&self.generation.static_store(), &key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Static asset unavailable");
        Served::synthesized(Response::new(404, ""))
      }
    }
  }

  async fn handle_other(&self, request: &Request) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Passthrough fetch failed");
        Served::synthesized(offline_text_response())
      }
    }
  }

  /// Look a key up across the current generation, newest data first.
  /// Read failures count as misses.
  fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    if !key.is_cacheable() {
      return None;
    }
    for store in [self.generation.dynamic_store(), self.generation.static_store()] {
      match self.storage.get(&store, key) {
        Ok(Some(cached)) => {
          debug!(store = %store, request = %key.description(), "Cache hit");
          return Some(cached);
        }
        Ok(None) => {}
        Err(e) => warn!(store = %store, request = %key.description(), error = %e, "Cache read failed"),
      }
    }
    None
  }

  /// Write-through that never fails the request.
  fn store(&self, store: &str, key: &RequestKey, response: &Response) {
    if !key.is_cacheable() {
      return;
    }
    if let Err(e) = self.storage.put(store, key, response) {
      warn!(store = %store, request = %key.description(), error = %e, "Skipping cache write");
    }
  }

  fn revalidate(&self, request: Request, key: RequestKey) {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let store = self.generation.dynamic_store();

    let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
    // Reap finished revalidations so a long-running host does not pile them up
    while background.try_join_next().is_some() {}

    background.spawn(async move {
      match network.fetch(&request).await {
        Ok(response) if response.ok() => {
          if let Err(e) = storage.put(&store, &key, &response) {
            warn!(request = %key.description(), error = %e, "Skipping revalidated cache write");
          } else {
            debug!(request = %key.description(), "Revalidated page");
          }
        }
        Ok(response) => {
          debug!(request = %key.description(), status = response.status, "Revalidation not cached")
        }
        Err(e) => debug!(request = %key.description(), error = %e, "Revalidation failed"),
      }
    });
  }
}

impl<N: Network> Clone for Router<N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      generation: self.generation.clone(),
      classifier: self.classifier.clone(),
      default_page: self.default_page.clone(),
      background: Arc::clone(&self.background),
    }
  }
}

/// Header marking responses the worker made up while offline.
pub const OFFLINE_HEADER: &str = "X-Cipsw-Offline";

fn offline_api_response() -> Response {
  Response::json(
    503,
    &serde_json::json!({
      "error": "Offline - Dati non disponibili",
      "message": "Connettiti a internet per aggiornare i dati",
    }),
  )
  .with_header(OFFLINE_HEADER, "1")
}

fn offline_text_response() -> Response {
  Response::new(503, "Offline")
    .with_header("Content-Type", "text/plain")
    .with_header(OFFLINE_HEADER, "1")
}
