//! Core traits and types for the cache stores.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use url::Url;

use crate::net::{Request, Response};

/// Identity of a cached request: method + absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url: url.as_str().to_string(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// Stable, fixed-length key used as the storage primary key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Only reads have a snapshot worth replaying; mutations always go to
  /// the network.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }

  /// Human-readable form, e.g. `GET https://host/user/dashboard`.
  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

impl From<&Request> for RequestKey {
  fn from(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }
}

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Named key-value stores of request -> response snapshots.
///
/// A miss is `Ok(None)`. Writing a key replaces the previous entry.
pub trait CacheStore: Send + Sync {
  /// Look up an entry in one store.
  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Write an entry, replacing any previous one for the same key.
  fn put(&self, store: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Write several entries in one transaction; either all land or none do.
  fn put_all(&self, store: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Drop a store and every entry in it. Returns whether it existed.
  fn delete_store(&self, store: &str) -> Result<bool>;

  /// Names of every store currently present.
  fn list_store_names(&self) -> Result<BTreeSet<String>>;
}

/// Result of routing a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The response handed back to the page
  pub response: Response,
  /// Where the response came from
  pub source: ServedFrom,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// A response fresh from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Network,
      cached_at: None,
    }
  }

  /// A response read from a cache store.
  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ServedFrom::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  /// A response made up locally because neither network nor cache had one.
  pub fn synthesized(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Fresh data from network
  Network,
  /// Data from a cache store
  Cache,
  /// Offline fallback built by the worker
  Synthesized,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_key_identity() {
    let url = Url::parse("https://cip.test/user/dashboard").unwrap();
    let a = RequestKey::new("get", &url);
    let b = RequestKey::get(&url);

    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
    assert_eq!(a.description(), "GET https://cip.test/user/dashboard");
  }

  #[test]
  fn test_method_changes_key() {
    let url = Url::parse("https://cip.test/api/portfolio").unwrap();

    assert_ne!(
      RequestKey::new("GET", &url).cache_hash(),
      RequestKey::new("POST", &url).cache_hash()
    );
  }

  #[test]
  fn test_only_reads_are_cacheable() {
    let url = Url::parse("https://cip.test/api/invest").unwrap();

    assert!(RequestKey::new("get", &url).is_cacheable());
    assert!(!RequestKey::new("POST", &url).is_cacheable());
    assert!(!RequestKey::new("PUT", &url).is_cacheable());
    assert!(!RequestKey::new("DELETE", &url).is_cacheable());
  }
}
