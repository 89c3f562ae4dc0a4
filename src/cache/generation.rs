//! Versioned static/dynamic store pairs.

const STATIC_PREFIX: &str = "cip-static-";
const DYNAMIC_PREFIX: &str = "cip-dynamic-";
const NAME_PREFIX: &str = "cip-immobiliare-";

/// A build's pair of cache stores. Every store outside the current
/// generation is evicted on activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  version: String,
}

impl Generation {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Name the build reports to pages asking for its version.
  pub fn cache_name(&self) -> String {
    format!("{}{}", NAME_PREFIX, self.version)
  }

  /// Store holding pre-warmed shell pages and build assets.
  pub fn static_store(&self) -> String {
    format!("{}{}", STATIC_PREFIX, self.version)
  }

  /// Store holding API and page responses fetched at runtime.
  pub fn dynamic_store(&self) -> String {
    format!("{}{}", DYNAMIC_PREFIX, self.version)
  }

  /// Whether a store name belongs to this generation.
  pub fn owns(&self, store: &str) -> bool {
    store == self.static_store() || store == self.dynamic_store()
  }
}
