//! Install, activation and update handling, plus the push notification
//! handlers that live on the worker.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStore, Generation, RequestKey};
use crate::db::Database;
use crate::event::ClientMessage;
use crate::net::{Network, Request};

const STATE_KEY: &str = "state";
const INSTALLED_KEY: &str = "installed_version";
const ACTIVE_KEY: &str = "active_version";

/// Path the push subscription is forwarded to.
pub const PUSH_SUBSCRIPTION_PATH: &str = "/api/push-subscription";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  /// Installed and waiting for activation
  Installed,
  Activating,
  Active,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
    }
  }
}

impl FromStr for LifecycleState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "installing" => Ok(Self::Installing),
      "installed" => Ok(Self::Installed),
      "activating" => Ok(Self::Activating),
      "active" => Ok(Self::Active),
      other => Err(format!("unknown lifecycle state: {}", other)),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
  #[error("pre-warm of {url} failed: {reason}")]
  PrewarmFailed { url: String, reason: String },
  #[error("no installed generation to activate")]
  NotInstalled,
}

/// Messages a page can post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
  SkipWaiting,
  GetVersion,
}

impl FromStr for WorkerMessage {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "SKIP_WAITING" => Ok(Self::SkipWaiting),
      "GET_VERSION" => Ok(Self::GetVersion),
      other => Err(format!("unknown worker message: {}", other)),
    }
  }
}

/// Persisted lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
  pub state: Option<LifecycleState>,
  pub installed_version: Option<String>,
  pub active_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  pub date_of_arrival: i64,
  pub primary_key: u32,
}

/// System notification shown for a push message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

/// Drives the worker through install and activation for one generation.
pub struct Lifecycle<N: Network> {
  storage: Arc<dyn CacheStore>,
  network: Arc<N>,
  db: Arc<Database>,
  generation: Generation,
  precache: Vec<Url>,
  skip_waiting: bool,
  default_page: Url,
  origin: Url,
  clients: mpsc::UnboundedSender<ClientMessage>,
}

impl<N: Network> Lifecycle<N> {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    storage: Arc<dyn CacheStore>,
    network: Arc<N>,
    db: Arc<Database>,
    generation: Generation,
    precache: Vec<Url>,
    skip_waiting: bool,
    default_page: Url,
    origin: Url,
    clients: mpsc::UnboundedSender<ClientMessage>,
  ) -> Self {
    Self {
      storage,
      network,
      db,
      generation,
      precache,
      skip_waiting,
      default_page,
      origin,
      clients,
    }
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  pub fn record(&self) -> Result<WorkerRecord> {
    let state = match self.db.get_state(STATE_KEY)? {
      Some(s) => Some(s.parse::<LifecycleState>().map_err(|e| eyre!(e))?),
      None => None,
    };

    Ok(WorkerRecord {
      state,
      installed_version: self.db.get_state(INSTALLED_KEY)?,
      active_version: self.db.get_state(ACTIVE_KEY)?,
    })
  }

  pub fn state(&self) -> Result<Option<LifecycleState>> {
    Ok(self.record()?.state)
  }

  pub fn is_active(&self) -> Result<bool> {
    Ok(self.state()? == Some(LifecycleState::Active))
  }

  /// Generation currently controlling pages. A newer install waiting for
  /// activation does not take over until it is activated.
  pub fn active_generation(&self) -> Result<Option<Generation>> {
    Ok(self.db.get_state(ACTIVE_KEY)?.map(Generation::new))
  }

  fn set_state(&self, state: LifecycleState) -> Result<()> {
    debug!(state = state.as_str(), "Lifecycle transition");
    self.db.set_state(STATE_KEY, state.as_str())
  }

  fn restore_state(&self, previous: Option<LifecycleState>) -> Result<()> {
    match previous {
      Some(state) => self.set_state(state),
      None => self.db.clear_state(STATE_KEY),
    }
  }

  /// Pre-warm the static store of the current generation.
  ///
  /// Every asset is fetched before anything is written; one failure aborts
  /// the install, leaving the stores and the previous state untouched.
  pub async fn install(&self) -> Result<()> {
    let previous = self.state()?;
    self.set_state(LifecycleState::Installing)?;
    info!(
      version = self.generation.version(),
      assets = self.precache.len(),
      "Installing worker"
    );

    let fetches = self.precache.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let result = self.network.fetch(&request).await;
      (request, result)
    });

    let mut entries = Vec::with_capacity(self.precache.len());
    for (request, result) in join_all(fetches).await {
      let failure = match result {
        Ok(response) if response.ok() => {
          entries.push((RequestKey::from(&request), response));
          continue;
        }
        Ok(response) => format!("HTTP {}", response.status),
        Err(e) => e.to_string(),
      };

      error!(url = %request.url, reason = %failure, "Install failed");
      self.restore_state(previous)?;
      return Err(
        LifecycleError::PrewarmFailed {
          url: request.url.to_string(),
          reason: failure,
        }
        .into(),
      );
    }

    if let Err(e) = self.storage.put_all(&self.generation.static_store(), &entries) {
      error!(error = %e, "Install failed writing the static store");
      self.restore_state(previous)?;
      return Err(e);
    }

    self.db.set_state(INSTALLED_KEY, self.generation.version())?;
    self.set_state(LifecycleState::Installed)?;
    info!(version = self.generation.version(), "Worker installed");

    if self.skip_waiting {
      self.activate().await?;
    } else {
      self.notify_if_update_pending()?;
    }

    Ok(())
  }

  /// Evict every store outside the installed generation and take control.
  /// Safe to call repeatedly.
  pub async fn activate(&self) -> Result<()> {
    let installed = self
      .db
      .get_state(INSTALLED_KEY)?
      .ok_or(LifecycleError::NotInstalled)?;
    let keep = Generation::new(installed.clone());

    let previous = self.state()?;
    self.set_state(LifecycleState::Activating)?;

    if let Err(e) = self.evict_stale(&keep) {
      error!(error = %e, "Activation failed removing stale caches");
      self.restore_state(previous)?;
      return Err(e);
    }

    self.db.set_state(ACTIVE_KEY, &installed)?;
    self.set_state(LifecycleState::Active)?;
    info!(version = %installed, "Worker active");

    self.send(ClientMessage::ControllerChanged { version: installed });
    Ok(())
  }

  fn evict_stale(&self, keep: &Generation) -> Result<()> {
    for store in self.storage.list_store_names()? {
      if !keep.owns(&store) {
        info!(store = %store, "Removing stale cache");
        self.storage.delete_store(&store)?;
      }
    }
    Ok(())
  }

  /// Version installed but not yet active, if any.
  pub fn update_pending(&self) -> Result<Option<String>> {
    let record = self.record()?;
    match (record.installed_version, record.active_version) {
      (Some(installed), Some(active)) if installed != active => Ok(Some(installed)),
      _ => Ok(None),
    }
  }

  /// Tell open pages a new version is waiting. No reload is forced.
  pub fn notify_if_update_pending(&self) -> Result<bool> {
    match self.update_pending()? {
      Some(version) => {
        info!(version = %version, "Update installed and waiting");
        self.send(ClientMessage::UpdateAvailable { version });
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Handle a message posted by a page.
  pub async fn on_message(&self, message: WorkerMessage) -> Result<()> {
    match message {
      WorkerMessage::SkipWaiting => self.activate().await,
      WorkerMessage::GetVersion => {
        self.send(ClientMessage::Version {
          version: self.generation.cache_name(),
        });
        Ok(())
      }
    }
  }

  /// Build the notification for a push message and hand it to the pages.
  pub fn on_push(&self, payload: Option<&str>) -> Notification {
    let icon = |path: &str| {
      self
        .origin
        .join(path)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| path.to_string())
    };

    let notification = Notification {
      title: "CIP Immobiliare".to_string(),
      body: payload
        .filter(|p| !p.is_empty())
        .unwrap_or("Nuova notifica da CIP Immobiliare")
        .to_string(),
      icon: icon("/assets/icons/icon-192x192.png"),
      badge: icon("/assets/icons/icon-72x72.png"),
      vibrate: vec![100, 50, 100],
      data: NotificationData {
        date_of_arrival: Utc::now().timestamp_millis(),
        primary_key: 1,
      },
      actions: vec![
        NotificationAction {
          action: "explore".to_string(),
          title: "Apri App".to_string(),
          icon: icon("/assets/icons/icon-96x96.png"),
        },
        NotificationAction {
          action: "close".to_string(),
          title: "Chiudi".to_string(),
          icon: icon("/assets/icons/icon-96x96.png"),
        },
      ],
    };

    debug!(body = %notification.body, "Push received");
    self.send(ClientMessage::ShowNotification(notification.clone()));
    notification
  }

  /// Only the `explore` action opens a window.
  pub fn on_notification_click(&self, action: Option<&str>) -> Option<ClientMessage> {
    match action {
      Some("explore") => {
        let message = ClientMessage::OpenWindow {
          url: self.default_page.to_string(),
        };
        self.send(message.clone());
        Some(message)
      }
      _ => None,
    }
  }

  /// Forward a push subscription to the backend. Nothing is kept locally.
  pub async fn forward_subscription(&self, subscription: &serde_json::Value) -> Result<()> {
    let url = self
      .origin
      .join(PUSH_SUBSCRIPTION_PATH)
      .map_err(|e| eyre!("Invalid subscription URL: {}", e))?;
    let request = Request::new("POST", url).with_json_body(subscription.to_string());

    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| eyre!("Failed to send push subscription: {}", e))?;

    if !response.ok() {
      return Err(eyre!(
        "Push subscription rejected with HTTP {}",
        response.status
      ));
    }

    info!("Push subscription forwarded");
    Ok(())
  }

  fn send(&self, message: ClientMessage) {
    if self.clients.send(message).is_err() {
      warn!("No foreground listener for worker message");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{FaultyStorage, SqliteStorage};
  use crate::net::mock::MockNetwork;
  use crate::net::Response;

  const ORIGIN: &str = "https://cip.test";

  struct Harness {
    storage: Arc<dyn CacheStore>,
    network: Arc<MockNetwork>,
    db: Arc<Database>,
    clients: mpsc::UnboundedReceiver<ClientMessage>,
    tx: mpsc::UnboundedSender<ClientMessage>,
  }

  impl Harness {
    fn new() -> Self {
      let db = Arc::new(Database::open_in_memory().unwrap());
      let (tx, clients) = mpsc::unbounded_channel();
      Self {
        storage: Arc::new(SqliteStorage::new(Arc::clone(&db))),
        network: Arc::new(MockNetwork::new()),
        db,
        clients,
        tx,
      }
    }

    fn lifecycle(&self, version: &str, paths: &[&str], skip_waiting: bool) -> Lifecycle<MockNetwork> {
      let origin = Url::parse(ORIGIN).unwrap();
      Lifecycle::new(
        Arc::clone(&self.storage),
        Arc::clone(&self.network),
        Arc::clone(&self.db),
        Generation::new(version),
        paths.iter().map(|p| origin.join(p).unwrap()).collect(),
        skip_waiting,
        origin.join("/user/dashboard").unwrap(),
        origin,
        self.tx.clone(),
      )
    }

    fn serve(&self, paths: &[&str], body: &str) {
      for path in paths {
        self.network.respond(
          "GET",
          &format!("{}{}", ORIGIN, path),
          Response::new(200, body),
        );
      }
    }

    fn messages(&mut self) -> Vec<ClientMessage> {
      let mut out = Vec::new();
      while let Ok(message) = self.clients.try_recv() {
        out.push(message);
      }
      out
    }
  }

  const ASSETS: [&str; 5] = [
    "/",
    "/user/dashboard",
    "/assets/css/style.css",
    "/assets/js/app.js",
    "/assets/icons/icon-192x192.png",
  ];

  #[tokio::test]
  async fn test_install_prewarms_and_activates() {
    let mut harness = Harness::new();
    harness.serve(&ASSETS, "v1");
    let lifecycle = harness.lifecycle("v1", &ASSETS, true);

    lifecycle.install().await.unwrap();

    let record = lifecycle.record().unwrap();
    assert_eq!(record.state, Some(LifecycleState::Active));
    assert_eq!(record.installed_version.as_deref(), Some("v1"));
    assert_eq!(record.active_version.as_deref(), Some("v1"));

    let url = Url::parse(ORIGIN).unwrap().join("/assets/js/app.js").unwrap();
    let cached = harness
      .storage
      .get("cip-static-v1", &RequestKey::get(&url))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"v1");

    assert_eq!(
      harness.messages(),
      vec![ClientMessage::ControllerChanged {
        version: "v1".to_string()
      }]
    );
  }

  #[tokio::test]
  async fn test_failed_prewarm_keeps_previous_generation() {
    let harness = Harness::new();
    harness.serve(&ASSETS, "v1");
    harness.lifecycle("v1", &ASSETS, true).install().await.unwrap();

    // One of five assets answers 500 for the new build
    harness.serve(&ASSETS, "v2");
    harness.network.respond(
      "GET",
      &format!("{}/assets/css/style.css", ORIGIN),
      Response::new(500, "error"),
    );
    let next = harness.lifecycle("v2", &ASSETS, true);

    let err = next.install().await.unwrap_err();
    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::PrewarmFailed { .. })
    ));

    let record = next.record().unwrap();
    assert_eq!(record.state, Some(LifecycleState::Active));
    assert_eq!(record.installed_version.as_deref(), Some("v1"));
    assert_eq!(record.active_version.as_deref(), Some("v1"));

    let stores = harness.storage.list_store_names().unwrap();
    assert!(stores.contains("cip-static-v1"));
    assert!(!stores.contains("cip-static-v2"));

    let url = Url::parse(ORIGIN).unwrap().join("/assets/js/app.js").unwrap();
    let cached = harness
      .storage
      .get("cip-static-v1", &RequestKey::get(&url))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"v1");
  }

  #[tokio::test]
  async fn test_network_failure_fails_first_install() {
    let harness = Harness::new();
    harness.serve(&ASSETS[..4], "v1");
    harness
      .network
      .fail("GET", &format!("{}/assets/icons/icon-192x192.png", ORIGIN));
    let lifecycle = harness.lifecycle("v1", &ASSETS, true);

    assert!(lifecycle.install().await.is_err());
    assert_eq!(lifecycle.state().unwrap(), None);
    assert!(harness.storage.list_store_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_twice_keeps_only_current_generation() {
    let harness = Harness::new();
    let url = Url::parse(ORIGIN).unwrap();
    for store in ["cip-static-v0", "cip-dynamic-v0", "cip-immobiliare-v1.0.0"] {
      harness
        .storage
        .put(store, &RequestKey::get(&url), &Response::new(200, "old"))
        .unwrap();
    }
    harness
      .storage
      .put("cip-dynamic-v1", &RequestKey::get(&url), &Response::new(200, "page"))
      .unwrap();
    harness.serve(&ASSETS, "v1");
    let lifecycle = harness.lifecycle("v1", &ASSETS, false);
    lifecycle.install().await.unwrap();

    lifecycle.activate().await.unwrap();
    lifecycle.activate().await.unwrap();

    let stores: Vec<String> = harness.storage.list_store_names().unwrap().into_iter().collect();
    assert_eq!(stores, vec!["cip-dynamic-v1", "cip-static-v1"]);
    assert!(lifecycle.is_active().unwrap());
  }

  #[tokio::test]
  async fn test_failed_eviction_restores_previous_state() {
    let mut harness = Harness::new();
    harness.serve(&ASSETS, "v1");
    harness.lifecycle("v1", &ASSETS, true).install().await.unwrap();
    harness.messages();

    let faulty = Arc::new(FaultyStorage::new(Arc::clone(&harness.storage)));
    harness.storage = Arc::clone(&faulty) as Arc<dyn CacheStore>;
    harness.serve(&ASSETS, "v2");
    let next = harness.lifecycle("v2", &ASSETS, false);
    next.install().await.unwrap();
    assert_eq!(next.state().unwrap(), Some(LifecycleState::Installed));
    harness.messages();

    faulty.fail_deletes(true);
    assert!(next.activate().await.is_err());

    let record = next.record().unwrap();
    assert_eq!(record.state, Some(LifecycleState::Installed));
    assert_eq!(record.active_version.as_deref(), Some("v1"));
    assert!(harness.messages().is_empty());

    // Retrying once the store recovers completes the takeover
    faulty.fail_deletes(false);
    next.activate().await.unwrap();
    assert_eq!(next.state().unwrap(), Some(LifecycleState::Active));
    assert_eq!(next.active_generation().unwrap(), Some(Generation::new("v2")));
  }

  #[tokio::test]
  async fn test_activate_without_install() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle("v1", &ASSETS, true);

    let err = lifecycle.activate().await.unwrap_err();
    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::NotInstalled)
    ));
  }

  #[tokio::test]
  async fn test_waiting_update_notifies_foreground() {
    let mut harness = Harness::new();
    harness.serve(&ASSETS, "v1");
    harness.lifecycle("v1", &ASSETS, true).install().await.unwrap();
    harness.messages();

    let next = harness.lifecycle("v2", &ASSETS, false);
    next.install().await.unwrap();

    assert_eq!(next.state().unwrap(), Some(LifecycleState::Installed));
    assert_eq!(next.active_generation().unwrap(), Some(Generation::new("v1")));
    assert_eq!(next.update_pending().unwrap().as_deref(), Some("v2"));
    assert_eq!(
      harness.messages(),
      vec![ClientMessage::UpdateAvailable {
        version: "v2".to_string()
      }]
    );
    // Old generation still serves pages until the user opts in
    assert!(harness
      .storage
      .list_store_names()
      .unwrap()
      .contains("cip-static-v1"));

    next.on_message(WorkerMessage::SkipWaiting).await.unwrap();
    assert_eq!(next.update_pending().unwrap(), None);
    assert!(!harness
      .storage
      .list_store_names()
      .unwrap()
      .contains("cip-static-v1"));
  }

  #[tokio::test]
  async fn test_get_version_message() {
    let mut harness = Harness::new();
    let lifecycle = harness.lifecycle("v3", &ASSETS, true);

    lifecycle.on_message(WorkerMessage::GetVersion).await.unwrap();

    assert_eq!(
      harness.messages(),
      vec![ClientMessage::Version {
        version: "cip-immobiliare-v3".to_string()
      }]
    );
    assert_eq!(
      "GET_VERSION".parse::<WorkerMessage>(),
      Ok(WorkerMessage::GetVersion)
    );
    assert!("RELOAD".parse::<WorkerMessage>().is_err());
  }

  #[test]
  fn test_push_notification_contents() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle("v1", &ASSETS, true);

    let notification = lifecycle.on_push(Some("Nuovo progetto disponibile"));
    assert_eq!(notification.title, "CIP Immobiliare");
    assert_eq!(notification.body, "Nuovo progetto disponibile");
    assert_eq!(notification.icon, "https://cip.test/assets/icons/icon-192x192.png");
    assert_eq!(notification.vibrate, vec![100, 50, 100]);
    assert_eq!(notification.actions.len(), 2);

    let fallback = lifecycle.on_push(None);
    assert_eq!(fallback.body, "Nuova notifica da CIP Immobiliare");
  }

  #[test]
  fn test_notification_click_actions() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle("v1", &ASSETS, true);

    assert_eq!(
      lifecycle.on_notification_click(Some("explore")),
      Some(ClientMessage::OpenWindow {
        url: "https://cip.test/user/dashboard".to_string()
      })
    );
    assert_eq!(lifecycle.on_notification_click(Some("close")), None);
    assert_eq!(lifecycle.on_notification_click(None), None);
  }

  #[tokio::test]
  async fn test_forward_subscription() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle("v1", &ASSETS, true);
    let endpoint = format!("{}{}", ORIGIN, PUSH_SUBSCRIPTION_PATH);
    harness
      .network
      .respond("POST", &endpoint, Response::new(201, ""));

    let subscription = serde_json::json!({
      "endpoint": "https://push.example/abc",
      "keys": { "p256dh": "key", "auth": "secret" }
    });
    lifecycle.forward_subscription(&subscription).await.unwrap();
    assert_eq!(harness.network.call_count("POST", &endpoint), 1);

    harness.network.set_offline(true);
    assert!(lifecycle.forward_subscription(&subscription).await.is_err());
  }
}
