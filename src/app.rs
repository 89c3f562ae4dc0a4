use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStore, Generation, NoopStorage, Served, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::{ClientMessage, Event};
use crate::interceptor::{InterceptorChain, KycGate, OfflineNotice};
use crate::lifecycle::Lifecycle;
use crate::net::{FetchError, Network, Request, Response};
use crate::queue::{ActionQueue, OfflineAction, SqliteQueue};
use crate::router::{Classifier, Router};
use crate::sync::{DrainReport, SyncCoordinator};

/// Whether the host has offered to install the app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPrompt {
  /// No prompt offered yet
  Unavailable,
  /// Prompt captured and held until the user asks to install
  Deferred,
  /// App installed; the prompt is gone
  Installed,
}

/// Process-wide worker state, initialized once when the host is ready
#[derive(Debug, Clone)]
pub struct AppState {
  pub is_online: bool,
  pub install_prompt: InstallPrompt,
}

impl Default for AppState {
  fn default() -> Self {
    Self {
      is_online: true,
      install_prompt: InstallPrompt::Unavailable,
    }
  }
}

/// A form the page tried to submit
#[derive(Debug, Clone)]
pub struct FormSubmission {
  pub action: Url,
  pub method: String,
  pub fields: Vec<(String, String)>,
}

/// What happened to a form submission
#[derive(Debug)]
pub enum SubmitOutcome {
  /// Delivered; the backend's answer
  Sent(Response),
  /// Stored for replay when connectivity returns
  Queued { id: i64 },
}

/// Message shown to the user when a submission is stored offline
pub const QUEUED_NOTICE: &str =
  "Azione salvata offline - Verrà sincronizzata quando torni online";

/// The worker: one handler per host event over shared persistent stores
pub struct App<N: Network> {
  state: AppState,
  router: Router<N>,
  lifecycle: Lifecycle<N>,
  sync: SyncCoordinator<N>,
  queue: Arc<dyn ActionQueue>,
  network: Arc<N>,
  interceptors: InterceptorChain,
  clients: mpsc::UnboundedSender<ClientMessage>,
}

impl<N: Network> App<N> {
  pub fn new(
    config: &Config,
    db: Arc<Database>,
    network: Arc<N>,
    clients: mpsc::UnboundedSender<ClientMessage>,
  ) -> Result<Self> {
    let storage: Arc<dyn CacheStore> = if config.cache.enabled {
      Arc::new(SqliteStorage::new(Arc::clone(&db)))
    } else {
      Arc::new(NoopStorage)
    };
    let queue: Arc<dyn ActionQueue> = Arc::new(SqliteQueue::new(Arc::clone(&db)));

    let generation = Generation::new(config.cache.version.clone());
    let default_page = config.resolve(&config.cache.default_page)?;
    let precache = config
      .cache
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let router = Router::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      generation.clone(),
      Classifier::new(config.cache.api_patterns.clone()),
      default_page.clone(),
    );
    let lifecycle = Lifecycle::new(
      storage,
      Arc::clone(&network),
      db,
      generation,
      precache,
      config.lifecycle.skip_waiting,
      default_page,
      config.origin_url()?,
      clients.clone(),
    );
    let sync = SyncCoordinator::new(Arc::clone(&queue), Arc::clone(&network));
    let interceptors = InterceptorChain::new()
      .register(OfflineNotice)
      .register(KycGate::new(config.kyc.gated_sections.clone()));

    Ok(Self {
      state: AppState::default(),
      router,
      lifecycle,
      sync,
      queue,
      network,
      interceptors,
      clients,
    })
  }

  pub fn state(&self) -> &AppState {
    &self.state
  }

  pub fn lifecycle(&self) -> &Lifecycle<N> {
    &self.lifecycle
  }

  pub fn queue(&self) -> &dyn ActionQueue {
    self.queue.as_ref()
  }

  pub fn set_online(&mut self, online: bool) {
    if self.state.is_online != online {
      info!(online, "Connectivity changed");
    }
    self.state.is_online = online;
  }

  /// Dispatch one host event.
  pub async fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Install => self.lifecycle.install().await,
      Event::Activate => self.lifecycle.activate().await,
      Event::Fetch(request) => {
        let served = self.fetch(&request).await;
        debug!(url = %request.url, status = served.response.status, source = ?served.source, "Fetch handled");
        Ok(())
      }
      Event::Push(payload) => {
        self.lifecycle.on_push(payload.as_deref());
        Ok(())
      }
      Event::NotificationClick(action) => {
        self.lifecycle.on_notification_click(action.as_deref());
        Ok(())
      }
      Event::Sync(tag) => {
        if let Some(report) = self.sync.on_sync(&tag).await? {
          self.report_drain(&report);
        }
        Ok(())
      }
      Event::Message(message) => self.lifecycle.on_message(message).await,
      Event::Online => {
        self.set_online(true);
        self.drain().await.map(|_| ())
      }
      Event::Offline => {
        self.set_online(false);
        Ok(())
      }
      Event::BeforeInstallPrompt => {
        if self.state.install_prompt != InstallPrompt::Installed {
          self.state.install_prompt = InstallPrompt::Deferred;
        }
        Ok(())
      }
      Event::AppInstalled => {
        info!("App installed");
        self.state.install_prompt = InstallPrompt::Installed;
        Ok(())
      }
      Event::Tick => {
        if self.state.is_online && self.queue.len()? > 0 {
          self.drain().await?;
        }
        Ok(())
      }
    }
  }

  /// Intercept a page request. Until a generation is active, requests go
  /// straight to the network.
  pub async fn fetch(&self, request: &Request) -> Served {
    let served = match self.lifecycle.active_generation() {
      Ok(Some(generation)) => self.router.for_generation(generation).handle(request).await,
      Ok(None) => self.router.passthrough(request).await,
      Err(e) => {
        warn!(error = %e, "Could not read lifecycle state, bypassing cache");
        self.router.passthrough(request).await
      }
    };

    for message in self.interceptors.run(request, &served) {
      self.notify(message);
    }
    served
  }

  /// Submit a form, or queue it when the host is offline or the network
  /// turns out to be unreachable.
  pub async fn submit_form(&self, form: &FormSubmission) -> Result<SubmitOutcome> {
    let action = OfflineAction::from_form(&form.action, &form.method, &form.fields)?;

    if self.state.is_online {
      match self.network.fetch(&action.to_request()?).await {
        Ok(response) => return Ok(SubmitOutcome::Sent(response)),
        Err(FetchError::Connectivity(reason)) => {
          debug!(url = %form.action, %reason, "Network unreachable, queueing submission");
        }
        Err(e) => return Err(eyre!("Failed to submit form to {}: {}", form.action, e)),
      }
    }

    let id = self.queue.enqueue(&action)?;
    info!(id, url = %action.url, method = %action.method, "{}", QUEUED_NOTICE);
    self.notify(ClientMessage::ActionQueued { id });

    Ok(SubmitOutcome::Queued { id })
  }

  /// Wait for background cache refreshes. Hosts call this before exiting.
  pub async fn settle(&self) {
    self.router.settle().await;
  }

  /// Manual retry: replay the queue now.
  pub async fn drain(&self) -> Result<DrainReport> {
    let report = self.sync.drain().await?;
    self.report_drain(&report);
    Ok(report)
  }

  fn report_drain(&self, report: &DrainReport) {
    if !report.is_empty() {
      self.notify(ClientMessage::Synced {
        replayed: report.replayed.len(),
        failed: report.failed.len(),
      });
    }
  }

  fn notify(&self, message: ClientMessage) {
    if self.clients.send(message).is_err() {
      debug!("No foreground listener for worker message");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ServedFrom;
  use crate::lifecycle::WorkerMessage;
  use crate::net::mock::MockNetwork;
  use crate::net::Destination;

  const ORIGIN: &str = "https://cip.test";

  struct Harness {
    app: App<MockNetwork>,
    network: Arc<MockNetwork>,
    clients: mpsc::UnboundedReceiver<ClientMessage>,
  }

  impl Harness {
    fn new() -> Self {
      let config = Config::from_yaml(
        r#"
origin: https://cip.test
cache:
  version: v1
  precache: ["/", "/user/dashboard", "/assets/js/app.js"]
"#,
      )
      .unwrap();
      let db = Arc::new(Database::open_in_memory().unwrap());
      let network = Arc::new(MockNetwork::new());
      let (tx, clients) = mpsc::unbounded_channel();
      let app = App::new(&config, db, Arc::clone(&network), tx).unwrap();

      for path in ["/", "/user/dashboard", "/assets/js/app.js"] {
        network.respond("GET", &url(path), Response::new(200, format!("shell {}", path)));
      }

      Self {
        app,
        network,
        clients,
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

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn page(path: &str) -> Request {
    Request::get(Url::parse(&url(path)).unwrap()).with_destination(Destination::Document)
  }

  fn invest_form() -> FormSubmission {
    FormSubmission {
      action: Url::parse(&url("/api/invest")).unwrap(),
      method: "post".to_string(),
      fields: vec![
        ("project_id".to_string(), "12".to_string()),
        ("amount".to_string(), "5000".to_string()),
      ],
    }
  }

  #[tokio::test]
  async fn test_requests_bypass_cache_before_activation() {
    let harness = Harness::new();
    harness.network.respond("GET", &url("/user/profile"), Response::new(200, "profile"));

    let served = harness.app.fetch(&page("/user/profile")).await;

    assert_eq!(served.source, ServedFrom::Network);
    harness.network.set_offline(true);
    let served = harness.app.fetch(&page("/user/profile")).await;
    assert_eq!(served.source, ServedFrom::Synthesized);
  }

  #[tokio::test]
  async fn test_offline_navigation_after_install() {
    let mut harness = Harness::new();
    harness.app.handle_event(Event::Install).await.unwrap();
    harness.messages();

    harness.network.set_offline(true);
    let served = harness.app.fetch(&page("/user/new-project")).await;

    // Falls back to the pre-warmed dashboard
    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(served.response.text(), "shell /user/dashboard");

    let served = harness
      .app
      .fetch(&Request::get(Url::parse(&url("/api/projects")).unwrap()))
      .await;
    assert_eq!(served.response.status, 503);
    assert_eq!(harness.messages(), vec![ClientMessage::Offline]);
  }

  #[tokio::test]
  async fn test_settle_lands_page_refresh_from_fetch_event() {
    let mut harness = Harness::new();
    harness.app.handle_event(Event::Install).await.unwrap();
    harness
      .network
      .respond("GET", &url("/user/dashboard"), Response::new(200, "fresh dashboard"));

    harness
      .app
      .handle_event(Event::Fetch(page("/user/dashboard")))
      .await
      .unwrap();
    harness.app.settle().await;

    harness.network.set_offline(true);
    let served = harness.app.fetch(&page("/user/dashboard")).await;
    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(served.response.text(), "fresh dashboard");
  }

  #[tokio::test]
  async fn test_kyc_gate_notifies_foreground() {
    let mut harness = Harness::new();
    harness.app.handle_event(Event::Install).await.unwrap();
    harness.messages();
    harness
      .network
      .respond("GET", &url("/user/new-project"), Response::new(403, "KYC"));

    harness.app.fetch(&page("/user/new-project")).await;

    assert_eq!(
      harness.messages(),
      vec![ClientMessage::KycRequired {
        section: "/user/new-project".to_string()
      }]
    );
  }

  #[tokio::test]
  async fn test_offline_submission_is_queued_and_replayed_on_reconnect() {
    let mut harness = Harness::new();
    harness.app.handle_event(Event::Offline).await.unwrap();

    let outcome = harness.app.submit_form(&invest_form()).await.unwrap();
    let id = match outcome {
      SubmitOutcome::Queued { id } => id,
      other => panic!("expected queued submission, got {:?}", other),
    };
    assert_eq!(harness.app.queue().len().unwrap(), 1);
    assert!(harness.network.calls().is_empty());

    harness
      .network
      .respond("POST", &url("/api/invest"), Response::new(200, "{}"));
    harness.app.handle_event(Event::Online).await.unwrap();

    assert!(harness.app.state().is_online);
    assert_eq!(harness.app.queue().len().unwrap(), 0);
    assert_eq!(harness.network.call_count("POST", &url("/api/invest")), 1);
    assert_eq!(
      harness.messages(),
      vec![
        ClientMessage::ActionQueued { id },
        ClientMessage::Synced {
          replayed: 1,
          failed: 0
        }
      ]
    );
  }

  #[tokio::test]
  async fn test_unreachable_network_queues_submission() {
    let harness = Harness::new();
    harness.network.fail("POST", &url("/api/invest"));

    let outcome = harness.app.submit_form(&invest_form()).await.unwrap();

    assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
    assert_eq!(harness.app.queue().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_online_submission_is_sent() {
    let harness = Harness::new();
    harness
      .network
      .respond("POST", &url("/api/invest"), Response::new(201, "created"));

    let outcome = harness.app.submit_form(&invest_form()).await.unwrap();

    match outcome {
      SubmitOutcome::Sent(response) => assert_eq!(response.status, 201),
      other => panic!("expected sent submission, got {:?}", other),
    }
    assert_eq!(harness.app.queue().len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_tick_drains_only_when_online() {
    let mut harness = Harness::new();
    harness
      .network
      .respond("POST", &url("/api/invest"), Response::new(200, ""));
    harness.app.handle_event(Event::Offline).await.unwrap();
    harness.app.submit_form(&invest_form()).await.unwrap();

    harness.app.handle_event(Event::Tick).await.unwrap();
    assert_eq!(harness.app.queue().len().unwrap(), 1);

    harness.app.set_online(true);
    harness.app.handle_event(Event::Tick).await.unwrap();
    assert_eq!(harness.app.queue().len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_background_sync_event() {
    let mut harness = Harness::new();
    harness
      .network
      .respond("POST", &url("/api/invest"), Response::new(200, ""));
    harness.app.handle_event(Event::Offline).await.unwrap();
    harness.app.submit_form(&invest_form()).await.unwrap();

    harness
      .app
      .handle_event(Event::Sync("background-sync".to_string()))
      .await
      .unwrap();

    assert_eq!(harness.app.queue().len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_install_prompt_state() {
    let mut harness = Harness::new();
    assert_eq!(harness.app.state().install_prompt, InstallPrompt::Unavailable);

    harness.app.handle_event(Event::BeforeInstallPrompt).await.unwrap();
    assert_eq!(harness.app.state().install_prompt, InstallPrompt::Deferred);

    harness.app.handle_event(Event::AppInstalled).await.unwrap();
    harness.app.handle_event(Event::BeforeInstallPrompt).await.unwrap();
    assert_eq!(harness.app.state().install_prompt, InstallPrompt::Installed);
  }

  #[tokio::test]
  async fn test_message_and_notification_events() {
    let mut harness = Harness::new();

    harness
      .app
      .handle_event(Event::Message(WorkerMessage::GetVersion))
      .await
      .unwrap();
    harness
      .app
      .handle_event(Event::NotificationClick(Some("explore".to_string())))
      .await
      .unwrap();

    assert_eq!(
      harness.messages(),
      vec![
        ClientMessage::Version {
          version: "cip-immobiliare-v1".to_string()
        },
        ClientMessage::OpenWindow {
          url: url("/user/dashboard")
        }
      ]
    );
  }

  #[tokio::test]
  async fn test_disabled_cache_never_stores() {
    let config = Config::from_yaml(
      "origin: https://cip.test\ncache:\n  enabled: false\n  precache: [\"/\"]\n",
    )
    .unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    network.respond("GET", &url("/"), Response::new(200, "shell"));
    let (tx, _rx) = mpsc::unbounded_channel();
    let app = App::new(&config, Arc::clone(&db), Arc::clone(&network), tx).unwrap();

    app.lifecycle().install().await.unwrap();
    network.set_offline(true);
    let served = app.fetch(&page("/")).await;

    assert_eq!(served.source, ServedFrom::Synthesized);
    assert!(SqliteStorage::new(db).list_store_names().unwrap().is_empty());
  }
}
