use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use url::Url;

use crate::lifecycle::{Notification, WorkerMessage};
use crate::net::{Destination, Network, Request};
use crate::sync::BACKGROUND_SYNC_TAG;

/// Host events delivered to the worker
#[derive(Debug)]
pub enum Event {
  /// Pre-warm the current generation
  Install,
  /// Evict stale generations and take control
  Activate,
  /// Intercepted page request
  Fetch(Request),
  /// Push message with an optional text payload
  Push(Option<String>),
  /// Notification clicked, with the chosen action if any
  NotificationClick(Option<String>),
  /// Background sync with its registration tag
  Sync(String),
  /// Message posted by a page
  Message(WorkerMessage),
  /// Connectivity restored
  Online,
  /// Connectivity lost
  Offline,
  /// Host offers the install prompt
  BeforeInstallPrompt,
  /// The app was installed from the prompt
  AppInstalled,
  /// Periodic tick for queue replay
  Tick,
}

impl Event {
  /// Parse one line of the host event stream read in watch mode.
  ///
  /// Blank lines and `#` comments yield `None`. Paths are resolved against
  /// `origin`.
  pub fn parse_line(line: &str, origin: &Url) -> Result<Option<Self>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      return Ok(None);
    }

    let (name, rest) = match line.split_once(char::is_whitespace) {
      Some((name, rest)) => (name, rest.trim()),
      None => (line, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    let event = match name {
      "install" => Self::Install,
      "activate" => Self::Activate,
      "online" => Self::Online,
      "offline" => Self::Offline,
      "tick" => Self::Tick,
      "install-prompt" => Self::BeforeInstallPrompt,
      "app-installed" => Self::AppInstalled,
      "push" => Self::Push(arg),
      "click" => Self::NotificationClick(arg),
      "sync" => Self::Sync(arg.unwrap_or_else(|| BACKGROUND_SYNC_TAG.to_string())),
      "message" => Self::Message(rest.parse()?),
      "fetch" => {
        let mut parts = rest.split_whitespace();
        let path = parts.next().ok_or("fetch needs a path")?;
        let destination = match parts.next() {
          Some(d) => d.parse::<Destination>()?,
          None => Destination::Document,
        };
        let url = origin
          .join(path)
          .map_err(|e| format!("invalid path {}: {}", path, e))?;
        Self::Fetch(Request::get(url).with_destination(destination))
      }
      other => return Err(format!("unknown host event: {}", other)),
    };

    Ok(Some(event))
  }
}

/// Messages from the worker to the foreground pages
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
  /// A new version is installed and waiting; reloading is up to the user
  UpdateAvailable { version: String },
  /// The worker now controls open pages
  ControllerChanged { version: String },
  /// Reply to a version query
  Version { version: String },
  /// A response was made up because the network is unreachable
  Offline,
  /// Navigation blocked until identity verification is complete
  KycRequired { section: String },
  /// Open (or focus) a window on this URL
  OpenWindow { url: String },
  /// Show a system notification
  ShowNotification(Notification),
  /// A submission was stored for later replay
  ActionQueued { id: i64 },
  /// Offline actions were replayed
  Synced { replayed: usize, failed: usize },
}

/// Event handler that produces ticks and connectivity changes
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn ticker
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      // The first tick fires immediately
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Probe `target` every `every` and emit `Online`/`Offline` on changes.
  pub fn watch_connectivity<N: Network>(
    &self,
    network: Arc<N>,
    target: Request,
    every: Duration,
    initially_online: bool,
  ) {
    let tx = self.tx.clone();

    tokio::spawn(async move {
      let mut online = initially_online;
      loop {
        tokio::time::sleep(every).await;
        let reachable = network.fetch(&target).await.is_ok();
        if reachable != online {
          online = reachable;
          debug!(online, "Connectivity changed");
          let event = if online { Event::Online } else { Event::Offline };
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    });
  }

  /// Sender for injecting host events (e.g. from signal handlers)
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Feed host events from a line stream (one event per line) until it
  /// ends. Unparseable lines are logged and skipped.
  ///
  /// Reads on a plain thread so a blocked stdin never holds up runtime
  /// shutdown.
  pub fn read_host_events<R>(&self, reader: R, origin: Url)
  where
    R: BufRead + Send + 'static,
  {
    let tx = self.sender();

    std::thread::spawn(move || {
      for line in reader.lines() {
        let line = match line {
          Ok(line) => line,
          Err(e) => {
            warn!(error = %e, "Host event stream failed");
            break;
          }
        };
        match Event::parse_line(&line, &origin) {
          Ok(Some(event)) => {
            if tx.send(event).is_err() {
              break;
            }
          }
          Ok(None) => {}
          Err(e) => warn!(line = %line, error = %e, "Ignoring host event"),
        }
      }
      debug!("Host event stream closed");
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
