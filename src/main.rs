mod app;
mod cache;
mod config;
mod db;
mod event;
mod interceptor;
mod lifecycle;
mod logging;
mod net;
mod queue;
mod router;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::app::{App, FormSubmission, SubmitOutcome};
use crate::event::{ClientMessage, Event, EventHandler};
use crate::lifecycle::WorkerMessage;
use crate::net::{Destination, HttpNetwork, Request};

/// How often watch mode probes the origin for connectivity.
const PROBE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "cipsw")]
#[command(about = "Offline caching and action replay worker for CIP Immobiliare")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cipsw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-warm the static store of the configured generation
  Install,
  /// Evict stale generations and take control
  Activate,
  /// Route one request through the worker
  Fetch {
    /// Path (or absolute URL) relative to the origin
    path: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// document, style, script, image or empty
    #[arg(short, long, default_value = "document")]
    destination: Destination,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Submit a form, queueing it when the network is unreachable
  Submit {
    /// Form action path
    action: String,
    #[arg(short, long, default_value = "POST")]
    method: String,
    /// Form field as name=value (repeatable)
    #[arg(short, long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
  },
  /// Replay the offline queue
  Sync {
    /// Background sync tag; omit for a manual retry
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// List queued offline actions
  Queue,
  /// Show the lifecycle record and queue length
  Status,
  /// Post a message to the worker (SKIP_WAITING or GET_VERSION)
  Message { message: String },
  /// Deliver a push message
  Push {
    #[arg(short, long)]
    payload: Option<String>,
  },
  /// Click a notification, optionally on one of its actions
  NotificationClick {
    #[arg(short, long)]
    action: Option<String>,
  },
  /// Forward a push subscription (JSON file) to the backend
  Subscribe { file: PathBuf },
  /// Run until interrupted, replaying the queue when connectivity returns.
  /// Host events are also read from stdin, one per line (e.g.
  /// `fetch /user/dashboard`, `install-prompt`, `app-installed`, `offline`).
  Watch,
}

fn parse_field(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .ok_or_else(|| format!("expected name=value, got {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _log_guard = logging::init(&data_dir.join("logs"), args.verbose)?;

  let db = Arc::new(db::Database::open(&data_dir)?);
  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let (clients_tx, mut clients) = mpsc::unbounded_channel();
  let mut app = App::new(&config, db, Arc::clone(&network), clients_tx)?;

  match args.command {
    Command::Install => {
      app.handle_event(Event::Install).await?;
      println!("Installed {}", app.lifecycle().generation().static_store());
    }
    Command::Activate => app.handle_event(Event::Activate).await?,
    Command::Fetch {
      path,
      method,
      destination,
      body,
    } => {
      let mut request = Request::new(&method, config.resolve(&path)?).with_destination(destination);
      if let Some(body) = body {
        request = request.with_json_body(body);
      }
      let served = app.fetch(&request).await;
      println!("{} ({:?})", served.response.status, served.source);
      if let Some(cached_at) = served.cached_at {
        println!("cached at {}", cached_at);
      }
      println!("{}", served.response.text());
    }
    Command::Submit {
      action,
      method,
      fields,
    } => {
      let form = FormSubmission {
        action: config.resolve(&action)?,
        method,
        fields,
      };
      match app.submit_form(&form).await? {
        SubmitOutcome::Sent(response) => println!("{}\n{}", response.status, response.text()),
        SubmitOutcome::Queued { id } => println!("{} (#{})", app::QUEUED_NOTICE, id),
      }
    }
    Command::Sync { tag } => match tag {
      Some(tag) => app.handle_event(Event::Sync(tag)).await?,
      None => {
        let report = app.drain().await?;
        println!(
          "replayed {}, failed {}",
          report.replayed.len(),
          report.failed.len()
        );
      }
    },
    Command::Queue => {
      for action in app.queue().list_all()? {
        println!(
          "{}\t{}\t{} {}\t{}",
          action.id, action.enqueued_at, action.method, action.url, action.body
        );
      }
    }
    Command::Status => {
      let lifecycle = app.lifecycle();
      let record = lifecycle.record()?;
      let describe = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
      println!(
        "state: {}",
        record.state.map(|s| s.as_str()).unwrap_or("not installed")
      );
      println!("installed: {}", describe(record.installed_version));
      println!("active: {}", describe(record.active_version));
      println!("controlling pages: {}", lifecycle.is_active()?);
      if let Some(version) = lifecycle.update_pending()? {
        println!("update waiting: {}", version);
      }
      println!("queued actions: {}", app.queue().len()?);
    }
    Command::Message { message } => {
      let message = message.parse::<WorkerMessage>().map_err(|e| eyre!(e))?;
      app.handle_event(Event::Message(message)).await?;
    }
    Command::Push { payload } => app.handle_event(Event::Push(payload)).await?,
    Command::NotificationClick { action } => {
      app.handle_event(Event::NotificationClick(action)).await?
    }
    Command::Subscribe { file } => {
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let subscription: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Invalid subscription in {}: {}", file.display(), e))?;
      if let Err(e) = app.lifecycle().forward_subscription(&subscription).await {
        error!(error = %e, "Push subscription not forwarded");
      }
    }
    Command::Watch => {
      let probe = Request::get(config.resolve(&config.sync.probe_path)?);
      let mut events = EventHandler::new(Duration::from_secs(config.sync.interval_secs));
      events.watch_connectivity(network, probe, PROBE_INTERVAL, app.state().is_online);
      events.read_host_events(std::io::BufReader::new(std::io::stdin()), config.origin_url()?);

      tokio::spawn(async move {
        while let Some(message) = clients.recv().await {
          print_message(&message);
        }
      });

      info!(origin = %config.origin, "Watching for connectivity changes");
      loop {
        tokio::select! {
          event = events.next() => match event {
            Some(event) => {
              if let Err(e) = app.handle_event(event).await {
                error!(error = %e, "Event handler failed");
              }
            }
            None => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
      }
      app.settle().await;
      return Ok(());
    }
  }

  // Background page refreshes must land before the runtime shuts down
  app.settle().await;

  while let Ok(message) = clients.try_recv() {
    print_message(&message);
  }

  Ok(())
}

fn print_message(message: &ClientMessage) {
  match message {
    ClientMessage::ShowNotification(notification) => {
      match serde_json::to_string_pretty(notification) {
        Ok(json) => println!("notification: {}", json),
        Err(_) => println!("notification: {}", notification.body),
      }
    }
    other => println!("{:?}", other),
  }
}
