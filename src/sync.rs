//! Replays the offline action queue against the network.
//!
//! A drain works on a snapshot of the queue and then clears the whole queue.
//! Two gaps follow from that and are accepted:
//! - an action whose replay fails is dropped after one attempt;
//! - an action enqueued after the snapshot is taken (by this process while
//!   replays are in flight, or by another process sharing the database) is
//!   cleared without ever being sent.
//!
//! Together with the millisecond collision in [`crate::queue::OfflineAction`]
//! these are the ways a queued action can be lost.

use color_eyre::Result;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::net::Network;
use crate::queue::{ActionQueue, OfflineAction};

/// Registration tag of the background sync that drains the queue.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Outcome of one drain pass, by action id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub replayed: Vec<i64>,
  pub failed: Vec<i64>,
}

impl DrainReport {
  pub fn is_empty(&self) -> bool {
    self.replayed.is_empty() && self.failed.is_empty()
  }
}

/// Drains the offline queue when connectivity returns, on background sync
/// and on manual retry.
pub struct SyncCoordinator<N: Network> {
  queue: Arc<dyn ActionQueue>,
  network: Arc<N>,
  /// Serializes drains within this process
  draining: Arc<Mutex<()>>,
}

impl<N: Network> SyncCoordinator<N> {
  pub fn new(queue: Arc<dyn ActionQueue>, network: Arc<N>) -> Self {
    Self {
      queue,
      network,
      draining: Arc::new(Mutex::new(())),
    }
  }

  /// One best-effort pass over the queue.
  ///
  /// Every action is replayed once, issued in enqueue order without waiting
  /// for the previous replay. Afterwards the whole queue is cleared, so an
  /// action whose replay failed is dropped with a warning.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _guard = self.draining.lock().await;

    let actions = self.queue.list_all()?;
    if actions.is_empty() {
      debug!("No offline actions to replay");
      return Ok(DrainReport::default());
    }

    info!(count = actions.len(), "Replaying offline actions");

    let outcomes = join_all(actions.iter().map(|action| self.replay(action))).await;

    let mut report = DrainReport::default();
    for (action, outcome) in actions.iter().zip(outcomes) {
      match outcome {
        Ok(()) => {
          debug!(id = action.id, method = %action.method, url = %action.url, "Offline action replayed");
          report.replayed.push(action.id);
        }
        Err(reason) => {
          warn!(
            id = action.id,
            method = %action.method,
            url = %action.url,
            %reason,
            "Offline action replay failed, dropping it"
          );
          report.failed.push(action.id);
        }
      }
    }

    let purged = self.queue.clear()?;
    info!(
      replayed = report.replayed.len(),
      failed = report.failed.len(),
      purged,
      "Offline actions synchronized"
    );

    Ok(report)
  }

  /// Background sync entry point; only the queue's tag triggers a drain.
  pub async fn on_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != BACKGROUND_SYNC_TAG {
      debug!(tag, "Ignoring background sync with unknown tag");
      return Ok(None);
    }
    self.drain().await.map(Some)
  }

  async fn replay(&self, action: &OfflineAction) -> Result<(), String> {
    let request = action.to_request().map_err(|e| e.to_string())?;
    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| e.to_string())?;

    if response.ok() {
      Ok(())
    } else {
      Err(format!("HTTP {}", response.status))
    }
  }
}

impl<N: Network> Clone for SyncCoordinator<N> {
  fn clone(&self) -> Self {
    Self {
      queue: Arc::clone(&self.queue),
      network: Arc::clone(&self.network),
      draining: Arc::clone(&self.draining),
    }
  }
}
