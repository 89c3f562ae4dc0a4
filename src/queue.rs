//! Durable queue of mutating requests captured while offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::db::Database;
use crate::net::Request;

/// A form submission waiting to be replayed.
///
/// `id` is the enqueue time in milliseconds and doubles as the queue key, so
/// two actions enqueued within the same millisecond collide and the later
/// one replaces the earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineAction {
  pub id: i64,
  pub url: String,
  pub method: String,
  /// JSON text sent as the request body on replay
  pub body: String,
  pub enqueued_at: DateTime<Utc>,
}

impl OfflineAction {
  pub fn new(url: &Url, method: &str, body: String) -> Self {
    let now = Utc::now();
    Self {
      id: now.timestamp_millis(),
      url: url.as_str().to_string(),
      method: method.to_uppercase(),
      body,
      enqueued_at: now,
    }
  }

  /// Capture a form submission: its fields become a JSON object.
  pub fn from_form(action: &Url, method: &str, fields: &[(String, String)]) -> Result<Self> {
    let data: serde_json::Map<String, serde_json::Value> = fields
      .iter()
      .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
      .collect();
    let body = serde_json::to_string(&data)
      .map_err(|e| eyre!("Failed to serialize form data: {}", e))?;

    Ok(Self::new(action, method, body))
  }

  /// The request that replays this action.
  pub fn to_request(&self) -> Result<Request> {
    let url =
      Url::parse(&self.url).map_err(|e| eyre!("Invalid queued URL {}: {}", self.url, e))?;
    Ok(Request::new(&self.method, url).with_json_body(self.body.clone()))
  }
}

/// Append-only, ordered log of offline actions. Removal is all-or-nothing.
pub trait ActionQueue: Send + Sync {
  /// Append an action; an existing action with the same id is replaced.
  fn enqueue(&self, action: &OfflineAction) -> Result<i64>;

  /// Every queued action, oldest first.
  fn list_all(&self) -> Result<Vec<OfflineAction>>;

  /// Remove every queued action. Returns how many were removed.
  fn clear(&self) -> Result<usize>;

  fn len(&self) -> Result<usize>;
}

/// SQLite-based action queue.
pub struct SqliteQueue {
  db: Arc<Database>,
}

impl SqliteQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl ActionQueue for SqliteQueue {
  fn enqueue(&self, action: &OfflineAction) -> Result<i64> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO offline_actions (id, url, method, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          action.id,
          action.url,
          action.method,
          action.body,
          action.enqueued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue offline action: {}", e))?;

    Ok(action.id)
  }

  fn list_all(&self) -> Result<Vec<OfflineAction>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT id, url, method, body, enqueued_at FROM offline_actions ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(i64, String, String, String, String)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| eyre!("Failed to query offline actions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read offline action: {}", e))?;

    rows
      .into_iter()
      .map(|(id, url, method, body, enqueued_at)| {
        let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
          .map_err(|e| eyre!("Failed to parse enqueue time '{}': {}", enqueued_at, e))?
          .with_timezone(&Utc);
        Ok(OfflineAction {
          id,
          url,
          method,
          body,
          enqueued_at,
        })
      })
      .collect()
  }

  fn clear(&self) -> Result<usize> {
    self
      .db
      .conn()?
      .execute("DELETE FROM offline_actions", [])
      .map_err(|e| eyre!("Failed to clear offline actions: {}", e))
  }

  fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count offline actions: {}", e))?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn queue() -> SqliteQueue {
    SqliteQueue::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn action(id: i64, path: &str) -> OfflineAction {
    let url = Url::parse("https://cip.test").unwrap().join(path).unwrap();
    OfflineAction {
      id,
      ..OfflineAction::new(&url, "post", r#"{"amount":"1000"}"#.to_string())
    }
  }

  #[test]
  fn test_list_is_oldest_first() {
    let queue = queue();
    queue.enqueue(&action(30, "/api/invest")).unwrap();
    queue.enqueue(&action(10, "/api/profile/update")).unwrap();
    queue.enqueue(&action(20, "/api/referral")).unwrap();

    let ids: Vec<i64> = queue.list_all().unwrap().iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![10, 20, 30]);
    assert_eq!(queue.len().unwrap(), 3);
  }

  #[test]
  fn test_round_trip_preserves_fields() {
    let queue = queue();
    let original = action(42, "/api/invest");

    assert_eq!(queue.enqueue(&original).unwrap(), 42);

    let stored = queue.list_all().unwrap().remove(0);
    assert_eq!(stored, original);
    assert_eq!(stored.method, "POST");
  }

  #[test]
  fn test_clear_removes_everything() {
    let queue = queue();
    queue.enqueue(&action(1, "/api/a")).unwrap();
    queue.enqueue(&action(2, "/api/b")).unwrap();

    assert_eq!(queue.clear().unwrap(), 2);
    assert!(queue.list_all().unwrap().is_empty());
    assert_eq!(queue.clear().unwrap(), 0);
  }

  #[test]
  fn test_same_timestamp_collision_overwrites() {
    // Known weakness: the enqueue timestamp is the key, so a second action
    // in the same millisecond replaces the first.
    let queue = queue();
    queue.enqueue(&action(1_700_000_000_000, "/api/first")).unwrap();
    queue.enqueue(&action(1_700_000_000_000, "/api/second")).unwrap();

    let actions = queue.list_all().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].url, "https://cip.test/api/second");
  }

  #[test]
  fn test_from_form_serializes_fields() {
    let url = Url::parse("https://cip.test/api/profile/update").unwrap();
    let fields = vec![
      ("first_name".to_string(), "Giulia".to_string()),
      ("city".to_string(), "Milano".to_string()),
    ];

    let action = OfflineAction::from_form(&url, "post", &fields).unwrap();
    let body: serde_json::Value = serde_json::from_str(&action.body).unwrap();

    assert_eq!(body["first_name"], "Giulia");
    assert_eq!(body["city"], "Milano");
    assert_eq!(action.method, "POST");
    assert_eq!(action.id, action.enqueued_at.timestamp_millis());
  }

  #[test]
  fn test_to_request_carries_body() {
    let request = action(5, "/api/invest").to_request().unwrap();

    assert_eq!(request.method, "POST");
    assert_eq!(request.url.as_str(), "https://cip.test/api/invest");
    assert_eq!(request.body.as_deref(), Some(&br#"{"amount":"1000"}"#[..]));
  }
}
