use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderValue, IntoHeaderName, CONTENT_TYPE};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{QueueError, StorageError};
use crate::http::{headers_from_json, headers_to_json, HeaderMap, Method};

/// Kind of user mutation being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
  Create,
  Update,
  Delete,
}

impl SyncAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncAction::Create => "create",
      SyncAction::Update => "update",
      SyncAction::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(SyncAction::Create),
      "update" => Some(SyncAction::Update),
      "delete" => Some(SyncAction::Delete),
      _ => None,
    }
  }

  /// Method used when the caller does not pick one.
  pub fn default_method(&self) -> Method {
    match self {
      SyncAction::Create => Method::POST,
      SyncAction::Update => Method::PUT,
      SyncAction::Delete => Method::DELETE,
    }
  }
}

/// Lifecycle of a queue item. `Done` items are deleted, so only the first
/// three are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
  Pending,
  InFlight,
  Failed,
  Done,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncStatus::Pending => "pending",
      SyncStatus::InFlight => "in-flight",
      SyncStatus::Failed => "failed",
      SyncStatus::Done => "done",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(SyncStatus::Pending),
      "in-flight" => Some(SyncStatus::InFlight),
      "failed" => Some(SyncStatus::Failed),
      "done" => Some(SyncStatus::Done),
      _ => None,
    }
  }
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A mutation as submitted by a page.
#[derive(Debug, Clone)]
pub struct Mutation {
  pub action: SyncAction,
  /// Path relative to the API origin, or an absolute URL
  pub endpoint: String,
  pub method: Option<Method>,
  pub payload: Option<Bytes>,
  pub headers: HeaderMap,
}

impl Mutation {
  pub fn new(action: SyncAction, endpoint: impl Into<String>) -> Self {
    Self {
      action,
      endpoint: endpoint.into(),
      method: None,
      payload: None,
      headers: HeaderMap::new(),
    }
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(mut self, value: &serde_json::Value) -> Self {
    self.payload = Some(Bytes::from(value.to_string()));
    self
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    self
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = Some(method);
    self
  }

  pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }
}

/// A stored mutation with its retry state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
  pub id: Uuid,
  pub action: SyncAction,
  pub endpoint: String,
  pub method: Method,
  pub payload: Option<Bytes>,
  pub headers: HeaderMap,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub last_error: Option<String>,
  pub status: SyncStatus,
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  pub pending: usize,
  pub in_flight: usize,
  pub failed: usize,
}

impl QueueCounts {
  /// Items still to be replayed.
  pub fn queued(&self) -> usize {
    self.pending + self.in_flight
  }
}

const ITEM_COLUMNS: &str = "id, action, endpoint, method, payload, headers, created_at, \
   retry_count, max_retries, last_error, status";

const LAST_SYNC_KEY: &str = "last_successful_sync";

/// Ordered, durable log of pending mutations.
///
/// Replay order is strict FIFO by creation; at most one item is in flight.
pub struct SyncQueue {
  db: Database,
  max_retries: u32,
}

impl SyncQueue {
  /// Open the queue. Items left in flight by a previous process go back to
  /// pending with their retry count unchanged.
  pub fn open(db: Database, max_retries: u32) -> Result<Self, QueueError> {
    let queue = Self { db, max_retries };

    let recovered = {
      let conn = queue.db.conn()?;
      conn.execute(
        "UPDATE sync_queue SET status = ? WHERE status = ?",
        params![SyncStatus::Pending.as_str(), SyncStatus::InFlight.as_str()],
      )?
    };
    if recovered > 0 {
      info!(recovered, "Returned interrupted sync items to pending");
    }

    Ok(queue)
  }

  /// Append a mutation. Returns the new item id.
  pub fn enqueue(&self, mutation: Mutation) -> Result<Uuid, QueueError> {
    let id = Uuid::new_v4();
    let method = mutation
      .method
      .unwrap_or_else(|| mutation.action.default_method());
    let headers = headers_to_json(&mutation.headers).map_err(StorageError::from)?;

    let conn = self.db.conn()?;
    conn.execute(
      "INSERT INTO sync_queue
         (id, action, endpoint, method, payload, headers, created_at,
          retry_count, max_retries, last_error, status)
       VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, NULL, ?)",
      params![
        id.to_string(),
        mutation.action.as_str(),
        mutation.endpoint,
        method.as_str(),
        mutation.payload.as_deref(),
        headers,
        Utc::now().to_rfc3339(),
        self.max_retries,
        SyncStatus::Pending.as_str(),
      ],
    )?;

    debug!(%id, action = mutation.action.as_str(), endpoint = %mutation.endpoint, "Enqueued mutation");
    Ok(id)
  }

  /// Oldest pending item, if any.
  pub fn dequeue_next(&self) -> Result<Option<SyncQueueItem>, QueueError> {
    let conn = self.db.conn()?;
    let sql = format!(
      "SELECT {} FROM sync_queue WHERE status = ? ORDER BY seq LIMIT 1",
      ITEM_COLUMNS
    );
    let raw = conn
      .query_row(&sql, params![SyncStatus::Pending.as_str()], RawItem::from_row)
      .optional()?;
    raw.map(RawItem::into_item).transpose().map_err(Into::into)
  }

  pub fn get(&self, id: Uuid) -> Result<Option<SyncQueueItem>, QueueError> {
    let conn = self.db.conn()?;
    let sql = format!("SELECT {} FROM sync_queue WHERE id = ?", ITEM_COLUMNS);
    let raw = conn
      .query_row(&sql, params![id.to_string()], RawItem::from_row)
      .optional()?;
    raw.map(RawItem::into_item).transpose().map_err(Into::into)
  }

  /// Claim a pending item for replay. Fails if another item is in flight.
  pub fn mark_in_flight(&self, id: Uuid) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    let tx = conn.unchecked_transaction()?;

    let other: Option<String> = tx
      .query_row(
        "SELECT id FROM sync_queue WHERE status = ? AND id != ? LIMIT 1",
        params![SyncStatus::InFlight.as_str(), id.to_string()],
        |row| row.get(0),
      )
      .optional()?;
    if let Some(other) = other {
      let other = Uuid::parse_str(&other)
        .map_err(|e| StorageError::Corrupt(format!("bad item id '{}': {}", other, e)))?;
      return Err(QueueError::AlreadyInFlight(other));
    }

    Self::transition(&tx, id, SyncStatus::Pending, SyncStatus::InFlight)?;
    tx.commit()?;
    Ok(())
  }

  /// Replay succeeded: the item is removed.
  pub fn mark_done(&self, id: Uuid) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    Self::expect_status(&conn, id, SyncStatus::InFlight, SyncStatus::Done)?;
    conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id.to_string()])?;
    Ok(())
  }

  /// Record a transient failure. The item returns to pending, or becomes
  /// failed once its retry count reaches the limit. Returns the new status.
  pub fn mark_failed(&self, id: Uuid, error: &str) -> Result<SyncStatus, QueueError> {
    let conn = self.db.conn()?;
    let tx = conn.unchecked_transaction()?;

    Self::expect_status(&tx, id, SyncStatus::InFlight, SyncStatus::Pending)?;
    let (retry_count, max_retries): (u32, u32) = tx.query_row(
      "SELECT retry_count, max_retries FROM sync_queue WHERE id = ?",
      params![id.to_string()],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let retry_count = (retry_count + 1).min(max_retries);
    let status = if retry_count >= max_retries {
      SyncStatus::Failed
    } else {
      SyncStatus::Pending
    };

    tx.execute(
      "UPDATE sync_queue SET retry_count = ?, last_error = ?, status = ? WHERE id = ?",
      params![retry_count, error, status.as_str(), id.to_string()],
    )?;
    tx.commit()?;

    Ok(status)
  }

  /// Hand an in-flight item back untouched, for attempts cut short by lost
  /// connectivity. The retry count does not change.
  pub fn release(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    Self::expect_status(&conn, id, SyncStatus::InFlight, SyncStatus::Pending)?;
    conn.execute(
      "UPDATE sync_queue SET last_error = ?, status = ? WHERE id = ?",
      params![error, SyncStatus::Pending.as_str(), id.to_string()],
    )?;
    Ok(())
  }

  /// Record a permanent rejection. No further automatic attempts.
  pub fn mark_permanently_failed(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    Self::expect_status(&conn, id, SyncStatus::InFlight, SyncStatus::Failed)?;
    conn.execute(
      "UPDATE sync_queue SET last_error = ?, status = ? WHERE id = ?",
      params![error, SyncStatus::Failed.as_str(), id.to_string()],
    )?;
    Ok(())
  }

  /// Manual retry of a failed item: retry count back to zero, pending again.
  pub fn retry(&self, id: Uuid) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    Self::expect_status(&conn, id, SyncStatus::Failed, SyncStatus::Pending)?;
    conn.execute(
      "UPDATE sync_queue SET retry_count = 0, last_error = NULL, status = ? WHERE id = ?",
      params![SyncStatus::Pending.as_str(), id.to_string()],
    )?;
    Ok(())
  }

  /// Items in replay order, optionally filtered by status.
  pub fn list(&self, status: Option<SyncStatus>) -> Result<Vec<SyncQueueItem>, QueueError> {
    let conn = self.db.conn()?;
    let raw = match status {
      Some(status) => {
        let sql = format!(
          "SELECT {} FROM sync_queue WHERE status = ? ORDER BY seq",
          ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(params![status.as_str()], RawItem::from_row)?
          .collect::<Result<Vec<_>, _>>()?;
        rows
      }
      None => {
        let sql = format!("SELECT {} FROM sync_queue ORDER BY seq", ITEM_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map([], RawItem::from_row)?
          .collect::<Result<Vec<_>, _>>()?;
        rows
      }
    };

    raw
      .into_iter()
      .map(RawItem::into_item)
      .collect::<Result<Vec<_>, _>>()
      .map_err(Into::into)
  }

  /// Delete items, all of them or only those with `status`. Returns the count.
  pub fn clear(&self, status: Option<SyncStatus>) -> Result<usize, QueueError> {
    let conn = self.db.conn()?;
    let removed = match status {
      Some(status) => conn.execute(
        "DELETE FROM sync_queue WHERE status = ?",
        params![status.as_str()],
      )?,
      None => conn.execute("DELETE FROM sync_queue", [])?,
    };
    info!(removed, status = ?status, "Cleared sync queue");
    Ok(removed)
  }

  pub fn counts(&self) -> Result<QueueCounts, QueueError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
      .collect::<Result<Vec<_>, _>>()?;

    let mut counts = QueueCounts::default();
    for (status, count) in rows {
      let count = count as usize;
      match SyncStatus::parse(&status) {
        Some(SyncStatus::Pending) => counts.pending = count,
        Some(SyncStatus::InFlight) => counts.in_flight = count,
        Some(SyncStatus::Failed) => counts.failed = count,
        _ => {}
      }
    }
    Ok(counts)
  }

  /// Time of the last successful replay, persisted across restarts.
  pub fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
    let conn = self.db.conn()?;
    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM sync_meta WHERE key = ?",
        params![LAST_SYNC_KEY],
        |row| row.get(0),
      )
      .optional()?;
    value.map(|v| parse_datetime(&v)).transpose().map_err(Into::into)
  }

  pub fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), QueueError> {
    let conn = self.db.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
      params![LAST_SYNC_KEY, at.to_rfc3339()],
    )?;
    Ok(())
  }

  fn transition(
    conn: &rusqlite::Connection,
    id: Uuid,
    from: SyncStatus,
    to: SyncStatus,
  ) -> Result<(), QueueError> {
    Self::expect_status(conn, id, from, to)?;
    conn.execute(
      "UPDATE sync_queue SET status = ? WHERE id = ?",
      params![to.as_str(), id.to_string()],
    )?;
    Ok(())
  }

  fn expect_status(
    conn: &rusqlite::Connection,
    id: Uuid,
    from: SyncStatus,
    to: SyncStatus,
  ) -> Result<(), QueueError> {
    let current: Option<String> = conn
      .query_row(
        "SELECT status FROM sync_queue WHERE id = ?",
        params![id.to_string()],
        |row| row.get(0),
      )
      .optional()?;

    match current.as_deref().and_then(SyncStatus::parse) {
      None => Err(QueueError::NotFound(id)),
      Some(status) if status == from => Ok(()),
      Some(status) => Err(QueueError::InvalidTransition {
        id,
        from: status.as_str(),
        to: to.as_str(),
      }),
    }
  }
}

/// Row as stored, before parsing.
struct RawItem {
  id: String,
  action: String,
  endpoint: String,
  method: String,
  payload: Option<Vec<u8>>,
  headers: String,
  created_at: String,
  retry_count: u32,
  max_retries: u32,
  last_error: Option<String>,
  status: String,
}

impl RawItem {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      action: row.get(1)?,
      endpoint: row.get(2)?,
      method: row.get(3)?,
      payload: row.get(4)?,
      headers: row.get(5)?,
      created_at: row.get(6)?,
      retry_count: row.get(7)?,
      max_retries: row.get(8)?,
      last_error: row.get(9)?,
      status: row.get(10)?,
    })
  }

  fn into_item(self) -> Result<SyncQueueItem, StorageError> {
    let corrupt = |what: &str, value: &str| StorageError::Corrupt(format!("bad {} '{}'", what, value));

    Ok(SyncQueueItem {
      id: Uuid::parse_str(&self.id).map_err(|_| corrupt("id", &self.id))?,
      action: SyncAction::parse(&self.action).ok_or_else(|| corrupt("action", &self.action))?,
      endpoint: self.endpoint,
      method: Method::from_bytes(self.method.as_bytes())
        .map_err(|_| corrupt("method", &self.method))?,
      payload: self.payload.map(Bytes::from),
      headers: headers_from_json(&self.headers)?,
      created_at: parse_datetime(&self.created_at)?,
      retry_count: self.retry_count,
      max_retries: self.max_retries,
      last_error: self.last_error,
      status: SyncStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?,
    })
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queue() -> SyncQueue {
    SyncQueue::open(Database::open_in_memory().unwrap(), 3).unwrap()
  }

  fn booking() -> Mutation {
    Mutation::new(SyncAction::Create, "/bookings")
      .with_json(&json!({"activityId": "3", "date": "2025-04-01"}))
  }

  #[test]
  fn test_enqueue_stores_pending_item() {
    let queue = queue();
    let id = queue.enqueue(booking()).unwrap();

    let item = queue.get(id).unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.method, Method::POST);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.max_retries, 3);
    assert_eq!(item.headers[CONTENT_TYPE], "application/json");
    let payload: serde_json::Value = serde_json::from_slice(item.payload.as_ref().unwrap()).unwrap();
    assert_eq!(payload["activityId"], "3");
  }

  #[test]
  fn test_dequeue_is_fifo() {
    let queue = queue();
    let a = queue.enqueue(Mutation::new(SyncAction::Create, "/a")).unwrap();
    let b = queue.enqueue(Mutation::new(SyncAction::Update, "/b")).unwrap();

    assert_eq!(queue.dequeue_next().unwrap().unwrap().id, a);
    queue.mark_in_flight(a).unwrap();
    queue.mark_done(a).unwrap();
    assert_eq!(queue.dequeue_next().unwrap().unwrap().id, b);
  }

  #[test]
  fn test_only_one_item_in_flight() {
    let queue = queue();
    let a = queue.enqueue(Mutation::new(SyncAction::Create, "/a")).unwrap();
    let b = queue.enqueue(Mutation::new(SyncAction::Create, "/b")).unwrap();

    queue.mark_in_flight(a).unwrap();
    let err = queue.mark_in_flight(b).unwrap_err();
    assert!(matches!(err, QueueError::AlreadyInFlight(id) if id == a));
  }

  #[test]
  fn test_mark_done_removes_item() {
    let queue = queue();
    let id = queue.enqueue(booking()).unwrap();
    queue.mark_in_flight(id).unwrap();
    queue.mark_done(id).unwrap();

    assert!(queue.get(id).unwrap().is_none());
    assert!(matches!(queue.mark_done(id), Err(QueueError::NotFound(_))));
  }

  #[test]
  fn test_mark_failed_until_exhausted() {
    let queue = queue();
    let id = queue.enqueue(booking()).unwrap();

    for attempt in 1..=3 {
      queue.mark_in_flight(id).unwrap();
      let status = queue.mark_failed(id, "503 Service Unavailable").unwrap();
      let item = queue.get(id).unwrap().unwrap();
      assert_eq!(item.retry_count, attempt);
      assert!(item.retry_count <= item.max_retries);
      if attempt < 3 {
        assert_eq!(status, SyncStatus::Pending);
      } else {
        assert_eq!(status, SyncStatus::Failed);
      }
    }

    // Failed items are not dequeued
    assert!(queue.dequeue_next().unwrap().is_none());
    let item = queue.get(id).unwrap().unwrap();
    assert_eq!(item.last_error.as_deref(), Some("503 Service Unavailable"));
  }

  #[test]
  fn test_custom_method_and_headers_survive_storage() {
    let queue = queue();
    let method = Method::from_bytes(b"PURGE").unwrap();
    let id = queue
      .enqueue(
        Mutation::new(SyncAction::Delete, "/bookings/cache")
          .with_method(method.clone())
          .with_header("x-device", HeaderValue::from_static("tablet-4")),
      )
      .unwrap();

    let item = queue.get(id).unwrap().unwrap();
    assert_eq!(item.method, method);
    assert_eq!(item.headers["x-device"], "tablet-4");
  }

  #[test]
  fn test_release_keeps_retry_budget() {
    let queue = queue();
    let id = queue.enqueue(booking()).unwrap();
    queue.mark_in_flight(id).unwrap();

    queue.release(id, "Network unavailable: link down").unwrap();

    let item = queue.get(id).unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.last_error.as_deref(), Some("Network unavailable: link down"));
    assert_eq!(queue.dequeue_next().unwrap().unwrap().id, id);
    assert!(matches!(
      queue.release(id, "again"),
      Err(QueueError::InvalidTransition { from: "pending", .. })
    ));
  }

  #[test]
  fn test_manual_retry_resets_count() {
    let queue = queue();
    let id = queue.enqueue(booking()).unwrap();
    queue.mark_in_flight(id).unwrap();
    queue.mark_permanently_failed(id, "404 Not Found").unwrap();

    queue.retry(id).unwrap();

    let item = queue.get(id).unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert!(item.last_error.is_none());
    assert_eq!(queue.dequeue_next().unwrap().unwrap().id, id);
  }

  #[test]
  fn test_retry_requires_failed_status() {
    let queue = queue();
    let id = queue.enqueue(booking()).unwrap();
    let err = queue.retry(id).unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { from: "pending", .. }));
  }

  #[test]
  fn test_list_and_clear_by_status() {
    let queue = queue();
    let a = queue.enqueue(Mutation::new(SyncAction::Create, "/a")).unwrap();
    queue.enqueue(Mutation::new(SyncAction::Delete, "/b")).unwrap();
    queue.mark_in_flight(a).unwrap();
    queue.mark_permanently_failed(a, "400 Bad Request").unwrap();

    assert_eq!(queue.list(None).unwrap().len(), 2);
    assert_eq!(queue.list(Some(SyncStatus::Failed)).unwrap()[0].id, a);
    assert_eq!(
      queue.counts().unwrap(),
      QueueCounts {
        pending: 1,
        in_flight: 0,
        failed: 1
      }
    );

    assert_eq!(queue.clear(Some(SyncStatus::Failed)).unwrap(), 1);
    assert_eq!(queue.list(None).unwrap().len(), 1);
    assert_eq!(queue.clear(None).unwrap(), 1);
    assert!(queue.list(None).unwrap().is_empty());
  }

  #[test]
  fn test_reopen_recovers_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");

    let id = {
      let queue = SyncQueue::open(Database::open(Some(&path)).unwrap(), 3).unwrap();
      let id = queue.enqueue(booking()).unwrap();
      queue.mark_in_flight(id).unwrap();
      id
    };

    let queue = SyncQueue::open(Database::open(Some(&path)).unwrap(), 3).unwrap();
    let item = queue.dequeue_next().unwrap().unwrap();
    assert_eq!(item.id, id);
    assert_eq!(item.status, SyncStatus::Pending);
  }

  #[test]
  fn test_last_synced_at_round_trip() {
    let queue = queue();
    assert!(queue.last_synced_at().unwrap().is_none());

    let now = Utc::now();
    queue.set_last_synced_at(now).unwrap();
    assert_eq!(queue.last_synced_at().unwrap(), Some(now));
  }
}
