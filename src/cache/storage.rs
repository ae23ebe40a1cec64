//! Cache storage trait and SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::traits::{CacheEntry, CachePartition};
use crate::db::Database;
use crate::error::StorageError;
use crate::http::{headers_from_json, headers_to_json, RequestIdentity};

/// Trait for cache storage backends.
///
/// Callers treat every `StorageError` as a cache miss.
#[async_trait]
pub trait CacheStorage: Send + Sync {
  /// Look up a single entry.
  async fn get(
    &self,
    partition: &CachePartition,
    key: &RequestIdentity,
  ) -> Result<Option<CacheEntry>, StorageError>;

  /// Store an entry, replacing any existing one for the key, then evict the
  /// oldest entries until the partition is within `max_entries`.
  ///
  /// Returns the number of evicted entries.
  async fn put(&self, partition: &CachePartition, entry: CacheEntry) -> Result<usize, StorageError>;

  /// Remove a single entry. Returns whether it existed.
  async fn delete(
    &self,
    partition: &CachePartition,
    key: &RequestIdentity,
  ) -> Result<bool, StorageError>;

  /// Keys in the partition, oldest first.
  async fn keys(&self, partition: &CachePartition) -> Result<Vec<RequestIdentity>, StorageError>;

  /// Drop every entry stored under a partition id.
  async fn delete_partition(&self, partition_id: &str) -> Result<usize, StorageError>;

  /// Ids of all partitions holding at least one entry.
  async fn partitions(&self) -> Result<Vec<String>, StorageError>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

#[async_trait]
impl CacheStorage for NoopStorage {
  async fn get(
    &self,
    _partition: &CachePartition,
    _key: &RequestIdentity,
  ) -> Result<Option<CacheEntry>, StorageError> {
    Ok(None) // Always miss
  }

  async fn put(
    &self,
    _partition: &CachePartition,
    _entry: CacheEntry,
  ) -> Result<usize, StorageError> {
    Ok(0) // Discard
  }

  async fn delete(
    &self,
    _partition: &CachePartition,
    _key: &RequestIdentity,
  ) -> Result<bool, StorageError> {
    Ok(false)
  }

  async fn keys(&self, _partition: &CachePartition) -> Result<Vec<RequestIdentity>, StorageError> {
    Ok(Vec::new())
  }

  async fn delete_partition(&self, _partition_id: &str) -> Result<usize, StorageError> {
    Ok(0)
  }

  async fn partitions(&self) -> Result<Vec<String>, StorageError> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn get(
    &self,
    partition: &CachePartition,
    key: &RequestIdentity,
  ) -> Result<Option<CacheEntry>, StorageError> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, content_type, headers, payload, stored_at FROM cache_entries
         WHERE partition = ? AND cache_key = ?",
        params![partition.id(), key.as_str()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((status, content_type, headers, payload, stored_at)) => {
        let headers = headers_from_json(&headers)?;
        Ok(Some(CacheEntry {
          key: key.clone(),
          status,
          payload: payload.into(),
          content_type,
          headers,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  async fn put(&self, partition: &CachePartition, entry: CacheEntry) -> Result<usize, StorageError> {
    let conn = self.db.conn()?;
    let partition_id = partition.id();
    let headers = headers_to_json(&entry.headers)?;

    let tx = conn.unchecked_transaction()?;

    // REPLACE deletes the old row, so an overwrite takes a fresh seq
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, cache_key, status, content_type, headers, payload, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition_id,
        entry.key.as_str(),
        entry.status,
        entry.content_type,
        headers,
        entry.payload.as_ref(),
        entry.stored_at.to_rfc3339(),
      ],
    )
    .map_err(map_quota)?;

    // FIFO eviction: keep only the newest max_entries rows
    let evicted = tx.execute(
      "DELETE FROM cache_entries
       WHERE partition = ?1 AND seq NOT IN (
         SELECT seq FROM cache_entries WHERE partition = ?1 ORDER BY seq DESC LIMIT ?2
       )",
      params![partition_id, partition.max_entries as i64],
    )?;

    tx.commit()?;

    if evicted > 0 {
      debug!(partition = %partition_id, evicted, "Evicted oldest cache entries");
    }

    Ok(evicted)
  }

  async fn delete(
    &self,
    partition: &CachePartition,
    key: &RequestIdentity,
  ) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE partition = ? AND cache_key = ?",
      params![partition.id(), key.as_str()],
    )?;
    Ok(removed > 0)
  }

  async fn keys(&self, partition: &CachePartition) -> Result<Vec<RequestIdentity>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt =
      conn.prepare("SELECT cache_key FROM cache_entries WHERE partition = ? ORDER BY seq")?;

    let keys = stmt
      .query_map(params![partition.id()], |row| row.get::<_, String>(0))?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(keys.into_iter().map(RequestIdentity::from_key).collect())
  }

  async fn delete_partition(&self, partition_id: &str) -> Result<usize, StorageError> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition_id],
    )?;
    Ok(removed)
  }

  async fn partitions(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare("SELECT DISTINCT partition FROM cache_entries ORDER BY partition")?;
    let ids = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
  }
}

/// SQLITE_FULL surfaces as a quota error rather than a generic backend error.
fn map_quota(e: rusqlite::Error) -> StorageError {
  match e {
    rusqlite::Error::SqliteFailure(ref err, _)
      if err.code == rusqlite::ErrorCode::DiskFull =>
    {
      StorageError::QuotaExceeded(e.to_string())
    }
    other => StorageError::Backend(other),
  }
}

/// Parse an RFC 3339 timestamp written by `put`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}
