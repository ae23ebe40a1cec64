/// Schema for the response cache and the sync queue.
///
/// `seq` columns are monotonic insertion counters; they give FIFO order even
/// when two rows share a timestamp.
pub const SCHEMA: &str = r#"
-- Cached responses, one row per (partition, key)
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    partition TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    payload BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    UNIQUE (partition, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_partition
    ON cache_entries(partition, seq);

-- Pending mutations awaiting replay
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    action TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    payload BLOB,
    headers TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    last_error TEXT,
    status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status
    ON sync_queue(status, seq);

CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
