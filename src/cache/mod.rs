//! Persistent response cache.
//!
//! This module provides the bounded, partitioned store behind the caching
//! strategies:
//! - One entry per request identity within a versioned partition
//! - FIFO eviction down to each partition's `max_entries` after every put
//! - Whole-partition deletion when a new version activates

mod storage;
mod traits;

pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheEntry, CachePartition, CacheSource, Served};
