//! Single-flight, stale-tolerant caching for directory lookups.
//!
//! This module provides the concurrency core of memberd:
//! - At most one in-flight refresh per key; concurrent lookups share it
//! - Optimistic reads that accept a stale value instead of waiting
//! - A durable backing store used to warm the cache across restarts

mod entry;
mod layer;
mod storage;

pub use entry::CacheEntry;
pub use layer::{Lookup, ReadHandle, SingleFlightCache};
pub use storage::{CacheStore, MemoryStore, SqliteStore};
