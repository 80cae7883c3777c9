//! # Caching infrastructure
//!
//! Resources are expensive to fetch and to decode, so every resource handed out by this crate
//! goes through the layers described here. This module contains our central [`CacheError`] type
//! and an explanation of how all of this fits together.
//!
//! ## Cache Layers
//!
//! - An optional in-memory layer in [`TypedCacheLoader`] holding decoded items.
//! - A request-coalescing layer: concurrent requests for one key share a single fetch, and a
//!   single decode.
//! - A file-system layer in [`CacheStore`] that keeps the fetched bytes in a flat directory, one
//!   file per key named after the sha-256 hash of the key.
//!
//! A request goes through the following steps:
//! - First, it goes through the in-memory layer, if enabled.
//! - On miss, it attaches to a running decode of the same key, or starts one.
//! - The decode asks the file-system layer for a fresh file. A missing or stale file is fetched
//!   again, again attaching to a running fetch of the same key if there is one.
//! - Fetched bytes are written to a temporary file and atomically moved into place, so a file in
//!   the cache directory is always complete.
//! - The file is decoded, on the configured execution context if there is one.
//!
//! ### Metrics
//!
//! Each metric is tagged with a `cache` field that corresponds to the cache name:
//!
//! - `caches.access`: All accesses of the file-system layer.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.file.hit`: Accesses served by a fresh file.
//! - `caches.file.miss`, `caches.file.stale`: Accesses that needed a fetch.
//! - `caches.fetch`: Actual fetches run against a source.
//! - `caches.coalesced`: Requests that attached to a running fetch or decode.
//! - `caches.decode`: Decodes of a cached file.
//! - `caches.file.size`: A histogram for the size (in bytes) of served or written files.
//! - `caches.capacity.evicted`: Entries removed to stay within `max_entries`.
//! - `caches.size.files`, `caches.size.bytes`: Gauges reported by cleanup and stats.
//!
//! ### Configuration
//!
//! [`Config::caches`] holds one [`CacheConfig`] per cache. The `retention` is measured either from
//! the last access of a file ("time to idle", the default) or from its last modification ("time to
//! live"), see [`StalenessSource`]. Empty files are always stale. `max_entries` bounds the number
//! of files, evicting the least recently accessed ones.
//!
//! Configuration can be changed at runtime with [`CacheStore::set_config`]; operations that are
//! already running keep the configuration they started with.
//!
//! [`Config::caches`]: crate::config::Config::caches
//! [`CacheConfig`]: crate::config::CacheConfig
//! [`StalenessSource`]: crate::config::StalenessSource

use crate::config::Config;

mod cache_error;
mod cache_key;
mod cleanup;
mod config;
mod fs;
mod in_flight;
mod loader;
mod overrides;
mod store;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::CacheKey;
pub use cleanup::{CacheStats, CleanupStats};
pub use config::CacheName;
pub use fs::{Cache, CacheEntry};
pub use loader::{ItemDecoder, LoadSource, TypedCacheLoader};
pub use overrides::{OverrideValue, PropertyOverrides};
pub use store::{CacheStore, ContentValidator};

/// All the caches backing the services.
#[derive(Debug, Clone)]
pub struct Caches {
    /// Caches for downloaded images.
    pub images: Cache,
    /// Caches for plain downloaded files.
    pub files: Cache,
}

impl Caches {
    pub fn from_config(config: &Config) -> Self {
        Self {
            images: Cache::from_config(CacheName::Images, config, config.caches.images),
            files: Cache::from_config(CacheName::Files, config, config.caches.files),
        }
    }
}
