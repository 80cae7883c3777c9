use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use filetime::FileTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::config::CacheConfig;
use crate::download::{FetchFile, FetchSource};
use crate::utils::defer::{DeferGuard, defer};

use super::fs::CacheEntry;
use super::in_flight::InFlight;
use super::{Cache, CacheContents, CacheError, CacheKey, CacheName};

/// A check run on the first bytes of a freshly fetched payload before it is promoted.
///
/// Returning an error rejects the payload: it is discarded and a previously cached file for the
/// same key stays untouched.
pub type ContentValidator = Arc<dyn Fn(&[u8]) -> CacheContents + Send + Sync>;

/// Number of leading bytes a [`ContentValidator`] gets to see.
const VALIDATION_HEADER_LEN: u64 = 1024;

/// Result of looking an entry up on disk.
enum Lookup {
    Fresh(CacheEntry),
    Stale,
    Missing,
}

/// Maps logical keys to files in one cache directory and keeps those files fresh.
///
/// Concurrent requests for the same key are coalesced: at most one fetch per key is running at
/// any time and every request observes its result.
#[derive(Clone)]
pub struct CacheStore {
    cache: Cache,
    fetcher: Arc<dyn FetchFile>,
    pub(super) fetches: InFlight<CacheEntry>,
    /// Keys whose files are in use outside of a fetch, with a use count.
    pins: Arc<Mutex<HashMap<CacheKey, usize>>>,
    /// Promotions hold this for reading, clearing the whole directory holds it for writing.
    pub(super) dir_lock: Arc<RwLock<()>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("cache", &self.cache)
            .field("fetches", &self.fetches)
            .finish()
    }
}

impl CacheStore {
    pub fn new(cache: Cache, fetcher: Arc<dyn FetchFile>) -> Self {
        let fetches = InFlight::new(cache.name(), "fetch");
        Self {
            cache,
            fetcher,
            fetches,
            pins: Default::default(),
            dir_lock: Default::default(),
        }
    }

    /// Protects the entry for `key` from capacity and expiry eviction until the guard is dropped.
    ///
    /// Explicit removal through [`clear`](Self::clear) or [`remove`](Self::remove) still applies.
    pub fn pin(&self, key: &CacheKey) -> DeferGuard<impl FnOnce() + Send + use<>> {
        *self
            .pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default() += 1;

        let pins = Arc::clone(&self.pins);
        let key = key.clone();
        defer(move || {
            let mut pins = pins.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(count) = pins.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(&key);
                }
            }
        })
    }

    /// The file names of all entries with a running fetch or a pin.
    pub(super) fn busy_entries(&self) -> HashSet<String> {
        let mut busy: HashSet<_> = self.fetches.file_names().into_iter().collect();
        let pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        busy.extend(pins.keys().map(CacheKey::file_name));
        busy
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn name(&self) -> CacheName {
        self.cache.name()
    }

    /// Returns a snapshot of the current configuration.
    pub fn config(&self) -> CacheConfig {
        self.cache.config()
    }

    /// Replaces the configuration. Running operations are not affected.
    pub fn set_config(&self, config: CacheConfig) {
        self.cache.set_config(config)
    }

    /// Modifies the configuration in place. Running operations are not affected.
    pub fn update_config(&self, f: impl FnOnce(&mut CacheConfig)) {
        self.cache.update_config(f)
    }

    /// Returns a fresh file for `key`, fetching it from `source` if it is missing or stale.
    ///
    /// An entry is stale when it is empty, or when it is older than `max_age`, falling back to the
    /// configured retention.
    pub async fn get_file(
        &self,
        key: impl Into<CacheKey>,
        source: FetchSource,
        max_age: Option<Duration>,
    ) -> CacheContents<CacheEntry> {
        self.get_file_inner(key.into(), source, max_age, None).await
    }

    /// Like [`get_file`](Self::get_file), but a fetched payload must pass `validator` before
    /// it is promoted into the cache.
    pub async fn get_file_validated(
        &self,
        key: impl Into<CacheKey>,
        source: FetchSource,
        max_age: Option<Duration>,
        validator: ContentValidator,
    ) -> CacheContents<CacheEntry> {
        self.get_file_inner(key.into(), source, max_age, Some(validator))
            .await
    }

    /// Returns the entry for `key` if it exists on disk, without fetching or checking staleness.
    pub fn get_cached_file(&self, key: impl Into<CacheKey>) -> CacheContents<Option<CacheEntry>> {
        Ok(self.cache.open_entry(&key.into())?)
    }

    async fn get_file_inner(
        &self,
        key: CacheKey,
        source: FetchSource,
        max_age: Option<Duration>,
        validator: Option<ContentValidator>,
    ) -> CacheContents<CacheEntry> {
        let name = self.cache.name();
        metric!(counter("caches.access") += 1, "cache" => name.as_ref());

        if !self.fetches.contains(&key) {
            match self.lookup(&key, max_age)? {
                Lookup::Fresh(entry) => {
                    metric!(counter("caches.file.hit") += 1, "cache" => name.as_ref());
                    metric!(
                        time_raw("caches.file.size") = entry.size_bytes,
                        "hit" => "true",
                        "cache" => name.as_ref(),
                    );
                    return Ok(entry);
                }
                Lookup::Stale => {
                    metric!(counter("caches.file.stale") += 1, "cache" => name.as_ref());
                }
                Lookup::Missing => {
                    metric!(counter("caches.file.miss") += 1, "cache" => name.as_ref());
                }
            }
        }

        let this = self.clone();
        self.fetches
            .run_or_join(key.clone(), move || async move {
                // Another fetch could have completed between the lookup above and joining the
                // ledger, so check once more before going to the source.
                if let Lookup::Fresh(entry) = this.lookup(&key, max_age)? {
                    return Ok(entry);
                }
                this.fetch(key, &source, validator).await
            })
            .await
    }

    /// Looks up the entry for `key` on disk, touching it if it is fresh.
    fn lookup(&self, key: &CacheKey, max_age: Option<Duration>) -> CacheContents<Lookup> {
        let name = self.cache.name();
        let Some(mut entry) = self.cache.open_entry(key)? else {
            tracing::trace!("No {} entry for `{}`", name, key);
            return Ok(Lookup::Missing);
        };

        if self.cache.is_stale(&entry, max_age) {
            tracing::trace!("Stale {} entry at path {}", name, entry.path.display());
            return Ok(Lookup::Stale);
        }

        match self.cache.touch(&mut entry) {
            Ok(()) => {}
            // removed concurrently
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Lookup::Missing),
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %entry.path.display(),
                    "Failed to update access time",
                );
            }
        }

        tracing::trace!("Using {} entry at path {}", name, entry.path.display());
        Ok(Lookup::Fresh(entry))
    }

    /// Fetches `source` into a temporary file and atomically promotes it to the entry for `key`.
    ///
    /// This does not deduplicate concurrent requests, see [`get_file`](Self::get_file).
    async fn fetch(
        &self,
        key: CacheKey,
        source: &FetchSource,
        validator: Option<ContentValidator>,
    ) -> CacheContents<CacheEntry> {
        let name = self.cache.name();
        metric!(
            counter("caches.fetch") += 1,
            "cache" => name.as_ref(),
            "source" => source.metric_key(),
        );

        let temp_file = self.cache.tempfile()?;
        let mut destination = tokio::fs::File::from_std(temp_file.reopen()?);

        if let Err(err) = self.fetcher.fetch(source, &mut destination).await {
            tracing::debug!("Fetching {} `{}` from `{}` failed: {}", name, key, source, err);
            return Err(err);
        }
        destination.flush().await?;
        drop(destination);

        let size = temp_file.as_file().metadata()?.len();
        if size == 0 {
            return Err(CacheError::InvalidContent("empty payload".into()));
        }

        if let Some(validator) = validator {
            let mut header = Vec::new();
            temp_file
                .reopen()?
                .take(VALIDATION_HEADER_LEN)
                .read_to_end(&mut header)?;
            if let Err(err) = validator(&header) {
                tracing::debug!("Rejected {} payload for `{}`: {}", name, key, err);
                return Err(err);
            }
        }

        let path = self.cache.entry_path(&key);
        let entry = {
            let _promotion = self.dir_lock.read().await;
            tracing::trace!("Creating {} at path {}", name, path.display());

            sentry::configure_scope(|scope| {
                scope.set_extra(
                    &format!("cache.{name}.cache_path"),
                    path.to_string_lossy().into(),
                );
            });

            let file = self.cache.persist_tempfile(temp_file, &path)?;
            let now = FileTime::now();
            filetime::set_file_handle_times(&file, Some(now), Some(now))?;
            CacheEntry::from_metadata(key, path, &file.metadata()?)?
        };

        metric!(
            time_raw("caches.file.size") = entry.size_bytes,
            "hit" => "false",
            "cache" => name.as_ref(),
        );

        let config = self.cache.config();
        if config.enforce_capacity_on_write && config.max_entries.is_some() {
            // The fresh entry is part of the fetch ledger while this runs, so it is never
            // evicted by its own promotion.
            if let Err(e) = self.enforce_capacity().await {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to enforce {} capacity",
                    name,
                );
            }
        }

        Ok(entry)
    }
}
