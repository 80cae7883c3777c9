use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture};

use crate::dispatch::{self, ExecutionContext};
use crate::download::FetchSource;

use super::in_flight::InFlight;
use super::store::ContentValidator;
use super::{
    CacheContents, CacheError, CacheKey, CacheName, CacheStore, OverrideValue, PropertyOverrides,
};

/// The raw input an item is decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// An in-memory payload.
    Bytes(Bytes),
    /// A file on disk, which decoders may read through a cheaper native path.
    Path(PathBuf),
}

/// Turns raw payloads into items of one particular type.
pub trait ItemDecoder: Send + Sync + 'static {
    /// The decoded item handed out to callers.
    type Item: Clone + Send + Sync + 'static;

    /// A default instance whose properties are set before decoding.
    type Builder: Send + 'static;

    /// Creates a default builder for `source`.
    fn create(&self, source: &LoadSource) -> Self::Builder;

    /// Assigns `value` to the property called `name`.
    ///
    /// Returns `false` when the property is unknown, read-only, or `value` has the wrong type.
    fn apply_override(
        &self,
        builder: &mut Self::Builder,
        name: &str,
        value: &OverrideValue,
    ) -> bool;

    /// Decodes `source` into an item, using the properties set on `builder`.
    fn decode(
        &self,
        builder: Self::Builder,
        source: LoadSource,
    ) -> BoxFuture<'static, CacheContents<Self::Item>>;

    /// Checks the first bytes of a freshly fetched payload before it is cached.
    ///
    /// Payloads rejected here are never promoted into the cache.
    fn validate(&self, header: &[u8]) -> CacheContents {
        let _ = header;
        Ok(())
    }
}

type MemoryCache<T> = moka::future::Cache<CacheKey, T>;

/// Produces typed items from files in a [`CacheStore`].
///
/// Concurrent requests for the same key are coalesced into one fetch and one decode. Decoded
/// items can additionally be kept in an in-memory cache.
pub struct TypedCacheLoader<D: ItemDecoder> {
    store: CacheStore,
    decoder: Arc<D>,
    context: Option<Arc<dyn ExecutionContext>>,
    decodes: InFlight<D::Item>,
    memory: Option<MemoryCache<D::Item>>,
}

impl<D: ItemDecoder> Clone for TypedCacheLoader<D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            decoder: Arc::clone(&self.decoder),
            context: self.context.clone(),
            decodes: self.decodes.clone(),
            memory: self.memory.clone(),
        }
    }
}

impl<D: ItemDecoder> std::fmt::Debug for TypedCacheLoader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCacheLoader")
            .field("store", &self.store)
            .field("context", &self.context)
            .field("decodes", &self.decodes)
            .field(
                "in-memory items",
                &self.memory.as_ref().map(|m| m.entry_count()),
            )
            .finish()
    }
}

impl<D: ItemDecoder> TypedCacheLoader<D> {
    pub fn new(store: CacheStore, decoder: D) -> Self {
        let decodes = InFlight::new(store.name(), "decode");
        Self {
            store,
            decoder: Arc::new(decoder),
            context: None,
            decodes,
            memory: None,
        }
    }

    /// Runs all item construction on `context`.
    pub fn with_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Keeps up to `capacity` decoded items in memory for at most `ttl`.
    ///
    /// A `capacity` of `0` disables the in-memory cache.
    pub fn with_memory_cache(mut self, capacity: u64, ttl: Duration) -> Self {
        self.memory = (capacity > 0).then(|| {
            MemoryCache::builder()
                .max_capacity(capacity)
                .name(self.store.name().as_ref())
                .time_to_live(ttl)
                .build()
        });
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    fn name(&self) -> CacheName {
        self.store.name()
    }

    fn validator(&self) -> ContentValidator {
        let decoder = Arc::clone(&self.decoder);
        Arc::new(move |header: &[u8]| decoder.validate(header))
    }

    /// Decodes an item from `source`, applying `overrides` to it first.
    ///
    /// Unknown, read-only and blank property names are skipped. An empty payload, or an empty or
    /// missing file, is [`CacheError::NotFound`].
    pub async fn load(
        &self,
        source: LoadSource,
        overrides: PropertyOverrides,
    ) -> CacheContents<D::Item> {
        match &source {
            LoadSource::Bytes(bytes) if bytes.is_empty() => return Err(CacheError::NotFound),
            LoadSource::Bytes(_) => {}
            LoadSource::Path(path) => {
                let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => CacheError::NotFound,
                    _ => e.into(),
                })?;
                if metadata.len() == 0 {
                    return Err(CacheError::NotFound);
                }
            }
        }

        let decoder = Arc::clone(&self.decoder);
        let name = self.name();
        dispatch::run_on(self.context.as_deref(), move || async move {
            let mut builder = decoder.create(&source);
            for (property, value) in &overrides {
                if property.trim().is_empty() {
                    continue;
                }
                if !decoder.apply_override(&mut builder, property, value) {
                    tracing::trace!("Skipping {} property `{}` = {}", name, property, value);
                }
            }
            decoder.decode(builder, source).await
        })
        .await
    }

    /// Returns the item for `key`, fetching and decoding it if necessary.
    ///
    /// When several requests for the same key overlap, all of them observe the item decoded with
    /// the overrides of the first one.
    pub async fn get(
        &self,
        key: impl Into<CacheKey>,
        source: FetchSource,
        overrides: PropertyOverrides,
    ) -> CacheContents<D::Item> {
        self.get_with_max_age(key, source, overrides, None).await
    }

    /// Like [`get`](Self::get), with a custom maximum age for the cached file.
    pub async fn get_with_max_age(
        &self,
        key: impl Into<CacheKey>,
        source: FetchSource,
        overrides: PropertyOverrides,
        max_age: Option<Duration>,
    ) -> CacheContents<D::Item> {
        let key = key.into();
        if let Some(item) = self.get_from_memory(&key).await {
            metric!(counter("caches.memory.hit") += 1, "cache" => self.name().as_ref());
            return Ok(item);
        }

        let this = self.clone();
        self.decodes
            .run_or_join(key.clone(), move || async move {
                this.fetch_and_decode(key, source, overrides, max_age).await
            })
            .await
    }

    async fn fetch_and_decode(
        &self,
        key: CacheKey,
        source: FetchSource,
        overrides: PropertyOverrides,
        max_age: Option<Duration>,
    ) -> CacheContents<D::Item> {
        // The file must survive eviction by other keys until it is decoded.
        let _pin = self.store.pin(&key);
        let entry = self
            .store
            .get_file_validated(key.clone(), source, max_age, self.validator())
            .await?;

        metric!(counter("caches.decode") += 1, "cache" => self.name().as_ref());
        let item = self.load(LoadSource::Path(entry.path.clone()), overrides).await;

        match &item {
            Ok(item) => {
                if let Some(memory) = &self.memory {
                    memory.insert(key, item.clone()).await;
                }
            }
            // The file stays in place, so the next request decodes it again without a fetch.
            Err(err) => tracing::debug!(
                "Decoding {} `{}` at path {} failed: {}",
                self.name(),
                key,
                entry.path.display(),
                err
            ),
        }

        item
    }

    /// Makes sure the file for `key` is cached, without handing out the item.
    ///
    /// With an in-memory cache, the item is decoded with default properties and kept in memory as
    /// well.
    pub async fn precache(&self, key: impl Into<CacheKey>, source: FetchSource) -> CacheContents {
        let key = key.into();
        if self.memory.is_some() {
            self.get(key, source, PropertyOverrides::new()).await?;
        } else {
            self.store
                .get_file_validated(key, source, None, self.validator())
                .await?;
        }
        Ok(())
    }

    /// Returns the decoded item for `key` if it is held in memory.
    pub async fn get_from_memory(&self, key: &CacheKey) -> Option<D::Item> {
        self.memory.as_ref()?.get(key).await
    }

    /// Drops all decoded items held in memory.
    pub fn clear_memory(&self) {
        if let Some(memory) = &self.memory {
            memory.invalidate_all();
        }
    }

    /// Removes `key` (or everything when `None`) from memory and from disk.
    ///
    /// Running decodes of the cleared keys are awaited first, so they cannot put their items
    /// back into memory afterwards.
    pub async fn clear(&self, key: Option<&CacheKey>) -> CacheContents {
        match key {
            Some(key) => {
                if let Some(running) = self.decodes.get(key) {
                    let _ = running.await;
                }
                if let Some(memory) = &self.memory {
                    memory.invalidate(key).await;
                }
            }
            None => {
                future::join_all(self.decodes.all()).await;
                self.clear_memory();
            }
        }
        self.store.clear(key).await
    }
}
