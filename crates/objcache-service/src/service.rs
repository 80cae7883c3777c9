//! Wires the caches, the download service and the loaders together according to a [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{CacheStore, Caches, TypedCacheLoader};
use crate::config::Config;
use crate::dispatch::ExecutionContext;
use crate::download::DownloadService;
use crate::images::{BitmapDecoder, ImageCache};

/// All the services built from one [`Config`].
#[derive(Debug, Clone)]
pub struct Services {
    pub config: Config,
    pub caches: Caches,
    pub download_svc: Arc<DownloadService>,
    /// Plain files, handed out as paths into the cache directory.
    pub files: CacheStore,
    /// Decoded bitmaps.
    pub images: ImageCache,
}

impl Services {
    /// Creates all services.
    ///
    /// Temporary files left behind by a previous process are removed. When `context` is given,
    /// images are constructed on it.
    pub fn create(config: Config, context: Option<Arc<dyn ExecutionContext>>) -> Result<Self> {
        let caches = Caches::from_config(&config);
        caches
            .clear_tmp(&config)
            .context("failed to clear tmp caches")?;

        let download_svc =
            DownloadService::new(&config).context("failed to create download service")?;

        let files = CacheStore::new(caches.files.clone(), download_svc.clone());

        let in_memory = &config.caches.in_memory;
        let mut images = TypedCacheLoader::new(
            CacheStore::new(caches.images.clone(), download_svc.clone()),
            BitmapDecoder::new(),
        )
        .with_memory_cache(in_memory.images_capacity, in_memory.images_ttl);
        if let Some(context) = context {
            images = images.with_context(context);
        }

        Ok(Self {
            config,
            caches,
            download_svc,
            files,
            images,
        })
    }
}
