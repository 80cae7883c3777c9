//! Bitmap images as cached items.
//!
//! [`ImageCache`] fetches image files into the `images` cache and decodes them into RGBA
//! [`Bitmap`]s, optionally scaled down to a requested decode size.

use crate::caching::TypedCacheLoader;

mod bitmap;

pub use bitmap::{
    Bitmap, BitmapDecoder, BitmapOptions, BitmapProperty, DecodePixelType,
    DEFAULT_MAX_DECODE_PIXELS,
};

/// A [`TypedCacheLoader`] producing [`Bitmap`]s.
pub type ImageCache = TypedCacheLoader<BitmapDecoder>;

#[cfg(test)]
mod tests {
    use futures::future;

    use crate::caching::{Cache, CacheError, CacheName, CacheStore, LoadSource};
    use crate::config::Config;
    use crate::download::{DownloadService, FetchSource};

    use super::*;

    fn image_cache(config: &Config) -> ImageCache {
        let cache = Cache::from_config(CacheName::Images, config, config.caches.images);
        let download_svc = DownloadService::new(config).unwrap();
        TypedCacheLoader::new(CacheStore::new(cache, download_svc), BitmapDecoder::new())
    }

    #[tokio::test]
    async fn test_images_over_http() {
        objcache_test::setup();
        let server = objcache_test::Server::new();
        let dir = objcache_test::tempdir();
        let config = Config {
            cache_dir: dir.path().to_owned(),
            ..Default::default()
        };
        let images = image_cache(&config);

        let url = server.url("/png/16/8/logo.png");
        let requests = (0..4).map(|_| {
            let overrides = vec![("DecodePixelHeight".to_owned(), 4u32.into())];
            images.get(&url, FetchSource::Http(url.clone()), overrides)
        });
        for bitmap in future::join_all(requests).await {
            let bitmap = bitmap.unwrap();
            assert_eq!((bitmap.pixel_width(), bitmap.pixel_height()), (8, 4));
        }
        assert_eq!(server.accesses(), 1);

        // cached on disk, decoded again with different overrides
        let bitmap = images
            .get(&url, FetchSource::Http(url.clone()), vec![])
            .await
            .unwrap();
        assert_eq!((bitmap.pixel_width(), bitmap.pixel_height()), (16, 8));
        assert_eq!(server.accesses(), 0);
    }

    #[tokio::test]
    async fn test_images_reject_non_images() {
        objcache_test::setup();
        let server = objcache_test::Server::new();
        let dir = objcache_test::tempdir();
        let config = Config {
            cache_dir: dir.path().to_owned(),
            ..Default::default()
        };
        let images = image_cache(&config);

        let url = server.url("/garbage_data/not-an-image");
        let result = images.get(&url, FetchSource::Http(url.clone()), vec![]).await;
        assert!(matches!(result, Err(CacheError::InvalidContent(_))));

        let url = server.url("/empty/nothing.png");
        let result = images.get(&url, FetchSource::Http(url.clone()), vec![]).await;
        assert!(matches!(result, Err(CacheError::InvalidContent(_))));

        let url = server.url("/respond_statuscode/404/missing.png");
        let result = images.get(&url, FetchSource::Http(url.clone()), vec![]).await;
        assert_eq!(result.unwrap_err(), CacheError::NotFound);

        assert_eq!(images.store().stats().unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_images_with_scale_factor() {
        objcache_test::setup();
        let dir = objcache_test::tempdir();
        let config = Config {
            cache_dir: dir.path().to_owned(),
            ..Default::default()
        };
        let cache = Cache::from_config(CacheName::Images, &config, config.caches.images);
        let images = TypedCacheLoader::new(
            CacheStore::new(cache, DownloadService::new(&config).unwrap()),
            BitmapDecoder::new().with_scale_factor(2.0),
        );

        let path = dir.path().join("source.png");
        std::fs::write(&path, objcache_test::png_bytes(40, 20)).unwrap();

        let overrides = vec![
            ("Width".to_owned(), 10u32.into()),
            ("DecodePixelType".to_owned(), "Logical".into()),
        ];
        let bitmap = images
            .get("logo", FetchSource::Filesystem(path), overrides)
            .await
            .unwrap();
        assert_eq!((bitmap.pixel_width(), bitmap.pixel_height()), (20, 10));
    }

    #[tokio::test]
    async fn test_images_refuse_oversized_decode() {
        objcache_test::setup();
        let dir = objcache_test::tempdir();
        let config = Config {
            cache_dir: dir.path().to_owned(),
            ..Default::default()
        };
        let images = image_cache(&config);

        let overrides = vec![
            ("Width".to_owned(), u32::MAX.into()),
            ("Height".to_owned(), u32::MAX.into()),
        ];
        let source = LoadSource::Bytes(objcache_test::png_bytes(1, 1).into());
        let result = images.load(source, overrides).await;
        assert!(matches!(result, Err(CacheError::DecodeFailed(_))));
    }
}
