//! Support to fetch from the local filesystem.

use std::io;
use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncWrite;

use crate::caching::{CacheContents, CacheError};

/// Downloader implementation that supports the filesystem source.
#[derive(Debug)]
pub struct FilesystemDownloader {}

impl FilesystemDownloader {
    pub fn new() -> Self {
        Self {}
    }

    /// Copies the file at `path` into `destination`.
    ///
    /// Missing files and directories are reported as [`CacheError::NotFound`].
    pub async fn download_source(
        &self,
        path: &Path,
        mut destination: impl AsyncWrite + Unpin,
    ) -> CacheContents {
        tracing::debug!("Fetching file from {:?}", path);

        let mut file = File::open(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            io::ErrorKind::PermissionDenied => CacheError::FetchFailed("permission denied".into()),
            _ => e.into(),
        })?;
        if !file.metadata().await?.is_file() {
            return Err(CacheError::NotFound);
        }
        tokio::io::copy(&mut file, &mut destination).await?;
        Ok(())
    }
}
