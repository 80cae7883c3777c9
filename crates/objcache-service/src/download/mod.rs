//! Service which fetches the resources backing cache entries.
//!
//! A resource is either a file on an HTTP server or a file on the local filesystem, see
//! [`FetchSource`]. The [`CacheStore`](crate::caching::CacheStore) only talks to the
//! [`FetchFile`] trait, so tests and embedders can plug in their own fetcher.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use sentry::SentryFutureExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::{Config, DownloadTimeouts};

mod filesystem;
mod http;

/// Where the bytes of a cache entry come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// An `http` or `https` URL.
    Http(Url),
    /// A file on the local filesystem.
    Filesystem(PathBuf),
}

impl FetchSource {
    /// Parses a user-supplied location.
    ///
    /// `http(s)://` URLs are fetched via HTTP and `file://` URLs are read from the filesystem.
    /// Everything else is treated as a local path.
    pub fn parse(location: &str) -> Self {
        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Http(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Self::Filesystem(path),
                Err(()) => Self::Filesystem(PathBuf::from(location)),
            },
            _ => Self::Filesystem(PathBuf::from(location)),
        }
    }

    /// A short name of the kind of source, used as a metric tag.
    pub fn metric_key(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Filesystem(_) => "filesystem",
        }
    }
}

impl fmt::Display for FetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::Filesystem(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<Url> for FetchSource {
    fn from(url: Url) -> Self {
        Self::Http(url)
    }
}

impl From<PathBuf> for FetchSource {
    fn from(path: PathBuf) -> Self {
        Self::Filesystem(path)
    }
}

/// Writes the bytes of a [`FetchSource`] into a destination file.
///
/// In case of an error, the contents of `destination` are garbage and will be discarded.
/// Implementations must not retry on their own.
pub trait FetchFile: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        source: &'a FetchSource,
        destination: &'a mut File,
    ) -> BoxFuture<'a, CacheContents>;
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::FetchFailed("request timed out".into());
        }
        Self::fetch_failed(&error)
    }
}

/// The default [`FetchFile`] implementation, supporting all kinds of [`FetchSource`].
#[derive(Debug)]
pub struct DownloadService {
    timeouts: DownloadTimeouts,
    http: http::HttpDownloader,
    fs: filesystem::FilesystemDownloader,
}

impl DownloadService {
    pub fn new(config: &Config) -> CacheContents<Arc<Self>> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = crate::utils::http::create_client(&timeouts).map_err(|e| {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "Failed to create HTTP client");
            CacheError::InternalError
        })?;

        Ok(Arc::new(Self {
            timeouts,
            http: http::HttpDownloader::new(client, timeouts),
            fs: filesystem::FilesystemDownloader::new(),
        }))
    }

    /// Fetches `source` into `destination`, bounded by the global download timeout.
    pub async fn download(&self, source: &FetchSource, destination: &mut File) -> CacheContents {
        let source_key = source.metric_key();
        let timeout = self.timeouts.max_download;
        let start = Instant::now();

        let job = async {
            let result = match source {
                FetchSource::Http(url) => self.http.download_source(url, &mut *destination).await,
                FetchSource::Filesystem(path) => {
                    self.fs.download_source(path, &mut *destination).await
                }
            };
            destination.flush().await?;
            result
        };

        let result = match tokio::time::timeout(timeout, job).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::FetchFailed(format!(
                "download timed out after {}",
                humantime_serde::re::humantime::format_duration(timeout)
            ))),
        };

        metric!(timer("service.download.duration") = start.elapsed(), "source" => source_key);

        match &result {
            Ok(()) => tracing::debug!("File `{}` fetched successfully", source),
            Err(err) => {
                tracing::debug!("File `{}` fetching failed: {}", source, err);
                if let CacheError::FetchFailed(_) = err {
                    metric!(counter("service.download.failure") += 1, "source" => source_key);
                }
            }
        }

        result
    }
}

impl FetchFile for DownloadService {
    fn fetch<'a>(
        &'a self,
        source: &'a FetchSource,
        destination: &'a mut File,
    ) -> BoxFuture<'a, CacheContents> {
        self.download(source, destination)
            .bind_hub(sentry::Hub::current())
            .boxed()
    }
}

/// Computes a download timeout based on a content length in bytes and a per-gigabyte timeout.
///
/// Returns at least 10 seconds.
fn content_length_timeout(content_length: u64, timeout_per_gb: Duration) -> Duration {
    let gb = content_length as f64 / (1024.0 * 1024.0 * 1024.0);
    timeout_per_gb.mul_f64(gb).max(Duration::from_secs(10))
}
