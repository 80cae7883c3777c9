//! Support to download from HTTP sources.

use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::DownloadTimeouts;

use super::content_length_timeout;

/// Downloader implementation that supports the HTTP source.
#[derive(Debug)]
pub struct HttpDownloader {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpDownloader {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Downloads a file hosted on an HTTP server.
    ///
    /// Responses map onto errors as follows: `401` and `403` fail the fetch, any other `4xx`
    /// means the file does not exist, and everything else that is not a `2xx` fails the fetch.
    pub async fn download_source(&self, url: &Url, destination: &mut File) -> CacheContents {
        tracing::debug!("Fetching file from `{}`", url);

        let request = self.client.get(url.clone()).send();
        let timeout = self.timeouts.head;
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| {
                CacheError::FetchFailed(format!(
                    "no response headers after {}",
                    humantime_serde::re::humantime::format_duration(timeout)
                ))
            })??;

        let status = response.status();
        if status.is_success() {
            tracing::trace!("Success hitting `{}`", url);

            let timeout = response
                .content_length()
                .map(|len| content_length_timeout(len, self.timeouts.streaming));
            let mut stream = std::pin::pin!(response.bytes_stream().map_err(CacheError::from));

            let copy = async {
                while let Some(chunk) = stream.try_next().await? {
                    destination.write_all(&chunk).await?;
                }
                Ok::<_, CacheError>(())
            };

            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, copy).await.map_err(|_| {
                    CacheError::FetchFailed(format!(
                        "body not received after {}",
                        humantime_serde::re::humantime::format_duration(timeout)
                    ))
                })?,
                None => copy.await,
            }
        } else if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
            tracing::debug!("Insufficient permissions to download `{}`: {}", url, status);
            Err(CacheError::FetchFailed(format!("permission denied: {status}")))
        } else if status.is_client_error() {
            // If it's a client error, chances are it's a 404.
            tracing::debug!("Unexpected client error status code from `{}`: {}", url, status);
            Err(CacheError::NotFound)
        } else {
            tracing::debug!("Unexpected status code from `{}`: {}", url, status);
            Err(CacheError::FetchFailed(status.to_string()))
        }
    }
}
