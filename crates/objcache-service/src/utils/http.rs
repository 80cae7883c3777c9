use std::time::Duration;

use reqwest::redirect;

use crate::config::DownloadTimeouts;

/// The `User-Agent` sent with every fetch.
pub const USER_AGENT: &str = concat!("objcache/", env!("CARGO_PKG_VERSION"));

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The client decompresses responses transparently and follows up to 10 redirects.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(10))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_fetches_from_server() {
        objcache_test::setup();

        let server = objcache_test::Server::new();

        let response = create_client(&Default::default())
            .unwrap()
            .get(server.url("/files/hello.txt"))
            .send()
            .await
            .unwrap();

        assert!(response.status().is_success());
        let text = response.text().await.unwrap();
        assert_eq!(text, "hello world\n");
    }
}
