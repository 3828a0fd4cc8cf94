use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};

/// Timeouts of the HTTP client.
///
/// The per-attempt timeout of a load is enforced by the loader itself, `request`
/// only acts as a backstop for connections the loader forgot about.
#[derive(Copy, Clone, Debug)]
pub struct ClientTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one request.
    pub request: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            request: Duration::from_secs(120),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The client sends a `User-Agent` identifying the loader and transparently decodes
/// compressed responses.
pub fn create_client(timeouts: &ClientTimeouts) -> reqwest::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(concat!("resource-loader/", env!("CARGO_PKG_VERSION"))),
    );

    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .default_headers(headers)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
