//! The transport used to perform a single network request.

use std::fmt;

use async_trait::async_trait;
use reqwest::header;

use crate::error::LoadError;
use crate::types::RawResource;
use crate::utils::http::{ClientTimeouts, create_client};

/// One outgoing request as seen by a [`Fetcher`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// A bearer token to attach as `Authorization` header.
    pub bearer_token: Option<String>,
}

/// Performs exactly one request, without retries or caching.
///
/// The loader enforces timeouts and cancellation around every call, implementations
/// only need to map transport failures to [`LoadError`].
#[async_trait]
pub trait Fetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, request: FetchRequest) -> Result<RawResource, LoadError>;
}

/// The default [`Fetcher`], backed by a shared [`reqwest::Client`].
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn with_timeouts(timeouts: &ClientTimeouts) -> Result<Self, LoadError> {
        let client = create_client(timeouts)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[tracing::instrument(level = "trace", skip_all, fields(url = %request.url))]
    async fn fetch(&self, request: FetchRequest) -> Result<RawResource, LoadError> {
        let mut builder = self.client.get(&request.url);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "unexpected status code");
            return Err(LoadError::Transport {
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status code")
                    .to_owned(),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?;

        Ok(RawResource { content_type, body })
    }
}
