//! Loading the bytes of a firmware segment

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{header::CONTENT_TYPE, Client, Response};
use serde::Deserialize;

use crate::{error::FetchError, manifest::SegmentSource};

pub(crate) const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads the bytes behind a [SegmentSource]
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(&self, source: &SegmentSource) -> Result<Vec<u8>, FetchError>;
}

/// Reads local segments from disk and remote segments over HTTP
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        HttpFetcher { client }
    }

    async fn download(&self, url: &url::Url) -> Result<Vec<u8>, FetchError> {
        debug!("GET {url}");
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            let essence = content_type.to_ascii_lowercase();
            if essence.starts_with("application/json") || essence.starts_with("text/html") {
                return Err(FetchError::UnexpectedContentType(content_type.to_string()));
            }
        }

        let expected = response.content_length();
        let bytes = response.bytes().await?;

        match expected {
            Some(expected) if (bytes.len() as u64) < expected => Err(FetchError::Truncated {
                expected,
                got: bytes.len(),
            }),
            _ => Ok(bytes.to_vec()),
        }
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetcher {
    async fn fetch(&self, source: &SegmentSource) -> Result<Vec<u8>, FetchError> {
        let data = match source {
            SegmentSource::Local(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| FetchError::Read {
                        path: path.clone(),
                        source,
                    })?
            }
            SegmentSource::Remote(url) => self.download(url).await?,
        };

        if data.is_empty() {
            return Err(FetchError::Empty);
        }

        Ok(data)
    }
}

#[derive(Deserialize)]
struct RelayFailure {
    error: String,
}

/// Build a status error, preferring the relay's own explanation
async fn status_error(response: Response) -> FetchError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<RelayFailure>(&body)
        .map(|failure| failure.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

    FetchError::Status {
        status: status.as_u16(),
        message,
    }
}
