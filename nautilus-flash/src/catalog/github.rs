use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{Asset, Release, ReleaseSource};
use crate::{error::CatalogError, fetch::USER_AGENT};

/// The public GitHub REST API
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const TIMEOUT: Duration = Duration::from_secs(30);

/// Lists the releases of a GitHub repository
#[derive(Debug, Clone)]
pub struct GitHubReleases {
    client: Client,
    url: Url,
}

impl GitHubReleases {
    /// `repository` is given as `owner/repo`
    pub fn new(repository: &str, api_url: &str) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(TIMEOUT)
            .build()?;

        Self::with_client(client, repository, api_url)
    }

    pub fn with_client(
        client: Client,
        repository: &str,
        api_url: &str,
    ) -> Result<Self, CatalogError> {
        let (owner, repo) = repository
            .split_once('/')
            .filter(|(owner, repo)| {
                !owner.is_empty() && !repo.is_empty() && !repo.contains('/')
            })
            .ok_or_else(|| CatalogError::InvalidRepository(repository.to_string()))?;

        let mut url = Url::parse(api_url)?;
        url.path_segments_mut()
            .map_err(|_| CatalogError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["repos", owner, repo, "releases"]);

        Ok(GitHubReleases { client, url })
    }

    /// The endpoint releases are listed from
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleases {
    async fn list(&self) -> Result<Vec<Release>, CatalogError> {
        debug!("GET {}", self.url);

        let response = self
            .client
            .get(self.url.clone())
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let exhausted = response
                .headers()
                .get("x-ratelimit-remaining")
                .is_some_and(|remaining| remaining == "0");

            return Err(
                if exhausted
                    && matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS)
                {
                    CatalogError::RateLimited
                } else {
                    CatalogError::Status(status.as_u16())
                },
            );
        }

        let releases = response.json::<Vec<ReleaseJson>>().await?;

        Ok(releases.into_iter().map(Release::from).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    #[serde(default)]
    name: Option<String>,
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<AssetJson>,
}

#[derive(Debug, Deserialize)]
struct AssetJson {
    name: String,
    browser_download_url: Url,
}

impl From<ReleaseJson> for Release {
    fn from(json: ReleaseJson) -> Self {
        Release {
            name: json.name.unwrap_or_default(),
            tag: json.tag_name,
            prerelease: json.prerelease,
            assets: json
                .assets
                .into_iter()
                .map(|asset| Asset {
                    name: asset.name,
                    download_url: asset.browser_download_url,
                })
                .collect(),
        }
    }
}
