use crate::chunk::RangeSpec;
use crate::config::ReleaseHostConfig;
use crate::integrity::ContentHash;
use crate::release::error::HostError;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;

/// Release metadata as advertised by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRelease {
    pub tag_name: String,
    pub name: String,
    pub draft: bool,
    pub prerelease: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub assets: Vec<RemoteAsset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAsset {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: Option<ContentHash>,
    pub download_url: String,
}

/// Where releases and their asset bytes come from.
#[async_trait]
pub trait ReleaseHost: Send + Sync {
    async fn list_releases(&self) -> Result<Vec<RemoteRelease>, HostError>;

    /// Fetch exactly the bytes of `range` from an asset download URL.
    async fn fetch_range(&self, url: &str, range: RangeSpec) -> Result<Bytes, HostError>;
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    #[serde(default)]
    content_type: Option<String>,
    size: u64,
    /// `sha256:<hex>`, absent on older uploads
    #[serde(default)]
    digest: Option<String>,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    created_at: DateTime<Utc>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

impl From<GitHubRelease> for RemoteRelease {
    fn from(release: GitHubRelease) -> Self {
        let assets = release
            .assets
            .into_iter()
            .map(|asset| RemoteAsset {
                sha256: asset
                    .digest
                    .as_deref()
                    .and_then(|d| ContentHash::parse_digest(d).ok()),
                name: asset.name,
                content_type: asset
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: asset.size,
                download_url: asset.browser_download_url,
            })
            .collect();

        Self {
            name: release.name.unwrap_or_else(|| release.tag_name.clone()),
            tag_name: release.tag_name,
            draft: release.draft,
            prerelease: release.prerelease,
            created_at: release.created_at,
            published_at: release.published_at,
            assets,
        }
    }
}

/// `ReleaseHost` backed by the GitHub releases REST API.
pub struct GitHubReleaseHost {
    client: reqwest::Client,
    config: ReleaseHostConfig,
}

impl GitHubReleaseHost {
    pub fn new(config: ReleaseHostConfig) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client, config })
    }

    fn releases_url(&self, page: usize) -> String {
        format!(
            "{}/repos/{}/{}/releases?per_page={}&page={}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            PAGE_SIZE,
            page
        )
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(url)
            .header(USER_AGENT, &self.config.user_agent);
        match &self.config.token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn list_page(&self, page: usize) -> Result<Vec<GitHubRelease>, HostError> {
        let url = self.releases_url(page);
        let resp = self
            .request(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HostError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        resp.json::<Vec<GitHubRelease>>()
            .await
            .map_err(|e| HostError::InvalidResponse(e.to_string()))
    }

    async fn list_all(&self) -> Result<Vec<RemoteRelease>, HostError> {
        let mut releases = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch = self.list_page(page).await?;
            let last = batch.len() < PAGE_SIZE;
            releases.extend(batch.into_iter().map(RemoteRelease::from));
            if last {
                break;
            }
        }
        Ok(releases)
    }
}

#[async_trait]
impl ReleaseHost for GitHubReleaseHost {
    async fn list_releases(&self) -> Result<Vec<RemoteRelease>, HostError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(Duration::from_millis(self.config.list_max_elapsed_ms)),
            ..Default::default()
        };

        loop {
            match self.list_all().await {
                Ok(releases) => return Ok(releases),
                Err(e) if e.is_retryable() => match backoff.next_backoff() {
                    Some(duration) => {
                        tracing::warn!(
                            "Listing releases failed, retrying in {:?}: {}",
                            duration,
                            e
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_range(&self, url: &str, range: RangeSpec) -> Result<Bytes, HostError> {
        let resp = self
            .request(url)
            .header(ACCEPT, "application/octet-stream")
            .header(RANGE, range.to_header_value())
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(HostError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let expected = range.len();
        let advertised = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        // A 200 means the server ignored the range and sent the whole body
        if status == StatusCode::OK && range.start != 0 {
            return Err(HostError::InvalidResponse(format!(
                "range {} ignored by {}",
                range.to_header_value(),
                url
            )));
        }
        if status == StatusCode::PARTIAL_CONTENT {
            if let Some(len) = advertised {
                if len != expected {
                    return Err(HostError::ShortRead {
                        expected,
                        actual: len,
                    });
                }
            }
        }

        let mut body = resp.bytes().await?;
        if status == StatusCode::OK && body.len() as u64 > expected {
            body.truncate(expected as usize);
        }
        if body.len() as u64 != expected {
            return Err(HostError::ShortRead {
                expected,
                actual: body.len() as u64,
            });
        }
        Ok(body)
    }
}
