use crate::chunk::RangeSpec;
use crate::integrity::{ContentHash, IntegrityVerifier};
use crate::release::{HostError, ReleaseHost, RemoteAsset, RemoteRelease};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

const EPOCH: i64 = 1_700_000_000;

struct SimAsset {
    name: String,
    data: Bytes,
    advertised: Option<ContentHash>,
}

struct SimRelease {
    tag_name: String,
    draft: bool,
    prerelease: bool,
    created_at: DateTime<Utc>,
    assets: Vec<SimAsset>,
}

#[derive(Default)]
struct HostState {
    releases: Vec<SimRelease>,
    failing_fetches: u32,
    failing_lists: u32,
    fetches: u64,
}

/// In-memory release host. Releases are published one minute apart in the order
/// they are added, so the last one added is the newest.
#[derive(Default)]
pub struct SimulatedReleaseHost {
    state: Mutex<HostState>,
}

impl SimulatedReleaseHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_release(
        &self,
        tag: &str,
        draft: bool,
        prerelease: bool,
        assets: Vec<(&str, Bytes)>,
    ) {
        let mut state = self.state.lock();
        let created_at = DateTime::from_timestamp(EPOCH, 0).unwrap_or_default()
            + Duration::minutes(state.releases.len() as i64);
        let assets = assets
            .into_iter()
            .map(|(name, data)| SimAsset {
                name: name.to_string(),
                advertised: Some(IntegrityVerifier::calculate_checksum(&data)),
                data,
            })
            .collect();

        state.releases.retain(|r| r.tag_name != tag);
        state.releases.push(SimRelease {
            tag_name: tag.to_string(),
            draft,
            prerelease,
            created_at,
            assets,
        });
    }

    /// Swap the bytes of an asset (or add it) and advertise the new digest.
    pub fn replace_asset(&self, tag: &str, name: &str, data: Bytes) {
        let mut state = self.state.lock();
        let Some(release) = state.releases.iter_mut().find(|r| r.tag_name == tag) else {
            return;
        };
        let advertised = Some(IntegrityVerifier::calculate_checksum(&data));
        match release.assets.iter_mut().find(|a| a.name == name) {
            Some(asset) => {
                asset.data = data;
                asset.advertised = advertised;
            }
            None => release.assets.push(SimAsset {
                name: name.to_string(),
                data,
                advertised,
            }),
        }
    }

    /// Advertise an arbitrary digest, or none at all, without touching the bytes.
    pub fn set_advertised_digest(&self, tag: &str, name: &str, digest: Option<ContentHash>) {
        let mut state = self.state.lock();
        if let Some(asset) = state
            .releases
            .iter_mut()
            .find(|r| r.tag_name == tag)
            .and_then(|r| r.assets.iter_mut().find(|a| a.name == name))
        {
            asset.advertised = digest;
        }
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().failing_fetches = count;
    }

    pub fn fail_next_lists(&self, count: u32) {
        self.state.lock().failing_lists = count;
    }

    /// Successful ranged reads served so far
    pub fn fetch_count(&self) -> u64 {
        self.state.lock().fetches
    }

    fn url(tag: &str, name: &str) -> String {
        format!("sim://{}/{}", tag, name)
    }
}

fn content_type(name: &str) -> &'static str {
    if name.ends_with(".wasm") || name.ends_with(".wasm.gz") {
        "application/wasm"
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        "application/gzip"
    } else if name.ends_with(".tar") {
        "application/x-tar"
    } else {
        "application/octet-stream"
    }
}

#[async_trait]
impl ReleaseHost for SimulatedReleaseHost {
    async fn list_releases(&self) -> Result<Vec<RemoteRelease>, HostError> {
        let mut state = self.state.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(HostError::HttpStatus {
                status: 503,
                url: "sim://releases".to_string(),
            });
        }

        // Newest first, like the real API.
        Ok(state
            .releases
            .iter()
            .rev()
            .map(|release| RemoteRelease {
                tag_name: release.tag_name.clone(),
                name: release.tag_name.clone(),
                draft: release.draft,
                prerelease: release.prerelease,
                created_at: release.created_at,
                published_at: (!release.draft).then_some(release.created_at),
                assets: release
                    .assets
                    .iter()
                    .map(|asset| RemoteAsset {
                        name: asset.name.clone(),
                        content_type: content_type(&asset.name).to_string(),
                        size: asset.data.len() as u64,
                        sha256: asset.advertised,
                        download_url: Self::url(&release.tag_name, &asset.name),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn fetch_range(&self, url: &str, range: RangeSpec) -> Result<Bytes, HostError> {
        let mut state = self.state.lock();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(HostError::Http(format!("simulated failure fetching {}", url)));
        }

        let data = state
            .releases
            .iter()
            .flat_map(|r| r.assets.iter().map(move |a| (r, a)))
            .find(|(r, a)| Self::url(&r.tag_name, &a.name) == url)
            .map(|(_, a)| a.data.clone())
            .ok_or_else(|| HostError::UnknownAsset(url.to_string()))?;

        let len = data.len() as u64;
        if range.start >= len || range.end < range.start {
            return Err(HostError::HttpStatus {
                status: 416,
                url: url.to_string(),
            });
        }
        let end = range.end.min(len - 1);
        state.fetches += 1;
        Ok(data.slice(range.start as usize..=end as usize))
    }
}
