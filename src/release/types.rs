use crate::extract::types::ExtractionCursor;
use crate::integrity::{frontend_digest, ContentHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    NotStarted,
    Downloading {
        chunks_completed: u64,
        chunks_error: u64,
        chunks_total: u64,
    },
    Completed {
        size: u64,
    },
    Error {
        message: String,
    },
}

impl DownloadStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadStatus::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DownloadStatus::Error { .. })
    }

    /// Still owed work by the downloader
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            DownloadStatus::NotStarted | DownloadStatus::Downloading { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionStatus {
    Idle,
    Decoding { processed: u64, total: u64 },
    Complete { files: Vec<FileManifestEntry> },
}

impl ExtractionStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, ExtractionStatus::Complete { .. })
    }

    pub fn files(&self) -> Option<&[FileManifestEntry]> {
        match self {
            ExtractionStatus::Complete { files } => Some(files),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    /// Normalized path inside the archive, without a leading slash
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub sha256: ContentHash,
    /// Offset of the entry data inside the decoded archive
    pub offset: u64,
}

impl FileManifestEntry {
    /// Resource-fork shadows and `__MACOSX/` trees written by archivers on some platforms.
    pub fn is_platform_metadata(&self) -> bool {
        let basename = self.key.rsplit('/').next().unwrap_or(&self.key);
        basename.starts_with("._") || self.key.starts_with("__MACOSX/")
    }

    /// Key under which the file is served by a storage instance.
    pub fn asset_key(&self) -> String {
        format!("/{}", self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// The compiled module installed on the instance
    Module,
    Archive(ArchiveFormat),
    Other,
}

impl AssetKind {
    pub fn classify(name: &str, content_type: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".wasm") || lower.ends_with(".wasm.gz") {
            AssetKind::Module
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            AssetKind::Archive(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") || content_type == "application/x-tar" {
            AssetKind::Archive(ArchiveFormat::Tar)
        } else if content_type == "application/x-gtar" {
            AssetKind::Archive(ArchiveFormat::TarGz)
        } else {
            AssetKind::Other
        }
    }
}

/// Retry bookkeeping of an asset download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Consecutive transport failures of the current chunk
    pub attempts: u32,
    /// Full downloads whose digest did not match
    #[serde(default)]
    pub verification_failures: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: Option<ContentHash>,
    pub download_url: String,
    pub download_status: DownloadStatus,
    pub extraction_status: Option<ExtractionStatus>,
    /// Bumped on every invalidation so in-flight work on stale bytes can be discarded
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub retry: RetryState,
    #[serde(default)]
    pub extraction_cursor: Option<ExtractionCursor>,
}

impl Asset {
    pub fn new(
        name: String,
        content_type: String,
        size: u64,
        sha256: Option<ContentHash>,
        download_url: String,
    ) -> Self {
        let extraction_status = match AssetKind::classify(&name, &content_type) {
            AssetKind::Archive(_) => Some(ExtractionStatus::Idle),
            _ => None,
        };
        Self {
            name,
            content_type,
            size,
            sha256,
            download_url,
            download_status: DownloadStatus::NotStarted,
            extraction_status,
            generation: 0,
            retry: RetryState::default(),
            extraction_cursor: None,
        }
    }

    pub fn kind(&self) -> AssetKind {
        AssetKind::classify(&self.name, &self.content_type)
    }

    pub fn is_archive(&self) -> bool {
        matches!(self.kind(), AssetKind::Archive(_))
    }

    /// Throw away every byte-derived state so the asset is fetched again from scratch.
    pub fn invalidate(&mut self) {
        self.download_status = DownloadStatus::NotStarted;
        if self.is_archive() {
            self.extraction_status = Some(ExtractionStatus::Idle);
        }
        self.extraction_cursor = None;
        self.retry = RetryState::default();
        self.generation += 1;
    }

    pub fn manifest(&self) -> Option<&[FileManifestEntry]> {
        self.extraction_status.as_ref().and_then(|s| s.files())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    pub name: String,
    pub draft: bool,
    pub prerelease: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub assets: Vec<Asset>,
}

impl Release {
    pub fn is_downloaded(&self) -> bool {
        !self.assets.is_empty() && self.assets.iter().all(|a| a.download_status.is_completed())
    }

    pub fn is_deployment_ready(&self) -> bool {
        self.is_downloaded()
            && self.assets.iter().all(|a| match &a.extraction_status {
                Some(status) => status.is_complete(),
                None => true,
            })
            && self.module_asset().is_some()
    }

    pub fn module_asset(&self) -> Option<&Asset> {
        self.assets.iter().find(|a| a.kind() == AssetKind::Module)
    }

    pub fn frontend_asset(&self) -> Option<&Asset> {
        self.assets.iter().find(|a| a.is_archive())
    }

    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.name == name)
    }

    pub fn asset_mut(&mut self, name: &str) -> Option<&mut Asset> {
        self.assets.iter_mut().find(|a| a.name == name)
    }

    /// Hash of the downloaded module, once verified.
    pub fn module_hash(&self) -> Option<ContentHash> {
        let asset = self.module_asset()?;
        if !asset.download_status.is_completed() {
            return None;
        }
        asset.sha256
    }

    /// Files an instance serves for this release, platform metadata excluded.
    pub fn frontend_files(&self) -> Vec<&FileManifestEntry> {
        self.frontend_asset()
            .and_then(|a| a.manifest())
            .map(|files| files.iter().filter(|f| !f.is_platform_metadata()).collect())
            .unwrap_or_default()
    }

    pub fn frontend_digest(&self) -> Option<ContentHash> {
        self.frontend_asset()?.manifest()?;
        let files = self.frontend_files();
        let keys: Vec<String> = files.iter().map(|f| f.asset_key()).collect();
        Some(frontend_digest(
            keys.iter().map(String::as_str).zip(files.iter().map(|f| &f.sha256)),
        ))
    }

    /// Ordering used to pick the newest release: publication time, then tag.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.published_at.unwrap_or(self.created_at), &self.tag_name)
    }
}

/// Identifies one asset of one release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    pub tag: String,
    pub name: String,
}

impl AssetKey {
    pub fn new(tag: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tag, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetFullStatus {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub download_status: DownloadStatus,
    pub extraction_status: Option<ExtractionStatus>,
}

impl From<&Asset> for AssetFullStatus {
    fn from(asset: &Asset) -> Self {
        Self {
            name: asset.name.clone(),
            content_type: asset.content_type.clone(),
            size: asset.size,
            sha256: asset.sha256.map(|h| h.to_digest()),
            download_status: asset.download_status.clone(),
            extraction_status: asset.extraction_status.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseFullStatus {
    pub tag_name: String,
    pub name: String,
    pub draft: bool,
    pub prerelease: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub is_downloaded: bool,
    pub is_deployment_ready: bool,
    pub assets: Vec<AssetFullStatus>,
}

impl From<&Release> for ReleaseFullStatus {
    fn from(release: &Release) -> Self {
        Self {
            tag_name: release.tag_name.clone(),
            name: release.name.clone(),
            draft: release.draft,
            prerelease: release.prerelease,
            created_at: release.created_at,
            published_at: release.published_at,
            is_downloaded: release.is_downloaded(),
            is_deployment_ready: release.is_deployment_ready(),
            assets: release.assets.iter().map(AssetFullStatus::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasesFullStatus {
    pub releases_count: u64,
    pub pending_downloads: u64,
    pub completed_downloads: u64,
    pub failed_downloads: u64,
    pub has_downloaded_release: bool,
    pub has_deployment_ready_release: bool,
    pub default_version_key: Option<String>,
    pub releases: Vec<ReleaseFullStatus>,
}

/// Outcome of one catalog refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub added_releases: usize,
    pub added_assets: usize,
    pub invalidated_assets: usize,
    pub retried_assets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::IntegrityVerifier;

    fn entry(key: &str, data: &[u8]) -> FileManifestEntry {
        FileManifestEntry {
            key: key.to_string(),
            size: data.len() as u64,
            content_type: "text/plain".to_string(),
            sha256: IntegrityVerifier::calculate_checksum(data),
            offset: 0,
        }
    }

    #[test]
    fn test_asset_classification() {
        assert_eq!(AssetKind::classify("vault.wasm.gz", ""), AssetKind::Module);
        assert_eq!(
            AssetKind::classify("frontend.tar.gz", "application/gzip"),
            AssetKind::Archive(ArchiveFormat::TarGz)
        );
        assert_eq!(
            AssetKind::classify("bundle", "application/x-tar"),
            AssetKind::Archive(ArchiveFormat::Tar)
        );
        assert_eq!(AssetKind::classify("notes.txt", "text/plain"), AssetKind::Other);
    }

    #[test]
    fn test_platform_metadata() {
        assert!(entry("._index.html", b"").is_platform_metadata());
        assert!(entry("assets/._app.js", b"").is_platform_metadata());
        assert!(entry("__MACOSX/assets/app.js", b"").is_platform_metadata());
        assert!(!entry("assets/app.js", b"").is_platform_metadata());
        assert!(!entry("assets/_app.js", b"").is_platform_metadata());
    }

    #[test]
    fn test_deployment_ready_requires_extraction() {
        let mut release = Release {
            tag_name: "v1".into(),
            name: "v1".into(),
            draft: false,
            prerelease: false,
            created_at: Utc::now(),
            published_at: None,
            assets: vec![
                Asset::new("vault.wasm".into(), String::new(), 4, None, String::new()),
                Asset::new("frontend.tar".into(), String::new(), 4, None, String::new()),
            ],
        };
        assert!(!release.is_downloaded());

        for asset in &mut release.assets {
            asset.download_status = DownloadStatus::Completed { size: 4 };
        }
        assert!(release.is_downloaded());
        assert!(!release.is_deployment_ready());

        release.assets[1].extraction_status = Some(ExtractionStatus::Complete {
            files: vec![entry("index.html", b"hi"), entry("._index.html", b"junk")],
        });
        assert!(release.is_deployment_ready());
        assert_eq!(release.frontend_files().len(), 1);
    }

    #[test]
    fn test_frontend_digest_ignores_metadata() {
        let files = vec![entry("index.html", b"hi")];
        let mut with_junk = files.clone();
        with_junk.push(entry("__MACOSX/index.html", b"junk"));

        let make = |files: Vec<FileManifestEntry>| {
            let mut asset = Asset::new("fe.tar".into(), String::new(), 1, None, String::new());
            asset.download_status = DownloadStatus::Completed { size: 1 };
            asset.extraction_status = Some(ExtractionStatus::Complete { files });
            Release {
                tag_name: "v1".into(),
                name: String::new(),
                draft: false,
                prerelease: false,
                created_at: Utc::now(),
                published_at: None,
                assets: vec![asset],
            }
        };

        assert_eq!(make(files).frontend_digest(), make(with_junk).frontend_digest());
    }

    #[test]
    fn test_invalidate_resets_and_bumps_generation() {
        let mut asset = Asset::new("fe.tgz".into(), String::new(), 10, None, String::new());
        asset.download_status = DownloadStatus::Completed { size: 10 };
        asset.extraction_status = Some(ExtractionStatus::Complete { files: vec![] });

        asset.invalidate();

        assert_eq!(asset.download_status, DownloadStatus::NotStarted);
        assert_eq!(asset.extraction_status, Some(ExtractionStatus::Idle));
        assert_eq!(asset.generation, 1);
    }
}
