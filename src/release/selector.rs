use crate::release::error::{ReleaseError, ReleaseResult};
use crate::release::types::Release;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which release a storage instance tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseSelector {
    /// Newest published release that is neither a draft nor a prerelease
    #[default]
    Latest,
    LatestDraft,
    LatestPrerelease,
    Version(String),
}

impl ReleaseSelector {
    fn accepts(&self, release: &Release) -> bool {
        match self {
            ReleaseSelector::Latest => !release.draft && !release.prerelease,
            ReleaseSelector::LatestDraft => release.draft,
            ReleaseSelector::LatestPrerelease => release.prerelease && !release.draft,
            ReleaseSelector::Version(tag) => &release.tag_name == tag,
        }
    }

    /// Pick the newest deployment-ready release this selector accepts.
    pub fn select<'a, I>(&self, releases: I) -> ReleaseResult<&'a Release>
    where
        I: IntoIterator<Item = &'a Release>,
    {
        releases
            .into_iter()
            .filter(|r| r.is_deployment_ready() && self.accepts(r))
            .max_by(|a, b| a.sort_key().cmp(&b.sort_key()))
            .ok_or_else(|| ReleaseError::ReleaseNotFound(self.to_string()))
    }
}

impl fmt::Display for ReleaseSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseSelector::Latest => write!(f, "latest"),
            ReleaseSelector::LatestDraft => write!(f, "latest draft"),
            ReleaseSelector::LatestPrerelease => write!(f, "latest prerelease"),
            ReleaseSelector::Version(tag) => write!(f, "version {}", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::types::{Asset, DownloadStatus};
    use chrono::{Duration, TimeZone, Utc};

    fn release(tag: &str, day: i64, draft: bool, prerelease: bool, ready: bool) -> Release {
        let mut asset = Asset::new("vault.wasm".into(), String::new(), 1, None, String::new());
        if ready {
            asset.download_status = DownloadStatus::Completed { size: 1 };
        }
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Release {
            tag_name: tag.into(),
            name: tag.into(),
            draft,
            prerelease,
            created_at: base,
            published_at: Some(base + Duration::days(day)),
            assets: vec![asset],
        }
    }

    #[test]
    fn test_latest_skips_drafts_and_prereleases() {
        let releases = vec![
            release("v1", 1, false, false, true),
            release("v2", 2, false, false, true),
            release("v3-rc", 3, false, true, true),
            release("v4-draft", 4, true, false, true),
        ];

        assert_eq!(ReleaseSelector::Latest.select(&releases).unwrap().tag_name, "v2");
        assert_eq!(
            ReleaseSelector::LatestPrerelease.select(&releases).unwrap().tag_name,
            "v3-rc"
        );
        assert_eq!(
            ReleaseSelector::LatestDraft.select(&releases).unwrap().tag_name,
            "v4-draft"
        );
    }

    #[test]
    fn test_only_deployment_ready_candidates() {
        let releases = vec![
            release("v1", 1, false, false, true),
            release("v2", 2, false, false, false),
        ];

        assert_eq!(ReleaseSelector::Latest.select(&releases).unwrap().tag_name, "v1");
        assert!(matches!(
            ReleaseSelector::Version("v2".into()).select(&releases),
            Err(ReleaseError::ReleaseNotFound(_))
        ));
    }

    #[test]
    fn test_is_deterministic_on_ties() {
        let releases = vec![
            release("b", 1, false, false, true),
            release("a", 1, false, false, true),
        ];
        let reversed: Vec<Release> = releases.iter().rev().cloned().collect();

        let first = ReleaseSelector::Latest.select(&releases).unwrap().tag_name.clone();
        let second = ReleaseSelector::Latest.select(&reversed).unwrap().tag_name.clone();
        assert_eq!(first, second);
        assert_eq!(first, "b");
    }

    #[test]
    fn test_no_releases() {
        let releases: Vec<Release> = vec![];
        assert!(ReleaseSelector::Latest.select(&releases).is_err());
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&ReleaseSelector::Version("v1.2".into())).unwrap();
        assert_eq!(json, r#"{"Version":"v1.2"}"#);
        let back: ReleaseSelector = serde_json::from_str(r#""LatestDraft""#).unwrap();
        assert_eq!(back, ReleaseSelector::LatestDraft);
    }
}
