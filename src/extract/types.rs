use crate::release::FileManifestEntry;
use serde::{Deserialize, Serialize};

/// Where decoding of an archive stopped, persisted with the asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionCursor {
    /// Byte offset of the next tar header in the decoded stream
    pub offset: u64,
    /// Length of the decoded tar stream
    pub total: u64,
    /// Entries recorded so far
    pub files: Vec<FileManifestEntry>,
    /// Path announced by a GNU long-name or PAX record for the next entry
    pub pending_path: Option<String>,
}

/// What one `step` did to an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    Idle,
    /// Part of a gzip stream was inflated; `consumed` counts compressed bytes
    Inflating { consumed: u64, total: u64 },
    /// The compressed stream was inflated and decoding can start
    Inflated { total: u64 },
    Decoded { processed: u64, total: u64, files: usize },
    Complete { files: usize },
}
