use serde::{Deserialize, Serialize};

/// Inclusive byte range, as sent in an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// One slice of some source content, identified by its position in the commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub order_index: u32,
    /// Index of the source (file) the chunk belongs to
    pub source: u32,
    /// Offset of the chunk within its source
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpec {
    pub fn range(&self) -> Option<RangeSpec> {
        if self.len == 0 {
            return None;
        }
        Some(RangeSpec::new(self.offset, self.offset + self.len - 1))
    }
}
