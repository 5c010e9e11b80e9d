pub mod content_type;
pub mod error;
pub mod extractor;
pub mod types;

pub use content_type::content_type_for;
pub use error::{ExtractError, ExtractResult};
pub use extractor::{normalize_key, ArchiveExtractor};
pub use types::{ExtractOutcome, ExtractionCursor};
