pub mod plan;
pub mod types;

pub use plan::{chunk_count, ChunkPlan};
pub use types::{ChunkSpec, RangeSpec};
