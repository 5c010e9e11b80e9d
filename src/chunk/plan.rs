use crate::chunk::types::ChunkSpec;

/// Number of `chunk_size` chunks needed to cover `len` bytes.
pub fn chunk_count(len: u64, chunk_size: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    len.div_ceil(chunk_size)
}

/// Fixed-size split of one or more sources into an ordered chunk list.
///
/// Chunks of source `n` precede chunks of source `n + 1`; order indexes are dense from 0.
/// An empty source still gets one zero-length chunk so it can be committed.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunk_size: u64,
    chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    pub fn for_len(len: u64, chunk_size: u64) -> Self {
        let mut plan = Self::for_sources(&[len], chunk_size);
        if len == 0 {
            plan.chunks.clear();
        }
        plan
    }

    pub fn for_sources(source_lens: &[u64], chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");

        let mut chunks = Vec::new();
        for (source, &len) in source_lens.iter().enumerate() {
            let count = chunk_count(len, chunk_size).max(1);
            for i in 0..count {
                let offset = i * chunk_size;
                chunks.push(ChunkSpec {
                    order_index: chunks.len() as u32,
                    source: source as u32,
                    offset,
                    len: chunk_size.min(len - offset),
                });
            }
        }

        Self { chunk_size, chunks }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn get(&self, order_index: u64) -> Option<&ChunkSpec> {
        self.chunks.get(order_index as usize)
    }

    pub fn chunks(&self) -> &[ChunkSpec] {
        &self.chunks
    }

    /// Chunks in `[from, from + count)`, clamped to the plan.
    pub fn window(&self, from: u64, count: usize) -> &[ChunkSpec] {
        let start = (from as usize).min(self.chunks.len());
        let end = start.saturating_add(count).min(self.chunks.len());
        &self.chunks[start..end]
    }

    pub fn chunks_for_source(&self, source: u32) -> impl Iterator<Item = &ChunkSpec> {
        self.chunks.iter().filter(move |c| c.source == source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 10), 0);
        assert_eq!(chunk_count(1, 10), 1);
        assert_eq!(chunk_count(10, 10), 1);
        assert_eq!(chunk_count(11, 10), 2);
    }

    #[test]
    fn test_single_source_plan() {
        let plan = ChunkPlan::for_len(25, 10);

        assert_eq!(plan.total(), 3);
        let last = plan.get(2).unwrap();
        assert_eq!(last.offset, 20);
        assert_eq!(last.len, 5);
        assert_eq!(last.range().unwrap().to_header_value(), "bytes=20-24");
    }

    #[test]
    fn test_empty_single_source_has_no_chunks() {
        assert_eq!(ChunkPlan::for_len(0, 10).total(), 0);
    }

    #[test]
    fn test_multi_source_order() {
        let plan = ChunkPlan::for_sources(&[15, 0, 4], 10);

        let sources: Vec<u32> = plan.chunks().iter().map(|c| c.source).collect();
        assert_eq!(sources, vec![0, 0, 1, 2]);

        let indexes: Vec<u32> = plan.chunks().iter().map(|c| c.order_index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);

        assert_eq!(plan.chunks_for_source(1).count(), 1);
        assert_eq!(plan.get(2).unwrap().len, 0);
        assert!(plan.get(2).unwrap().range().is_none());
    }

    #[test]
    fn test_window_is_clamped() {
        let plan = ChunkPlan::for_len(50, 10);

        assert_eq!(plan.window(3, 4).len(), 2);
        assert_eq!(plan.window(5, 4).len(), 0);
        assert_eq!(plan.window(9, 4).len(), 0);
    }
}
