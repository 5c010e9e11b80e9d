use crate::integrity::error::{IntegrityError, IntegrityResult};
use crate::integrity::types::ContentHash;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_BUFFER: usize = 64 * 1024;

/// Incremental SHA-256 that also counts the bytes it has seen.
#[derive(Clone, Default)]
pub struct StreamingHasher {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.hasher.finalize().into())
    }
}

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Calculate SHA-256 for a byte slice
    pub fn calculate_checksum(data: &[u8]) -> ContentHash {
        ContentHash(Sha256::digest(data).into())
    }

    /// Calculate SHA-256 for a file (streaming)
    pub async fn calculate_file_checksum(path: &Path) -> IntegrityResult<ContentHash> {
        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| IntegrityError::FileNotFound(format!("{}: {}", path.display(), e)))?
            .len();
        Ok(Self::hash_file_prefix(path, len).await?.finalize())
    }

    /// Hash the first `len` bytes of a file without loading it whole.
    pub async fn hash_file_prefix(path: &Path, len: u64) -> IntegrityResult<StreamingHasher> {
        let mut hasher = StreamingHasher::new();
        if len == 0 {
            return Ok(hasher);
        }

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| IntegrityError::FileNotFound(format!("{}: {}", path.display(), e)))?;
        let mut buffer = vec![0u8; READ_BUFFER];
        let mut remaining = len;

        while remaining > 0 {
            let want = remaining.min(READ_BUFFER as u64) as usize;
            let n = file.read(&mut buffer[..want]).await?;
            if n == 0 {
                return Err(IntegrityError::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} is shorter than {} bytes", path.display(), len),
                )));
            }
            hasher.update(&buffer[..n]);
            remaining -= n as u64;
        }

        Ok(hasher)
    }

    pub fn verify(expected: &ContentHash, actual: &ContentHash) -> IntegrityResult<()> {
        if expected != actual {
            return Err(IntegrityError::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }

    pub fn verify_data(data: &[u8], expected: &ContentHash) -> IntegrityResult<()> {
        Self::verify(expected, &Self::calculate_checksum(data))
    }
}

/// Order-independent digest of a frontend bundle.
///
/// Both the release side (from the extracted manifest) and the storage instance (from its
/// committed assets) compute this over `(key, sha256)` pairs, so equal digests mean the
/// same set of files with the same contents.
pub fn frontend_digest<'a, I>(entries: I) -> ContentHash
where
    I: IntoIterator<Item = (&'a str, &'a ContentHash)>,
{
    let mut pairs: Vec<(&str, &ContentHash)> = entries.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (key, hash) in pairs {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
    }
    ContentHash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_calculate_checksum() {
        let hash = IntegrityVerifier::calculate_checksum(b"");
        assert_eq!(
            hash.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();

        let mut hasher = StreamingHasher::new();
        for piece in data.chunks(333) {
            hasher.update(piece);
        }

        assert_eq!(hasher.bytes_hashed(), data.len() as u64);
        assert_eq!(hasher.finalize(), IntegrityVerifier::calculate_checksum(&data));
    }

    #[tokio::test]
    async fn test_file_checksum_and_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let full = IntegrityVerifier::calculate_file_checksum(&path).await.unwrap();
        assert_eq!(full, IntegrityVerifier::calculate_checksum(&data));

        let prefix = IntegrityVerifier::hash_file_prefix(&path, 70_000).await.unwrap();
        assert_eq!(prefix.bytes_hashed(), 70_000);
        assert_eq!(
            prefix.finalize(),
            IntegrityVerifier::calculate_checksum(&data[..70_000])
        );
    }

    #[tokio::test]
    async fn test_prefix_longer_than_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert!(IntegrityVerifier::hash_file_prefix(&path, 10).await.is_err());
    }

    #[test]
    fn test_verify_mismatch() {
        let expected = IntegrityVerifier::calculate_checksum(b"expected");
        let result = IntegrityVerifier::verify_data(b"actual", &expected);
        assert!(matches!(result, Err(IntegrityError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_frontend_digest_is_order_independent() {
        let a = IntegrityVerifier::calculate_checksum(b"a");
        let b = IntegrityVerifier::calculate_checksum(b"b");

        let forward = frontend_digest(vec![("index.html", &a), ("app.js", &b)]);
        let reverse = frontend_digest(vec![("app.js", &b), ("index.html", &a)]);
        assert_eq!(forward, reverse);

        let changed = frontend_digest(vec![("index.html", &b), ("app.js", &b)]);
        assert_ne!(forward, changed);
    }
}
