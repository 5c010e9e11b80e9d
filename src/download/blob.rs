use crate::release::{ArchiveFormat, AssetKey};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// On-disk bytes of downloaded assets, laid out as `<root>/assets/<tag>/<asset>`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("assets"),
        }
    }

    /// Raw bytes as served by the release host
    pub fn path(&self, key: &AssetKey) -> PathBuf {
        self.root.join(sanitize(&key.tag)).join(sanitize(&key.name))
    }

    /// Inflated tar stream of a gzip archive
    pub fn decoded_path(&self, key: &AssetKey) -> PathBuf {
        self.root
            .join(sanitize(&key.tag))
            .join(format!("{}.decoded.tar", sanitize(&key.name)))
    }

    /// Plain tar stream of an archive asset.
    pub fn archive_path(&self, key: &AssetKey, format: ArchiveFormat) -> PathBuf {
        match format {
            ArchiveFormat::Tar => self.path(key),
            ArchiveFormat::TarGz => self.decoded_path(key),
        }
    }

    /// Write `data` at `offset`. `truncate` starts the blob over.
    pub async fn write_at(
        &self,
        key: &AssetKey,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> std::io::Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn set_len(&self, key: &AssetKey, len: u64) -> std::io::Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.set_len(len).await?;
        file.sync_all().await
    }

    /// Read `len` bytes at `offset` of any file in the store.
    pub async fn read_range(path: &Path, offset: u64, len: u64) -> std::io::Result<Bytes> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    /// Drop every file derived from the asset.
    pub async fn remove(&self, key: &AssetKey) -> std::io::Result<()> {
        for path in [self.path(key), self.decoded_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}
