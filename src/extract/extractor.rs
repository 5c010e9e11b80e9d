use crate::config::ExtractConfig;
use crate::download::{BlobStore, InFlight};
use crate::extract::content_type::content_type_for;
use crate::extract::error::{ExtractError, ExtractResult};
use crate::extract::types::{ExtractOutcome, ExtractionCursor};
use crate::integrity::{ContentHash, StreamingHasher};
use crate::release::{
    ArchiveFormat, AssetKey, AssetKind, DownloadStatus, ExtractionStatus, FileManifestEntry,
    ReleaseCatalog,
};
use flate2::bufread::GzDecoder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tar::{EntryType, Header};

const BLOCK: u64 = 512;
const READ_BUFFER: usize = 64 * 1024;

/// Hands out at most `remaining` bytes of the inner reader, then reports `WouldBlock`.
struct Budgeted<R> {
    inner: R,
    remaining: u64,
    consumed: u64,
}

impl<R: BufRead> Budgeted<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            consumed: 0,
        }
    }
}

impl<R: BufRead> Read for Budgeted<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = {
            let available = self.fill_buf()?;
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for Budgeted<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.remaining == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let limit = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let available = self.inner.fill_buf()?;
        Ok(&available[..available.len().min(limit)])
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.remaining = self.remaining.saturating_sub(amt as u64);
        self.consumed += amt as u64;
    }
}

/// A gzip stream being inflated into the decoded blob across steps.
struct Inflater {
    generation: u64,
    decoder: GzDecoder<Budgeted<BufReader<File>>>,
    output: BufWriter<File>,
    written: u64,
}

enum Inflation {
    Pending(Inflater),
    Done { written: u64 },
}

impl Inflater {
    /// Start from the first compressed byte, truncating any earlier output.
    fn open(src: &Path, dst: &Path, generation: u64) -> io::Result<Self> {
        let input = BufReader::with_capacity(READ_BUFFER, File::open(src)?);
        Ok(Self {
            generation,
            decoder: GzDecoder::new(Budgeted::new(input)),
            output: BufWriter::new(File::create(dst)?),
            written: 0,
        })
    }

    fn consumed(&self) -> u64 {
        self.decoder.get_ref().consumed
    }

    /// Inflate until `budget` compressed bytes were read or the stream ended.
    fn advance(mut self, budget: u64) -> io::Result<Inflation> {
        self.decoder.get_mut().remaining = budget;
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            match self.decoder.read(&mut buffer) {
                Ok(0) => {
                    let written = self.written;
                    self.output.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                    return Ok(Inflation::Done { written });
                }
                Ok(n) => {
                    self.output.write_all(&buffer[..n])?;
                    self.written += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.output.flush()?;
                    return Ok(Inflation::Pending(self));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Errors caused by the archive bytes themselves rather than the local disk.
fn is_content_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    )
}

/// Decodes downloaded tar archives into file manifests, a bounded slice per step.
pub struct ArchiveExtractor {
    catalog: Arc<ReleaseCatalog>,
    blobs: BlobStore,
    config: ExtractConfig,
    in_flight: InFlight<AssetKey>,
    inflaters: Mutex<HashMap<AssetKey, Inflater>>,
}

impl ArchiveExtractor {
    pub fn new(catalog: Arc<ReleaseCatalog>, blobs: BlobStore, config: ExtractConfig) -> Self {
        Self {
            catalog,
            blobs,
            config,
            in_flight: InFlight::new(),
            inflaters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn tick(&self) -> usize {
        let queue = self.catalog.extraction_queue();
        let mut advanced = 0;
        for (key, _) in queue {
            match self.step(&key).await {
                Ok(ExtractOutcome::Idle) => {}
                Ok(_) => advanced += 1,
                Err(e) => tracing::warn!("Extraction step for {} failed: {}", key, e),
            }
        }
        advanced
    }

    pub async fn step(&self, key: &AssetKey) -> ExtractResult<ExtractOutcome> {
        let Some(_guard) = self.in_flight.try_claim(key) else {
            return Ok(ExtractOutcome::Idle);
        };
        let Some(asset) = self.catalog.asset(key) else {
            return Ok(ExtractOutcome::Idle);
        };
        if !asset.download_status.is_completed() {
            return Ok(ExtractOutcome::Idle);
        }
        let AssetKind::Archive(format) = asset.kind() else {
            return Ok(ExtractOutcome::Idle);
        };

        match (&asset.extraction_status, asset.extraction_cursor.clone()) {
            (Some(ExtractionStatus::Decoding { .. }), Some(cursor)) => {
                self.decode(key, asset.generation, format, cursor).await
            }
            (Some(ExtractionStatus::Idle), _) => {
                self.inflaters.lock().remove(key);
                self.start(key, asset.generation, asset.size, format).await
            }
            (Some(ExtractionStatus::Decoding { .. }), None) => {
                self.start(key, asset.generation, asset.size, format).await
            }
            _ => Ok(ExtractOutcome::Idle),
        }
    }

    async fn start(
        &self,
        key: &AssetKey,
        generation: u64,
        size: u64,
        format: ArchiveFormat,
    ) -> ExtractResult<ExtractOutcome> {
        match format {
            ArchiveFormat::Tar => self.begin_decoding(key, generation, size).await,
            ArchiveFormat::TarGz => self.inflate(key, generation, size).await,
        }
    }

    /// One bounded slice of gzip inflation.
    ///
    /// The decoder lives in memory only; after a restart inflation begins again at the
    /// first compressed byte.
    async fn inflate(
        &self,
        key: &AssetKey,
        generation: u64,
        size: u64,
    ) -> ExtractResult<ExtractOutcome> {
        let cached = self
            .inflaters
            .lock()
            .remove(key)
            .filter(|inflater| inflater.generation == generation);
        if cached.is_none() {
            tracing::debug!("{}: inflating {} compressed bytes", key, size);
        }

        let src = self.blobs.path(key);
        let dst = self.blobs.decoded_path(key);
        let budget = self.config.max_bytes_per_step;
        let slice = tokio::task::spawn_blocking(move || {
            let inflater = match cached {
                Some(inflater) => inflater,
                None => Inflater::open(&src, &dst, generation)?,
            };
            inflater.advance(budget)
        })
        .await;

        let inflation = match slice {
            Ok(Ok(inflation)) => inflation,
            Ok(Err(e)) if is_content_error(&e) => {
                return self
                    .reject(key, generation, format!("cannot inflate archive: {}", e))
                    .await;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(e) if e.is_panic() => {
                return self.reject(key, generation, format!("inflation aborted: {}", e)).await;
            }
            Err(e) => return Err(e.into()),
        };

        match inflation {
            Inflation::Done { written } => self.begin_decoding(key, generation, written).await,
            Inflation::Pending(inflater) => {
                let consumed = inflater.consumed();
                let current = self
                    .catalog
                    .update_asset(key, generation, |a| {
                        a.extraction_status = Some(ExtractionStatus::Decoding {
                            processed: consumed,
                            total: size,
                        });
                        a.extraction_cursor = None;
                    })
                    .await?;
                if current {
                    self.inflaters.lock().insert(key.clone(), inflater);
                }
                Ok(ExtractOutcome::Inflating {
                    consumed,
                    total: size,
                })
            }
        }
    }

    async fn begin_decoding(
        &self,
        key: &AssetKey,
        generation: u64,
        total: u64,
    ) -> ExtractResult<ExtractOutcome> {
        tracing::debug!("{}: decoding {} bytes of tar", key, total);

        let cursor = ExtractionCursor {
            total,
            ..Default::default()
        };
        self.catalog
            .update_asset(key, generation, |a| {
                a.extraction_status = Some(ExtractionStatus::Decoding { processed: 0, total });
                a.extraction_cursor = Some(cursor);
            })
            .await?;
        Ok(ExtractOutcome::Inflated { total })
    }

    async fn decode(
        &self,
        key: &AssetKey,
        generation: u64,
        format: ArchiveFormat,
        cursor: ExtractionCursor,
    ) -> ExtractResult<ExtractOutcome> {
        let path = self.blobs.archive_path(key, format);
        let max_entries = self.config.max_entries_per_step;
        let max_bytes = self.config.max_bytes_per_step;

        let batch =
            tokio::task::spawn_blocking(move || decode_batch(&path, cursor, max_entries, max_bytes))
                .await;

        let (cursor, done) = match batch {
            Ok(Ok(result)) => result,
            Ok(Err(e @ (ExtractError::CorruptHeader { .. } | ExtractError::Truncated(_)))) => {
                return self.reject(key, generation, e.to_string()).await;
            }
            Ok(Err(ExtractError::IoError(e))) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("{}: decoded archive missing, starting over", key);
                self.catalog
                    .update_asset(key, generation, |a| {
                        a.extraction_status = Some(ExtractionStatus::Idle);
                        a.extraction_cursor = None;
                    })
                    .await?;
                return Ok(ExtractOutcome::Idle);
            }
            Ok(Err(ExtractError::IoError(e))) if is_content_error(&e) => {
                return self.reject(key, generation, e.to_string()).await;
            }
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_panic() => {
                return self.reject(key, generation, format!("decoding aborted: {}", e)).await;
            }
            Err(e) => return Err(e.into()),
        };

        if done {
            let count = cursor.files.len();
            let files = cursor.files;
            self.catalog
                .update_asset(key, generation, |a| {
                    a.extraction_status = Some(ExtractionStatus::Complete { files });
                    a.extraction_cursor = None;
                })
                .await?;
            crate::metrics::record_archive_extracted(count as u64);
            tracing::info!("Extracted {} ({} files)", key, count);
            return Ok(ExtractOutcome::Complete { files: count });
        }

        let processed = cursor.offset;
        let total = cursor.total;
        let files = cursor.files.len();
        self.catalog
            .update_asset(key, generation, |a| {
                a.extraction_status = Some(ExtractionStatus::Decoding { processed, total });
                a.extraction_cursor = Some(cursor);
            })
            .await?;
        Ok(ExtractOutcome::Decoded {
            processed,
            total,
            files,
        })
    }

    /// An archive that matched its digest but cannot be decoded will not improve by
    /// decoding it again; surface it as a failed download so a refresh can retry it.
    async fn reject(
        &self,
        key: &AssetKey,
        generation: u64,
        reason: String,
    ) -> ExtractResult<ExtractOutcome> {
        tracing::error!("Archive {} is unreadable: {}", key, reason);
        self.catalog
            .update_asset(key, generation, |a| {
                a.download_status = DownloadStatus::Error {
                    message: format!("archive unreadable: {}", reason),
                };
                a.extraction_status = Some(ExtractionStatus::Idle);
                a.extraction_cursor = None;
            })
            .await?;
        Ok(ExtractOutcome::Idle)
    }
}

/// Strip `./`, `.`, `..` and empty segments from an archive path.
pub fn normalize_key(raw: &str) -> String {
    raw.split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("/")
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK) * BLOCK
}

fn verify_checksum(block: &[u8; 512], header: &Header, offset: u64) -> ExtractResult<()> {
    let stored = header.cksum().map_err(|e| ExtractError::CorruptHeader {
        offset,
        reason: e.to_string(),
    })?;
    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { 0x20 } else { *b as u32 })
        .sum();
    if stored != computed {
        return Err(ExtractError::CorruptHeader {
            offset,
            reason: format!("checksum {} != {}", stored, computed),
        });
    }
    Ok(())
}

fn read_data(file: &mut File, offset: u64, size: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; size as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

fn hash_data(file: &mut File, offset: u64, size: u64) -> io::Result<ContentHash> {
    file.seek(SeekFrom::Start(offset))?;
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(READ_BUFFER as u64) as usize;
        file.read_exact(&mut buffer[..want])?;
        hasher.update(&buffer[..want]);
        remaining -= want as u64;
    }
    Ok(hasher.finalize())
}

fn long_name(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// `path` value of a PAX extended header (`"<len> path=<value>\n"` records).
fn pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest.iter().position(|b| *b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space || len > rest.len() {
            return None;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            return Some(String::from_utf8_lossy(value).into_owned());
        }
        rest = &rest[len..];
    }
    None
}

/// Walk tar headers from `cursor` until the budget is spent or the archive ends.
///
/// Returns the advanced cursor and whether the end of the archive was reached.
fn decode_batch(
    path: &Path,
    mut cursor: ExtractionCursor,
    max_entries: usize,
    max_bytes: u64,
) -> ExtractResult<(ExtractionCursor, bool)> {
    let mut file = File::open(path)?;
    let total = cursor.total;
    let mut entries = 0;
    let mut bytes = 0u64;

    loop {
        if entries >= max_entries || bytes >= max_bytes {
            return Ok((cursor, false));
        }
        if cursor.offset + BLOCK > total {
            return Ok((cursor, true));
        }

        let mut block = [0u8; 512];
        file.seek(SeekFrom::Start(cursor.offset))?;
        file.read_exact(&mut block)?;
        if block.iter().all(|b| *b == 0) {
            return Ok((cursor, true));
        }

        let header = Header::from_byte_slice(&block);
        verify_checksum(&block, header, cursor.offset)?;
        let size = header.entry_size().map_err(|e| ExtractError::CorruptHeader {
            offset: cursor.offset,
            reason: e.to_string(),
        })?;
        let data_offset = cursor.offset + BLOCK;
        match data_offset.checked_add(size) {
            Some(end) if end <= total => {}
            _ => return Err(ExtractError::Truncated(cursor.offset)),
        }

        match header.entry_type() {
            EntryType::GNULongName => {
                cursor.pending_path = Some(long_name(&read_data(&mut file, data_offset, size)?));
            }
            EntryType::XHeader => {
                if let Some(path) = pax_path(&read_data(&mut file, data_offset, size)?) {
                    cursor.pending_path = Some(path);
                }
            }
            EntryType::GNULongLink | EntryType::XGlobalHeader => {}
            EntryType::Regular | EntryType::Continuous => {
                let raw = match cursor.pending_path.take() {
                    Some(path) => path,
                    None => String::from_utf8_lossy(&header.path_bytes()).into_owned(),
                };
                let key = normalize_key(&raw);
                if !key.is_empty() {
                    let sha256 = hash_data(&mut file, data_offset, size)?;
                    cursor.files.push(FileManifestEntry {
                        content_type: content_type_for(&key).to_string(),
                        key,
                        size,
                        sha256,
                        offset: data_offset,
                    });
                }
                bytes += size;
            }
            _ => {
                cursor.pending_path = None;
            }
        }

        entries += 1;
        cursor.offset = data_offset + padded(size);
    }
}
