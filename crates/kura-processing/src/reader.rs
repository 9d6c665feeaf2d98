//! Uniform access to asset bytes, whether path-backed or in memory

use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use kura_core::models::FileSource;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Size of the asset in bytes
pub async fn file_size(source: &FileSource) -> Result<u64> {
    match source {
        FileSource::Path(path) => {
            let meta = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            Ok(meta.len())
        }
        FileSource::Memory { data, .. } => Ok(data.len() as u64),
    }
}

/// Last modification time in microseconds since the epoch, if known
pub async fn last_modified(source: &FileSource) -> Option<i64> {
    match source {
        FileSource::Path(path) => {
            let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
            let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
            i64::try_from(since_epoch.as_micros()).ok()
        }
        FileSource::Memory { last_modified, .. } => *last_modified,
    }
}

async fn fill(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read at most `len` leading bytes
pub async fn read_prefix(source: &FileSource, len: usize) -> Result<Vec<u8>> {
    match source {
        FileSource::Path(path) => {
            let mut file = File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut buf = vec![0u8; len];
            let n = fill(&mut file, &mut buf).await?;
            buf.truncate(n);
            Ok(buf)
        }
        FileSource::Memory { data, .. } => Ok(data[..len.min(data.len())].to_vec()),
    }
}

/// Read the whole asset into memory
pub async fn read_all(source: &FileSource) -> Result<Bytes> {
    match source {
        FileSource::Path(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Bytes::from(data))
        }
        FileSource::Memory { data, .. } => Ok(data.clone()),
    }
}

enum ChunkSource {
    File(File),
    Memory(Bytes),
}

/// Sequential fixed-size chunk reader.
///
/// Every chunk except the last is exactly `chunk_size` bytes. An empty asset yields a single
/// empty chunk so that stream encryption still produces a final block. A file whose size
/// changes after `open` is an error rather than a short or truncated stream.
pub struct ChunkReader {
    inner: ChunkSource,
    chunk_size: usize,
    total_size: u64,
    offset: u64,
    emitted: u64,
}

impl ChunkReader {
    pub async fn open(source: &FileSource, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(anyhow!("chunk size must be positive"));
        }
        let (inner, total_size) = match source {
            FileSource::Path(path) => {
                let file = File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let size = file.metadata().await?.len();
                (ChunkSource::File(file), size)
            }
            FileSource::Memory { data, .. } => {
                (ChunkSource::Memory(data.clone()), data.len() as u64)
            }
        };

        Ok(Self {
            inner,
            chunk_size,
            total_size,
            offset: 0,
            emitted: 0,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size as u64).max(1)
    }

    pub fn is_exhausted(&self) -> bool {
        self.emitted >= self.chunk_count()
    }

    /// Next chunk, or `None` once every chunk has been returned
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.is_exhausted() {
            return Ok(None);
        }

        let want = (self.total_size - self.offset).min(self.chunk_size as u64) as usize;
        let is_last = self.emitted + 1 == self.chunk_count();
        let chunk = match &mut self.inner {
            ChunkSource::File(file) => {
                let mut buf = vec![0u8; want];
                let n = fill(file, &mut buf).await?;
                if n != want {
                    return Err(anyhow!(
                        "file shrank while reading: expected {} bytes at offset {}, got {}",
                        want,
                        self.offset,
                        n
                    ));
                }
                if is_last {
                    let mut extra = [0u8; 1];
                    if file.read(&mut extra).await? != 0 {
                        return Err(anyhow!(
                            "file grew while reading: more than {} bytes",
                            self.total_size
                        ));
                    }
                }
                Bytes::from(buf)
            }
            ChunkSource::Memory(data) => {
                let start = self.offset as usize;
                data.slice(start..start + want)
            }
        };

        self.offset += want as u64;
        self.emitted += 1;
        Ok(Some(chunk))
    }
}
