//! Archive synthesis.
//!
//! Assembles a chunked archive byte for byte from a mix of store chunk
//! files and compressed byte ranges spliced out of seed archives, then
//! appends the trailing chunk id and seek tables. No chunk data is
//! decompressed at any point.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use log::*;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};

use crate::archive::{build_chunk_table, build_seek_table, SeekEntry};
use crate::chunk_id::ChunkId;
use crate::frame::{Frame, FrameError, FrameWalker};
use crate::seed::{seed_chunks, SeedChunk};
use crate::store::ChunkStore;

#[derive(Debug)]
pub enum SynthesizeError {
    /// A target chunk is in neither the store nor any seed.
    MissingChunk { id: ChunkId },
    /// A seed ended before the full chunk range could be copied.
    TruncatedSeedChunk { id: ChunkId },
    /// A source frame does not carry its content size in the header.
    MissingContentSize { id: ChunkId },
    /// A source frame does not fit the 32 bit seek table fields.
    ChunkTooLarge { id: ChunkId },
    /// A store or seed file does not start with a valid zstd frame.
    Frame(FrameError),
    Io(std::io::Error),
}

impl std::error::Error for SynthesizeError {}

impl std::fmt::Display for SynthesizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingChunk { id } => write!(f, "missing chunk {}", id),
            Self::TruncatedSeedChunk { id } => {
                write!(f, "seed ended inside chunk {}", id.short())
            }
            Self::MissingContentSize { id } => {
                write!(f, "chunk {} frame has no content size", id.short())
            }
            Self::ChunkTooLarge { id } => write!(f, "chunk {} exceeds table limits", id.short()),
            Self::Frame(err) => write!(f, "frame error: {}", err),
            Self::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl From<FrameError> for SynthesizeError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

impl From<std::io::Error> for SynthesizeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Accounting from a completed synthesis.
#[derive(Debug, Default)]
pub struct SynthesizeSummary {
    pub chunk_count: usize,
    pub chunks_from_store: usize,
    pub chunks_from_seeds: usize,
    pub bytes_from_store: u64,
    pub bytes_from_seeds: u64,
    /// Uncompressed size of the assembled content.
    pub uncompressed_size: u64,
}

/// Assemble the archive for `target` at `output_path`.
///
/// Every chunk is taken from the store when present, otherwise from the
/// last seed that provides it. A partial output file is removed before any
/// error is returned.
pub async fn synthesize(
    target: &[ChunkId],
    store: &ChunkStore,
    seed_paths: &[PathBuf],
    output_path: &Path,
) -> Result<SynthesizeSummary, SynthesizeError> {
    match synthesize_inner(target, store, seed_paths, output_path).await {
        Ok(summary) => Ok(summary),
        Err(err) => {
            // Never leave a half written archive behind.
            let _ = tokio::fs::remove_file(output_path).await;
            Err(err)
        }
    }
}

async fn synthesize_inner(
    target: &[ChunkId],
    store: &ChunkStore,
    seed_paths: &[PathBuf],
    output_path: &Path,
) -> Result<SynthesizeSummary, SynthesizeError> {
    // Later seeds win ties, so a freshly downloaded seed shadows older ones.
    let mut seeds: Vec<File> = Vec::with_capacity(seed_paths.len());
    let mut seed_map: HashMap<ChunkId, (usize, SeedChunk)> = HashMap::new();
    for path in seed_paths {
        let mut file = File::open(path).await?;
        let chunks = seed_chunks(&mut file).await?;
        debug!("seed {} provides {} chunks", path.display(), chunks.len());
        let seed_index = seeds.len();
        for chunk in chunks {
            seed_map.insert(chunk.id, (seed_index, chunk));
        }
        seeds.push(file);
    }

    let mut output = BufWriter::new(File::create(output_path).await?);
    let mut summary = SynthesizeSummary {
        chunk_count: target.len(),
        ..Default::default()
    };
    let mut entries: Vec<SeekEntry> = Vec::with_capacity(target.len());

    for id in target {
        let chunk_path = store.chunk_path(id);
        let entry = if tokio::fs::metadata(&chunk_path).await.is_ok() {
            let data = tokio::fs::read(&chunk_path).await?;
            let entry = peek_entry(&mut std::io::Cursor::new(&data), 0, id).await?;
            output.write_all(&data).await?;
            trace!("chunk {} from store, {} bytes", id.short(), data.len());
            summary.chunks_from_store += 1;
            summary.bytes_from_store += data.len() as u64;
            entry
        } else if let Some((seed_index, chunk)) = seed_map.get(id) {
            let seed = &mut seeds[*seed_index];
            let entry = peek_entry(seed, chunk.offset, id).await?;
            copy_range(seed, chunk.offset, chunk.compressed_len, &mut output, id).await?;
            trace!(
                "chunk {} from seed {}, offset {}, {} bytes",
                id.short(),
                seed_index,
                chunk.offset,
                chunk.compressed_len
            );
            summary.chunks_from_seeds += 1;
            summary.bytes_from_seeds += chunk.compressed_len;
            entry
        } else {
            return Err(SynthesizeError::MissingChunk { id: *id });
        };
        summary.uncompressed_size += u64::from(entry.uncompressed_len);
        entries.push(entry);
    }

    output.write_all(&build_chunk_table(target)).await?;
    output.write_all(&build_seek_table(&entries)).await?;
    output.flush().await?;
    info!(
        "synthesized {} with {} chunks ({} store, {} seed)",
        output_path.display(),
        summary.chunk_count,
        summary.chunks_from_store,
        summary.chunks_from_seeds,
    );
    Ok(summary)
}

/// Parse the frame at `offset` to learn its sizes, leaving no mark on the
/// output. The source position is not preserved.
async fn peek_entry<R>(reader: &mut R, offset: u64, id: &ChunkId) -> Result<SeekEntry, SynthesizeError>
where
    R: tokio::io::AsyncRead + tokio::io::AsyncSeek + Unpin,
{
    let mut walker = FrameWalker::new(reader, offset).await?;
    let frame = match walker.next_frame().await {
        Ok(Some(Frame::Data(frame))) => frame,
        Ok(_) => {
            return Err(SynthesizeError::Frame(FrameError::NotAFrame { offset }));
        }
        Err(FrameError::TruncatedFrame { .. }) => {
            return Err(SynthesizeError::TruncatedSeedChunk { id: *id });
        }
        Err(err) => return Err(err.into()),
    };
    let uncompressed_len = frame
        .uncompressed_len
        .ok_or(SynthesizeError::MissingContentSize { id: *id })?;
    let compressed_len = u32::try_from(frame.compressed_len)
        .map_err(|_| SynthesizeError::ChunkTooLarge { id: *id })?;
    let uncompressed_len = u32::try_from(uncompressed_len)
        .map_err(|_| SynthesizeError::ChunkTooLarge { id: *id })?;
    Ok(SeekEntry {
        compressed_len,
        uncompressed_len,
    })
}

/// Copy exactly `len` bytes starting at `offset` from the seed to the
/// output. Running out of seed bytes is fatal.
async fn copy_range<W>(
    seed: &mut File,
    offset: u64,
    len: u64,
    output: &mut W,
    id: &ChunkId,
) -> Result<(), SynthesizeError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    seed.seek(SeekFrom::Start(offset)).await?;
    let mut remaining = len;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let got = seed.read(&mut buf[..want]).await?;
        if got == 0 {
            return Err(SynthesizeError::TruncatedSeedChunk { id: *id });
        }
        output
            .write_all(&buf[..got])
            .await
            .map_err(SynthesizeError::Io)?;
        remaining -= got as u64;
    }
    Ok(())
}
