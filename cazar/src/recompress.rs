//! Chunk store recompression.
//!
//! Rewrites every chunk in a store against one shared dictionary, in three
//! strictly ordered passes: decompress whatever needs rewriting, optionally
//! train the dictionary over the decompressed chunks, recompress. Per file
//! work is fanned out over a bounded worker pool; pass boundaries are hard
//! barriers. The operation is not transactional: a failure leaves already
//! rewritten chunks in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::StreamExt;
use log::*;
use tokio::task::JoinError;

use crate::chunk_id::ChunkId;
use crate::frame::sniff_dictionary_id;
use crate::store::ChunkStore;

/// Magic number prefixing a zstd dictionary blob.
const DICTIONARY_MAGIC: u32 = 0xEC30_A437;
/// Default capacity handed to the dictionary trainer.
pub const DEFAULT_DICTIONARY_CAPACITY: usize = 112_640;

#[derive(Debug)]
pub enum RecompressError {
    /// A chunk references a dictionary the store does not hold.
    MissingDictionary { dictionary_id: u32, path: PathBuf },
    /// A chunk frame carries no content size.
    MissingContentSize { path: PathBuf },
    /// A chunk's content does not digest to its file name (verify mode).
    ChunkMismatch { path: PathBuf },
    /// Dictionary training failed or produced an unusable blob.
    Training { message: String },
    /// Compression or decompression of one chunk failed.
    Compression { path: PathBuf, message: String },
    ThreadJoin(JoinError),
    Io(std::io::Error),
}

impl std::error::Error for RecompressError {}

impl std::fmt::Display for RecompressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDictionary { dictionary_id, path } => write!(
                f,
                "chunk {} references missing dictionary {}",
                path.display(),
                dictionary_id
            ),
            Self::MissingContentSize { path } => {
                write!(f, "chunk {} has no content size", path.display())
            }
            Self::ChunkMismatch { path } => {
                write!(f, "chunk {} does not match its name", path.display())
            }
            Self::Training { message } => write!(f, "dictionary training failed: {}", message),
            Self::Compression { path, message } => {
                write!(f, "failed to recompress {}: {}", path.display(), message)
            }
            Self::ThreadJoin(err) => write!(f, "error joining worker: {}", err),
            Self::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl From<JoinError> for RecompressError {
    fn from(err: JoinError) -> Self {
        Self::ThreadJoin(err)
    }
}

impl From<std::io::Error> for RecompressError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct RecompressOptions {
    /// Target dictionary id. 0 strips dictionaries and never trains.
    pub dictionary_id: u32,
    /// Zstd compression level for the recompress pass.
    pub level: i32,
    /// Worker count; 0 selects one per core.
    pub workers: usize,
    /// Force dictionary retraining even when the dictionary exists.
    pub train: bool,
    /// Check decompressed chunk content against the file name hash.
    pub verify: bool,
    /// Capacity handed to the dictionary trainer.
    pub dictionary_capacity: usize,
}

impl Default for RecompressOptions {
    fn default() -> Self {
        Self {
            dictionary_id: 1,
            level: 19,
            workers: 0,
            train: false,
            verify: false,
            dictionary_capacity: DEFAULT_DICTIONARY_CAPACITY,
        }
    }
}

impl RecompressOptions {
    fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            match num_cpus::get() {
                0 | 1 => 1,
                n => n,
            }
        } else {
            self.workers
        }
    }
}

/// Size accounting over a completed run.
#[derive(Debug, Default)]
pub struct RecompressSummary {
    pub chunk_count: usize,
    pub recompressed: usize,
    pub skipped: usize,
    pub original_size: u64,
    pub uncompressed_size: u64,
    pub recompressed_size: u64,
    pub trained_dictionary: bool,
}

struct DecompressOutcome {
    path: PathBuf,
    original_size: u64,
    uncompressed_size: u64,
    raw_written: bool,
}

/// Recompress every chunk of the store against dictionary
/// `opts.dictionary_id`.
pub async fn recompress(
    store: &ChunkStore,
    opts: &RecompressOptions,
) -> Result<RecompressSummary, RecompressError> {
    let dictionary_id = opts.dictionary_id;
    let dictionary_path = store.dictionary_path(dictionary_id);
    let mut train = opts.train && dictionary_id != 0;
    if let Some(path) = &dictionary_path {
        if tokio::fs::metadata(path).await.is_err() {
            // No dictionary on disk means there is nothing to compress
            // against; training is not optional.
            train = true;
        }
    }
    let workers = opts.effective_workers();
    let chunks = store.list_chunks().await?;
    let old_dictionaries = Arc::new(store.load_dictionaries().await?);
    info!(
        "recompressing {} chunks with dictionary {} at level {} ({} workers{})",
        chunks.len(),
        dictionary_id,
        opts.level,
        workers,
        if train { ", training" } else { "" },
    );

    let mut summary = RecompressSummary {
        chunk_count: chunks.len(),
        ..Default::default()
    };

    // Decompress pass.
    let verify = opts.verify;
    let mut raw_paths = Vec::new();
    {
        let mut outcomes = futures_util::stream::iter(chunks.iter().cloned().map(|path| {
            let old_dictionaries = old_dictionaries.clone();
            tokio::task::spawn_blocking(move || {
                decompress_chunk(&path, dictionary_id, train, verify, &old_dictionaries)
            })
        }))
        .buffered(workers);
        while let Some(result) = outcomes.next().await {
            let outcome = result??;
            summary.original_size += outcome.original_size;
            summary.uncompressed_size += outcome.uncompressed_size;
            if outcome.raw_written {
                raw_paths.push(outcome.path);
            }
        }
    }

    // Training barrier: all raw files are on disk before the trainer runs.
    let dictionary: Option<Arc<Vec<u8>>> = if dictionary_id == 0 || raw_paths.is_empty() {
        None
    } else if train {
        let samples = raw_paths.clone();
        let capacity = opts.dictionary_capacity;
        let trained =
            tokio::task::spawn_blocking(move || train_dictionary(&samples, capacity, dictionary_id))
                .await??;
        let path = dictionary_path.as_ref().expect("non-zero id has a path");
        tokio::fs::write(path, &trained).await?;
        info!(
            "trained dictionary {} ({} bytes) over {} chunks",
            dictionary_id,
            trained.len(),
            raw_paths.len()
        );
        summary.trained_dictionary = true;
        Some(Arc::new(trained))
    } else {
        let path = dictionary_path.as_ref().expect("non-zero id has a path");
        Some(Arc::new(tokio::fs::read(path).await?))
    };

    // Recompress pass.
    {
        let level = opts.level;
        let mut outcomes = futures_util::stream::iter(raw_paths.iter().cloned().map(|path| {
            let dictionary = dictionary.clone();
            tokio::task::spawn_blocking(move || recompress_chunk(&path, dictionary.as_deref(), level))
        }))
        .buffered(workers);
        while let Some(result) = outcomes.next().await {
            summary.recompressed_size += result??;
            summary.recompressed += 1;
        }
    }
    summary.skipped = summary.chunk_count - summary.recompressed;
    info!(
        "recompressed {} chunks ({} skipped): {} -> {} bytes ({} uncompressed)",
        summary.recompressed,
        summary.skipped,
        summary.original_size,
        summary.recompressed_size,
        summary.uncompressed_size,
    );
    Ok(summary)
}

fn decompress_chunk(
    path: &Path,
    dictionary_id: u32,
    train: bool,
    verify: bool,
    old_dictionaries: &std::collections::HashMap<u32, Vec<u8>>,
) -> Result<DecompressOutcome, RecompressError> {
    let data = std::fs::read(path)?;
    let embedded_id = sniff_dictionary_id(&data);
    let original_size = data.len() as u64;
    if !train && embedded_id == dictionary_id {
        // Already compressed against the target dictionary.
        let uncompressed_size = frame_content_size(&data, path)?;
        trace!("chunk {} already on dictionary {}", path.display(), dictionary_id);
        return Ok(DecompressOutcome {
            path: path.to_owned(),
            original_size,
            uncompressed_size,
            raw_written: false,
        });
    }
    let capacity = frame_content_size(&data, path)?;
    let mut decompressor = match embedded_id {
        0 => zstd::bulk::Decompressor::new(),
        id => {
            let dictionary = old_dictionaries.get(&id).ok_or_else(|| {
                RecompressError::MissingDictionary { dictionary_id: id, path: path.to_owned() }
            })?;
            zstd::bulk::Decompressor::with_dictionary(dictionary)
        }
    }
    .map_err(|err| RecompressError::Compression {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    let raw = decompressor
        .decompress(&data, capacity as usize)
        .map_err(|err| RecompressError::Compression {
            path: path.to_owned(),
            message: err.to_string(),
        })?;
    if verify {
        let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("");
        match ChunkId::from_hex(stem) {
            Ok(id) if id == ChunkId::b2_digest(&raw) => {}
            _ => return Err(RecompressError::ChunkMismatch { path: path.to_owned() }),
        }
    }
    let uncompressed_size = raw.len() as u64;
    std::fs::write(raw_path(path), &raw)?;
    Ok(DecompressOutcome {
        path: path.to_owned(),
        original_size,
        uncompressed_size,
        raw_written: true,
    })
}

fn recompress_chunk(
    path: &Path,
    dictionary: Option<&Vec<u8>>,
    level: i32,
) -> Result<u64, RecompressError> {
    let raw_path = raw_path(path);
    let raw = std::fs::read(&raw_path)?;
    let mut compressor = match dictionary {
        Some(dictionary) => zstd::bulk::Compressor::with_dictionary(level, dictionary),
        None => zstd::bulk::Compressor::new(level),
    }
    .map_err(|err| RecompressError::Compression {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    let compressed = compressor
        .compress(&raw)
        .map_err(|err| RecompressError::Compression {
            path: path.to_owned(),
            message: err.to_string(),
        })?;
    std::fs::write(path, &compressed)?;
    std::fs::remove_file(&raw_path)?;
    trace!(
        "recompressed {}: {} -> {} bytes",
        path.display(),
        raw.len(),
        compressed.len()
    );
    Ok(compressed.len() as u64)
}

fn train_dictionary(
    samples: &[PathBuf],
    capacity: usize,
    dictionary_id: u32,
) -> Result<Vec<u8>, RecompressError> {
    let mut trained = zstd::dict::from_files(samples, capacity)
        .map_err(|err| RecompressError::Training { message: err.to_string() })?;
    if trained.len() < 8
        || u32::from_le_bytes(trained[0..4].try_into().unwrap()) != DICTIONARY_MAGIC
    {
        return Err(RecompressError::Training {
            message: "trainer produced no usable dictionary".to_owned(),
        });
    }
    // The id field sits right behind the magic; stamping it here is what
    // makes recompressed frames reference this dictionary.
    trained[4..8].copy_from_slice(&dictionary_id.to_le_bytes());
    Ok(trained)
}

fn raw_path(path: &Path) -> PathBuf {
    path.with_extension("raw")
}

fn frame_content_size(data: &[u8], path: &Path) -> Result<u64, RecompressError> {
    match zstd::zstd_safe::get_frame_content_size(data) {
        Ok(Some(size)) => Ok(size),
        _ => Err(RecompressError::MissingContentSize { path: path.to_owned() }),
    }
}
