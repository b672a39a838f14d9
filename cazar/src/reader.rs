//! Random access reads over the uncompressed content of a chunked archive.
//!
//! The reader walks the archive once to build a per frame index, then
//! serves byte range reads in uncompressed coordinates by decompressing
//! only the frames overlapping the requested range. Frames referencing a
//! dictionary are decoded against dictionaries obtained from a resolver
//! given at construction. The most recently decoded frame is kept, which
//! makes a monotonic forward cursor cheap.

use std::collections::HashMap;
use std::io::SeekFrom;

use bytes::{Bytes, BytesMut};
use log::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use zstd::dict::DecoderDictionary;

use crate::frame::{self, Frame, FrameError};
use crate::store::ChunkStore;

#[derive(Debug)]
pub enum ReaderError {
    /// A data frame references a dictionary the resolver does not provide.
    MissingDictionary { dictionary_id: u32 },
    /// A data frame carries no content size, so it can not be indexed.
    MissingContentSize { offset: u64 },
    /// The archive produced fewer bytes than its index promises.
    TruncatedRead { position: u64 },
    /// The decompressor rejected a frame.
    Decompressor { message: String },
    Frame(FrameError),
    Io(std::io::Error),
}

impl std::error::Error for ReaderError {}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDictionary { dictionary_id } => {
                write!(f, "missing dictionary {}", dictionary_id)
            }
            Self::MissingContentSize { offset } => {
                write!(f, "frame at offset {} has no content size", offset)
            }
            Self::TruncatedRead { position } => {
                write!(f, "truncated read (position {})", position)
            }
            Self::Decompressor { message } => write!(f, "decompressor error: {}", message),
            Self::Frame(err) => write!(f, "frame error: {}", err),
            Self::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl From<FrameError> for ReaderError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Source of decompression dictionaries, by id.
pub trait DictionaryResolver {
    fn resolve(&self, dictionary_id: u32) -> std::io::Result<Option<Vec<u8>>>;
}

/// A store root resolves `dictionary-<id>.zstdict` files.
impl DictionaryResolver for ChunkStore {
    fn resolve(&self, dictionary_id: u32) -> std::io::Result<Option<Vec<u8>>> {
        let Some(path) = self.dictionary_path(dictionary_id) else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Resolver for archives that reference no dictionaries at all.
impl DictionaryResolver for () {
    fn resolve(&self, _dictionary_id: u32) -> std::io::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// In-memory resolver, mainly for tests.
impl DictionaryResolver for HashMap<u32, Vec<u8>> {
    fn resolve(&self, dictionary_id: u32) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.get(&dictionary_id).cloned())
    }
}

struct IndexEntry {
    compressed_offset: u64,
    compressed_len: u64,
    uncompressed_offset: u64,
    uncompressed_len: u64,
    dictionary_id: u32,
}

/// Seekable view of an archive's uncompressed content.
pub struct SeekableReader<R> {
    source: R,
    entries: Vec<IndexEntry>,
    size: u64,
    position: u64,
    dictionaries: HashMap<u32, DecoderDictionary<'static>>,
    cached: Option<(usize, Bytes)>,
}

impl<R> SeekableReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Index the archive and load every dictionary its frames reference.
    pub async fn new<D>(mut source: R, resolver: &D) -> Result<Self, ReaderError>
    where
        D: DictionaryResolver + ?Sized,
    {
        let walk = frame::walk(&mut source, 0).await?;
        let mut entries = Vec::new();
        let mut size = 0u64;
        for entry in &walk.frames {
            let Frame::Data(data) = entry else { continue };
            let uncompressed_len = data
                .uncompressed_len
                .ok_or(ReaderError::MissingContentSize { offset: data.offset })?;
            entries.push(IndexEntry {
                compressed_offset: data.offset,
                compressed_len: data.compressed_len,
                uncompressed_offset: size,
                uncompressed_len,
                dictionary_id: data.dictionary_id,
            });
            size += uncompressed_len;
        }
        let mut dictionaries = HashMap::new();
        for dictionary_id in walk.dictionary_ids() {
            let data = resolver
                .resolve(dictionary_id)?
                .ok_or(ReaderError::MissingDictionary { dictionary_id })?;
            debug!("loaded dictionary {} ({} bytes)", dictionary_id, data.len());
            dictionaries.insert(dictionary_id, DecoderDictionary::copy(&data));
        }
        Ok(Self {
            source,
            entries,
            size,
            position: 0,
            dictionaries,
            cached: None,
        })
    }

    /// Total uncompressed size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current cursor position in uncompressed coordinates.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor, clamped into `[0, size]`. Returns the new position.
    pub fn seek(&mut self, position: u64) -> u64 {
        self.position = position.min(self.size);
        self.position
    }

    /// Advance the cursor by `count`, clamped at the end.
    pub fn skip(&mut self, count: u64) -> u64 {
        self.seek(self.position.saturating_add(count))
    }

    /// Read up to `count` bytes at the cursor and advance it.
    ///
    /// Produces exactly `count` bytes unless the request crosses the end of
    /// the content; producing less for an in-bounds request is
    /// [`ReaderError::TruncatedRead`].
    pub async fn read(&mut self, count: usize) -> Result<Bytes, ReaderError> {
        let data = self.read_at(self.position, count).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Read up to `count` bytes at an absolute position, cursor untouched
    /// by the requested range (reads are deterministic and repeatable).
    pub async fn read_at(&mut self, position: u64, count: usize) -> Result<Bytes, ReaderError> {
        let end = position.saturating_add(count as u64).min(self.size);
        if position >= end {
            return Ok(Bytes::new());
        }
        let mut out = BytesMut::with_capacity((end - position) as usize);
        let mut index = self
            .entries
            .partition_point(|entry| entry.uncompressed_offset + entry.uncompressed_len <= position);
        let mut cursor = position;
        while cursor < end {
            let (frame_offset, frame_len) = {
                let entry = &self.entries[index];
                (entry.uncompressed_offset, entry.uncompressed_len)
            };
            let data = self.frame_data(index).await?;
            if (data.len() as u64) < frame_len {
                return Err(ReaderError::TruncatedRead { position: cursor });
            }
            let local_start = (cursor - frame_offset) as usize;
            let local_end = (end.min(frame_offset + frame_len) - frame_offset) as usize;
            out.extend_from_slice(&data[local_start..local_end]);
            cursor = frame_offset + local_end as u64;
            index += 1;
        }
        Ok(out.freeze())
    }

    /// Decompressed content of one frame, through the one frame cache.
    async fn frame_data(&mut self, index: usize) -> Result<Bytes, ReaderError> {
        if let Some((cached_index, data)) = &self.cached {
            if *cached_index == index {
                return Ok(data.clone());
            }
        }
        let entry = &self.entries[index];
        let mut compressed = vec![0u8; entry.compressed_len as usize];
        self.source
            .seek(SeekFrom::Start(entry.compressed_offset))
            .await?;
        self.source.read_exact(&mut compressed).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                ReaderError::TruncatedRead { position: entry.uncompressed_offset }
            } else {
                ReaderError::Io(err)
            }
        })?;
        let mut decompressor = match entry.dictionary_id {
            0 => zstd::bulk::Decompressor::new(),
            id => zstd::bulk::Decompressor::with_prepared_dictionary(
                self.dictionaries
                    .get(&id)
                    .ok_or(ReaderError::MissingDictionary { dictionary_id: id })?,
            ),
        }
        .map_err(|err| ReaderError::Decompressor { message: err.to_string() })?;
        let data: Bytes = decompressor
            .decompress(&compressed, entry.uncompressed_len as usize)
            .map_err(|err| ReaderError::Decompressor { message: err.to_string() })?
            .into();
        self.cached = Some((index, data.clone()));
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn two_frame_archive() -> (Vec<u8>, Vec<u8>) {
        let first: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let second: Vec<u8> = b"0123456789".iter().copied().cycle().take(1000).collect();
        let mut archive = zstd::bulk::compress(&first, 3).unwrap();
        archive.extend_from_slice(&zstd::bulk::compress(&second, 3).unwrap());
        let mut content = first;
        content.extend_from_slice(&second);
        (archive, content)
    }

    #[tokio::test]
    async fn reads_across_frame_boundary() {
        let (archive, content) = two_frame_archive();
        let mut reader = SeekableReader::new(Cursor::new(archive), &()).await.unwrap();
        assert_eq!(reader.size(), content.len() as u64);
        let data = reader.read_at(4000, 200).await.unwrap();
        assert_eq!(&data[..], &content[4000..4200]);
    }

    #[tokio::test]
    async fn cursor_reads_are_sequential() {
        let (archive, content) = two_frame_archive();
        let mut reader = SeekableReader::new(Cursor::new(archive), &()).await.unwrap();
        reader.seek(100);
        let first = reader.read(50).await.unwrap();
        let second = reader.read(50).await.unwrap();
        assert_eq!(&first[..], &content[100..150]);
        assert_eq!(&second[..], &content[150..200]);
        assert_eq!(reader.position(), 200);
    }

    #[tokio::test]
    async fn seek_clamps_to_size() {
        let (archive, content) = two_frame_archive();
        let mut reader = SeekableReader::new(Cursor::new(archive), &()).await.unwrap();
        assert_eq!(reader.seek(u64::MAX), content.len() as u64);
        assert!(reader.read(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_past_end_is_short() {
        let (archive, content) = two_frame_archive();
        let mut reader = SeekableReader::new(Cursor::new(archive), &()).await.unwrap();
        let tail = reader.read_at(content.len() as u64 - 7, 100).await.unwrap();
        assert_eq!(&tail[..], &content[content.len() - 7..]);
    }

    #[tokio::test]
    async fn repeated_reads_match() {
        let (archive, content) = two_frame_archive();
        let mut reader = SeekableReader::new(Cursor::new(archive), &()).await.unwrap();
        let a = reader.read_at(1234, 99).await.unwrap();
        let b = reader.read_at(1234, 99).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..], &content[1234..1333]);
    }
}
