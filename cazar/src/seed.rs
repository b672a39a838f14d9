//! Seed archive inspection.
//!
//! A previously downloaded chunked archive can serve as a local source of
//! compressed chunks. Its embedded chunk id table names the content of each
//! data frame, so matching chunks can be spliced out of the seed byte range
//! for byte range without decompressing anything.

use log::*;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::archive::ArchiveLayout;
use crate::chunk_id::ChunkId;
use crate::frame::FrameError;

/// A chunk located inside a seed archive: the id bound to the compressed
/// byte range that decompresses to the chunk's content.
#[derive(Clone, Debug)]
pub struct SeedChunk {
    pub id: ChunkId,
    pub dictionary_id: u32,
    /// Absolute offset of the chunk's frame within the seed.
    pub offset: u64,
    /// Full compressed size of the chunk's frame.
    pub compressed_len: u64,
    /// Content size from the frame header, when present.
    pub uncompressed_len: Option<u64>,
}

/// Recover the chunks embedded in a seed archive, in archive order.
///
/// An archive without a valid chunk id table is not an error; it simply
/// provides no chunks.
pub async fn seed_chunks<R>(reader: &mut R) -> Result<Vec<SeedChunk>, FrameError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let layout = ArchiveLayout::from_reader(reader).await?;
    let Some(ids) = layout.chunk_ids else {
        debug!("archive carries no chunk id table, no seed chunks");
        return Ok(Vec::new());
    };
    Ok(ids
        .into_iter()
        .zip(layout.data_frames.iter())
        .map(|(id, frame)| SeedChunk {
            id,
            dictionary_id: frame.dictionary_id,
            offset: frame.offset,
            compressed_len: frame.compressed_len,
            uncompressed_len: frame.uncompressed_len,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{build_chunk_table, build_seek_table, SeekEntry};
    use crate::frame::DATA_FRAME_MAGIC;
    use std::io::Cursor;

    fn raw_frame(content: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DATA_FRAME_MAGIC.to_le_bytes());
        buf.push(0x20 | 0x80); // single segment, 4 byte content size
        buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(((content.len() as u32) << 3) | 1).to_le_bytes()[0..3]);
        buf.extend_from_slice(content);
        buf
    }

    #[tokio::test]
    async fn pairs_frames_with_table_rows() {
        let ids = [
            ChunkId::b2_digest(b"one"),
            ChunkId::b2_digest(b"two"),
            ChunkId::b2_digest(b"three"),
        ];
        let mut archive = Vec::new();
        let mut frame_offsets = Vec::new();
        let mut entries = Vec::new();
        for content in [b"one".as_slice(), b"two", b"three"] {
            let frame = raw_frame(content);
            frame_offsets.push(archive.len() as u64);
            entries.push(SeekEntry {
                compressed_len: frame.len() as u32,
                uncompressed_len: content.len() as u32,
            });
            archive.extend_from_slice(&frame);
        }
        archive.extend_from_slice(&build_chunk_table(&ids));
        archive.extend_from_slice(&build_seek_table(&entries));

        let mut cursor = Cursor::new(archive);
        let chunks = seed_chunks(&mut cursor).await.unwrap();
        assert_eq!(chunks.len(), 3);
        for ((chunk, id), offset) in chunks.iter().zip(ids.iter()).zip(frame_offsets.iter()) {
            assert_eq!(chunk.id, *id);
            assert_eq!(chunk.offset, *offset);
        }
        assert_eq!(chunks[1].uncompressed_len, Some(3));
    }

    #[tokio::test]
    async fn archive_without_table_has_no_seed_chunks() {
        let mut archive = raw_frame(b"lonely frame");
        archive.extend_from_slice(&raw_frame(b"another"));
        let mut cursor = Cursor::new(archive);
        assert!(seed_chunks(&mut cursor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn table_with_wrong_row_count_is_ignored() {
        let mut archive = raw_frame(b"only one frame");
        archive.extend_from_slice(&build_chunk_table(&[
            ChunkId::b2_digest(b"a"),
            ChunkId::b2_digest(b"b"),
        ]));
        let mut cursor = Cursor::new(archive);
        assert!(seed_chunks(&mut cursor).await.unwrap().is_empty());
    }
}
