//! Chunked archive trailing metadata.
//!
//! A chunked archive is a plain zstd stream whose data frames each hold one
//! content chunk, followed by two skippable frames:
//!
//! | Order | Magic        | Payload                                              |
//! |-------|--------------|------------------------------------------------------|
//! |     1 | `0x184D2A5D` | `N * 32` chunk id bytes, cookie `0xD12FA2A3` (u32 le) |
//! |     2 | `0x184D2A5E` | `N * (compressed: u32 le, uncompressed: u32 le)`, `N` (u32 le), reserved `0` (u8), cookie `0x8F92EAB1` (u32 le) |
//!
//! `N` equals the number of data frames and the i-th row of each table
//! describes the i-th data frame. Decoders ignore both frames, so the
//! archive stays an ordinary decompressible stream.

use tokio::io::{AsyncRead, AsyncSeek};

use crate::chunk_id::{ChunkId, CHUNK_ID_LEN};
use crate::frame::{self, DataFrame, Frame, FrameError, SkippableFrame};

/// Magic of the skippable frame holding the ordered chunk id table.
pub const CHUNK_TABLE_MAGIC: u32 = 0x184D_2A5D;
/// Cookie terminating the chunk id table payload.
pub const CHUNK_TABLE_COOKIE: u32 = 0xD12F_A2A3;
/// Magic of the skippable frame holding the per-frame seek table.
pub const SEEK_TABLE_MAGIC: u32 = 0x184D_2A5E;
/// Cookie terminating the seek table payload.
pub const SEEK_TABLE_COOKIE: u32 = 0x8F92_EAB1;

/// One seek table row: sizes of a single data frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekEntry {
    pub compressed_len: u32,
    pub uncompressed_len: u32,
}

/// Encode the chunk id table as a complete skippable frame.
pub fn build_chunk_table(ids: &[ChunkId]) -> Vec<u8> {
    let payload_len = ids.len() * CHUNK_ID_LEN + 4;
    let mut buf = Vec::with_capacity(8 + payload_len);
    buf.extend_from_slice(&CHUNK_TABLE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
    for id in ids {
        buf.extend_from_slice(id.as_bytes());
    }
    buf.extend_from_slice(&CHUNK_TABLE_COOKIE.to_le_bytes());
    buf
}

/// Encode the seek table as a complete skippable frame.
pub fn build_seek_table(entries: &[SeekEntry]) -> Vec<u8> {
    let payload_len = entries.len() * 8 + 9;
    let mut buf = Vec::with_capacity(8 + payload_len);
    buf.extend_from_slice(&SEEK_TABLE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
    for entry in entries {
        buf.extend_from_slice(&entry.compressed_len.to_le_bytes());
        buf.extend_from_slice(&entry.uncompressed_len.to_le_bytes());
    }
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    buf.push(0);
    buf.extend_from_slice(&SEEK_TABLE_COOKIE.to_le_bytes());
    buf
}

/// Decode a chunk id table payload, validating its length against the data
/// frame count and its trailing cookie. `None` when the payload is not a
/// chunk id table for `frame_count` frames.
pub fn parse_chunk_table(payload: &[u8], frame_count: usize) -> Option<Vec<ChunkId>> {
    if payload.len() != frame_count * CHUNK_ID_LEN + 4 {
        return None;
    }
    let (rows, cookie) = payload.split_at(frame_count * CHUNK_ID_LEN);
    if cookie != CHUNK_TABLE_COOKIE.to_le_bytes() {
        return None;
    }
    Some(
        rows.chunks_exact(CHUNK_ID_LEN)
            .map(|row| ChunkId::from_slice(row).expect("row width is CHUNK_ID_LEN"))
            .collect(),
    )
}

/// Decode a seek table payload. `None` when the footer does not validate.
pub fn parse_seek_table(payload: &[u8]) -> Option<Vec<SeekEntry>> {
    if payload.len() < 9 || (payload.len() - 9) % 8 != 0 {
        return None;
    }
    let (rows, footer) = payload.split_at(payload.len() - 9);
    let count = u32::from_le_bytes(footer[0..4].try_into().unwrap()) as usize;
    let cookie = u32::from_le_bytes(footer[5..9].try_into().unwrap());
    if cookie != SEEK_TABLE_COOKIE || footer[4] != 0 || count * 8 != rows.len() {
        return None;
    }
    Some(
        rows.chunks_exact(8)
            .map(|row| SeekEntry {
                compressed_len: u32::from_le_bytes(row[0..4].try_into().unwrap()),
                uncompressed_len: u32::from_le_bytes(row[4..8].try_into().unwrap()),
            })
            .collect(),
    )
}

/// Parsed view of a chunked archive: its data frames and whatever trailing
/// tables it carries.
#[derive(Debug, Default)]
pub struct ArchiveLayout {
    pub data_frames: Vec<DataFrame>,
    pub chunk_ids: Option<Vec<ChunkId>>,
    pub seek_table: Option<Vec<SeekEntry>>,
    pub total_len: u64,
}

impl ArchiveLayout {
    /// Walk `reader` from the start and extract the archive layout.
    pub async fn from_reader<R>(reader: &mut R) -> Result<Self, FrameError>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        let walk = frame::walk(reader, 0).await?;
        Ok(Self::from_frames(&walk.frames))
    }

    /// Partition walked frames and recover the trailing tables.
    ///
    /// The chunk id table is searched from the last skippable frame towards
    /// the first; a candidate must have the table magic, the exact payload
    /// length for the data frame count, and the table cookie. Same scheme
    /// for the seek table. Archives without tables yield `None` fields.
    pub fn from_frames(frames: &[Frame]) -> Self {
        let mut data_frames = Vec::new();
        let mut skippable: Vec<&SkippableFrame> = Vec::new();
        let mut total_len = 0;
        for entry in frames {
            total_len = total_len.max(entry.offset() + entry.compressed_len());
            match entry {
                Frame::Data(data) => data_frames.push(data.clone()),
                Frame::Skippable(frame) => skippable.push(frame),
            }
        }
        let chunk_ids = skippable
            .iter()
            .rev()
            .filter(|frame| frame.magic == CHUNK_TABLE_MAGIC)
            .find_map(|frame| parse_chunk_table(&frame.payload, data_frames.len()));
        let seek_table = skippable
            .iter()
            .rev()
            .filter(|frame| frame.magic == SEEK_TABLE_MAGIC)
            .find_map(|frame| parse_seek_table(&frame.payload));
        Self {
            data_frames,
            chunk_ids,
            seek_table,
            total_len,
        }
    }

    /// Total compressed size of the data frames.
    pub fn compressed_data_size(&self) -> u64 {
        self.data_frames.iter().map(|frame| frame.compressed_len).sum()
    }

    /// Total uncompressed size of the data frames, when all carry a
    /// content size.
    pub fn uncompressed_size(&self) -> Option<u64> {
        self.data_frames
            .iter()
            .map(|frame| frame.uncompressed_len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ChunkId {
        ChunkId::from_slice(&[byte; CHUNK_ID_LEN]).unwrap()
    }

    #[test]
    fn chunk_table_round_trip() {
        let ids = vec![id(1), id(2), id(3)];
        let table = build_chunk_table(&ids);
        assert_eq!(&table[0..4], &CHUNK_TABLE_MAGIC.to_le_bytes());
        let payload = &table[8..];
        assert_eq!(payload.len(), 3 * CHUNK_ID_LEN + 4);
        assert_eq!(parse_chunk_table(payload, 3).unwrap(), ids);
        // Wrong frame count must not match.
        assert!(parse_chunk_table(payload, 2).is_none());
    }

    #[test]
    fn chunk_table_rejects_bad_cookie() {
        let mut table = build_chunk_table(&[id(9)]);
        let len = table.len();
        table[len - 1] ^= 0xFF;
        assert!(parse_chunk_table(&table[8..], 1).is_none());
    }

    #[test]
    fn seek_table_round_trip() {
        let entries = vec![
            SeekEntry { compressed_len: 100, uncompressed_len: 4096 },
            SeekEntry { compressed_len: 200, uncompressed_len: 8192 },
        ];
        let table = build_seek_table(&entries);
        assert_eq!(&table[0..4], &SEEK_TABLE_MAGIC.to_le_bytes());
        let payload = &table[8..];
        assert_eq!(payload.len(), 2 * 8 + 9);
        assert_eq!(parse_seek_table(payload).unwrap(), entries);
    }

    #[test]
    fn seek_table_rejects_bad_footer() {
        let entries = vec![SeekEntry { compressed_len: 1, uncompressed_len: 1 }];
        let mut table = build_seek_table(&entries);
        let reserved = table.len() - 5;
        table[reserved] = 1;
        assert!(parse_seek_table(&table[8..]).is_none());
    }
}
