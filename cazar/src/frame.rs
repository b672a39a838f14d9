//! Zstd frame inspector.
//!
//! Walks a compressed stream and enumerates its frames without decompressing
//! any payload. Data frames yield their compressed extent, the content size
//! from the frame header (when present) and the dictionary id. Skippable
//! frames yield their magic and payload, which is where the archive format
//! keeps its trailing metadata.

use bytes::Bytes;
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Magic number of a zstd data frame.
pub const DATA_FRAME_MAGIC: u32 = 0xFD2F_B528;

/// A skippable frame magic is any value in `0x184D2A50..=0x184D2A5F`,
/// i.e. `magic >> 4 == SKIPPABLE_MAGIC_HIGH`.
pub const SKIPPABLE_MAGIC_HIGH: u32 = 0x0184_D2A5;

#[derive(Debug)]
pub enum FrameError {
    /// The bytes at the given offset do not start a zstd frame.
    NotAFrame { offset: u64 },
    /// The stream ended in the middle of a frame starting at the given offset.
    TruncatedFrame { offset: u64 },
    /// A frame header or block header carries a reserved or impossible value.
    CorruptFrame { offset: u64 },
    Io(std::io::Error),
}

impl std::error::Error for FrameError {}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAFrame { offset } => write!(f, "not a zstd frame (offset {})", offset),
            Self::TruncatedFrame { offset } => {
                write!(f, "truncated frame (starting at offset {})", offset)
            }
            Self::CorruptFrame { offset } => {
                write!(f, "corrupt frame (starting at offset {})", offset)
            }
            Self::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// An ordinary zstd frame carrying compressed data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    /// Absolute byte offset of the frame magic within the stream.
    pub offset: u64,
    /// Full frame size: magic, header, blocks and trailing checksum.
    pub compressed_len: u64,
    /// Content size from the frame header, when the header carries one.
    pub uncompressed_len: Option<u64>,
    /// Dictionary id from the frame header, 0 when none.
    pub dictionary_id: u32,
}

impl DataFrame {
    /// End offset of the frame (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.compressed_len
    }
}

/// A skippable frame, opaque to decoders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippableFrame {
    pub offset: u64,
    pub magic: u32,
    pub payload: Bytes,
}

impl SkippableFrame {
    /// Full frame size including magic and size field.
    pub fn compressed_len(&self) -> u64 {
        4 + 4 + self.payload.len() as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Skippable(SkippableFrame),
}

impl Frame {
    pub fn offset(&self) -> u64 {
        match self {
            Frame::Data(frame) => frame.offset,
            Frame::Skippable(frame) => frame.offset,
        }
    }
    pub fn compressed_len(&self) -> u64 {
        match self {
            Frame::Data(frame) => frame.compressed_len,
            Frame::Skippable(frame) => frame.compressed_len(),
        }
    }
}

/// Result of enumerating a stream's frames.
#[derive(Debug, Default)]
pub struct FrameWalk {
    /// Frames in stream order, a gapless partition of the walked range.
    pub frames: Vec<Frame>,
    /// Offset of the first non-frame byte, if the walk hit one.
    pub trailing_garbage: Option<u64>,
}

impl FrameWalk {
    /// Sum of the content sizes of all data frames.
    pub fn uncompressed_size(&self) -> u64 {
        self.frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) => data.uncompressed_len,
                Frame::Skippable(_) => None,
            })
            .sum()
    }
    /// Distinct non-zero dictionary ids referenced by data frames.
    pub fn dictionary_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) if data.dictionary_id != 0 => Some(data.dictionary_id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Sequential frame parser over a seekable byte source.
///
/// A pure inspector: block payloads are skipped, never decompressed, and the
/// source is left positioned right after the last parsed frame.
pub struct FrameWalker<'a, R> {
    reader: &'a mut R,
    offset: u64,
}

impl<'a, R> FrameWalker<'a, R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Create a walker positioned at `offset` within the source.
    pub async fn new(reader: &'a mut R, offset: u64) -> Result<FrameWalker<'a, R>, FrameError> {
        reader.seek(SeekFrom::Start(offset)).await?;
        Ok(Self { reader, offset })
    }

    /// Current absolute offset, the start of the next frame to parse.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Parse the next frame. Returns `None` at end of stream on a frame
    /// boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let frame_offset = self.offset;
        let mut magic_buf = [0u8; 4];
        match self.read_or_eof(&mut magic_buf).await? {
            0 => return Ok(None),
            4 => {}
            // A 1..3 byte tail can not be a frame.
            _ => {
                self.seek_to(frame_offset).await?;
                return Err(FrameError::NotAFrame { offset: frame_offset });
            }
        }
        let magic = u32::from_le_bytes(magic_buf);
        if magic >> 4 == SKIPPABLE_MAGIC_HIGH {
            let size = self.read_u32(frame_offset).await?;
            let mut payload = vec![0u8; size as usize];
            self.read_frame_exact(&mut payload, frame_offset).await?;
            return Ok(Some(Frame::Skippable(SkippableFrame {
                offset: frame_offset,
                magic,
                payload: payload.into(),
            })));
        }
        if magic != DATA_FRAME_MAGIC {
            // Rewind so the non-frame prefix is left unconsumed.
            self.seek_to(frame_offset).await?;
            return Err(FrameError::NotAFrame { offset: frame_offset });
        }
        let frame = self.parse_data_frame(frame_offset).await?;
        Ok(Some(Frame::Data(frame)))
    }

    async fn parse_data_frame(&mut self, frame_offset: u64) -> Result<DataFrame, FrameError> {
        let descriptor = self.read_u8(frame_offset).await?;
        let fcs_flag = descriptor >> 6;
        let single_segment = descriptor & 0x20 != 0;
        let content_checksum = descriptor & 0x04 != 0;
        let did_flag = descriptor & 0x03;

        if !single_segment {
            // Window descriptor, size only matters to decoders.
            self.skip(1, frame_offset).await?;
        }
        let dictionary_id = match did_flag {
            0 => 0,
            1 => u32::from(self.read_u8(frame_offset).await?),
            2 => {
                let mut buf = [0u8; 2];
                self.read_frame_exact(&mut buf, frame_offset).await?;
                u32::from(u16::from_le_bytes(buf))
            }
            _ => self.read_u32(frame_offset).await?,
        };
        let uncompressed_len = match fcs_flag {
            0 if single_segment => Some(u64::from(self.read_u8(frame_offset).await?)),
            0 => None,
            1 => {
                let mut buf = [0u8; 2];
                self.read_frame_exact(&mut buf, frame_offset).await?;
                // The two byte field is biased by 256.
                Some(u64::from(u16::from_le_bytes(buf)) + 256)
            }
            2 => Some(u64::from(self.read_u32(frame_offset).await?)),
            _ => {
                let mut buf = [0u8; 8];
                self.read_frame_exact(&mut buf, frame_offset).await?;
                Some(u64::from_le_bytes(buf))
            }
        };

        loop {
            let mut header = [0u8; 3];
            self.read_frame_exact(&mut header, frame_offset).await?;
            let header = u32::from(u16::from_le_bytes([header[0], header[1]]))
                | (u32::from(header[2]) << 16);
            let last = header & 1 != 0;
            let block_type = (header >> 1) & 3;
            let block_size = u64::from(header >> 3);
            let on_disk_size = match block_type {
                // RLE blocks store a single byte regardless of their size.
                1 => 1,
                0 | 2 => block_size,
                _ => return Err(FrameError::CorruptFrame { offset: frame_offset }),
            };
            self.skip(on_disk_size, frame_offset).await?;
            if last {
                break;
            }
        }
        if content_checksum {
            self.skip(4, frame_offset).await?;
        }
        Ok(DataFrame {
            offset: frame_offset,
            compressed_len: self.offset - frame_offset,
            uncompressed_len,
            dictionary_id,
        })
    }

    async fn read_or_eof(&mut self, buf: &mut [u8]) -> Result<usize, FrameError> {
        let mut filled = 0;
        while filled < buf.len() {
            let count = self.reader.read(&mut buf[filled..]).await?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    async fn read_frame_exact(
        &mut self,
        buf: &mut [u8],
        frame_offset: u64,
    ) -> Result<(), FrameError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(FrameError::TruncatedFrame { offset: frame_offset })
            }
            Err(err) => Err(FrameError::Io(err)),
        }
    }

    async fn read_u8(&mut self, frame_offset: u64) -> Result<u8, FrameError> {
        let mut buf = [0u8; 1];
        self.read_frame_exact(&mut buf, frame_offset).await?;
        Ok(buf[0])
    }

    async fn read_u32(&mut self, frame_offset: u64) -> Result<u32, FrameError> {
        let mut buf = [0u8; 4];
        self.read_frame_exact(&mut buf, frame_offset).await?;
        Ok(u32::from_le_bytes(buf))
    }

    async fn skip(&mut self, count: u64, frame_offset: u64) -> Result<(), FrameError> {
        let target = self.offset + count;
        let end = self.reader.seek(SeekFrom::End(0)).await?;
        if target > end {
            self.reader.seek(SeekFrom::Start(end)).await?;
            return Err(FrameError::TruncatedFrame { offset: frame_offset });
        }
        self.reader.seek(SeekFrom::Start(target)).await?;
        self.offset = target;
        Ok(())
    }

    async fn seek_to(&mut self, offset: u64) -> Result<(), FrameError> {
        self.reader.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        Ok(())
    }
}

/// Read the dictionary id out of a data frame header without parsing the
/// rest of the frame.
///
/// Returns 0 for anything that is not a data frame or carries no
/// dictionary id.
pub fn sniff_dictionary_id(data: &[u8]) -> u32 {
    if data.len() < 5 {
        return 0;
    }
    if u32::from_le_bytes(data[0..4].try_into().unwrap()) != DATA_FRAME_MAGIC {
        return 0;
    }
    let descriptor = data[4];
    let did_flag = descriptor & 0x03;
    if did_flag == 0 {
        return 0;
    }
    let mut pos = 5;
    if descriptor & 0x20 == 0 {
        // Window descriptor precedes the dictionary id.
        pos += 1;
    }
    let width = [0, 1, 2, 4][did_flag as usize];
    if data.len() < pos + width {
        return 0;
    }
    let mut bytes = [0u8; 4];
    bytes[..width].copy_from_slice(&data[pos..pos + width]);
    u32::from_le_bytes(bytes)
}

/// Enumerate all frames of a stream starting at `offset`.
///
/// Stops cleanly at end of stream or at a non-frame prefix, which is
/// reported through [`FrameWalk::trailing_garbage`] rather than as an error.
pub async fn walk<R>(reader: &mut R, offset: u64) -> Result<FrameWalk, FrameError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let mut walker = FrameWalker::new(reader, offset).await?;
    let mut walk = FrameWalk::default();
    loop {
        match walker.next_frame().await {
            Ok(Some(frame)) => walk.frames.push(frame),
            Ok(None) => break,
            Err(FrameError::NotAFrame { offset }) => {
                walk.trailing_garbage = Some(offset);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(walk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn skippable(magic: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&magic.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    // Hand-assembled data frame: single-segment, 4 byte content size,
    // one raw last block.
    fn data_frame(content: &[u8], dictionary_id: Option<u8>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DATA_FRAME_MAGIC.to_le_bytes());
        let mut descriptor = 0x20 | 0x80; // single segment, fcs flag 2
        if dictionary_id.is_some() {
            descriptor |= 0x01;
        }
        buf.push(descriptor);
        if let Some(id) = dictionary_id {
            buf.push(id);
        }
        buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
        let block_header = ((content.len() as u32) << 3) | 1; // raw, last
        buf.extend_from_slice(&block_header.to_le_bytes()[0..3]);
        buf.extend_from_slice(content);
        buf
    }

    #[tokio::test]
    async fn walks_mixed_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&data_frame(b"hello zstd", None));
        stream.extend_from_slice(&data_frame(b"with dict", Some(7)));
        stream.extend_from_slice(&skippable(0x184D2A5D, b"metadata"));
        let len = stream.len() as u64;

        let mut cursor = Cursor::new(stream);
        let walk = walk(&mut cursor, 0).await.unwrap();
        assert_eq!(walk.frames.len(), 3);
        assert!(walk.trailing_garbage.is_none());
        // Frames partition the stream with no gaps.
        let mut expected_offset = 0;
        for frame in &walk.frames {
            assert_eq!(frame.offset(), expected_offset);
            expected_offset += frame.compressed_len();
        }
        assert_eq!(expected_offset, len);
        assert_eq!(walk.uncompressed_size(), 10 + 9);
        assert_eq!(walk.dictionary_ids(), vec![7]);
        match &walk.frames[2] {
            Frame::Skippable(frame) => {
                assert_eq!(frame.magic, 0x184D2A5D);
                assert_eq!(&frame.payload[..], b"metadata");
            }
            other => panic!("expected skippable frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rle_block_occupies_one_byte() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DATA_FRAME_MAGIC.to_le_bytes());
        buf.push(0x20 | 0x00); // single segment, 1 byte content size
        buf.push(100); // content size
        let block_header = (100u32 << 3) | (1 << 1) | 1; // RLE, last
        buf.extend_from_slice(&block_header.to_le_bytes()[0..3]);
        buf.push(0xAA); // the single repeated byte
        let len = buf.len() as u64;

        let mut cursor = Cursor::new(buf);
        let walk = walk(&mut cursor, 0).await.unwrap();
        match &walk.frames[0] {
            Frame::Data(frame) => {
                assert_eq!(frame.compressed_len, len);
                assert_eq!(frame.uncompressed_len, Some(100));
            }
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn two_byte_content_size_is_biased() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DATA_FRAME_MAGIC.to_le_bytes());
        buf.push(0x40 | 0x20); // fcs flag 1, single segment
        buf.extend_from_slice(&300u16.to_le_bytes());
        let block_header = 1u32; // empty raw last block
        buf.extend_from_slice(&block_header.to_le_bytes()[0..3]);

        let mut cursor = Cursor::new(buf);
        let walk = walk(&mut cursor, 0).await.unwrap();
        match &walk.frames[0] {
            Frame::Data(frame) => assert_eq!(frame.uncompressed_len, Some(300 + 256)),
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn content_checksum_is_skipped() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DATA_FRAME_MAGIC.to_le_bytes());
        buf.push(0x20 | 0x04); // single segment, checksum, 1 byte fcs
        buf.push(3);
        let block_header = (3u32 << 3) | 1;
        buf.extend_from_slice(&block_header.to_le_bytes()[0..3]);
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let len = buf.len() as u64;

        let mut cursor = Cursor::new(buf);
        let walk = walk(&mut cursor, 0).await.unwrap();
        assert_eq!(walk.frames[0].compressed_len(), len);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = data_frame(b"some data going missing", None);
        buf.truncate(buf.len() - 5);
        let mut cursor = Cursor::new(buf);
        let mut walker = FrameWalker::new(&mut cursor, 0).await.unwrap();
        assert!(matches!(
            walker.next_frame().await,
            Err(FrameError::TruncatedFrame { offset: 0 })
        ));
    }

    #[tokio::test]
    async fn non_frame_prefix_is_reported_not_thrown() {
        let mut stream = data_frame(b"valid", None);
        let garbage_offset = stream.len() as u64;
        stream.extend_from_slice(b"tarball trailer, not zstd");
        let mut cursor = Cursor::new(stream);
        let walk = walk(&mut cursor, 0).await.unwrap();
        assert_eq!(walk.frames.len(), 1);
        assert_eq!(walk.trailing_garbage, Some(garbage_offset));
    }

    #[test]
    fn sniffs_dictionary_ids() {
        // Not a frame at all.
        assert_eq!(sniff_dictionary_id(b"garbage bytes"), 0);
        // Single segment frame with a one byte id.
        assert_eq!(sniff_dictionary_id(&data_frame(b"x", Some(42))), 42);
        // No dictionary id flag.
        assert_eq!(sniff_dictionary_id(&data_frame(b"x", None)), 0);
        // Non single segment frame: window descriptor before the id.
        let mut buf = Vec::new();
        buf.extend_from_slice(&DATA_FRAME_MAGIC.to_le_bytes());
        buf.push(0x02); // two byte dictionary id, window descriptor present
        buf.push(0x00); // window descriptor
        buf.extend_from_slice(&0x1234u16.to_le_bytes());
        assert_eq!(sniff_dictionary_id(&buf), 0x1234);
    }

    #[tokio::test]
    async fn real_zstd_frame_parses() {
        let content = b"walked but never decompressed".repeat(20);
        let compressed = zstd::bulk::compress(&content, 3).unwrap();
        let len = compressed.len() as u64;
        let mut cursor = Cursor::new(compressed);
        let walk = walk(&mut cursor, 0).await.unwrap();
        assert_eq!(walk.frames.len(), 1);
        match &walk.frames[0] {
            Frame::Data(frame) => {
                assert_eq!(frame.compressed_len, len);
                assert_eq!(frame.uncompressed_len, Some(content.len() as u64));
                assert_eq!(frame.dictionary_id, 0);
            }
            other => panic!("expected data frame, got {:?}", other),
        }
    }
}
