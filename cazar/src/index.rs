//! Index file reader.
//!
//! An index (`.caibx`) lists the ordered chunk ids that compose one target
//! file. Layout, all little endian:
//!
//! | Offset | Size | Description                                    |
//! |--------|------|------------------------------------------------|
//! |      0 |   16 | Index header: payload size 48, type marker.    |
//! |     16 |   32 | Remainder of the index header (chunker knobs). |
//! |     48 |   16 | Table header: payload size `u64::MAX`, marker. |
//! |     64 | 40*n | Records `(offset: u64, chunk id: 32 bytes)`.   |
//!
//! Records end at end of file or at a record with offset 0. The offsets are
//! producer-side bookkeeping and are ignored here.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::chunk_id::{ChunkId, CHUNK_ID_LEN};

/// Type marker of the index header.
pub const INDEX_HEADER_TYPE: u64 = 0x9682_4d9c_7b12_9ff9;
/// Payload size carried by the index header.
pub const INDEX_HEADER_SIZE: u64 = 48;
/// Type marker of the chunk table header.
pub const TABLE_HEADER_TYPE: u64 = 0xe75b_9e11_2f17_417d;

#[derive(Debug)]
pub enum IndexError {
    /// A header at the given offset did not match the expected layout.
    MalformedIndex { offset: u64 },
    /// The file ended inside a header or record.
    UnexpectedEnd { offset: u64 },
    Io(std::io::Error),
}

impl std::error::Error for IndexError {}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedIndex { offset } => {
                write!(f, "malformed index (offset {})", offset)
            }
            Self::UnexpectedEnd { offset } => {
                write!(f, "index ended unexpectedly (offset {})", offset)
            }
            Self::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Read the ordered chunk ids of an index stream.
pub async fn read_index<R>(reader: &mut R) -> Result<Vec<ChunkId>, IndexError>
where
    R: AsyncRead + Unpin,
{
    let mut offset = 0u64;

    let (payload_size, header_type) = read_header(reader, &mut offset).await?;
    if payload_size != INDEX_HEADER_SIZE || header_type != INDEX_HEADER_TYPE {
        return Err(IndexError::MalformedIndex { offset: 0 });
    }
    // The index header payload includes the 16 bytes already read.
    let mut remainder = vec![0u8; (payload_size - 16) as usize];
    read_all(reader, &mut remainder, &mut offset).await?;

    let table_offset = offset;
    let (payload_size, header_type) = read_header(reader, &mut offset).await?;
    if payload_size != u64::MAX || header_type != TABLE_HEADER_TYPE {
        return Err(IndexError::MalformedIndex { offset: table_offset });
    }

    let mut ids = Vec::new();
    loop {
        let mut record = [0u8; 8 + CHUNK_ID_LEN];
        let record_offset = offset;
        if !read_record(reader, &mut record, &mut offset).await? {
            break;
        }
        let chunk_offset = u64::from_le_bytes(record[0..8].try_into().unwrap());
        if chunk_offset == 0 {
            // Terminator record.
            break;
        }
        ids.push(
            ChunkId::from_slice(&record[8..])
                .map_err(|_| IndexError::MalformedIndex { offset: record_offset })?,
        );
    }
    Ok(ids)
}

async fn read_header<R>(reader: &mut R, offset: &mut u64) -> Result<(u64, u64), IndexError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 16];
    read_all(reader, &mut buf, offset).await?;
    Ok((
        u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        u64::from_le_bytes(buf[8..16].try_into().unwrap()),
    ))
}

async fn read_all<R>(reader: &mut R, buf: &mut [u8], offset: &mut u64) -> Result<(), IndexError>
where
    R: AsyncRead + Unpin,
{
    let at = *offset;
    match reader.read_exact(buf).await {
        Ok(_) => {
            *offset += buf.len() as u64;
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(IndexError::UnexpectedEnd { offset: at })
        }
        Err(err) => Err(IndexError::Io(err)),
    }
}

/// Read one full record, or nothing at a clean end of file.
async fn read_record<R>(
    reader: &mut R,
    buf: &mut [u8],
    offset: &mut u64,
) -> Result<bool, IndexError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let count = reader.read(&mut buf[filled..]).await?;
        if count == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(IndexError::UnexpectedEnd { offset: *offset + filled as u64 });
        }
        filled += count;
    }
    *offset += filled as u64;
    Ok(true)
}
