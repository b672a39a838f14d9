use blake2::{Blake2b512, Digest};
use std::fmt;
use std::path::{Path, PathBuf};

/// Width of a chunk identifier in bytes.
pub const CHUNK_ID_LEN: usize = 32;

/// File extension used for chunk files in a store.
pub const CHUNK_FILE_EXT: &str = "cacnk";

#[derive(Debug)]
pub enum ChunkIdError {
    InvalidHashLength(usize),
    InvalidHexDigit(char),
}

impl std::error::Error for ChunkIdError {}

impl fmt::Display for ChunkIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHashLength(len) => write!(f, "invalid hash length ({} bytes)", len),
            Self::InvalidHexDigit(c) => write!(f, "invalid hex digit ({:?})", c),
        }
    }
}

/// A chunk identifier, the hash of the chunk's uncompressed content.
///
/// Fixed width, compared and hashed byte-wise. The canonical string form is
/// 64 characters of lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; CHUNK_ID_LEN]);

impl ChunkId {
    /// Create a chunk id from a byte slice. Must be exactly 32 bytes.
    pub fn from_slice(s: &[u8]) -> Result<Self, ChunkIdError> {
        if s.len() != CHUNK_ID_LEN {
            return Err(ChunkIdError::InvalidHashLength(s.len()));
        }
        let mut id = [0u8; CHUNK_ID_LEN];
        id.copy_from_slice(s);
        Ok(Self(id))
    }
    /// Create a chunk id from its canonical 64 character hex form.
    pub fn from_hex(hex: &str) -> Result<Self, ChunkIdError> {
        if hex.len() != CHUNK_ID_LEN * 2 {
            return Err(ChunkIdError::InvalidHashLength(hex.len() / 2));
        }
        if !hex.is_ascii() {
            return Err(ChunkIdError::InvalidHexDigit(
                hex.chars().find(|c| !c.is_ascii()).unwrap_or('?'),
            ));
        }
        let mut id = [0u8; CHUNK_ID_LEN];
        for (index, byte) in id.iter_mut().enumerate() {
            let pair = &hex[index * 2..index * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| {
                ChunkIdError::InvalidHexDigit(pair.chars().next().unwrap_or('?'))
            })?;
        }
        Ok(Self(id))
    }
    /// Create a chunk id by digesting the given data (blake2, truncated).
    pub fn b2_digest(data: &[u8]) -> Self {
        let mut b2 = Blake2b512::new();
        b2.update(data);
        let mut id = [0u8; CHUNK_ID_LEN];
        id.copy_from_slice(&b2.finalize()[..CHUNK_ID_LEN]);
        Self(id)
    }
    #[inline]
    pub fn as_bytes(&self) -> &[u8; CHUNK_ID_LEN] {
        &self.0
    }
    /// Canonical lowercase hex form.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(CHUNK_ID_LEN * 2);
        for byte in &self.0 {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }
    /// Short display form, the first 8 hex characters in brackets.
    pub fn short(&self) -> ShortId {
        ShortId(*self)
    }
    /// Path of the chunk within a store rooted at `root`:
    /// `root/<first 4 hex chars>/<64 hex chars>.cacnk`.
    pub fn store_path(&self, root: &Path) -> PathBuf {
        let hex = self.to_hex();
        root.join(&hex[0..4]).join(format!("{}.{}", hex, CHUNK_FILE_EXT))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Bracketed short form of a chunk id, for log output.
pub struct ShortId(ChunkId);

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", &self.0.to_hex()[0..8])
    }
}
