//! Read-only tar filesystem over a seekable reader.
//!
//! One forward pass over the uncompressed tar stream builds an in-memory
//! entry index; after that, lookups are map hits and file reads are byte
//! range reads against the backing reader at absolute offsets, so multiple
//! open files can interleave freely.
//!
//! Understands ustar headers (with the prefix field), GNU long name and
//! long link extensions, and both octal and base-256 numeric fields. Pax
//! extended headers are skipped.

use std::collections::HashMap;

use bytes::Bytes;
use log::*;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::reader::{ReaderError, SeekableReader};

const BLOCK_LEN: u64 = 512;
/// Upper bound on symlink hops while resolving a path.
const MAX_LINK_HOPS: usize = 40;

#[derive(Debug)]
pub enum TarFsError {
    NotFound { path: String },
    NotADirectory { path: String },
    /// Only plain read access is supported.
    InvalidOpenMode,
    /// A file view was read at or past its end.
    EndOfFile,
    /// Symlink chain longer than the hop bound.
    TooManyLinks { path: String },
    /// The stream is not a tar archive (bad header at the given offset).
    NotATarFile { offset: u64 },
    Reader(ReaderError),
}

impl std::error::Error for TarFsError {}

impl std::fmt::Display for TarFsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { path } => write!(f, "no such entry: {}", path),
            Self::NotADirectory { path } => write!(f, "not a directory: {}", path),
            Self::InvalidOpenMode => write!(f, "only read access is supported"),
            Self::EndOfFile => write!(f, "end of file"),
            Self::TooManyLinks { path } => write!(f, "too many links: {}", path),
            Self::NotATarFile { offset } => {
                write!(f, "not a tar archive (bad header at offset {})", offset)
            }
            Self::Reader(err) => write!(f, "reader error: {}", err),
        }
    }
}

impl From<ReaderError> for TarFsError {
    fn from(err: ReaderError) -> Self {
        Self::Reader(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Hardlink,
}

/// One indexed tar entry.
#[derive(Clone, Debug)]
pub struct TarEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub link_target: Option<String>,
    /// Absolute position of the entry's data in the uncompressed stream.
    pub payload_offset: u64,
}

/// Result of `stat`. A missing path yields the empty default rather than an
/// error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TarStat {
    pub kind: Option<EntryKind>,
    pub size: u64,
    pub mode: u32,
}

impl TarStat {
    fn of(entry: &TarEntry) -> Self {
        Self {
            kind: Some(entry.kind),
            size: entry.size,
            mode: entry.mode,
        }
    }
}

/// Requested access for [`TarFs::open_with`]. Anything but plain read is
/// rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenMode {
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

/// An open file within the tar view. Holds its own cursor; reads go
/// through [`TarFs::read`].
#[derive(Clone, Debug)]
pub struct TarFile {
    entry: TarEntry,
    pos: u64,
}

impl TarFile {
    pub fn entry(&self) -> &TarEntry {
        &self.entry
    }
    pub fn position(&self) -> u64 {
        self.pos
    }
    /// Move this file's cursor, clamped to the entry size.
    pub fn seek(&mut self, pos: u64) -> u64 {
        self.pos = pos.min(self.entry.size);
        self.pos
    }
}

/// Tar archive index over a seekable reader.
pub struct TarFs<R> {
    reader: SeekableReader<R>,
    entries: HashMap<String, TarEntry>,
    dir_map: HashMap<String, Vec<String>>,
}

impl<R> TarFs<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Index the tar stream behind `reader`.
    pub async fn new(mut reader: SeekableReader<R>) -> Result<Self, TarFsError> {
        let mut entries: HashMap<String, TarEntry> = HashMap::new();
        let mut dir_map: HashMap<String, Vec<String>> = HashMap::new();
        let mut offset = 0u64;
        let mut long_name: Option<String> = None;
        let mut long_link: Option<String> = None;
        let size = reader.size();

        while offset + BLOCK_LEN <= size {
            let header_offset = offset;
            let header = reader.read_at(header_offset, BLOCK_LEN as usize).await?;
            if header.iter().all(|&byte| byte == 0) {
                // End of archive marker.
                break;
            }
            verify_checksum(&header, header_offset)?;
            let type_flag = header[156];
            let entry_size = parse_numeric(&header[124..136], header_offset)?;
            let payload_offset = header_offset + BLOCK_LEN;
            let payload_blocks = entry_size.div_ceil(BLOCK_LEN);
            offset = payload_offset + payload_blocks * BLOCK_LEN;

            match type_flag {
                // GNU long name / long link apply to the following entry.
                b'L' => {
                    let data = reader.read_at(payload_offset, entry_size as usize).await?;
                    long_name = Some(trim_nul_string(&data));
                    continue;
                }
                b'K' => {
                    let data = reader.read_at(payload_offset, entry_size as usize).await?;
                    long_link = Some(trim_nul_string(&data));
                    continue;
                }
                // Pax extended headers carry attributes we do not index.
                b'x' | b'g' => {
                    long_name = None;
                    long_link = None;
                    continue;
                }
                _ => {}
            }

            let kind = match type_flag {
                b'0' | 0 | b'7' => EntryKind::File,
                b'5' => EntryKind::Directory,
                b'2' => EntryKind::Symlink,
                b'1' => EntryKind::Hardlink,
                other => {
                    trace!(
                        "skipping tar entry type {:?} at offset {}",
                        other as char,
                        header_offset
                    );
                    long_name = None;
                    long_link = None;
                    continue;
                }
            };
            let path = match long_name.take() {
                Some(name) => normalize_path(&name),
                None => normalize_path(&header_path(&header)),
            };
            if path.is_empty() {
                continue;
            }
            let link_field = trim_nul_string(&header[157..257]);
            let link_target = match long_link.take() {
                Some(link) => Some(link),
                None if !link_field.is_empty() => Some(link_field),
                None => None,
            };
            let entry = TarEntry {
                path: path.clone(),
                kind,
                mode: parse_numeric(&header[100..108], header_offset)? as u32,
                size: entry_size,
                link_target,
                payload_offset,
            };
            insert_entry(&mut entries, &mut dir_map, entry);
        }
        debug!("tar index holds {} entries", entries.len());
        Ok(Self {
            reader,
            entries,
            dir_map,
        })
    }

    /// Look up a path without following symlinks.
    pub fn get(&self, path: &str) -> Result<TarFile, TarFsError> {
        let normalized = normalize_path(path);
        match self.entries.get(&normalized) {
            Some(entry) => Ok(TarFile { entry: entry.clone(), pos: 0 }),
            None => Err(TarFsError::NotFound { path: normalized }),
        }
    }

    /// Open a file for reading, following links.
    pub fn open(&self, path: &str) -> Result<TarFile, TarFsError> {
        self.open_with(path, OpenMode::default())
    }

    /// Open with explicit access flags; anything but plain read fails.
    pub fn open_with(&self, path: &str, mode: OpenMode) -> Result<TarFile, TarFsError> {
        if mode.write || mode.create || mode.truncate || mode.append {
            return Err(TarFsError::InvalidOpenMode);
        }
        let entry = self
            .follow_links(path)?
            .ok_or_else(|| TarFsError::NotFound { path: normalize_path(path) })?;
        Ok(TarFile { entry: entry.clone(), pos: 0 })
    }

    /// Stat a path, following links. Missing paths give the empty stat.
    pub fn stat(&self, path: &str) -> Result<TarStat, TarFsError> {
        Ok(self.follow_links(path)?.map(TarStat::of).unwrap_or_default())
    }

    /// Stat a path without following links.
    pub fn lstat(&self, path: &str) -> TarStat {
        self.entries
            .get(&normalize_path(path))
            .map(TarStat::of)
            .unwrap_or_default()
    }

    /// Children of a directory, in archive order.
    pub fn readdir(&self, path: &str) -> Result<&[String], TarFsError> {
        let normalized = normalize_path(path);
        if !normalized.is_empty() {
            match self.entries.get(&normalized) {
                Some(entry) if entry.kind == EntryKind::Directory => {}
                Some(_) => return Err(TarFsError::NotADirectory { path: normalized }),
                None => return Err(TarFsError::NotFound { path: normalized }),
            }
        }
        Ok(self
            .dir_map
            .get(&normalized)
            .map(|children| children.as_slice())
            .unwrap_or(&[]))
    }

    /// Read up to `count` bytes at the file's cursor and advance it.
    /// Reading at or past the end of the entry is an error.
    pub async fn read(&mut self, file: &mut TarFile, count: usize) -> Result<Bytes, TarFsError> {
        if file.pos >= file.entry.size {
            return Err(TarFsError::EndOfFile);
        }
        let remaining = (file.entry.size - file.pos) as usize;
        let count = count.min(remaining);
        let data = self
            .reader
            .read_at(file.entry.payload_offset + file.pos, count)
            .await?;
        file.pos += data.len() as u64;
        Ok(data)
    }

    /// Read the entire content of the file, regardless of its cursor.
    pub async fn read_all(&mut self, file: &TarFile) -> Result<Bytes, TarFsError> {
        Ok(self
            .reader
            .read_at(file.entry.payload_offset, file.entry.size as usize)
            .await?)
    }

    /// The backing seekable reader.
    pub fn into_inner(self) -> SeekableReader<R> {
        self.reader
    }

    fn follow_links(&self, path: &str) -> Result<Option<&TarEntry>, TarFsError> {
        let mut current = match self.entries.get(&normalize_path(path)) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let mut hops = 0;
        loop {
            let target = match (current.kind, &current.link_target) {
                // Symlink targets are relative to the entry's directory,
                // hardlink targets name a path from the archive root.
                (EntryKind::Symlink, Some(link)) => join_paths(dirname(&current.path), link),
                (EntryKind::Hardlink, Some(link)) => normalize_path(link),
                _ => return Ok(Some(current)),
            };
            hops += 1;
            if hops > MAX_LINK_HOPS {
                return Err(TarFsError::TooManyLinks { path: normalize_path(path) });
            }
            current = match self.entries.get(&target) {
                Some(entry) => entry,
                None => return Ok(None),
            };
        }
    }
}

fn insert_entry(
    entries: &mut HashMap<String, TarEntry>,
    dir_map: &mut HashMap<String, Vec<String>>,
    entry: TarEntry,
) {
    // Parents may never appear as explicit entries; materialize them so
    // readdir can walk the tree.
    let mut parent = dirname(&entry.path).to_owned();
    let mut child = entry.path.clone();
    entries.insert(entry.path.clone(), entry);
    loop {
        let children = dir_map.entry(parent.clone()).or_default();
        if !children.contains(&child) {
            children.push(child.clone());
        }
        if parent.is_empty() {
            break;
        }
        if !entries.contains_key(&parent) {
            entries.insert(
                parent.clone(),
                TarEntry {
                    path: parent.clone(),
                    kind: EntryKind::Directory,
                    mode: 0o755,
                    size: 0,
                    link_target: None,
                    payload_offset: 0,
                },
            );
        }
        child = parent.clone();
        parent = dirname(&parent).to_owned();
    }
}

fn header_path(header: &[u8]) -> String {
    let name = trim_nul_string(&header[0..100]);
    let prefix = trim_nul_string(&header[345..500]);
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn trim_nul_string(data: &[u8]) -> String {
    let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Octal field, or base-256 when the high bit of the first byte is set.
fn parse_numeric(field: &[u8], offset: u64) -> Result<u64, TarFsError> {
    if field.first().is_some_and(|&byte| byte & 0x80 != 0) {
        let mut value: u64 = u64::from(field[0] & 0x7F);
        for &byte in &field[1..] {
            value = (value << 8) | u64::from(byte);
        }
        return Ok(value);
    }
    let text = String::from_utf8_lossy(field);
    let text = text.trim_matches(|c| c == ' ' || c == '\0');
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8).map_err(|_| TarFsError::NotATarFile { offset })
}

fn verify_checksum(header: &[u8], offset: u64) -> Result<(), TarFsError> {
    let stored = parse_numeric(&header[148..156], offset)?;
    let sum: u64 = header
        .iter()
        .enumerate()
        .map(|(index, &byte)| {
            if (148..156).contains(&index) {
                u64::from(b' ')
            } else {
                u64::from(byte)
            }
        })
        .sum();
    if sum != stored {
        return Err(TarFsError::NotATarFile { offset });
    }
    Ok(())
}

fn dirname(path: &str) -> &str {
    path.rfind('/').map(|index| &path[..index]).unwrap_or("")
}

/// Join a link target onto a base directory and normalize the result.
fn join_paths(base: &str, link: &str) -> String {
    if link.starts_with('/') {
        normalize_path(link)
    } else if base.is_empty() {
        normalize_path(link)
    } else {
        normalize_path(&format!("{}/{}", base, link))
    }
}

/// Collapse `.` and `..` segments, strip leading `./` and `/` and any
/// trailing slash. Never escapes above the root.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("./a/b.txt"), "a/b.txt");
        assert_eq!(normalize_path("a/b/../c"), "a/c");
        assert_eq!(normalize_path("a/./b/"), "a/b");
        assert_eq!(normalize_path("../../x"), "x");
        assert_eq!(normalize_path("/abs/path"), "abs/path");
    }

    #[test]
    fn joins_link_targets() {
        assert_eq!(join_paths("a/b", "../c"), "a/c");
        assert_eq!(join_paths("", "c"), "c");
        assert_eq!(join_paths("a", "/etc/passwd"), "etc/passwd");
    }

    #[test]
    fn parses_octal_and_base256() {
        assert_eq!(parse_numeric(b"0000644\0", 0).unwrap(), 0o644);
        assert_eq!(parse_numeric(b"        ", 0).unwrap(), 0);
        let mut field = [0u8; 12];
        field[0] = 0x80;
        field[10] = 0x01;
        field[11] = 0x00;
        assert_eq!(parse_numeric(&field, 0).unwrap(), 256);
        assert!(parse_numeric(b"notoctal", 0).is_err());
    }

    #[test]
    fn dirname_splits() {
        assert_eq!(dirname("a/b/c.txt"), "a/b");
        assert_eq!(dirname("top.txt"), "");
    }
}
