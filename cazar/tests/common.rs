#![allow(dead_code)]
use std::path::{Path, PathBuf};

use rand::Rng;

use cazar::{ChunkId, ChunkStore};

/// Content for one chunk: structured enough to be worth dictionary
/// training, random enough to be distinct.
pub fn chunk_content(index: usize, len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    let mut content = Vec::with_capacity(len);
    content.extend_from_slice(b"{\"package\":\"registry-entry\",\"version\":\"1.0.");
    content.extend_from_slice(index.to_string().as_bytes());
    content.extend_from_slice(b"\",\"payload\":\"");
    while content.len() < len {
        // Mix of repeated structure and noise.
        if content.len() % 7 == 0 {
            content.extend_from_slice(b"abcdefgh");
        } else {
            content.push(rng.random());
        }
    }
    content.truncate(len);
    content
}

/// Write `chunks` into a store as single-frame files, returning their ids
/// in order.
pub fn populate_store(root: &Path, chunks: &[Vec<u8>], level: i32) -> Vec<ChunkId> {
    let store = ChunkStore::new(root);
    let mut ids = Vec::with_capacity(chunks.len());
    for content in chunks {
        let id = ChunkId::b2_digest(content);
        let path = store.chunk_path(&id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, zstd::bulk::compress(content, level).unwrap()).unwrap();
        ids.push(id);
    }
    ids
}

/// Synthesize an archive for `ids` out of a store, panicking on failure.
pub async fn synthesize_from_store(ids: &[ChunkId], store_root: &Path, output: &Path) {
    cazar::synthesize::synthesize(ids, &ChunkStore::new(store_root), &[], output)
        .await
        .unwrap();
}

/// Build a store and an archive from it in one go; returns the chunk ids.
pub async fn store_and_archive(
    store_root: &Path,
    archive_path: &Path,
    chunks: &[Vec<u8>],
    level: i32,
) -> Vec<ChunkId> {
    let ids = populate_store(store_root, chunks, level);
    synthesize_from_store(&ids, store_root, archive_path).await;
    ids
}

/// Split `content` into fixed-size pieces, like an (external) chunker
/// would.
pub fn split_chunks(content: &[u8], chunk_len: usize) -> Vec<Vec<u8>> {
    content.chunks(chunk_len).map(|piece| piece.to_vec()).collect()
}

/// A synthetic `.caibx` index for the given ids.
pub fn build_index_file(path: &Path, ids: &[ChunkId]) {
    let mut buf = Vec::new();
    buf.extend_from_slice(&48u64.to_le_bytes());
    buf.extend_from_slice(&0x9682_4d9c_7b12_9ff9u64.to_le_bytes());
    buf.extend_from_slice(&[0u8; 32]);
    buf.extend_from_slice(&u64::MAX.to_le_bytes());
    buf.extend_from_slice(&0xe75b_9e11_2f17_417du64.to_le_bytes());
    let mut end = 0u64;
    for id in ids {
        end += 1;
        buf.extend_from_slice(&end.to_le_bytes());
        buf.extend_from_slice(id.as_bytes());
    }
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&[0u8; 32]);
    std::fs::write(path, buf).unwrap();
}

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

pub fn file_names(dir: &Path) -> Vec<PathBuf> {
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    names.sort();
    names
}
