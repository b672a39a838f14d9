//! Local chunk store.
//!
//! A store is a directory tree with one file per chunk at
//! `root/<first 4 hex chars>/<64 hex chars>.cacnk`, each a single zstd
//! frame, plus any shared dictionaries at `root/dictionary-<id>.zstdict`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::chunk_id::{ChunkId, CHUNK_FILE_EXT};

/// File name of a store dictionary. Id 0 means "no dictionary" and has no
/// file name.
pub fn dictionary_file_name(dictionary_id: u32) -> Option<String> {
    if dictionary_id == 0 {
        None
    } else {
        Some(format!("dictionary-{}.zstdict", dictionary_id))
    }
}

/// Handle to a chunk store root.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    /// Path of the given chunk within the store.
    pub fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        id.store_path(&self.root)
    }
    /// Path of the given dictionary, `None` for id 0.
    pub fn dictionary_path(&self, dictionary_id: u32) -> Option<PathBuf> {
        dictionary_file_name(dictionary_id).map(|name| self.root.join(name))
    }
    /// Whether the store holds a file for the given chunk.
    pub async fn has_chunk(&self, id: &ChunkId) -> bool {
        tokio::fs::metadata(self.chunk_path(id)).await.is_ok()
    }
    /// Enumerate every chunk file in the store, sorted by path.
    pub async fn list_chunks(&self) -> Result<Vec<PathBuf>, std::io::Error> {
        let mut chunks = Vec::new();
        let mut top = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = top.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut sub = tokio::fs::read_dir(entry.path()).await?;
            while let Some(chunk) = sub.next_entry().await? {
                let path = chunk.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(CHUNK_FILE_EXT) {
                    chunks.push(path);
                }
            }
        }
        chunks.sort();
        Ok(chunks)
    }
    /// Load every dictionary present at the store root, keyed by id.
    pub async fn load_dictionaries(&self) -> Result<HashMap<u32, Vec<u8>>, std::io::Error> {
        let mut dictionaries = HashMap::new();
        let mut top = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = top.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix("dictionary-")
                .and_then(|rest| rest.strip_suffix(".zstdict"))
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            if id != 0 {
                dictionaries.insert(id, tokio::fs::read(entry.path()).await?);
            }
        }
        Ok(dictionaries)
    }
}
