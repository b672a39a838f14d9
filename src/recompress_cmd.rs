use anyhow::{Context, Result};
use log::*;
use std::path::PathBuf;

use crate::string_utils::*;
use cazar::recompress::{recompress, RecompressOptions};
use cazar::ChunkStore;

#[derive(Debug, Clone)]
pub struct Command {
    pub store: PathBuf,
    pub options: RecompressOptions,
}

impl Command {
    pub async fn run(self) -> Result<()> {
        let store = ChunkStore::new(&self.store);
        let summary = recompress(&store, &self.options)
            .await
            .context(format!("Failed to recompress store {}", self.store.display()))?;
        info!("Store: {}", self.store.display());
        info!(
            "  Chunks: {} ({} recompressed, {} skipped)",
            summary.chunk_count, summary.recompressed, summary.skipped
        );
        if summary.trained_dictionary {
            info!("  Trained dictionary: {}", self.options.dictionary_id);
        }
        info!("  Original size: {}", size_to_str(summary.original_size));
        info!(
            "  Uncompressed size: {}",
            size_to_str(summary.uncompressed_size)
        );
        if summary.recompressed > 0 {
            info!(
                "  Recompressed size: {}",
                size_to_str(summary.recompressed_size)
            );
        }
        Ok(())
    }
}
