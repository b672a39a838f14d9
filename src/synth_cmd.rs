use anyhow::{Context, Result};
use log::*;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::BufReader;

use crate::string_utils::*;
use cazar::index::read_index;
use cazar::synthesize::synthesize;
use cazar::ChunkStore;

#[derive(Debug, Clone)]
pub struct Command {
    pub index: PathBuf,
    pub store: PathBuf,
    pub seeds: Vec<PathBuf>,
    pub output: PathBuf,
}

impl Command {
    pub async fn run(self) -> Result<()> {
        let index_file = File::open(&self.index)
            .await
            .context(format!("Failed to open index {}", self.index.display()))?;
        let target = read_index(&mut BufReader::new(index_file))
            .await
            .context(format!("Failed to read index {}", self.index.display()))?;
        info!(
            "index {} lists {} chunks",
            self.index.display(),
            target.len()
        );

        let store = ChunkStore::new(&self.store);
        let summary = synthesize(&target, &store, &self.seeds, &self.output)
            .await
            .context(format!("Failed to synthesize {}", self.output.display()))?;

        info!("Output: {}", self.output.display());
        info!(
            "  Chunks: {} ({} from store, {} from seeds)",
            summary.chunk_count, summary.chunks_from_store, summary.chunks_from_seeds
        );
        info!("  From store: {}", size_to_str(summary.bytes_from_store));
        info!("  From seeds: {}", size_to_str(summary.bytes_from_seeds));
        info!(
            "  Uncompressed size: {}",
            size_to_str(summary.uncompressed_size)
        );
        Ok(())
    }
}
