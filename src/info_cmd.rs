use anyhow::{Context, Result};
use log::*;
use std::path::PathBuf;
use tokio::fs::File;

use crate::string_utils::*;
use cazar::archive::ArchiveLayout;
use cazar::frame;

pub fn print_archive(layout: &ArchiveLayout, total_frames: usize) {
    info!("Archive:");
    info!("  Total size: {}", size_to_str(layout.total_len));
    info!(
        "  Frames: {} ({} data, {} skippable)",
        total_frames,
        layout.data_frames.len(),
        total_frames - layout.data_frames.len()
    );
    info!(
        "  Compressed chunk data: {}",
        size_to_str(layout.compressed_data_size())
    );
    match layout.uncompressed_size() {
        Some(size) => info!("  Uncompressed size: {}", size_to_str(size)),
        None => info!("  Uncompressed size: unknown (missing content sizes)"),
    }
    let mut dictionary_ids: Vec<u32> = layout
        .data_frames
        .iter()
        .map(|frame| frame.dictionary_id)
        .filter(|&id| id != 0)
        .collect();
    dictionary_ids.sort_unstable();
    dictionary_ids.dedup();
    if dictionary_ids.is_empty() {
        info!("  Dictionaries: none");
    } else {
        info!("  Dictionaries: {:?}", dictionary_ids);
    }
    match &layout.chunk_ids {
        Some(ids) => {
            info!("Chunks:");
            info!("  Chunks in archive: {}", ids.len());
            if !layout.data_frames.is_empty() {
                match layout.uncompressed_size() {
                    Some(total) => info!(
                        "  Average chunk size: {}",
                        size_to_str(total / layout.data_frames.len() as u64)
                    ),
                    None => info!("  Average chunk size: unknown (missing content sizes)"),
                }
            }
            if let Some(first) = ids.first() {
                info!("  First chunk: {}", first);
            }
        }
        None => info!("Chunks: no chunk id table"),
    }
    match &layout.seek_table {
        Some(entries) => info!("Seek table: {} entries", entries.len()),
        None => info!("Seek table: none"),
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    pub input: PathBuf,
}

impl Command {
    pub async fn run(self) -> Result<()> {
        let mut file = File::open(&self.input)
            .await
            .context(format!("Failed to open {}", self.input.display()))?;
        let walk = frame::walk(&mut file, 0)
            .await
            .context(format!("Failed to parse {}", self.input.display()))?;
        if let Some(offset) = walk.trailing_garbage {
            warn!("non-frame data after offset {}", offset);
        }
        let total_frames = walk.frames.len();
        let layout = ArchiveLayout::from_frames(&walk.frames);
        let seedable = layout.chunk_ids.is_some();
        print_archive(&layout, total_frames);
        if !seedable {
            warn!("{} can not be used as a seed", self.input.display());
        }
        Ok(())
    }
}
