//! Read-only access into an archive: directory listing, file and byte
//! range extraction.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use cazar::{ChunkStore, DictionaryResolver, EntryKind, SeekableReader, TarFs};

/// Resolves dictionaries from an optional directory; archives without
/// dictionary references need none.
struct DictionaryDir(Option<ChunkStore>);

impl DictionaryResolver for DictionaryDir {
    fn resolve(&self, dictionary_id: u32) -> std::io::Result<Option<Vec<u8>>> {
        match &self.0 {
            Some(store) => store.resolve(dictionary_id),
            None => Ok(None),
        }
    }
}

async fn open_reader(
    input: &PathBuf,
    dictionary_dir: &Option<PathBuf>,
) -> Result<SeekableReader<File>> {
    let file = File::open(input)
        .await
        .context(format!("Failed to open {}", input.display()))?;
    let resolver = DictionaryDir(dictionary_dir.as_ref().map(ChunkStore::new));
    SeekableReader::new(file, &resolver)
        .await
        .context(format!("Failed to index {}", input.display()))
}

#[derive(Debug, Clone)]
pub struct ListCommand {
    pub input: PathBuf,
    pub path: String,
    pub dictionary_dir: Option<PathBuf>,
}

impl ListCommand {
    pub async fn run(self) -> Result<()> {
        let reader = open_reader(&self.input, &self.dictionary_dir).await?;
        let tar = TarFs::new(reader)
            .await
            .context(format!("Failed to read tar index of {}", self.input.display()))?;
        for child in tar.readdir(&self.path)? {
            let stat = tar.lstat(child);
            let marker = match stat.kind {
                Some(EntryKind::Directory) => "/",
                Some(EntryKind::Symlink) => "@",
                _ => "",
            };
            println!("{}{}", child, marker);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CatCommand {
    pub input: PathBuf,
    pub path: Option<String>,
    pub range: Option<(u64, usize)>,
    pub dictionary_dir: Option<PathBuf>,
}

impl CatCommand {
    pub async fn run(self) -> Result<()> {
        let reader = open_reader(&self.input, &self.dictionary_dir).await?;
        let mut stdout = tokio::io::stdout();
        match (self.path, self.range) {
            (Some(path), None) => {
                let mut tar = TarFs::new(reader).await.context(format!(
                    "Failed to read tar index of {}",
                    self.input.display()
                ))?;
                let file = tar.open(&path)?;
                let data = tar.read_all(&file).await?;
                stdout.write_all(&data).await?;
            }
            (None, Some((offset, size))) => {
                let mut reader = reader;
                let data = reader.read_at(offset, size).await?;
                stdout.write_all(&data).await?;
            }
            _ => return Err(anyhow!("specify either --path or --offset and --size")),
        }
        stdout.flush().await?;
        Ok(())
    }
}
