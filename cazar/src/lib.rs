pub mod archive;
pub mod frame;
pub mod index;
pub mod recompress;
pub mod seed;
pub mod synthesize;

mod chunk_id;
mod reader;
mod store;
mod tar_fs;

pub use chunk_id::{ChunkId, ChunkIdError, CHUNK_FILE_EXT, CHUNK_ID_LEN};
pub use reader::{DictionaryResolver, ReaderError, SeekableReader};
pub use store::{dictionary_file_name, ChunkStore};
pub use tar_fs::{EntryKind, OpenMode, TarEntry, TarFile, TarFs, TarFsError, TarStat};
