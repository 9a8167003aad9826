//! Chunk file storage
//!
//! Two backends behind one enum, picked at construction:
//! - `Local`: one file per chunk under a root directory. Writes go to a
//!   temporary file that is then linked into place, so a reader never
//!   observes a partially written chunk and an existing chunk is never
//!   replaced.
//! - `Memory`: a shared in-process map, for tests and the demo.
//!
//! Reads are random access (`read_bytes(offset, len)`); a read that runs past
//! the end of a chunk is corruption, since chunk files are immutable and
//! every offset read comes from the chunk's own template.

use crate::config::{StorageBackend, StorageConfig};
use crate::storage::error::{StorageError, StorageResult};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Extension used while a chunk is being written
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub enum FileSystemHandler {
    Local(LocalFileSystem),
    Memory(MemoryFileSystem),
}

impl FileSystemHandler {
    /// Local backend rooted at `root`, created if missing
    pub fn local(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FileSystemHandler::Local(LocalFileSystem { root }))
    }

    pub fn memory() -> Self {
        FileSystemHandler::Memory(MemoryFileSystem::default())
    }

    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        match config.backend {
            StorageBackend::Local => Self::local(&config.data_dir),
            StorageBackend::Memory => Ok(Self::memory()),
        }
    }

    /// Write a whole chunk under `file_name`.
    ///
    /// Chunks are never rewritten: a name that is already taken fails with
    /// `AlreadyExists` and leaves the stored chunk untouched.
    pub fn write_chunk(&self, file_name: &str, bytes: &[u8]) -> StorageResult<()> {
        match self {
            FileSystemHandler::Local(local) => local.write_chunk(file_name, bytes),
            FileSystemHandler::Memory(memory) => memory.write_chunk(file_name, bytes),
        }
    }

    pub fn open_for_read(&self, file_name: &str) -> StorageResult<ChunkFile> {
        match self {
            FileSystemHandler::Local(local) => local.open_for_read(file_name),
            FileSystemHandler::Memory(memory) => memory.open_for_read(file_name),
        }
    }

    pub fn exists(&self, file_name: &str) -> bool {
        match self {
            FileSystemHandler::Local(local) => local.path_of(file_name).is_file(),
            FileSystemHandler::Memory(memory) => memory
                .files
                .lock()
                .map(|files| files.contains_key(file_name))
                .unwrap_or(false),
        }
    }

    /// Names of all stored chunks, sorted
    pub fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = match self {
            FileSystemHandler::Local(local) => local.list()?,
            FileSystemHandler::Memory(memory) => memory.lock()?.keys().cloned().collect(),
        };
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    fn write_chunk(&self, file_name: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.path_of(file_name);
        let temp = self.path_of(&format!("{}{}", file_name, TEMP_SUFFIX));

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            // Unlike rename, linking refuses to clobber an existing chunk
            fs::hard_link(&temp, &path)
        })();
        // Never leave a partial chunk behind
        let _ = fs::remove_file(&temp);

        if let Err(e) = result {
            return Err(match e.kind() {
                io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(file_name.to_string()),
                _ => StorageError::Io(e),
            });
        }

        tracing::debug!(file = %file_name, bytes = bytes.len(), "Chunk file written");
        Ok(())
    }

    fn open_for_read(&self, file_name: &str) -> StorageResult<ChunkFile> {
        let file = File::open(self.path_of(file_name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::FileNotFound(file_name.to_string()),
            _ => StorageError::Io(e),
        })?;
        let len = file.metadata()?.len();

        Ok(ChunkFile {
            name: file_name.to_string(),
            len,
            source: ChunkSource::Local(file),
        })
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(TEMP_SUFFIX) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    files: Arc<Mutex<HashMap<String, Arc<[u8]>>>>,
    #[cfg(test)]
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryFileSystem {
    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, Arc<[u8]>>>> {
        self.files
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))
    }

    /// Make every following write fail with an I/O error
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Replace a stored chunk's bytes in place
    #[cfg(test)]
    pub fn overwrite(&self, file_name: &str, bytes: Vec<u8>) -> StorageResult<()> {
        self.lock()?.insert(file_name.to_string(), bytes.into());
        Ok(())
    }

    fn write_chunk(&self, file_name: &str, bytes: &[u8]) -> StorageResult<()> {
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::other(format!(
                "simulated write failure for {}",
                file_name
            ))));
        }
        let mut files = self.lock()?;
        if files.contains_key(file_name) {
            return Err(StorageError::AlreadyExists(file_name.to_string()));
        }
        files.insert(file_name.to_string(), Arc::from(bytes));
        Ok(())
    }

    fn open_for_read(&self, file_name: &str) -> StorageResult<ChunkFile> {
        let data = self
            .lock()?
            .get(file_name)
            .cloned()
            .ok_or_else(|| StorageError::FileNotFound(file_name.to_string()))?;

        Ok(ChunkFile {
            name: file_name.to_string(),
            len: data.len() as u64,
            source: ChunkSource::Memory(data),
        })
    }
}

#[derive(Debug)]
enum ChunkSource {
    Local(File),
    Memory(Arc<[u8]>),
}

/// An open chunk, read by absolute byte offset
#[derive(Debug)]
pub struct ChunkFile {
    name: String,
    len: u64,
    source: ChunkSource,
}

impl ChunkFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_bytes(&mut self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(StorageError::Corruption(format!(
                "read of {} bytes at {} runs past end of {} ({} bytes)",
                len, offset, self.name, self.len
            )));
        }

        match &mut self.source {
            ChunkSource::Local(file) => {
                let mut buf = vec![0u8; len];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => StorageError::Corruption(format!(
                        "{} shrank while being read",
                        self.name
                    )),
                    _ => StorageError::Io(e),
                })?;
                Ok(buf)
            }
            ChunkSource::Memory(data) => {
                let start = offset as usize;
                Ok(data[start..start + len].to_vec())
            }
        }
    }

    pub fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        self.read_bytes(0, self.len as usize)
    }

    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_write_and_read() {
        let dir = tempdir().unwrap();
        let fs = FileSystemHandler::local(dir.path()).unwrap();

        fs.write_chunk("chunk-0", b"hello chunk").unwrap();
        assert!(fs.exists("chunk-0"));
        assert!(!dir.path().join("chunk-0.tmp").exists());

        let mut file = fs.open_for_read("chunk-0").unwrap();
        assert_eq!(file.len(), 11);
        assert_eq!(file.read_bytes(6, 5).unwrap(), b"chunk");
        assert_eq!(file.read_all().unwrap(), b"hello chunk");
        file.close();

        assert_eq!(fs.list().unwrap(), vec!["chunk-0".to_string()]);
    }

    #[test]
    fn test_existing_chunk_is_never_replaced() {
        let dir = tempdir().unwrap();
        let local = FileSystemHandler::local(dir.path()).unwrap();
        for fs in [local, FileSystemHandler::memory()] {
            fs.write_chunk("chunk-0", b"first").unwrap();
            let err = fs.write_chunk("chunk-0", b"second").unwrap_err();
            assert!(matches!(err, StorageError::AlreadyExists(ref name) if name == "chunk-0"));
            assert!(!err.is_transient());

            let mut file = fs.open_for_read("chunk-0").unwrap();
            assert_eq!(file.read_all().unwrap(), b"first");
            assert_eq!(fs.list().unwrap(), vec!["chunk-0".to_string()]);
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let fs = FileSystemHandler::local(dir.path()).unwrap();
        assert!(matches!(
            fs.open_for_read("nope"),
            Err(StorageError::FileNotFound(_))
        ));
        assert!(matches!(
            FileSystemHandler::memory().open_for_read("nope"),
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_read_past_end_is_corruption() {
        let fs = FileSystemHandler::memory();
        fs.write_chunk("c", &[1, 2, 3]).unwrap();
        let mut file = fs.open_for_read("c").unwrap();
        assert!(file.read_bytes(2, 2).unwrap_err().is_corruption());
        assert!(file.read_bytes(u64::MAX, 2).unwrap_err().is_corruption());
        assert_eq!(file.read_bytes(1, 2).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_memory_write_failure() {
        let memory = MemoryFileSystem::default();
        let fs = FileSystemHandler::Memory(memory.clone());

        memory.set_fail_writes(true);
        let err = fs.write_chunk("c", &[1]).unwrap_err();
        assert!(err.is_transient());
        assert!(!fs.exists("c"));

        memory.set_fail_writes(false);
        fs.write_chunk("c", &[1]).unwrap();
        assert!(fs.exists("c"));
    }

    #[test]
    fn test_from_config() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().join("chunks").to_string_lossy().to_string(),
            backend: StorageBackend::Local,
        };
        let fs = FileSystemHandler::from_config(&config).unwrap();
        assert!(matches!(fs, FileSystemHandler::Local(_)));
        assert!(dir.path().join("chunks").is_dir());
    }
}
