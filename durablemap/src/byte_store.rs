use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

/// A growable, randomly addressable region of bytes backing a storage.
///
/// Bytes past the previously used length are always zero after `grow`, storages
/// rely on that to tell "never written" from "written".
pub trait ByteStore: AsRef<[u8]> + AsMut<[u8]> + Send + Sync {
    /// Grows the store by at least `additional` bytes
    fn grow(&mut self, additional: usize) -> io::Result<()>;

    /// Makes the content durable, no-op for in-memory stores
    fn flush(&self) -> io::Result<()>;

    /// Drops the store and deletes whatever backs it
    fn remove_backing(self) -> io::Result<()>
    where
        Self: Sized;

    fn len(&self) -> usize {
        self.as_ref().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes sure the store is at least `required` bytes long, doubling when it needs to grow
    fn ensure_len(&mut self, required: usize) -> io::Result<()> {
        let current = self.len();
        if required <= current {
            return Ok(());
        }
        let target = required.max(current * 2).next_power_of_two();
        self.grow(target - current)
    }
}

/// In-memory store, used by tests and for maps that don't need to outlive the process
#[derive(Debug, Default)]
pub struct VecStore {
    data: Vec<u8>,
    resizes: u64,
}

impl VecStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            resizes: 0,
        }
    }

    /// Number of times the store was grown
    pub fn stats(&self) -> u64 {
        self.resizes
    }
}

impl AsRef<[u8]> for VecStore {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for VecStore {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl ByteStore for VecStore {
    fn grow(&mut self, additional: usize) -> io::Result<()> {
        let new_len = self.data.len() + additional;
        self.data.resize(new_len, 0);
        self.resizes += 1;
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn remove_backing(self) -> io::Result<()> {
        Ok(())
    }
}

/// File-backed store, the whole file is memory-mapped read-write
pub struct MMapFile {
    mmap: MmapMut,
    file: File,
    path: PathBuf,
}

impl MMapFile {
    /// Creates (or truncates) the file at `path` and maps `len` zeroed bytes
    pub fn create(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len.max(1) as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        tracing::debug!(path = %path.display(), len, "created mapped file");
        Ok(Self { mmap, file, path })
    }

    /// Maps an existing file
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is empty", path.display()),
            ));
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        tracing::debug!(path = %path.display(), len = mmap.len(), "opened mapped file");
        Ok(Self { mmap, file, path })
    }

    /// Opens the file if it exists, creates it with `len` bytes otherwise.
    /// The flag is `true` if the file was created.
    pub fn open_or_create(path: impl AsRef<Path>, len: usize) -> io::Result<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::open(path)?, false))
        } else {
            Ok((Self::create(path, len)?, true))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<[u8]> for MMapFile {
    fn as_ref(&self) -> &[u8] {
        &self.mmap
    }
}

impl AsMut<[u8]> for MMapFile {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

impl ByteStore for MMapFile {
    fn grow(&mut self, additional: usize) -> io::Result<()> {
        // Flush before remapping so nothing written through the old mapping is lost
        self.mmap.flush()?;

        let new_len = self.mmap.len() + additional;
        self.file.set_len(new_len as u64)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        tracing::debug!(path = %self.path.display(), new_len, "grew mapped file");
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    fn remove_backing(self) -> io::Result<()> {
        let Self { mmap, file, path } = self;
        drop(mmap);
        drop(file);
        fs::remove_file(&path)
    }
}
