//! Virtual file system contract consumed by the pager and the sorter.
//!
//! Two backends are provided: `FileVfs` over the host file system and
//! `MemoryVfs` for hermetic tests. Temporary files (used by the sorter for
//! PMA spills) are opened exclusive with delete-on-close semantics.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READONLY      = 0x0001;
        const READWRITE     = 0x0002;
        const CREATE        = 0x0004;
        const EXCLUSIVE     = 0x0008;
        const DELETEONCLOSE = 0x0010;
    }
}

/// An open file. Reads past end-of-file zero-fill the tail of the buffer
/// and report the number of bytes actually read.
pub trait VfsFile: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn file_size(&mut self) -> Result<u64>;
    fn truncate(&mut self, size: u64) -> Result<()>;
}

pub trait Vfs: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn VfsFile>>;
    /// Open an anonymous temporary file: exclusive access, unlinked when
    /// the handle drops.
    fn open_temp(&self) -> Result<Box<dyn VfsFile>>;
    fn delete(&self, path: &str) -> Result<()>;
    fn access(&self, path: &str) -> Result<bool>;
    fn full_pathname(&self, path: &str) -> Result<String>;
}

// ============================================================================
// File-backed VFS
// ============================================================================

pub struct StdFile {
    file: File,
}

impl VfsFile for StdFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf[read..].fill(0);
        Ok(read)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }
}

/// VFS over the host file system.
#[derive(Default, Clone)]
pub struct FileVfs;

impl Vfs for FileVfs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if flags.contains(OpenFlags::READWRITE) {
            opts.write(true);
        }
        if flags.contains(OpenFlags::CREATE) {
            opts.create(true);
        }
        if flags.contains(OpenFlags::EXCLUSIVE) && flags.contains(OpenFlags::CREATE) {
            opts.create_new(true);
        }
        let file = opts.open(path)?;
        Ok(Box::new(StdFile { file }))
    }

    fn open_temp(&self) -> Result<Box<dyn VfsFile>> {
        let file = tempfile::tempfile()?;
        Ok(Box::new(StdFile { file }))
    }

    fn delete(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn access(&self, path: &str) -> Result<bool> {
        Ok(std::path::Path::new(path).exists())
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        let canonical = std::fs::canonicalize(path)
            .unwrap_or_else(|_| std::path::PathBuf::from(path));
        Ok(canonical.to_string_lossy().into_owned())
    }
}

// ============================================================================
// In-memory VFS
// ============================================================================

#[derive(Default)]
struct MemoryVfsState {
    files: HashMap<String, Arc<Mutex<Vec<u8>>>>,
}

/// VFS keeping all files in memory; used by tests and `:memory:` trees.
#[derive(Default, Clone)]
pub struct MemoryVfs {
    state: Arc<Mutex<MemoryVfsState>>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl VfsFile for MemoryFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        let available = data.len().saturating_sub(offset);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.data.lock().truncate(size as usize);
        Ok(())
    }
}

impl Vfs for MemoryVfs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let mut state = self.state.lock();
        if let Some(data) = state.files.get(path) {
            if flags.contains(OpenFlags::EXCLUSIVE) {
                return Err(Error::with_message(ErrorCode::Busy, "file exists"));
            }
            return Ok(Box::new(MemoryFile {
                data: Arc::clone(data),
            }));
        }
        if !flags.contains(OpenFlags::CREATE) {
            return Err(Error::with_message(ErrorCode::IoErr, "no such file"));
        }
        let data = Arc::new(Mutex::new(Vec::new()));
        state.files.insert(path.to_string(), Arc::clone(&data));
        Ok(Box::new(MemoryFile { data }))
    }

    fn open_temp(&self) -> Result<Box<dyn VfsFile>> {
        // Anonymous: never registered, so it vanishes when the handle drops.
        Ok(Box::new(MemoryFile {
            data: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.state.lock().files.remove(path);
        Ok(())
    }

    fn access(&self, path: &str) -> Result<bool> {
        Ok(self.state.lock().files.contains_key(path))
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        Ok(path.to_string())
    }
}
