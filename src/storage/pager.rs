//! Page-granular block device consumed by the B-tree.
//!
//! The pager owns the database file and an in-memory page cache. Callers
//! obtain an owned snapshot of a page with [`Pager::get`], transition it
//! to writable with [`Pager::write`] (which journals the original image
//! for rollback), and publish modifications with
//! [`Pager::write_page_to_cache`]. Transactions are page-level: `commit`
//! flushes dirty pages and drops the journal, `rollback` restores the
//! journaled images.
//!
//! Crash recovery from partially written pages is out of scope here; the
//! journal exists to give in-process rollback semantics.

use std::collections::{HashMap, HashSet};

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{OpenFlags, Vfs, VfsFile};
use crate::types::Pgno;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerOpenFlags: u32 {
        const OMIT_JOURNAL = 0x01;
        const MEMORY = 0x02;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PgFlags: u8 {
        const DIRTY = 0x01;
        const WRITEABLE = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    /// No transaction open.
    Open,
    /// Read transaction.
    Reader,
    /// Write transaction; pages may be journaled and modified.
    Writer,
}

/// An owned snapshot of one page.
#[derive(Clone)]
pub struct PgHdr {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub flags: PgFlags,
}

impl PgHdr {
    pub fn is_writeable(&self) -> bool {
        self.flags.contains(PgFlags::WRITEABLE)
    }
}

pub struct Pager {
    file: Option<Box<dyn VfsFile>>,
    page_size: u32,
    /// Number of pages in the database image.
    pub db_size: Pgno,
    state: PagerState,
    is_memory: bool,
    omit_journal: bool,
    cache: HashMap<Pgno, Vec<u8>>,
    /// Original images of pages modified in the current write transaction.
    journal: HashMap<Pgno, Vec<u8>>,
    dirty: HashSet<Pgno>,
    refs: HashMap<Pgno, u32>,
}

impl Pager {
    pub fn open(
        vfs: &dyn Vfs,
        path: Option<&str>,
        page_size: u32,
        flags: PagerOpenFlags,
    ) -> Result<Pager> {
        let is_memory = flags.contains(PagerOpenFlags::MEMORY) || path.is_none();
        let file = if is_memory {
            None
        } else {
            let path = path.unwrap();
            Some(vfs.open(
                path,
                OpenFlags::READWRITE | OpenFlags::CREATE,
            )?)
        };
        let mut pager = Pager {
            file,
            page_size,
            db_size: 0,
            state: PagerState::Open,
            is_memory,
            omit_journal: flags.contains(PagerOpenFlags::OMIT_JOURNAL),
            cache: HashMap::new(),
            journal: HashMap::new(),
            dirty: HashSet::new(),
            refs: HashMap::new(),
        };
        if let Some(file) = pager.file.as_mut() {
            let len = file.file_size()?;
            pager.db_size = (len / page_size as u64) as Pgno;
        }
        Ok(pager)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    pub fn begin(&mut self, write: bool) -> Result<()> {
        match self.state {
            PagerState::Open => {
                self.state = if write {
                    PagerState::Writer
                } else {
                    PagerState::Reader
                };
                Ok(())
            }
            PagerState::Reader if write => {
                self.state = PagerState::Writer;
                Ok(())
            }
            // Already at or above the requested level.
            _ => Ok(()),
        }
    }

    /// Fetch a page. Pages past the current end of the database read as
    /// zeroes (the page is created on first reference).
    pub fn get(&mut self, pgno: Pgno) -> Result<PgHdr> {
        if pgno == 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "page number 0"));
        }
        if let Some(data) = self.cache.get(&pgno) {
            return Ok(PgHdr {
                pgno,
                data: data.clone(),
                flags: PgFlags::empty(),
            });
        }
        let mut data = vec![0u8; self.page_size as usize];
        if pgno <= self.db_size {
            if let Some(file) = self.file.as_mut() {
                let offset = (pgno as u64 - 1) * self.page_size as u64;
                file.read_at(offset, &mut data)?;
            }
        }
        self.cache.insert(pgno, data.clone());
        Ok(PgHdr {
            pgno,
            data,
            flags: PgFlags::empty(),
        })
    }

    /// Transition a page to writable. The original image is journaled the
    /// first time a page is written inside a write transaction.
    pub fn write(&mut self, page: &mut PgHdr) -> Result<()> {
        if self.state != PagerState::Writer {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "write outside a write transaction",
            ));
        }
        if !self.omit_journal && !self.journal.contains_key(&page.pgno) {
            let original = self
                .cache
                .get(&page.pgno)
                .cloned()
                .unwrap_or_else(|| page.data.clone());
            self.journal.insert(page.pgno, original);
        }
        page.flags.insert(PgFlags::WRITEABLE | PgFlags::DIRTY);
        Ok(())
    }

    /// Publish a modified page so subsequent `get` calls observe it.
    pub fn write_page_to_cache(&mut self, page: &PgHdr) {
        self.cache.insert(page.pgno, page.data.clone());
        self.dirty.insert(page.pgno);
        if page.pgno > self.db_size {
            self.db_size = page.pgno;
        }
    }

    pub fn page_ref(&mut self, pgno: Pgno) {
        *self.refs.entry(pgno).or_insert(0) += 1;
    }

    pub fn page_unref(&mut self, pgno: Pgno) {
        if let Some(count) = self.refs.get_mut(&pgno) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.refs.remove(&pgno);
            }
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.state == PagerState::Writer {
            if let Some(file) = self.file.as_mut() {
                let mut pages: Vec<Pgno> = self.dirty.iter().copied().collect();
                pages.sort_unstable();
                for pgno in pages {
                    if let Some(data) = self.cache.get(&pgno) {
                        let offset = (pgno as u64 - 1) * self.page_size as u64;
                        file.write_at(offset, data)?;
                    }
                }
                file.sync()?;
            }
            debug!(pages = self.dirty.len(), "pager commit");
        }
        self.journal.clear();
        self.dirty.clear();
        self.state = PagerState::Open;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.state == PagerState::Writer {
            debug!(pages = self.journal.len(), "pager rollback");
            for (pgno, original) in self.journal.drain() {
                self.cache.insert(pgno, original);
            }
            if let Some(file) = self.file.as_mut() {
                let len = file.file_size()?;
                self.db_size = (len / self.page_size as u64) as Pgno;
            }
        }
        self.journal.clear();
        self.dirty.clear();
        self.state = PagerState::Open;
        Ok(())
    }

    /// Allocate a fresh page at the end of the database image.
    pub fn allocate_page(&mut self) -> Pgno {
        self.db_size += 1;
        let pgno = self.db_size;
        self.cache.insert(pgno, vec![0u8; self.page_size as usize]);
        trace!(pgno, "allocate page");
        pgno
    }

    pub fn truncate_image(&mut self, n_page: Pgno) {
        let stale: Vec<Pgno> = self.cache.keys().copied().filter(|&p| p > n_page).collect();
        for pgno in stale {
            self.cache.remove(&pgno);
            self.dirty.remove(&pgno);
        }
        self.db_size = n_page;
    }

    pub fn close(&mut self) -> Result<()> {
        self.rollback()?;
        self.cache.clear();
        self.file = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vfs::MemoryVfs;

    fn memory_pager() -> Pager {
        let vfs = MemoryVfs::new();
        Pager::open(&vfs, None, 512, PagerOpenFlags::MEMORY).unwrap()
    }

    #[test]
    fn test_get_unknown_page_reads_zeroes() {
        let mut pager = memory_pager();
        let page = pager.get(1).unwrap();
        assert_eq!(page.data.len(), 512);
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_requires_write_transaction() {
        let mut pager = memory_pager();
        let mut page = pager.get(1).unwrap();
        assert_eq!(
            pager.write(&mut page).unwrap_err().code(),
            ErrorCode::ReadOnly
        );
        pager.begin(true).unwrap();
        pager.write(&mut page).unwrap();
        assert!(page.is_writeable());
    }

    #[test]
    fn test_rollback_restores_original_image() {
        let mut pager = memory_pager();
        pager.begin(true).unwrap();
        let mut page = pager.get(1).unwrap();
        pager.write(&mut page).unwrap();
        page.data[0] = 0x55;
        pager.write_page_to_cache(&page);
        assert_eq!(pager.get(1).unwrap().data[0], 0x55);
        pager.rollback().unwrap();
        assert_eq!(pager.get(1).unwrap().data[0], 0);
    }

    #[test]
    fn test_commit_persists_to_file() {
        let vfs = MemoryVfs::new();
        {
            let mut pager =
                Pager::open(&vfs, Some("t.db"), 512, PagerOpenFlags::empty()).unwrap();
            pager.begin(true).unwrap();
            let mut page = pager.get(1).unwrap();
            pager.write(&mut page).unwrap();
            page.data[0] = 0x42;
            pager.write_page_to_cache(&page);
            pager.commit().unwrap();
        }
        let mut reopened =
            Pager::open(&vfs, Some("t.db"), 512, PagerOpenFlags::empty()).unwrap();
        assert_eq!(reopened.db_size, 1);
        assert_eq!(reopened.get(1).unwrap().data[0], 0x42);
    }

    #[test]
    fn test_allocate_page_grows_image() {
        let mut pager = memory_pager();
        assert_eq!(pager.allocate_page(), 1);
        assert_eq!(pager.allocate_page(), 2);
        assert_eq!(pager.db_size, 2);
    }

    #[test]
    fn test_page_refs() {
        let mut pager = memory_pager();
        pager.page_ref(3);
        pager.page_ref(3);
        pager.page_unref(3);
        pager.page_unref(3);
        assert!(pager.refs.is_empty());
    }
}
