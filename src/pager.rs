//! Page source and read-through cache. Owns the backing file (or, for
//! tests, an in-memory buffer) and hands out fixed-size pages by 1-based
//! page number. Pages are loaded on demand and cached as owned buffers;
//! writes land in the cache immediately (read-your-writes within a handle)
//! and only reach the backing store on `flush`.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

pub type PageNum = u32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("page number {0} is beyond what this pager supports")]
    PageNumberBeyondLimits(PageNum),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default page cache capacity, in pages. Chosen the way the teacher's
/// `MAX_PAGE_NUM` was: generous enough for real workloads, small enough to
/// bound memory use of a single handle.
pub const DEFAULT_CACHE_CAPACITY: usize = 2000;

/// Backing store for a pager: either a real file or an in-memory buffer
/// used by tests that don't want to touch disk.
pub enum Storage {
    File(File),
    Memory(Vec<u8>),
}

impl Storage {
    fn len(&mut self) -> Result<u64> {
        match self {
            Storage::File(f) => Ok(f.metadata()?.len()),
            Storage::Memory(v) => Ok(v.len() as u64),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Storage::File(f) => {
                f.seek(SeekFrom::Start(offset))?;
                f.read_exact(buf)?;
            }
            Storage::Memory(v) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > v.len() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "read past end of in-memory storage",
                    )));
                }
                buf.copy_from_slice(&v[start..end]);
            }
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Storage::File(f) => {
                f.seek(SeekFrom::Start(offset))?;
                f.write_all(buf)?;
            }
            Storage::Memory(v) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > v.len() {
                    v.resize(end, 0);
                }
                v[start..end].copy_from_slice(buf);
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Storage::File(f) = self {
            f.sync_all()?;
        }
        Ok(())
    }
}

/// Fixed-size-page read/write store with a read-through LRU cache.
///
/// `page_count` is the pager's own accounting of how many pages the file
/// logically has; it grows as `write_page` is called with a new page
/// number, ahead of `flush` actually extending the backing store.
pub struct Pager {
    storage: Storage,
    page_size: u32,
    page_count: PageNum,
    cache: HashMap<PageNum, Vec<u8>>,
    lru: VecDeque<PageNum>,
    dirty: std::collections::HashSet<PageNum>,
    cache_capacity: usize,
    data_version: u64,
}

impl Pager {
    /// Opens an existing database file and reads its page size from the
    /// header on page 1.
    pub fn open(path: &str) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Self::from_storage(Storage::File(file))
    }

    /// Wraps an already-open storage backend (a file, or an in-memory
    /// buffer for tests) that already contains a valid header on page 1.
    pub fn from_storage(mut storage: Storage) -> Result<Self> {
        let mut header_buf = [0u8; crate::dbheader::HEADER_SIZE];
        storage.read_at(0, &mut header_buf)?;
        let header = crate::dbheader::DbHeader::parse(&header_buf)
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad header")))?;
        Ok(Pager {
            storage,
            page_size: header.page_size,
            page_count: header.page_count,
            cache: HashMap::new(),
            lru: VecDeque::new(),
            dirty: std::collections::HashSet::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            data_version: 0,
        })
    }

    /// Creates a brand-new empty database of `page_size` bytes per page,
    /// backed by `storage` (a freshly-created, empty file or buffer).
    pub fn create(mut storage: Storage, page_size: u32) -> Result<Self> {
        let header = crate::dbheader::DbHeader::new_empty(page_size);
        let mut page1 = vec![0u8; page_size as usize];
        header
            .write_into(&mut page1)
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad header")))?;
        // A freshly created page 1 is a leaf-table btree page (the schema table) by default.
        crate::cell::init_leaf_header(&mut page1, crate::dbheader::HEADER_SIZE, crate::cell::PageKind::LeafTable);
        storage.write_at(0, &page1)?;
        storage.sync()?;
        let mut pager = Pager {
            storage,
            page_size,
            page_count: 1,
            cache: HashMap::new(),
            lru: VecDeque::new(),
            dirty: std::collections::HashSet::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            data_version: 0,
        };
        pager.cache.insert(1, page1);
        pager.touch(1);
        Ok(pager)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> PageNum {
        self.page_count
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    /// Byte offset of `header_offset` for a page: page 1 carries the
    /// 100-byte database header before its btree page header; every other
    /// page's btree header starts at byte 0.
    pub fn btree_header_offset(pn: PageNum) -> usize {
        if pn == 1 {
            crate::dbheader::HEADER_SIZE
        } else {
            0
        }
    }

    fn touch(&mut self, pn: PageNum) {
        self.lru.retain(|&x| x != pn);
        self.lru.push_back(pn);
    }

    fn evict_if_needed(&mut self) {
        while self.cache.len() > self.cache_capacity {
            // Never evict a dirty (uncommitted) page.
            if let Some(pos) = self.lru.iter().position(|pn| !self.dirty.contains(pn)) {
                let pn = self.lru.remove(pos).unwrap();
                self.cache.remove(&pn);
                log::debug!("pager: evicted page {} from cache", pn);
            } else {
                break; // everything cached is dirty; let the cache grow.
            }
        }
    }

    fn load(&mut self, pn: PageNum) -> Result<()> {
        if self.cache.contains_key(&pn) {
            return Ok(());
        }
        if pn == 0 || pn > self.page_count {
            return Err(Error::PageNumberBeyondLimits(pn));
        }
        let mut buf = vec![0u8; self.page_size as usize];
        let offset = (pn as u64 - 1) * self.page_size as u64;
        self.storage.read_at(offset, &mut buf)?;
        log::debug!("pager: loaded page {} from storage", pn);
        self.cache.insert(pn, buf);
        Ok(())
    }

    /// Returns a borrowed, zero-copy view of page `pn`, valid until the
    /// next call that can invalidate or evict it (`write_page`,
    /// `invalidate`, or another `get_page` that triggers eviction).
    pub fn get_page(&mut self, pn: PageNum) -> Result<&[u8]> {
        self.load(pn)?;
        self.touch(pn);
        self.evict_if_needed();
        Ok(self.cache.get(&pn).expect("just loaded").as_slice())
    }

    /// Returns an owned snapshot of page `pn`; safe to hold across cache
    /// changes, at the cost of a copy.
    pub fn get_page_owned(&mut self, pn: PageNum) -> Result<Vec<u8>> {
        self.load(pn)?;
        self.touch(pn);
        Ok(self.cache.get(&pn).expect("just loaded").clone())
    }

    /// Writes `bytes` as the new contents of page `pn`. Durable only after
    /// `flush`; callers are responsible for having recorded the pre-image
    /// in the rollback journal first. Growing `pn` past the current page
    /// count extends the pager's page count immediately (the file itself
    /// only grows at flush).
    pub fn write_page(&mut self, pn: PageNum, bytes: &[u8]) -> Result<()> {
        assert_eq!(bytes.len(), self.page_size as usize, "page write must be exactly one page");
        if pn == 0 {
            return Err(Error::PageNumberBeyondLimits(pn));
        }
        if pn > self.page_count {
            self.page_count = pn;
        }
        self.cache.insert(pn, bytes.to_vec());
        self.dirty.insert(pn);
        self.touch(pn);
        Ok(())
    }

    /// Drops any cached copy of page `pn` (it will be re-read from storage
    /// on next access). Refuses to drop a dirty page -- callers must flush
    /// or explicitly discard dirty state first.
    pub fn invalidate(&mut self, pn: PageNum) {
        if !self.dirty.contains(&pn) {
            self.cache.remove(&pn);
            self.lru.retain(|&x| x != pn);
        }
    }

    /// Writes every dirty page to the backing store, fsyncs, and updates
    /// the header's page count and change counter. Bumps `data_version` so
    /// outstanding cursors observe staleness.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let dirty_pages: Vec<PageNum> = self.dirty.iter().copied().collect();
        for pn in &dirty_pages {
            let offset = (*pn as u64 - 1) * self.page_size as u64;
            let bytes = self.cache.get(pn).expect("dirty page must be cached").clone();
            self.storage.write_at(offset, &bytes)?;
        }
        self.storage.sync()?;
        self.dirty.clear();
        self.data_version += 1;
        log::debug!("pager: flushed {} pages, data_version={}", dirty_pages.len(), self.data_version);
        self.evict_if_needed();
        Ok(())
    }

    /// Discards all dirty (uncommitted) cache entries without writing them,
    /// used by `Transaction::rollback` after the journal has restored the
    /// on-disk pre-images.
    pub fn discard_dirty(&mut self) {
        for pn in self.dirty.drain() {
            self.cache.remove(&pn);
            self.lru.retain(|&x| x != pn);
        }
    }

    pub fn is_dirty(&self, pn: PageNum) -> bool {
        self.dirty.contains(&pn)
    }

    pub fn dirty_pages(&self) -> Vec<PageNum> {
        self.dirty.iter().copied().collect()
    }

    /// Allocates a fresh page number by extending the page count. Callers
    /// wanting freelist reuse should check `Transaction::alloc_page`
    /// instead, which tries the freelist first.
    pub fn extend(&mut self) -> PageNum {
        self.page_count += 1;
        self.page_count
    }

    /// Forces the pager's page-count accounting back to `n`, used by
    /// `Transaction::rollback` to undo page allocations made by an aborted
    /// transaction after the journal has restored page contents.
    pub fn set_page_count(&mut self, n: PageNum) {
        self.page_count = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_pager() -> Pager {
        Pager::create(Storage::Memory(Vec::new()), 4096).unwrap()
    }

    #[test]
    fn write_then_read_is_read_your_writes() {
        let mut pager = new_test_pager();
        let pn = pager.extend();
        let mut page = vec![0xAAu8; 4096];
        page[0] = 0x0D;
        pager.write_page(pn, &page).unwrap();
        assert_eq!(pager.get_page(pn).unwrap()[0], 0x0D);
    }

    #[test]
    fn flush_bumps_data_version_and_clears_dirty() {
        let mut pager = new_test_pager();
        let pn = pager.extend();
        pager.write_page(pn, &vec![1u8; 4096]).unwrap();
        assert!(pager.is_dirty(pn));
        let before = pager.data_version();
        pager.flush().unwrap();
        assert!(!pager.is_dirty(pn));
        assert_eq!(pager.data_version(), before + 1);
    }

    #[test]
    fn discard_dirty_drops_uncommitted_pages() {
        let mut pager = new_test_pager();
        let pn = pager.extend();
        pager.write_page(pn, &vec![9u8; 4096]).unwrap();
        pager.discard_dirty();
        assert!(pager.get_page(pn).is_err() || pager.get_page(pn).unwrap()[0] != 9);
    }

    #[test]
    fn out_of_range_page_errors() {
        let mut pager = new_test_pager();
        assert!(pager.get_page(999).is_err());
    }
}
