//! Transaction: the crash-atomic unit of work composing the pager and the
//! rollback journal. `begin` opens (or creates) the journal lazily;
//! `commit` fsyncs the journal, flushes dirty pages, fsyncs the database,
//! then deletes the journal -- the same two-fsync ordering the file
//! format's crash model requires. `rollback` replays the journal back into
//! the pager and discards any page-count growth the transaction caused.
//!
//! Also owns page allocation: `alloc_page` tries the freelist first (a
//! minimal singly-linked trunk page list) before falling back to
//! extending the file, and `free_page` threads a vacated page back onto
//! that list.

use crate::journal::Journal;
use crate::pager::{PageNum, Pager};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error(transparent)]
    Journal(#[from] crate::journal::Error),
    #[error("transaction already committed or rolled back")]
    AlreadyClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// An in-flight write transaction against one database file.
pub struct Transaction<'p> {
    pager: &'p mut Pager,
    journal: Journal,
    page_count_at_start: PageNum,
    closed: bool,
}

impl<'p> Transaction<'p> {
    /// Begins a transaction, recording the database's current page count so
    /// `rollback` can undo any growth from new-page allocation.
    pub fn begin(pager: &'p mut Pager, db_path: &str) -> Transaction<'p> {
        let journal_path = Journal::path_for_database(db_path);
        let page_count_at_start = pager.page_count();
        let page_size = pager.page_size();
        Transaction {
            pager,
            journal: Journal::new(journal_path, page_size),
            page_count_at_start,
            closed: false,
        }
    }

    /// Records the pre-image of `page_num` (if not already recorded this
    /// transaction) before the caller overwrites it, then performs the
    /// write.
    pub fn write_page(&mut self, page_num: PageNum, bytes: &[u8]) -> Result<()> {
        if page_num <= self.page_count_at_start {
            if let Ok(pre_image) = self.pager.get_page_owned(page_num) {
                self.journal.record_pre_image(page_num, &pre_image)?;
            }
        }
        self.pager.write_page(page_num, bytes)?;
        Ok(())
    }

    /// Allocates a page number for new content: the freelist's head trunk
    /// page first, falling back to extending the file. Freelist pages are
    /// read directly (not journaled) since they're being consumed, not
    /// mutated in place in a way that needs undoing -- the trunk page that
    /// shrinks is journaled as a normal write through `write_page`.
    pub fn alloc_page(&mut self, header: &mut crate::dbheader::DbHeader) -> Result<PageNum> {
        if header.freelist_head != 0 {
            let trunk = header.freelist_head;
            let mut page = self.pager.get_page_owned(trunk)?;
            let leaf_count = u32::from_be_bytes([page[4], page[5], page[6], page[7]]);
            if leaf_count > 0 {
                let last_offset = 8 + (leaf_count as usize - 1) * 4;
                let freed = u32::from_be_bytes([
                    page[last_offset],
                    page[last_offset + 1],
                    page[last_offset + 2],
                    page[last_offset + 3],
                ]);
                let new_count = leaf_count - 1;
                page[4..8].copy_from_slice(&new_count.to_be_bytes());
                self.write_page(trunk, &page)?;
                header.freelist_count -= 1;
                return Ok(freed);
            }
            // Trunk page is itself now free: consume it and promote the
            // next trunk in the chain.
            let next_trunk = u32::from_be_bytes([page[0], page[1], page[2], page[3]]);
            header.freelist_head = next_trunk;
            return Ok(trunk);
        }
        Ok(self.pager.extend())
    }

    /// Threads `page_num` onto the head of the freelist as a new, empty
    /// trunk page (the simplest possible reclamation: a real trunk-page
    /// compaction that packs leaves into existing trunks is not
    /// implemented).
    pub fn free_page(&mut self, page_num: PageNum, header: &mut crate::dbheader::DbHeader) -> Result<()> {
        let usable = self.pager.page_size();
        let mut page = vec![0u8; usable as usize];
        page[0..4].copy_from_slice(&header.freelist_head.to_be_bytes());
        page[4..8].copy_from_slice(&0u32.to_be_bytes());
        self.write_page(page_num, &page)?;
        header.freelist_head = page_num;
        header.freelist_count += 1;
        Ok(())
    }

    /// Commits: fsync the journal (if anything was journaled), flush and
    /// fsync the database, then delete the journal. After this returns the
    /// transaction's writes are durable.
    pub fn commit(mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.journal.sync()?;
        self.pager.flush()?;
        self.journal.delete()?;
        self.closed = true;
        log::debug!("transaction: committed");
        Ok(())
    }

    /// Rolls back: replays the journal's pre-images into the pager
    /// (discarding dirty pages in the process) and reverts any page-count
    /// growth this transaction caused, then deletes the journal.
    pub fn rollback(mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.journal.replay_into_pager(self.pager)?;
        self.pager.set_page_count(self.page_count_at_start);
        self.journal.delete()?;
        self.closed = true;
        log::debug!("transaction: rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Storage;

    #[test]
    fn commit_clears_dirty_state_and_deletes_journal() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        std::fs::write(&db_path, vec![0u8; 4096]).unwrap();
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 4096).unwrap();
        let pn = pager.extend();
        {
            let mut txn = Transaction::begin(&mut pager, db_path.to_str().unwrap());
            txn.write_page(pn, &vec![7u8; 4096]).unwrap();
            txn.commit().unwrap();
        }
        assert!(!pager.is_dirty(pn));
        assert!(!Journal::path_for_database(db_path.to_str().unwrap()).exists());
    }

    #[test]
    fn rollback_reverts_page_count_growth() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t2.db");
        std::fs::write(&db_path, vec![0u8; 4096]).unwrap();
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 4096).unwrap();
        let before = pager.page_count();
        {
            let mut txn = Transaction::begin(&mut pager, db_path.to_str().unwrap());
            let pn = txn.pager.extend();
            txn.write_page(pn, &vec![9u8; 4096]).unwrap();
            txn.rollback().unwrap();
        }
        assert_eq!(pager.page_count(), before);
    }

    #[test]
    fn freelist_reuses_a_freed_page_before_extending() {
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 4096).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t3.db");
        std::fs::write(&db_path, vec![0u8; 4096]).unwrap();
        let mut header = crate::dbheader::DbHeader::new_empty(4096);

        let mut txn = Transaction::begin(&mut pager, db_path.to_str().unwrap());
        let pn = txn.alloc_page(&mut header).unwrap();
        txn.free_page(pn, &mut header).unwrap();
        let reused = txn.alloc_page(&mut header).unwrap();
        assert_eq!(reused, pn);
        txn.commit().unwrap();
    }
}
