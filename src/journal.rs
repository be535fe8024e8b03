//! Rollback journal: a copy-on-write log of pre-images for every page a
//! transaction is about to modify for the first time. Fsync'd before any
//! dirty page is written to the database, so a crash between journal-fsync
//! and database-fsync can always be undone by replaying the journal.
//!
//! On-disk layout (append order, one record per distinct first-dirtied
//! page): an 8-byte magic/header, then repeated
//! `page_number: u32be ‖ page_bytes: [u8; page_size]`. The spec does not
//! require this to be bit-compatible with SQLite's own journal format --
//! only the database file needs that -- so the header is kept minimal.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::pager::{PageNum, Pager};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal record truncated")]
    Truncated,
    #[error("journal header is not recognizable")]
    BadHeader,
}

pub type Result<T> = std::result::Result<T, Error>;

const MAGIC: &[u8; 8] = b"SQCJRNL\0";

/// A single (page_number, pre-image) record as it appears in the journal.
struct Record {
    page_number: PageNum,
    pre_image: Vec<u8>,
}

/// Handle to an open (or about-to-be-created) rollback journal file.
///
/// A transaction owns one journal for its lifetime: created lazily at the
/// first dirtying write, appended to as new pages are first touched,
/// fsync'd at commit, and deleted once the database itself is fsync'd.
pub struct Journal {
    path: PathBuf,
    file: Option<File>,
    page_size: u32,
    recorded: HashMap<PageNum, ()>, // pages already appended, to record each page only once
}

impl Journal {
    pub fn path_for_database(db_path: &str) -> PathBuf {
        let mut p = PathBuf::from(db_path);
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        p.set_file_name(format!("{}-journal", name));
        p
    }

    pub fn new(path: PathBuf, page_size: u32) -> Journal {
        Journal {
            path,
            file: None,
            page_size,
            recorded: HashMap::new(),
        }
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let mut f = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?;
            f.write_all(MAGIC)?;
            log::debug!("journal: created {}", self.path.display());
            self.file = Some(f);
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Records `pre_image` as the pre-transaction contents of page
    /// `page_number`, unless that page has already been recorded by this
    /// journal (only the *first* dirtying write needs its pre-image saved).
    pub fn record_pre_image(&mut self, page_number: PageNum, pre_image: &[u8]) -> Result<()> {
        if self.recorded.contains_key(&page_number) {
            return Ok(());
        }
        debug_assert_eq!(pre_image.len(), self.page_size as usize);
        let f = self.ensure_open()?;
        f.seek(SeekFrom::End(0))?;
        f.write_u32::<BigEndian>(page_number)?;
        f.write_all(pre_image)?;
        self.recorded.insert(page_number, ());
        Ok(())
    }

    /// Fsyncs the journal so it is durable before any database page write
    /// for this transaction proceeds.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(f) = &mut self.file {
            f.sync_all()?;
        }
        Ok(())
    }

    /// Deletes the journal file after a successful commit.
    pub fn delete(mut self) -> Result<()> {
        self.file = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            log::debug!("journal: deleted {}", self.path.display());
        }
        Ok(())
    }

    /// Reads every record currently appended to this journal, in order.
    /// Used both by `rollback` (replay into the pager) and by crash
    /// recovery (replay into the database file directly).
    fn read_records(path: &Path, page_size: u32) -> Result<Vec<Record>> {
        let mut f = std::fs::OpenOptions::new().read(true).open(path)?;
        let mut magic = [0u8; 8];
        match f.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(vec![]),
            Err(e) => return Err(Error::Io(e)),
        }
        if &magic != MAGIC {
            return Err(Error::BadHeader);
        }
        let mut records = vec![];
        loop {
            let page_number = match f.read_u32::<BigEndian>() {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e)),
            };
            let mut pre_image = vec![0u8; page_size as usize];
            // A torn tail (partial page write) means this transaction never
            // finished recording its pre-images and therefore never
            // reached commit either -- every page actually written to the
            // database by this writer has its pre-image recorded before
            // that write happens, so a partial record here implies no
            // database write happened for it. Stop cleanly instead of
            // erroring.
            match f.read_exact(&mut pre_image) {
                Ok(()) => records.push(Record { page_number, pre_image }),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(records)
    }

    /// Replays this journal's records back into `pager` (undoing an
    /// aborted transaction's dirty writes in memory) without touching the
    /// database file -- used by `Transaction::rollback`.
    pub fn replay_into_pager(&self, pager: &mut Pager) -> Result<()> {
        let records = Self::read_records(&self.path, self.page_size)?;
        for r in records {
            pager.write_page(r.page_number, &r.pre_image)?;
        }
        pager.discard_dirty();
        Ok(())
    }

    /// Crash recovery entry point: if `path` names an existing journal next
    /// to the database at `db_path`, replay every pre-image directly onto
    /// the database file, fsync, then delete the journal. After this call
    /// the on-disk database equals the last successfully committed state.
    pub fn recover(db_path: &str, page_size: u32) -> Result<bool> {
        let journal_path = Self::path_for_database(db_path);
        if !journal_path.exists() {
            return Ok(false);
        }
        let records = Self::read_records(&journal_path, page_size)?;
        if !records.is_empty() {
            let mut db = std::fs::OpenOptions::new().read(true).write(true).open(db_path)?;
            for r in &records {
                let offset = (r.page_number as u64 - 1) * page_size as u64;
                db.seek(SeekFrom::Start(offset))?;
                db.write_all(&r.pre_image)?;
            }
            db.sync_all()?;
            log::debug!("journal: recovered {} pages from {}", records.len(), journal_path.display());
        }
        std::fs::remove_file(&journal_path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn records_only_first_pre_image_per_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j");
        let mut j = Journal::new(path, 16);
        j.record_pre_image(5, &[1u8; 16]).unwrap();
        j.record_pre_image(5, &[2u8; 16]).unwrap(); // second write to same page: ignored
        let records = Journal::read_records(&j.path, 16).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pre_image, vec![1u8; 16]);
    }

    #[test]
    fn recover_restores_pre_image_and_deletes_journal() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let page_size = 16u32;
        {
            let mut f = File::create(&db_path).unwrap();
            f.write_all(&vec![0u8; (page_size as usize) * 2]).unwrap();
        }
        let journal_path = Journal::path_for_database(db_path.to_str().unwrap());
        let mut j = Journal::new(journal_path.clone(), page_size);
        j.record_pre_image(2, &vec![0xAAu8; page_size as usize]).unwrap();
        j.sync().unwrap();
        // Simulate the post-image having been written to the db without committing.
        {
            let mut f = std::fs::OpenOptions::new().write(true).open(&db_path).unwrap();
            f.seek(SeekFrom::Start(page_size as u64)).unwrap();
            f.write_all(&vec![0x99u8; page_size as usize]).unwrap();
        }
        let recovered = Journal::recover(db_path.to_str().unwrap(), page_size).unwrap();
        assert!(recovered);
        assert!(!journal_path.exists());
        let mut f = File::open(&db_path).unwrap();
        let mut buf = vec![0u8; page_size as usize];
        f.seek(SeekFrom::Start(page_size as u64)).unwrap();
        f.read_exact(&mut buf).unwrap();
        assert_eq!(buf, vec![0xAAu8; page_size as usize]);
    }

    #[test]
    fn recover_is_noop_when_no_journal_exists() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test2.db");
        File::create(&db_path).unwrap();
        assert!(!Journal::recover(db_path.to_str().unwrap(), 16).unwrap());
    }
}
