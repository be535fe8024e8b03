//! An embeddable, single-file relational storage engine: the b-tree and
//! page layer of the SQLite on-disk file format, with crash-atomic commits
//! via a rollback journal. This crate does not parse or plan SQL; it
//! exposes the table and index btree primitives a query layer would sit
//! on top of.

pub mod btree;
pub mod cell;
pub mod dbheader;
pub mod error;
pub mod journal;
pub mod overflow;
pub mod pager;
pub mod page_rewriter;
pub mod populate;
pub mod record;
pub mod serial_type;
pub mod transaction;
pub mod varint;

pub use error::{Error, Result};

/// Page 1 is always the root of the schema table: SQLite's own bookkeeping
/// table that maps object names to their root page and creation SQL. This
/// crate stores and retrieves schema-table rows like any other table; it
/// does not interpret or validate the SQL text in them.
pub const SCHEMA_TABLE_ROOT_PAGE: pager::PageNum = 1;

/// Opens an existing database file, recovering from a crash (replaying a
/// leftover rollback journal) before handing back a `Pager`.
pub fn open(path: &str) -> Result<pager::Pager> {
    let header_probe = std::fs::read(path).map_err(error::Error::IoFailure)?;
    let header = dbheader::DbHeader::parse(&header_probe)?;
    journal::Journal::recover(path, header.page_size)?;
    Ok(pager::Pager::open(path)?)
}

/// Creates a brand-new, empty database file at `path` with `page_size`
/// bytes per page.
pub fn create(path: &str, page_size: u32) -> Result<pager::Pager> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(error::Error::IoFailure)?;
    Ok(pager::Pager::create(pager::Storage::File(file), page_size)?)
}
