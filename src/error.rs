//! Crate-wide error type. Per-module errors (`pager::Error`, `journal::Error`, ...)
//! convert into this one at the API boundary; callers of `Transaction`, the
//! cursors and the mutators only ever see `error::Error` / `error::Result`.

use crate::pager::PageNum;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("page {0} is corrupt: {1}")]
    CorruptPage(PageNum, &'static str),
    #[error("record is corrupt: {0}")]
    CorruptRecord(&'static str),
    #[error("out of space writing page {0}")]
    OutOfSpace(PageNum),
    #[error("rowid {0} already exists")]
    DuplicateRowId(i64),
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("journal failure: {0}")]
    JournalFailure(String),
    #[error("not found")]
    NotFound,
    #[error("cursor observed a newer data_version; reseek required")]
    Stale,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::pager::Error> for Error {
    fn from(e: crate::pager::Error) -> Self {
        match e {
            crate::pager::Error::PageNumberBeyondLimits(pn) => {
                Error::CorruptPage(pn, "page number beyond limits")
            }
            crate::pager::Error::Io(e) => Error::IoFailure(e),
        }
    }
}

impl From<crate::journal::Error> for Error {
    fn from(e: crate::journal::Error) -> Self {
        match e {
            crate::journal::Error::Io(e) => Error::IoFailure(e),
            crate::journal::Error::Truncated => {
                Error::JournalFailure("journal truncated".to_string())
            }
            crate::journal::Error::BadHeader => {
                Error::JournalFailure("bad journal header".to_string())
            }
        }
    }
}

impl From<crate::dbheader::Error> for Error {
    fn from(e: crate::dbheader::Error) -> Self {
        Error::CorruptPage(1, match e {
            crate::dbheader::Error::WrongMagic => "wrong magic",
            crate::dbheader::Error::UnsupportedPageSize => "unsupported page size",
            crate::dbheader::Error::Invalid => "invalid header field",
        })
    }
}

impl From<crate::varint::Error> for Error {
    fn from(_: crate::varint::Error) -> Self {
        Error::CorruptRecord("varint terminator missing")
    }
}

impl From<crate::record::Error> for Error {
    fn from(e: crate::record::Error) -> Self {
        match e {
            crate::record::Error::Varint(_) => Error::CorruptRecord("bad varint in record"),
            crate::record::Error::Truncated => Error::CorruptRecord("body shorter than declared"),
            crate::record::Error::ReservedSerialType(_) => Error::CorruptRecord("reserved serial type"),
        }
    }
}

impl From<crate::overflow::Error> for Error {
    fn from(e: crate::overflow::Error) -> Self {
        match e {
            crate::overflow::Error::Pager(e) => e.into(),
            crate::overflow::Error::ChainTooShort => Error::CorruptRecord("overflow chain shorter than payload size"),
            crate::overflow::Error::Cycle => Error::CorruptPage(0, "overflow chain cycle"),
        }
    }
}

impl From<crate::cell::Error> for Error {
    fn from(e: crate::cell::Error) -> Self {
        match e {
            crate::cell::Error::Varint(_) => Error::CorruptRecord("bad varint in cell"),
            crate::cell::Error::Truncated => Error::CorruptPage(0, "cell extent out of page bounds"),
        }
    }
}
