//! The first 100 bytes of page 1: the database file header. Parses and
//! serializes it; every multi-byte field is big-endian.
//! See https://www.sqlite.org/fileformat2.html#the_database_header.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("the magic bytes for this file are wrong")]
    WrongMagic,
    #[error("page size must be a power of two in 512..65536")]
    UnsupportedPageSize,
    #[error("a header field is invalid per the SQLite format spec")]
    Invalid,
}

pub const HEADER_SIZE: usize = 100;
const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// The 100-byte database file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_bytes_per_page: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub freelist_head: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub application_id: u32,
}

impl DbHeader {
    /// Usable page size: the page size minus the reserved tail bytes.
    pub fn usable_page_size(&self) -> u32 {
        self.page_size - self.reserved_bytes_per_page as u32
    }

    pub fn new_empty(page_size: u32) -> Self {
        DbHeader {
            page_size,
            write_version: 1,
            read_version: 1,
            reserved_bytes_per_page: 0,
            change_counter: 1,
            page_count: 1,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            text_encoding: 1,
            user_version: 0,
            application_id: 0,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<DbHeader, Error> {
        let mut c = Cursor::new(buf);
        c.seek(SeekFrom::Start(0)).map_err(|_| Error::Invalid)?;

        let mut magic = [0u8; 16];
        c.read_exact(&mut magic).map_err(|_| Error::Invalid)?;
        if &magic != MAGIC {
            return Err(Error::WrongMagic);
        }

        let raw_page_size = c.read_u16::<BigEndian>().map_err(|_| Error::Invalid)?;
        let page_size: u32 = match raw_page_size {
            1 => 65536,
            n if n.is_power_of_two() && n >= 512 => n as u32,
            _ => return Err(Error::UnsupportedPageSize),
        };

        let write_version = c.read_u8().map_err(|_| Error::Invalid)?;
        let read_version = c.read_u8().map_err(|_| Error::Invalid)?;
        let reserved_bytes_per_page = c.read_u8().map_err(|_| Error::Invalid)?;
        // Max/min embedded payload fraction, leaf payload fraction -- fixed by the format.
        let _max_payload_frac = c.read_u8().map_err(|_| Error::Invalid)?;
        let _min_payload_frac = c.read_u8().map_err(|_| Error::Invalid)?;
        let _leaf_payload_frac = c.read_u8().map_err(|_| Error::Invalid)?;

        let change_counter = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let page_count = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let freelist_head = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let freelist_count = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let schema_cookie = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let schema_format = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let _default_cache_size = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let _largest_root_page = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let text_encoding = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let user_version = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let _incremental_vacuum = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;
        let application_id = c.read_u32::<BigEndian>().map_err(|_| Error::Invalid)?;

        Ok(DbHeader {
            page_size,
            write_version,
            read_version,
            reserved_bytes_per_page,
            change_counter,
            page_count,
            freelist_head,
            freelist_count,
            schema_cookie,
            schema_format,
            text_encoding,
            user_version,
            application_id,
        })
    }

    /// Serializes the header into the first 100 bytes of `buf` (a full page
    /// 1 buffer; bytes 100.. are left untouched).
    pub fn write_into(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut c = Cursor::new(&mut buf[..HEADER_SIZE]);
        c.write_all(MAGIC).map_err(|_| Error::Invalid)?;
        let raw_page_size: u16 = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        c.write_u16::<BigEndian>(raw_page_size).map_err(|_| Error::Invalid)?;
        c.write_u8(self.write_version).map_err(|_| Error::Invalid)?;
        c.write_u8(self.read_version).map_err(|_| Error::Invalid)?;
        c.write_u8(self.reserved_bytes_per_page).map_err(|_| Error::Invalid)?;
        c.write_u8(64).map_err(|_| Error::Invalid)?;
        c.write_u8(32).map_err(|_| Error::Invalid)?;
        c.write_u8(32).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(self.change_counter).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(self.page_count).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(self.freelist_head).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(self.freelist_count).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(self.schema_cookie).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(self.schema_format).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(0).map_err(|_| Error::Invalid)?; // default cache size
        c.write_u32::<BigEndian>(0).map_err(|_| Error::Invalid)?; // largest root page (no auto-vacuum)
        c.write_u32::<BigEndian>(self.text_encoding).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(self.user_version).map_err(|_| Error::Invalid)?;
        c.write_u32::<BigEndian>(0).map_err(|_| Error::Invalid)?; // incremental vacuum mode
        c.write_u32::<BigEndian>(self.application_id).map_err(|_| Error::Invalid)?;
        // Bytes 72..92 reserved for expansion, must be zero; 92..100 version-valid-for / sqlite version number.
        // Callers of `new_empty` leave those as already-zeroed page bytes.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_page_buffer() {
        let hdr = DbHeader {
            page_size: 4096,
            write_version: 1,
            read_version: 1,
            reserved_bytes_per_page: 0,
            change_counter: 7,
            page_count: 12,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 3,
            schema_format: 4,
            text_encoding: 1,
            user_version: 42,
            application_id: 0,
        };
        let mut page = vec![0u8; 4096];
        hdr.write_into(&mut page).unwrap();
        let parsed = DbHeader::parse(&page).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn rejects_wrong_magic() {
        let page = vec![0u8; 4096];
        assert_eq!(DbHeader::parse(&page), Err(Error::WrongMagic));
    }

    #[test]
    fn page_size_1_means_65536() {
        let hdr = DbHeader::new_empty(65536);
        let mut page = vec![0u8; 65536];
        hdr.write_into(&mut page).unwrap();
        let parsed = DbHeader::parse(&page).unwrap();
        assert_eq!(parsed.page_size, 65536);
    }
}
