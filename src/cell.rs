//! Cell codec: the page-header layout and the four cell byte layouts
//! (leaf-table, interior-table, leaf-index, interior-index), plus the
//! inline-payload-size formulas that decide how much of an oversized
//! record lives on the page versus in the overflow chain.
//! See https://www.sqlite.org/fileformat2.html#b_tree_pages.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::pager::PageNum;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Varint(#[from] crate::varint::Error),
    #[error("cell extends past the page boundary")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    LeafTable,
    InteriorTable,
    LeafIndex,
    InteriorIndex,
}

impl PageKind {
    pub fn from_byte(b: u8) -> Result<PageKind> {
        match b {
            0x0D => Ok(PageKind::LeafTable),
            0x05 => Ok(PageKind::InteriorTable),
            0x0A => Ok(PageKind::LeafIndex),
            0x02 => Ok(PageKind::InteriorIndex),
            _ => Err(Error::Truncated),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            PageKind::LeafTable => 0x0D,
            PageKind::InteriorTable => 0x05,
            PageKind::LeafIndex => 0x0A,
            PageKind::InteriorIndex => 0x02,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageKind::LeafTable | PageKind::LeafIndex)
    }

    pub fn is_table(self) -> bool {
        matches!(self, PageKind::LeafTable | PageKind::InteriorTable)
    }

    /// 8 bytes on leaves, 12 on interior pages (the extra 4 bytes are the
    /// right-child pointer).
    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }
}

/// The 8 or 12 byte b-tree page header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub kind: PageKind,
    pub first_freeblock: u16,
    pub cell_count: u16,
    /// Offset of the start of the cell-content area; 0 in the on-disk
    /// encoding means 65536, which this field already normalizes to.
    pub cell_content_start: u32,
    pub fragmented_free_bytes: u8,
    pub right_child: Option<PageNum>,
}

impl PageHeader {
    pub fn new_leaf(kind: PageKind, usable_size: u32) -> PageHeader {
        assert!(kind.is_leaf());
        PageHeader {
            kind,
            first_freeblock: 0,
            cell_count: 0,
            cell_content_start: usable_size,
            fragmented_free_bytes: 0,
            right_child: None,
        }
    }

    pub fn new_interior(kind: PageKind, usable_size: u32, right_child: PageNum) -> PageHeader {
        assert!(!kind.is_leaf());
        PageHeader {
            kind,
            first_freeblock: 0,
            cell_count: 0,
            cell_content_start: usable_size,
            fragmented_free_bytes: 0,
            right_child: Some(right_child),
        }
    }
}

/// Parses the b-tree page header starting at `header_offset` (100 for page
/// 1, else 0).
pub fn parse_header(page: &[u8], header_offset: usize) -> Result<PageHeader> {
    let mut c = Cursor::new(&page[header_offset..]);
    let kind = PageKind::from_byte(c.read_u8().map_err(|_| Error::Truncated)?)?;
    let first_freeblock = c.read_u16::<BigEndian>().map_err(|_| Error::Truncated)?;
    let cell_count = c.read_u16::<BigEndian>().map_err(|_| Error::Truncated)?;
    let raw_content_start = c.read_u16::<BigEndian>().map_err(|_| Error::Truncated)?;
    let cell_content_start: u32 = if raw_content_start == 0 { 65536 } else { raw_content_start as u32 };
    let fragmented_free_bytes = c.read_u8().map_err(|_| Error::Truncated)?;
    let right_child = if kind.is_leaf() {
        None
    } else {
        Some(c.read_u32::<BigEndian>().map_err(|_| Error::Truncated)?)
    };
    Ok(PageHeader {
        kind,
        first_freeblock,
        cell_count,
        cell_content_start,
        fragmented_free_bytes,
        right_child,
    })
}

/// Writes a b-tree page header back into `page` at `header_offset`.
pub fn write_header(page: &mut [u8], header_offset: usize, header: &PageHeader) -> Result<()> {
    let mut c = Cursor::new(&mut page[header_offset..header_offset + header.kind.header_size()]);
    c.write_u8(header.kind.to_byte()).map_err(|_| Error::Truncated)?;
    c.write_u16::<BigEndian>(header.first_freeblock).map_err(|_| Error::Truncated)?;
    c.write_u16::<BigEndian>(header.cell_count).map_err(|_| Error::Truncated)?;
    let raw_content_start: u16 = if header.cell_content_start == 65536 {
        0
    } else {
        header.cell_content_start as u16
    };
    c.write_u16::<BigEndian>(raw_content_start).map_err(|_| Error::Truncated)?;
    c.write_u8(header.fragmented_free_bytes).map_err(|_| Error::Truncated)?;
    if let Some(rc) = header.right_child {
        c.write_u32::<BigEndian>(rc).map_err(|_| Error::Truncated)?;
    }
    Ok(())
}

/// Initializes a fresh empty page of `kind` at `header_offset`: zeroes the
/// header region and sets `cell_content_start` to the top of the usable
/// page. Used when creating a brand-new database (page 1) and when a split
/// allocates a new sibling page.
pub fn init_leaf_header(page: &mut [u8], header_offset: usize, kind: PageKind) {
    let usable_size = page.len() as u32; // caller passes a page already sized to the usable size for in-memory construction
    let header = PageHeader::new_leaf(kind, usable_size);
    write_header(page, header_offset, &header).expect("fresh header always fits");
}

/// Byte offset of the cell pointer array, immediately after the page header.
pub fn pointer_array_offset(header_offset: usize, kind: PageKind) -> usize {
    header_offset + kind.header_size()
}

pub fn get_cell_pointer(page: &[u8], header_offset: usize, kind: PageKind, idx: usize) -> u16 {
    let off = pointer_array_offset(header_offset, kind) + idx * 2;
    u16::from_be_bytes([page[off], page[off + 1]])
}

pub fn set_cell_pointer(page: &mut [u8], header_offset: usize, kind: PageKind, idx: usize, value: u16) {
    let off = pointer_array_offset(header_offset, kind) + idx * 2;
    page[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

/// Computes the inline-payload capacity for a given usable page size `u`
/// and total `payload_size`, per the table- or index-cell formula.
/// Bit-exact with SQLite's `payload_overflow_threshold`/local-payload math.
pub fn inline_payload_size(usable_size: u32, payload_size: u64, is_table: bool) -> u64 {
    let u = usable_size as i64;
    let payload = payload_size as i64;
    let x: i64 = if is_table {
        u - 35
    } else {
        (u - 12) * 64 / 255 - 23
    };
    if payload <= x {
        return payload as u64;
    }
    let m: i64 = (u - 12) * 32 / 255 - 23;
    let k = m + (payload - m) % (u - 4);
    let inline = if k <= x { k } else { m };
    inline as u64
}

/// A cell as built for insertion: the raw bytes (with a zeroed 4-byte
/// overflow-pointer placeholder if `overflow_spill` is nonzero) plus enough
/// information for the caller to allocate and patch in an overflow chain.
pub struct BuiltCell {
    pub bytes: Vec<u8>,
    /// Byte offset within `bytes` of the 4-byte overflow page pointer, if
    /// the payload spills.
    pub overflow_pointer_offset: Option<usize>,
    /// Number of payload bytes that did not fit inline and must be written
    /// to the overflow chain.
    pub overflow_spill: usize,
    /// Number of bytes of `payload` that were written inline.
    pub inline_len: usize,
}

fn build_payload_bearing_cell(
    usable_size: u32,
    is_table: bool,
    leading: impl Fn(&mut Vec<u8>),
    payload: &[u8],
) -> BuiltCell {
    let mut bytes = Vec::new();
    leading(&mut bytes);
    let inline_len = inline_payload_size(usable_size, payload.len() as u64, is_table) as usize;
    bytes.extend_from_slice(&payload[..inline_len]);
    let overflow_spill = payload.len() - inline_len;
    let overflow_pointer_offset = if overflow_spill > 0 {
        let off = bytes.len();
        bytes.extend_from_slice(&[0u8; 4]);
        Some(off)
    } else {
        None
    };
    BuiltCell {
        bytes,
        overflow_pointer_offset,
        overflow_spill,
        inline_len,
    }
}

/// Patches a previously-built cell's overflow pointer with the first
/// overflow page number, once the overflow chain has been written.
pub fn patch_overflow_pointer(cell: &mut [u8], offset: usize, first_overflow_page: PageNum) {
    cell[offset..offset + 4].copy_from_slice(&first_overflow_page.to_be_bytes());
}

/// Leaf table cell: `payload_size:varint ‖ rowid:varint ‖ inline[..] ‖ overflow_page:u32be?`.
pub fn build_leaf_table_cell(usable_size: u32, rowid: i64, payload: &[u8]) -> BuiltCell {
    build_payload_bearing_cell(
        usable_size,
        true,
        |buf| {
            let mut tmp = [0u8; crate::varint::MAX_LEN];
            let n = crate::varint::write(&mut tmp, payload.len() as i64).unwrap();
            buf.extend_from_slice(&tmp[..n]);
            let n = crate::varint::write(&mut tmp, rowid).unwrap();
            buf.extend_from_slice(&tmp[..n]);
        },
        payload,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLeafTableCell<'a> {
    pub payload_size: u64,
    pub rowid: i64,
    pub inline: &'a [u8],
    pub overflow_page: Option<PageNum>,
}

pub fn parse_leaf_table_cell(bytes: &[u8]) -> Result<ParsedLeafTableCell> {
    let (payload_size, n1) = crate::varint::read(bytes)?;
    let (rowid, n2) = crate::varint::read(&bytes[n1..])?;
    let header_len = n1 + n2;
    let payload_size = payload_size as u64;
    let inline_len = (bytes.len() - header_len).saturating_sub(if bytes.len() - header_len > 0 && bytes.len() >= header_len + 4 && payload_size as usize > bytes.len() - header_len - 4 { 4 } else { 0 });
    // Determine whether the trailing 4 bytes are an overflow pointer: they
    // are present exactly when the cell carries fewer bytes than the full
    // payload size.
    let available = bytes.len() - header_len;
    let (inline_len, overflow_page) = if (available as u64) > payload_size {
        // No overflow: available == payload_size exactly in well-formed cells;
        // extra bytes beyond that are not valid, but tolerate equality only.
        (payload_size as usize, None)
    } else if (available as u64) == payload_size {
        (payload_size as usize, None)
    } else {
        if available < 4 {
            return Err(Error::Truncated);
        }
        let inline_len = available - 4;
        let overflow_off = header_len + inline_len;
        let overflow_page = u32::from_be_bytes(bytes[overflow_off..overflow_off + 4].try_into().unwrap());
        (inline_len, Some(overflow_page))
    };
    let _ = inline_len; // silence unused-assignment warnings from the scratch computation above
    let inline = &bytes[header_len..header_len + inline_len];
    Ok(ParsedLeafTableCell { payload_size, rowid, inline, overflow_page })
}

/// Interior table cell: `left_child:u32be ‖ rowid:varint`. Never overflows.
pub fn build_interior_table_cell(left_child: PageNum, rowid: i64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + crate::varint::MAX_LEN);
    bytes.extend_from_slice(&left_child.to_be_bytes());
    let mut tmp = [0u8; crate::varint::MAX_LEN];
    let n = crate::varint::write(&mut tmp, rowid).unwrap();
    bytes.extend_from_slice(&tmp[..n]);
    bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInteriorTableCell {
    pub left_child: PageNum,
    pub rowid: i64,
}

pub fn parse_interior_table_cell(bytes: &[u8]) -> Result<ParsedInteriorTableCell> {
    if bytes.len() < 4 {
        return Err(Error::Truncated);
    }
    let left_child = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let (rowid, _) = crate::varint::read(&bytes[4..])?;
    Ok(ParsedInteriorTableCell { left_child, rowid })
}

/// Leaf index cell: `payload_size:varint ‖ inline[..] ‖ overflow_page:u32be?`.
pub fn build_leaf_index_cell(usable_size: u32, payload: &[u8]) -> BuiltCell {
    build_payload_bearing_cell(
        usable_size,
        false,
        |buf| {
            let mut tmp = [0u8; crate::varint::MAX_LEN];
            let n = crate::varint::write(&mut tmp, payload.len() as i64).unwrap();
            buf.extend_from_slice(&tmp[..n]);
        },
        payload,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLeafIndexCell<'a> {
    pub payload_size: u64,
    pub inline: &'a [u8],
    pub overflow_page: Option<PageNum>,
}

pub fn parse_leaf_index_cell(bytes: &[u8]) -> Result<ParsedLeafIndexCell> {
    let (payload_size, n1) = crate::varint::read(bytes)?;
    let payload_size = payload_size as u64;
    let available = bytes.len() - n1;
    let (inline_len, overflow_page) = if (available as u64) <= payload_size && (available as u64) != payload_size {
        if available < 4 {
            return Err(Error::Truncated);
        }
        let inline_len = available - 4;
        let overflow_off = n1 + inline_len;
        let overflow_page = u32::from_be_bytes(bytes[overflow_off..overflow_off + 4].try_into().unwrap());
        (inline_len, Some(overflow_page))
    } else {
        (payload_size as usize, None)
    };
    let inline = &bytes[n1..n1 + inline_len];
    Ok(ParsedLeafIndexCell { payload_size, inline, overflow_page })
}

/// Interior index cell: `left_child:u32be ‖ payload_size:varint ‖ inline[..] ‖ overflow_page:u32be?`.
pub fn build_interior_index_cell(usable_size: u32, left_child: PageNum, payload: &[u8]) -> BuiltCell {
    build_payload_bearing_cell(
        usable_size,
        false,
        |buf| {
            buf.extend_from_slice(&left_child.to_be_bytes());
            let mut tmp = [0u8; crate::varint::MAX_LEN];
            let n = crate::varint::write(&mut tmp, payload.len() as i64).unwrap();
            buf.extend_from_slice(&tmp[..n]);
        },
        payload,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInteriorIndexCell<'a> {
    pub left_child: PageNum,
    pub payload_size: u64,
    pub inline: &'a [u8],
    pub overflow_page: Option<PageNum>,
}

pub fn parse_interior_index_cell(bytes: &[u8]) -> Result<ParsedInteriorIndexCell> {
    if bytes.len() < 4 {
        return Err(Error::Truncated);
    }
    let left_child = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let rest = &bytes[4..];
    let (payload_size, n1) = crate::varint::read(rest)?;
    let payload_size = payload_size as u64;
    let available = rest.len() - n1;
    let (inline_len, overflow_page) = if (available as u64) <= payload_size && (available as u64) != payload_size {
        if available < 4 {
            return Err(Error::Truncated);
        }
        let inline_len = available - 4;
        let overflow_off = n1 + inline_len;
        let overflow_page = u32::from_be_bytes(rest[overflow_off..overflow_off + 4].try_into().unwrap());
        (inline_len, Some(overflow_page))
    } else {
        (payload_size as usize, None)
    };
    let inline = &rest[n1..n1 + inline_len];
    Ok(ParsedInteriorIndexCell { left_child, payload_size, inline, overflow_page })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_table_cell_without_overflow_round_trips() {
        let usable = 4096u32;
        let built = build_leaf_table_cell(usable, 7, b"hello world");
        assert!(built.overflow_pointer_offset.is_none());
        let parsed = parse_leaf_table_cell(&built.bytes).unwrap();
        assert_eq!(parsed.rowid, 7);
        assert_eq!(parsed.payload_size, 11);
        assert_eq!(parsed.inline, b"hello world");
        assert_eq!(parsed.overflow_page, None);
    }

    #[test]
    fn leaf_table_cell_with_overflow_round_trips() {
        let usable = 512u32;
        let payload = vec![0x42u8; 2000];
        let mut built = build_leaf_table_cell(usable, 1, &payload);
        assert!(built.overflow_spill > 0);
        let off = built.overflow_pointer_offset.unwrap();
        patch_overflow_pointer(&mut built.bytes, off, 99);
        let parsed = parse_leaf_table_cell(&built.bytes).unwrap();
        assert_eq!(parsed.rowid, 1);
        assert_eq!(parsed.overflow_page, Some(99));
        assert_eq!(parsed.inline.len(), built.inline_len);
    }

    #[test]
    fn interior_table_cell_round_trips() {
        let bytes = build_interior_table_cell(17, 12345);
        let parsed = parse_interior_table_cell(&bytes).unwrap();
        assert_eq!(parsed.left_child, 17);
        assert_eq!(parsed.rowid, 12345);
    }

    #[test]
    fn leaf_index_cell_round_trips() {
        let usable = 4096u32;
        let built = build_leaf_index_cell(usable, b"indexed-key");
        let parsed = parse_leaf_index_cell(&built.bytes).unwrap();
        assert_eq!(parsed.inline, b"indexed-key");
        assert_eq!(parsed.overflow_page, None);
    }

    #[test]
    fn interior_index_cell_round_trips() {
        let usable = 4096u32;
        let built = build_interior_index_cell(usable, 3, b"sep-key");
        let parsed = parse_interior_index_cell(&built.bytes).unwrap();
        assert_eq!(parsed.left_child, 3);
        assert_eq!(parsed.inline, b"sep-key");
    }

    #[test]
    fn page_header_round_trips_leaf_and_interior() {
        let mut page = vec![0u8; 4096];
        let hdr = PageHeader {
            kind: PageKind::LeafTable,
            first_freeblock: 0,
            cell_count: 3,
            cell_content_start: 4000,
            fragmented_free_bytes: 2,
            right_child: None,
        };
        write_header(&mut page, 0, &hdr).unwrap();
        assert_eq!(parse_header(&page, 0).unwrap(), hdr);

        let mut page2 = vec![0u8; 4096];
        let hdr2 = PageHeader {
            kind: PageKind::InteriorTable,
            first_freeblock: 0,
            cell_count: 5,
            cell_content_start: 3000,
            fragmented_free_bytes: 0,
            right_child: Some(42),
        };
        write_header(&mut page2, 100, &hdr2).unwrap();
        assert_eq!(parse_header(&page2, 100).unwrap(), hdr2);
    }

    #[test]
    fn inline_size_formula_matches_known_constants_for_4096_page() {
        // Table leaf: X = 4096-35 = 4061; small payloads stay fully inline.
        assert_eq!(inline_payload_size(4096, 100, true), 100);
        assert_eq!(inline_payload_size(4096, 4061, true), 4061);
        // Larger than X: spills, using the K/M formula.
        let inline = inline_payload_size(4096, 5000, true);
        assert!(inline < 5000);
        // Index: X = ((4096-12)*64/255)-23 = 1001
        assert_eq!(inline_payload_size(4096, 500, false), 500);
    }
}
