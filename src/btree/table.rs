//! Table b-tree cursor: a seekable, stateful iterator over the rows of one
//! table btree (rowid-keyed). Hides the fact that the tree spans several
//! pages behind `move_next`/`move_last`/`seek`, keeping an ancestor path so
//! `move_next` can climb back up to the parent once a leaf is exhausted --
//! the same stack shape the teacher's `EitherIter`-driven traversal used,
//! generalized into a cursor that supports more than forward-only scans.

use crate::cell::{self, PageKind};
use crate::pager::{PageNum, Pager};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Cell(#[from] crate::cell::Error),
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error(transparent)]
    Overflow(#[from] crate::overflow::Error),
    #[error("cursor observed a newer data_version; reseek required")]
    Stale,
    #[error("page {0} is not a table btree page")]
    NotATablePage(PageNum),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One level of the descent: the page visited and which cell index within
/// it the cursor is currently positioned at.
struct Frame {
    page: PageNum,
    kind: PageKind,
    /// Index into the cell pointer array; for interior pages, `cell_count`
    /// itself means "positioned at the right-child pointer".
    index: u16,
    cell_count: u16,
}

/// A positioned, reusable cursor over a table btree rooted at `root_page`.
pub struct Cursor<'p> {
    pager: &'p mut Pager,
    root_page: PageNum,
    data_version: u64,
    stack: Vec<Frame>,
    exhausted: bool,
}

fn header_offset(pn: PageNum) -> usize {
    Pager::btree_header_offset(pn)
}

impl<'p> Cursor<'p> {
    pub fn new(pager: &'p mut Pager, root_page: PageNum) -> Cursor<'p> {
        let data_version = pager.data_version();
        Cursor {
            pager,
            root_page,
            data_version,
            stack: vec![],
            exhausted: false,
        }
    }

    fn check_fresh(&self) -> Result<()> {
        if self.pager.data_version() != self.data_version {
            return Err(Error::Stale);
        }
        Ok(())
    }

    fn push_frame(&mut self, page_num: PageNum, index: u16) -> Result<()> {
        let page = self.pager.get_page(page_num)?;
        let hdr = cell::parse_header(page, header_offset(page_num))?;
        if !hdr.kind.is_table() {
            return Err(Error::NotATablePage(page_num));
        }
        self.stack.push(Frame {
            page: page_num,
            kind: hdr.kind,
            index,
            cell_count: hdr.cell_count,
        });
        Ok(())
    }

    /// Descends from `page_num` to the leftmost (or rightmost) leaf,
    /// pushing every interior page visited onto the stack positioned at the
    /// child pointer it descended through.
    fn descend_to_edge(&mut self, page_num: PageNum, leftmost: bool) -> Result<()> {
        let mut page_num = page_num;
        loop {
            let page = self.pager.get_page(page_num)?;
            let hdr = cell::parse_header(page, header_offset(page_num))?;
            if !hdr.kind.is_table() {
                return Err(Error::NotATablePage(page_num));
            }
            if hdr.kind.is_leaf() {
                let index = if leftmost { 0 } else { hdr.cell_count.saturating_sub(1) };
                self.push_frame(page_num, index)?;
                return Ok(());
            }
            let child = if leftmost {
                let offset = header_offset(page_num) + hdr.kind.header_size();
                let ptr = u16::from_be_bytes([page[offset], page[offset + 1]]);
                let cell_bytes = read_cell_at(page, ptr as usize);
                cell::parse_interior_table_cell(cell_bytes)?.left_child
            } else {
                hdr.right_child.expect("interior page always has a right child")
            };
            let index = if leftmost { 0 } else { hdr.cell_count };
            self.push_frame(page_num, index)?;
            page_num = child;
        }
    }

    /// Positions the cursor at the first row (smallest rowid).
    pub fn move_first(&mut self) -> Result<bool> {
        self.check_fresh()?;
        self.stack.clear();
        self.exhausted = false;
        self.descend_to_edge(self.root_page, true)?;
        Ok(self.current().is_some())
    }

    /// Positions the cursor at the last row (largest rowid).
    pub fn move_last(&mut self) -> Result<bool> {
        self.check_fresh()?;
        self.stack.clear();
        self.exhausted = false;
        self.descend_to_edge(self.root_page, false)?;
        Ok(self.current().is_some())
    }

    /// Moves to the smallest row with rowid >= `key`. Returns true if an
    /// exact match was found, false if positioned at the next-larger row
    /// (or past the end, in which case `current()` returns `None`).
    pub fn seek(&mut self, key: i64) -> Result<bool> {
        self.check_fresh()?;
        self.stack.clear();
        self.exhausted = false;
        let mut page_num = self.root_page;
        loop {
            let page = self.pager.get_page(page_num)?;
            let hdr = cell::parse_header(page, header_offset(page_num))?;
            if !hdr.kind.is_table() {
                return Err(Error::NotATablePage(page_num));
            }
            if hdr.kind.is_leaf() {
                let (index, exact) = binary_search_leaf(page, header_offset(page_num), hdr.cell_count, key);
                self.push_frame(page_num, index)?;
                return Ok(exact);
            }
            let (child_index, child_page) =
                binary_search_interior(page, header_offset(page_num), hdr.cell_count, hdr.right_child.unwrap(), key)?;
            self.push_frame(page_num, child_index)?;
            page_num = child_page;
        }
    }

    /// Advances to the next row in rowid order.
    pub fn move_next(&mut self) -> Result<bool> {
        self.check_fresh()?;
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(false);
            };
            if frame.kind.is_leaf() {
                if frame.index + 1 < frame.cell_count {
                    frame.index += 1;
                    return Ok(true);
                }
                self.stack.pop();
                continue;
            } else {
                // Interior frame: advance to the next child pointer.
                let next_index = frame.index + 1;
                let page_num = frame.page;
                let cell_count = frame.cell_count;
                if next_index > cell_count {
                    self.stack.pop();
                    continue;
                }
                frame.index = next_index;
                let page = self.pager.get_page(page_num)?;
                let hdr = cell::parse_header(page, header_offset(page_num))?;
                let child = if next_index == cell_count {
                    hdr.right_child.expect("interior page always has a right child")
                } else {
                    let offset = header_offset(page_num) + hdr.kind.header_size() + next_index as usize * 2;
                    let ptr = u16::from_be_bytes([page[offset], page[offset + 1]]);
                    let cell_bytes = read_cell_at(page, ptr as usize);
                    cell::parse_interior_table_cell(cell_bytes)?.left_child
                };
                self.descend_to_edge(child, true)?;
                return Ok(self.current().is_some());
            }
        }
    }

    /// Returns `(rowid, payload_size, inline_bytes, overflow_page)` for the
    /// cell the cursor is positioned at, without assembling overflow bytes.
    fn current_raw(&mut self) -> Option<(i64, u64, Vec<u8>, Option<PageNum>)> {
        let frame = self.stack.last()?;
        if !frame.kind.is_leaf() || frame.index >= frame.cell_count {
            return None;
        }
        let page_num = frame.page;
        let index = frame.index;
        let page = self.pager.get_page(page_num).ok()?;
        let offset = header_offset(page_num) + frame.kind.header_size() + index as usize * 2;
        let ptr = u16::from_be_bytes([page[offset], page[offset + 1]]);
        let cell_bytes = read_cell_at(page, ptr as usize);
        let parsed = cell::parse_leaf_table_cell(cell_bytes).ok()?;
        Some((parsed.rowid, parsed.payload_size, parsed.inline.to_vec(), parsed.overflow_page))
    }

    /// Returns the current row's rowid, or `None` if the cursor has run off
    /// either end of the tree.
    pub fn current_rowid(&mut self) -> Option<i64> {
        self.current_raw().map(|(rowid, ..)| rowid)
    }

    /// Returns `true` if the cursor is positioned at a row.
    pub fn current(&mut self) -> Option<i64> {
        self.current_rowid()
    }

    /// Returns the full assembled payload of the current row, reading
    /// through the overflow chain if the record spilled.
    pub fn current_payload(&mut self) -> Result<Option<Vec<u8>>> {
        let Some((_, payload_size, inline, overflow_page)) = self.current_raw() else {
            return Ok(None);
        };
        let mut out = inline;
        if let Some(first) = overflow_page {
            let remaining = payload_size - out.len() as u64;
            crate::overflow::read_chain(self.pager, first, remaining, &mut out)?;
        }
        Ok(Some(out))
    }
}

fn read_cell_at(page: &[u8], offset: usize) -> &[u8] {
    &page[offset..]
}

/// Finds the cell index for `key` in a leaf page's sorted rowid array.
/// Returns `(index, exact)`; `index` is where `key` is, or would be
/// inserted to keep the array sorted.
fn binary_search_leaf(page: &[u8], header_offset: usize, cell_count: u16, key: i64) -> (u16, bool) {
    let mut lo = 0u16;
    let mut hi = cell_count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let offset = header_offset + PageKind::LeafTable.header_size() + mid as usize * 2;
        let ptr = u16::from_be_bytes([page[offset], page[offset + 1]]);
        let rowid = cell::parse_leaf_table_cell(read_cell_at(page, ptr as usize)).unwrap().rowid;
        if rowid < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let exact = lo < cell_count && {
        let offset = header_offset + PageKind::LeafTable.header_size() + lo as usize * 2;
        let ptr = u16::from_be_bytes([page[offset], page[offset + 1]]);
        cell::parse_leaf_table_cell(read_cell_at(page, ptr as usize)).unwrap().rowid == key
    };
    (lo, exact)
}

/// Finds the child pointer to follow for `key` on an interior page:
/// table interior cells carry `(left_child, max_rowid_in_subtree)`, so the
/// first cell whose rowid is >= key names the subtree to descend into,
/// falling back to the right-child pointer if none qualifies.
fn binary_search_interior(
    page: &[u8],
    header_offset: usize,
    cell_count: u16,
    right_child: PageNum,
    key: i64,
) -> Result<(u16, PageNum)> {
    let mut lo = 0u16;
    let mut hi = cell_count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let offset = header_offset + PageKind::InteriorTable.header_size() + mid as usize * 2;
        let ptr = u16::from_be_bytes([page[offset], page[offset + 1]]);
        let parsed = cell::parse_interior_table_cell(read_cell_at(page, ptr as usize))?;
        if parsed.rowid < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == cell_count {
        Ok((cell_count, right_child))
    } else {
        let offset = header_offset + PageKind::InteriorTable.header_size() + lo as usize * 2;
        let ptr = u16::from_be_bytes([page[offset], page[offset + 1]]);
        let parsed = cell::parse_interior_table_cell(read_cell_at(page, ptr as usize))?;
        Ok((lo, parsed.left_child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Storage;

    fn build_single_leaf(rows: &[(i64, &[u8])]) -> Pager {
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 4096).unwrap();
        let header_off = 100; // page 1
        let usable = pager.page_size();
        let mut page = pager.get_page_owned(1).unwrap();
        let hdr = cell::PageHeader::new_leaf(PageKind::LeafTable, usable);
        cell::write_header(&mut page, header_off, &hdr).unwrap();

        let mut cell_content_start = usable as usize;
        let mut pointers = vec![];
        for (rowid, payload) in rows {
            let built = cell::build_leaf_table_cell(usable, *rowid, payload);
            cell_content_start -= built.bytes.len();
            page[cell_content_start..cell_content_start + built.bytes.len()].copy_from_slice(&built.bytes);
            pointers.push(cell_content_start as u16);
        }
        let mut hdr = cell::parse_header(&page, header_off).unwrap();
        hdr.cell_count = rows.len() as u16;
        hdr.cell_content_start = cell_content_start as u32;
        cell::write_header(&mut page, header_off, &hdr).unwrap();
        for (i, ptr) in pointers.iter().enumerate() {
            cell::set_cell_pointer(&mut page, header_off, PageKind::LeafTable, i, *ptr);
        }
        pager.write_page(1, &page).unwrap();
        pager
    }

    #[test]
    fn iterates_rows_in_rowid_order() {
        let mut pager = build_single_leaf(&[(1, b"one"), (2, b"two"), (3, b"three")]);
        let mut cursor = Cursor::new(&mut pager, 1);
        assert!(cursor.move_first().unwrap());
        let mut seen = vec![];
        loop {
            seen.push((cursor.current_rowid().unwrap(), cursor.current_payload().unwrap().unwrap()));
            if !cursor.move_next().unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![(1, b"one".to_vec()), (2, b"two".to_vec()), (3, b"three".to_vec())]);
    }

    #[test]
    fn seek_finds_exact_and_next_larger() {
        let mut pager = build_single_leaf(&[(1, b"a"), (5, b"b"), (10, b"c")]);
        let mut cursor = Cursor::new(&mut pager, 1);
        assert!(cursor.seek(5).unwrap());
        assert_eq!(cursor.current_rowid(), Some(5));

        let mut cursor = Cursor::new(&mut pager, 1);
        assert!(!cursor.seek(6).unwrap());
        assert_eq!(cursor.current_rowid(), Some(10));
    }

    #[test]
    fn move_last_positions_at_largest_rowid() {
        let mut pager = build_single_leaf(&[(1, b"a"), (5, b"b"), (10, b"c")]);
        let mut cursor = Cursor::new(&mut pager, 1);
        assert!(cursor.move_last().unwrap());
        assert_eq!(cursor.current_rowid(), Some(10));
    }

    #[test]
    fn stale_data_version_is_rejected() {
        let mut pager = build_single_leaf(&[(1, b"a")]);
        let version_before = pager.data_version();
        {
            let mut cursor = Cursor::new(&mut pager, 1);
            cursor.move_first().unwrap();
        }
        let page = pager.get_page_owned(1).unwrap();
        pager.write_page(1, &page).unwrap();
        pager.flush().unwrap();
        assert!(pager.data_version() > version_before);
        let mut cursor = Cursor::new(&mut pager, 1);
        cursor.data_version = version_before;
        assert_eq!(cursor.move_first().unwrap_err(), Error::Stale);
    }
}
