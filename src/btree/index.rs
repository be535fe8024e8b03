//! Index b-tree: comparator, cursor, and mutator for record-keyed trees
//! (as opposed to the table tree's implicit rowid key). An index cell's
//! payload is itself a record whose last column is the indexed row's
//! rowid, used to break ties between equal indexed values and to let a
//! cursor recover which table row an index entry points at.
//!
//! Grounded in `erictune-diydb/src/btree/interior.rs`'s split between
//! scanning and searching iterators, generalized to index pages, plus the
//! cross-type ordering and BINARY-collation comparator from the column
//! value types in `record.rs`.

use crate::cell::{self, PageKind};
use crate::pager::{PageNum, Pager};
use crate::record::Value;
use std::cmp::Ordering;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Cell(#[from] crate::cell::Error),
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error(transparent)]
    Overflow(#[from] crate::overflow::Error),
    #[error(transparent)]
    Record(#[from] crate::record::Error),
    #[error("page {0} is not an index btree page")]
    NotAnIndexPage(PageNum),
    #[error("cursor observed a newer data_version; reseek required")]
    Stale,
}

pub type Result<T> = std::result::Result<T, Error>;

fn header_offset(pn: PageNum) -> usize {
    Pager::btree_header_offset(pn)
}

/// SQLite's cross-type ordering: NULL < numeric (INTEGER/REAL compared by
/// value) < TEXT < BLOB. Within TEXT and BLOB, comparison is byte-wise
/// (BINARY collation -- the only collation this design supports).
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Integer(_) | Value::Real(_) => 1,
        Value::Text(_) => 2,
        Value::Blob(_) => 3,
    }
}

fn compare_value(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Real(x), Value::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Integer(x), Value::Real(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Real(x), Value::Integer(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Compares two index keys column-by-column (BINARY collation, SQLite's
/// cross-type ordering), falling back to comparing the trailing rowid
/// column only if every preceding column is equal.
pub fn compare_index_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_value(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn decode_key(record: &[u8]) -> Result<Vec<Value>> {
    Ok(crate::record::decode(record)?)
}

struct Frame {
    page: PageNum,
    kind: PageKind,
    index: u16,
    cell_count: u16,
}

/// A positioned cursor over an index btree rooted at `root_page`.
pub struct Cursor<'p> {
    pager: &'p mut Pager,
    root_page: PageNum,
    data_version: u64,
    stack: Vec<Frame>,
}

impl<'p> Cursor<'p> {
    pub fn new(pager: &'p mut Pager, root_page: PageNum) -> Cursor<'p> {
        let data_version = pager.data_version();
        Cursor { pager, root_page, data_version, stack: vec![] }
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
        if hdr.kind.is_table() {
            return Err(Error::NotAnIndexPage(page_num));
        }
        self.stack.push(Frame { page: page_num, kind: hdr.kind, index, cell_count: hdr.cell_count });
        Ok(())
    }

    fn cell_payload(&mut self, page_num: PageNum, kind: PageKind, index: u16) -> Result<(Vec<u8>, u64, Option<PageNum>)> {
        let page = self.pager.get_page(page_num)?;
        let off = header_offset(page_num);
        let ptr = cell::get_cell_pointer(page, off, kind, index as usize) as usize;
        if kind.is_leaf() {
            let parsed = cell::parse_leaf_index_cell(&page[ptr..])?;
            Ok((parsed.inline.to_vec(), parsed.payload_size, parsed.overflow_page))
        } else {
            let parsed = cell::parse_interior_index_cell(&page[ptr..])?;
            Ok((parsed.inline.to_vec(), parsed.payload_size, parsed.overflow_page))
        }
    }

    fn assemble_key(&mut self, page_num: PageNum, kind: PageKind, index: u16) -> Result<Vec<Value>> {
        let (mut inline, payload_size, overflow) = self.cell_payload(page_num, kind, index)?;
        if let Some(first) = overflow {
            let remaining = payload_size - inline.len() as u64;
            crate::overflow::read_chain(self.pager, first, remaining, &mut inline)?;
        }
        decode_key(&inline)
    }

    fn left_child_at(&mut self, page_num: PageNum, index: u16) -> Result<PageNum> {
        let page = self.pager.get_page(page_num)?;
        let off = header_offset(page_num);
        let ptr = cell::get_cell_pointer(page, off, PageKind::InteriorIndex, index as usize) as usize;
        Ok(cell::parse_interior_index_cell(&page[ptr..])?.left_child)
    }

    /// Descends to the leftmost leaf cell reachable from `page_num`.
    fn descend_leftmost(&mut self, page_num: PageNum) -> Result<()> {
        let mut page_num = page_num;
        loop {
            let page = self.pager.get_page(page_num)?;
            let hdr = cell::parse_header(page, header_offset(page_num))?;
            if hdr.kind.is_table() {
                return Err(Error::NotAnIndexPage(page_num));
            }
            if hdr.kind.is_leaf() {
                self.push_frame(page_num, 0)?;
                return Ok(());
            }
            self.push_frame(page_num, 0)?;
            page_num = self.left_child_at(page_num, 0)?;
        }
    }

    pub fn move_first(&mut self) -> Result<bool> {
        self.check_fresh()?;
        self.stack.clear();
        self.descend_leftmost(self.root_page)?;
        Ok(self.current_key().is_some())
    }

    /// Seeks to the first entry whose key is >= `key` under BINARY
    /// collation with rowid tiebreak. Returns true on an exact match.
    pub fn seek(&mut self, key: &[Value]) -> Result<bool> {
        self.check_fresh()?;
        self.stack.clear();
        let mut page_num = self.root_page;
        loop {
            let page = self.pager.get_page(page_num)?;
            let hdr = cell::parse_header(page, header_offset(page_num))?;
            if hdr.kind.is_table() {
                return Err(Error::NotAnIndexPage(page_num));
            }
            let cell_count = hdr.cell_count;
            let mut lo = 0u16;
            let mut hi = cell_count;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let mid_key = self.assemble_key(page_num, hdr.kind, mid)?;
                if compare_index_keys(&mid_key, key) == Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            if hdr.kind.is_leaf() {
                self.push_frame(page_num, lo)?;
                let exact = lo < cell_count && {
                    let found = self.assemble_key(page_num, hdr.kind, lo)?;
                    compare_index_keys(&found, key) == Ordering::Equal
                };
                return Ok(exact);
            }
            self.push_frame(page_num, lo)?;
            page_num = if lo == cell_count {
                hdr.right_child.unwrap()
            } else {
                self.left_child_at(page_num, lo)?
            };
        }
    }

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
            }
            let next_index = frame.index + 1;
            let page_num = frame.page;
            let cell_count = frame.cell_count;
            if next_index > cell_count {
                self.stack.pop();
                continue;
            }
            frame.index = next_index;
            let child = if next_index == cell_count {
                let page = self.pager.get_page(page_num)?;
                cell::parse_header(page, header_offset(page_num))?.right_child.unwrap()
            } else {
                self.left_child_at(page_num, next_index)?
            };
            self.descend_leftmost(child)?;
            return Ok(self.current_key().is_some());
        }
    }

    pub fn current_key(&mut self) -> Option<Vec<Value>> {
        let frame = self.stack.last()?;
        if !frame.kind.is_leaf() || frame.index >= frame.cell_count {
            return None;
        }
        let (page, kind, index) = (frame.page, frame.kind, frame.index);
        self.assemble_key(page, kind, index).ok()
    }
}

/// Inserts `key` (its last column already carrying the tiebreak rowid) into
/// the index btree rooted at `root_page`. Splits the target leaf and
/// propagates a promoted separator upward exactly as the table mutator
/// does, but keyed on `compare_index_keys` instead of plain rowid order.
pub fn insert(pager: &mut Pager, root_page: PageNum, key: &[Value], mut allocate: impl FnMut(&mut Pager) -> Result<PageNum>) -> Result<()> {
    let encoded = crate::record::encode(key);
    let usable = pager.page_size();
    let built = cell::build_leaf_index_cell(usable, &encoded);
    let mut cell_bytes = built.bytes;
    if let Some(off) = built.overflow_pointer_offset {
        let spill = &encoded[built.inline_len..];
        let first = crate::overflow::write_chain(pager, spill, |p| Ok(p.extend()))?;
        cell::patch_overflow_pointer(&mut cell_bytes, off, first);
    }

    let mut path: Vec<(PageNum, u16)> = vec![];
    let mut page_num = root_page;
    let target_leaf = loop {
        let page = pager.get_page_owned(page_num)?;
        let off = header_offset(page_num);
        let hdr = cell::parse_header(&page, off)?;
        if hdr.kind.is_leaf() {
            break page_num;
        }
        let mut lo = 0u16;
        let mut hi = hdr.cell_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let ptr = cell::get_cell_pointer(&page, off, hdr.kind, mid as usize) as usize;
            let parsed = cell::parse_interior_index_cell(&page[ptr..])?;
            let mid_key = decode_key(parsed.inline)?;
            if compare_index_keys(&mid_key, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let child = if lo == hdr.cell_count {
            hdr.right_child.unwrap()
        } else {
            let ptr = cell::get_cell_pointer(&page, off, hdr.kind, lo as usize) as usize;
            cell::parse_interior_index_cell(&page[ptr..])?.left_child
        };
        path.push((page_num, lo));
        page_num = child;
    };

    let mut cells = read_leaf_cells(pager, target_leaf)?;
    let leaf_cell_key = |c: &[u8]| -> Vec<Value> {
        cell::parse_leaf_index_cell(c)
            .ok()
            .and_then(|p| decode_key(p.inline).ok())
            .unwrap_or_default()
    };
    let pos = cells.partition_point(|c| compare_index_keys(&leaf_cell_key(c), key) == Ordering::Less);
    cells.insert(pos, cell_bytes);

    if let Ok(page) = crate::page_rewriter::build_leaf_page(pager, target_leaf, PageKind::LeafIndex, &cells) {
        pager.write_page(target_leaf, &page)?;
        return Ok(());
    }

    let split_at = crate::page_rewriter::choose_split_point(&cells);
    let right_page = allocate(pager)?;
    let (left, right) = cells.split_at(split_at + 1);
    let separator_key = leaf_cell_key(&left[left.len() - 1]);
    let left_page =
        crate::page_rewriter::build_leaf_page(pager, target_leaf, PageKind::LeafIndex, left).map_err(|_| Error::Cell(crate::cell::Error::Truncated))?;
    let right_built =
        crate::page_rewriter::build_leaf_page(pager, right_page, PageKind::LeafIndex, right).map_err(|_| Error::Cell(crate::cell::Error::Truncated))?;
    pager.write_page(target_leaf, &left_page)?;
    pager.write_page(right_page, &right_built)?;

    let mut promoted_key = separator_key;
    let mut promoted_child = target_leaf;
    let mut new_right = right_page;
    while let Some((parent_page, child_index)) = path.pop() {
        let mut parent_cells = read_interior_cells(pager, parent_page)?;
        let sep_encoded = crate::record::encode(&promoted_key);
        let sep_built = cell::build_interior_index_cell(usable, promoted_child, &sep_encoded);
        parent_cells.insert(child_index as usize, sep_built.bytes);

        let parent_hdr = {
            let page = pager.get_page_owned(parent_page)?;
            cell::parse_header(&page, header_offset(parent_page))?
        };

        if let Ok(page) =
            crate::page_rewriter::build_interior_page(pager, parent_page, PageKind::InteriorIndex, &parent_cells, parent_hdr.right_child.unwrap())
        {
            pager.write_page(parent_page, &page)?;
            retarget_next_child(pager, parent_page, child_index as usize, new_right)?;
            return Ok(());
        }

        let split_at = crate::page_rewriter::choose_split_point(&parent_cells);
        let promoted_rowid_cell = parent_cells[split_at].clone();
        let promoted_parsed = cell::parse_interior_index_cell(&promoted_rowid_cell)?;
        let promoted = decode_key(promoted_parsed.inline)?;
        let promoted_left_child = promoted_parsed.left_child;
        let (left, rest) = parent_cells.split_at(split_at);
        let right = &rest[1..];
        let alloc_right = allocate(pager)?;
        let left_page = crate::page_rewriter::build_interior_page(pager, parent_page, PageKind::InteriorIndex, left, promoted_left_child)
            .map_err(|_| Error::Cell(crate::cell::Error::Truncated))?;
        let right_page_bytes = crate::page_rewriter::build_interior_page(pager, alloc_right, PageKind::InteriorIndex, right, parent_hdr.right_child.unwrap())
            .map_err(|_| Error::Cell(crate::cell::Error::Truncated))?;
        pager.write_page(parent_page, &left_page)?;
        pager.write_page(alloc_right, &right_page_bytes)?;

        promoted_key = promoted;
        promoted_child = parent_page;
        new_right = alloc_right;
    }

    // Root split: grow the tree by one level, root page number unchanged.
    // The old root's cells are re-decoded and rebuilt into the new left
    // child rather than byte-copied, since page 1's header sits at a
    // different offset than an ordinary page's.
    let old_root_hdr = {
        let page = pager.get_page_owned(root_page)?;
        cell::parse_header(&page, header_offset(root_page))?
    };
    let new_left = allocate(pager)?;
    let relocated = if old_root_hdr.kind.is_leaf() {
        let cells = read_leaf_cells(pager, root_page)?;
        crate::page_rewriter::build_leaf_page(pager, new_left, old_root_hdr.kind, &cells)
    } else {
        let cells = read_interior_cells(pager, root_page)?;
        crate::page_rewriter::build_interior_page(pager, new_left, old_root_hdr.kind, &cells, old_root_hdr.right_child.unwrap())
    }
    .map_err(|_| Error::Cell(crate::cell::Error::Truncated))?;
    pager.write_page(new_left, &relocated)?;
    let sep_encoded = crate::record::encode(&promoted_key);
    let sep_built = cell::build_interior_index_cell(usable, new_left, &sep_encoded);
    let root_page_bytes = crate::page_rewriter::build_interior_page(pager, root_page, PageKind::InteriorIndex, &[sep_built.bytes], new_right)
        .map_err(|_| Error::Cell(crate::cell::Error::Truncated))?;
    pager.write_page(root_page, &root_page_bytes)?;
    Ok(())
}

fn read_leaf_cells(pager: &mut Pager, page_num: PageNum) -> Result<Vec<Vec<u8>>> {
    let page = pager.get_page_owned(page_num)?;
    let off = header_offset(page_num);
    let hdr = cell::parse_header(&page, off)?;
    let mut cells = Vec::with_capacity(hdr.cell_count as usize);
    for i in 0..hdr.cell_count {
        let ptr = cell::get_cell_pointer(&page, off, hdr.kind, i as usize) as usize;
        let parsed = cell::parse_leaf_index_cell(&page[ptr..])?;
        let (_, n1) = crate::varint::read(&page[ptr..])?;
        let len = n1 + parsed.inline.len() + if parsed.overflow_page.is_some() { 4 } else { 0 };
        cells.push(page[ptr..ptr + len].to_vec());
    }
    Ok(cells)
}

fn read_interior_cells(pager: &mut Pager, page_num: PageNum) -> Result<Vec<Vec<u8>>> {
    let page = pager.get_page_owned(page_num)?;
    let off = header_offset(page_num);
    let hdr = cell::parse_header(&page, off)?;
    let mut cells = Vec::with_capacity(hdr.cell_count as usize);
    for i in 0..hdr.cell_count {
        let ptr = cell::get_cell_pointer(&page, off, hdr.kind, i as usize) as usize;
        let parsed = cell::parse_interior_index_cell(&page[ptr..])?;
        let (_, n1) = crate::varint::read(&page[ptr + 4..])?;
        let len = 4 + n1 + parsed.inline.len() + if parsed.overflow_page.is_some() { 4 } else { 0 };
        cells.push(page[ptr..ptr + len].to_vec());
    }
    Ok(cells)
}

fn retarget_next_child(pager: &mut Pager, page_num: PageNum, insert_pos: usize, right_page: PageNum) -> Result<()> {
    let mut page = pager.get_page_owned(page_num)?;
    let off = header_offset(page_num);
    let hdr = cell::parse_header(&page, off)?;
    let next_index = insert_pos + 1;
    if next_index < hdr.cell_count as usize {
        let ptr = cell::get_cell_pointer(&page, off, hdr.kind, next_index) as usize;
        page[ptr..ptr + 4].copy_from_slice(&right_page.to_be_bytes());
    } else {
        let mut new_hdr = hdr.clone();
        new_hdr.right_child = Some(right_page);
        cell::write_header(&mut page, off, &new_hdr)?;
    }
    pager.write_page(page_num, &page)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Storage;

    #[test]
    fn stale_data_version_is_rejected() {
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 4096).unwrap();
        insert(&mut pager, 1, &[Value::Integer(1), Value::Integer(1)], |p| Ok(p.extend())).unwrap();
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

    #[test]
    fn binary_collation_orders_by_type_then_value() {
        assert_eq!(compare_value(&Value::Null, &Value::Integer(0)), Ordering::Less);
        assert_eq!(compare_value(&Value::Integer(5), &Value::Integer(10)), Ordering::Less);
        assert_eq!(compare_value(&Value::Integer(10), &Value::Text(b"a".to_vec())), Ordering::Less);
        assert_eq!(compare_value(&Value::Text(b"a".to_vec()), &Value::Blob(vec![0])), Ordering::Less);
        assert_eq!(compare_value(&Value::Text(b"abc".to_vec()), &Value::Text(b"abd".to_vec())), Ordering::Less);
    }

    #[test]
    fn rowid_breaks_ties_on_equal_leading_columns() {
        let a = vec![Value::Integer(5), Value::Integer(1)];
        let b = vec![Value::Integer(5), Value::Integer(2)];
        assert_eq!(compare_index_keys(&a, &b), Ordering::Less);
    }

    #[test]
    fn mixed_numeric_comparison_compares_by_value() {
        assert_eq!(compare_value(&Value::Integer(3), &Value::Real(3.5)), Ordering::Less);
    }
}
