//! Leaf-page scanner: a read-only, non-seekable forward scan over every
//! leaf page of a btree, used by the bulk index populator and by full
//! table scans that don't need `Cursor`'s seek support. Precomputes the
//! full leaf-page list up front by walking the interior pages once, the
//! same leftmost-descent shape as `btree::table::Cursor`, but flattened
//! into a plain `Vec<PageNum>` instead of a reusable ancestor stack.

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
}

pub type Result<T> = std::result::Result<T, Error>;

fn header_offset(pn: PageNum) -> usize {
    Pager::btree_header_offset(pn)
}

/// Walks every interior page reachable from `root_page` and returns the
/// leaf page numbers in left-to-right (sorted-key) order.
pub fn leaf_pages(pager: &mut Pager, root_page: PageNum) -> Result<Vec<PageNum>> {
    let mut leaves = vec![];
    let mut stack = vec![root_page];
    // Depth-first, but each interior page's children are pushed in
    // right-to-left order so popping yields them left-to-right.
    while let Some(page_num) = stack.pop() {
        let page = pager.get_page_owned(page_num)?;
        let off = header_offset(page_num);
        let hdr = cell::parse_header(&page, off)?;
        if hdr.kind.is_leaf() {
            leaves.push(page_num);
            continue;
        }
        let mut children = Vec::with_capacity(hdr.cell_count as usize + 1);
        for i in 0..hdr.cell_count {
            let ptr = cell::get_cell_pointer(&page, off, hdr.kind, i as usize) as usize;
            let child = if hdr.kind.is_table() {
                cell::parse_interior_table_cell(&page[ptr..])?.left_child
            } else {
                cell::parse_interior_index_cell(&page[ptr..])?.left_child
            };
            children.push(child);
        }
        children.push(hdr.right_child.expect("interior page always has a right child"));
        for c in children.into_iter().rev() {
            stack.push(c);
        }
    }
    Ok(leaves)
}

/// Scans every table-leaf row reachable from `root_page`, in rowid order,
/// assembling overflow payloads, and calls `visit(rowid, payload)` for
/// each. Stops early if `visit` returns `false`.
pub fn scan_table(pager: &mut Pager, root_page: PageNum, mut visit: impl FnMut(i64, &[u8]) -> bool) -> Result<()> {
    for page_num in leaf_pages(pager, root_page)? {
        let page = pager.get_page_owned(page_num)?;
        let off = header_offset(page_num);
        let hdr = cell::parse_header(&page, off)?;
        for i in 0..hdr.cell_count {
            let ptr = cell::get_cell_pointer(&page, off, PageKind::LeafTable, i as usize) as usize;
            let parsed = cell::parse_leaf_table_cell(&page[ptr..])?;
            let mut payload = parsed.inline.to_vec();
            if let Some(first) = parsed.overflow_page {
                let remaining = parsed.payload_size - payload.len() as u64;
                crate::overflow::read_chain(pager, first, remaining, &mut payload)?;
            }
            if !visit(parsed.rowid, &payload) {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Storage;

    #[test]
    fn leaf_pages_returns_the_single_root_for_a_small_tree() {
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 4096).unwrap();
        crate::btree::table_mutator::insert(&mut pager, 1, 1, b"a", |p| Ok(p.extend())).unwrap();
        let leaves = leaf_pages(&mut pager, 1).unwrap();
        assert_eq!(leaves, vec![1]);
    }

    #[test]
    fn scan_table_visits_rows_in_order() {
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 512).unwrap();
        for i in 0..50i64 {
            crate::btree::table_mutator::insert(&mut pager, 1, i, format!("v{i}").as_bytes(), |p| Ok(p.extend())).unwrap();
        }
        let mut seen = vec![];
        scan_table(&mut pager, 1, |rowid, payload| {
            seen.push((rowid, payload.to_vec()));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 50);
        for w in seen.windows(2) {
            assert!(w[0].0 < w[1].0);
        }
    }
}
