//! Bulk index populator: builds a brand-new index btree from a full table
//! scan in one pass, bottom-up, instead of calling `btree::index::insert`
//! once per row. Used when an index is created on a table that already has
//! rows. Grounded in the bottom-up `build_from_sorted_entries` approach in
//! `other_examples/c773d47f_ysankpia-nervusdb`: lay out leaf pages densely
//! left-to-right from pre-sorted keys, then build each level of interior
//! pages from the separators of the level below, repeating until one page
//! (the new root) remains.

use crate::btree::scanner;
use crate::cell::{self, PageKind};
use crate::pager::{PageNum, Pager};
use crate::record::Value;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Scanner(#[from] crate::btree::scanner::Error),
    #[error(transparent)]
    Record(#[from] crate::record::Error),
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error(transparent)]
    Overflow(#[from] crate::overflow::Error),
    #[error(transparent)]
    PageRewriter(#[from] crate::page_rewriter::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Builds a fresh index btree over `table_root` keyed by `key_of(row)`
/// (the indexed column values; callers append the rowid as the last
/// element themselves to get the usual rowid tiebreak), allocating new
/// pages via `allocate`. Returns the new index's root page number.
pub fn build_index(
    pager: &mut Pager,
    table_root: PageNum,
    mut key_of: impl FnMut(i64, &[u8]) -> Vec<Value>,
    mut allocate: impl FnMut(&mut Pager) -> Result<PageNum>,
) -> Result<PageNum> {
    let mut keys: Vec<Vec<Value>> = vec![];
    scanner::scan_table(pager, table_root, |rowid, payload| {
        keys.push(key_of(rowid, payload));
        true
    })?;
    keys.sort_by(|a, b| crate::btree::index::compare_index_keys(a, b));

    let usable = pager.page_size();
    if keys.is_empty() {
        let root = allocate(pager)?;
        let page = crate::page_rewriter::build_leaf_page(pager, root, PageKind::LeafIndex, &[])?;
        pager.write_page(root, &page)?;
        return Ok(root);
    }

    // Level 0: pack sorted keys densely into leaf pages.
    let mut level_cells: Vec<Vec<u8>> = Vec::with_capacity(keys.len());
    for key in &keys {
        let encoded = crate::record::encode(key);
        let built = cell::build_leaf_index_cell(usable, &encoded);
        let mut bytes = built.bytes;
        if let Some(off) = built.overflow_pointer_offset {
            let spill = &encoded[built.inline_len..];
            let first = crate::overflow::write_chain(pager, spill, |p| Ok(p.extend()))?;
            cell::patch_overflow_pointer(&mut bytes, off, first);
        }
        level_cells.push(bytes);
    }

    let mut current_pages: Vec<(PageNum, Vec<Value>)> = vec![]; // (page_num, largest key on that page)
    let mut batch: Vec<Vec<u8>> = vec![];
    let mut batch_keys: Vec<Vec<Value>> = vec![];
    let max_payload = usable as usize - PageKind::LeafIndex.header_size();
    let mut used = 0usize;
    for (i, cell_bytes) in level_cells.into_iter().enumerate() {
        let cell_len = cell_bytes.len() + 2;
        if used + cell_len > max_payload && !batch.is_empty() {
            let page_num = allocate(pager)?;
            let page = crate::page_rewriter::build_leaf_page(pager, page_num, PageKind::LeafIndex, &batch)?;
            pager.write_page(page_num, &page)?;
            current_pages.push((page_num, batch_keys.last().unwrap().clone()));
            batch.clear();
            batch_keys.clear();
            used = 0;
        }
        used += cell_len;
        batch_keys.push(keys[i].clone());
        batch.push(cell_bytes);
    }
    if !batch.is_empty() {
        let page_num = allocate(pager)?;
        let page = crate::page_rewriter::build_leaf_page(pager, page_num, PageKind::LeafIndex, &batch)?;
        pager.write_page(page_num, &page)?;
        current_pages.push((page_num, batch_keys.last().unwrap().clone()));
    }

    // Build interior levels bottom-up until only one page remains.
    while current_pages.len() > 1 {
        let mut next_level: Vec<(PageNum, Vec<Value>)> = vec![];
        let mut batch: Vec<Vec<u8>> = vec![];
        let mut used = 0usize;
        let max_payload = usable as usize - PageKind::InteriorIndex.header_size();
        let mut i = 0usize;
        while i < current_pages.len() {
            let (child_page, child_key) = &current_pages[i];
            // The last child of the final interior page on this level
            // becomes that page's right-child pointer, not a separator
            // cell, so only emit a cell for children before the last one
            // in the *current batch*.
            if i + 1 == current_pages.len() {
                // Final child overall: flush into the right-child pointer.
                let page_num = allocate(pager)?;
                let page = crate::page_rewriter::build_interior_page(pager, page_num, PageKind::InteriorIndex, &batch, *child_page)?;
                pager.write_page(page_num, &page)?;
                next_level.push((page_num, child_key.clone()));
                batch.clear();
                used = 0;
                i += 1;
                continue;
            }
            let encoded = crate::record::encode(child_key);
            let built = cell::build_interior_index_cell(usable, *child_page, &encoded);
            let cell_len = built.bytes.len() + 2;
            if used + cell_len > max_payload && !batch.is_empty() {
                // Flush using the *next* child as this batch's right-child.
                let (right_child, right_key) = &current_pages[i];
                let page_num = allocate(pager)?;
                let page = crate::page_rewriter::build_interior_page(pager, page_num, PageKind::InteriorIndex, &batch, *right_child)?;
                pager.write_page(page_num, &page)?;
                next_level.push((page_num, right_key.clone()));
                batch.clear();
                used = 0;
                i += 1;
                continue;
            }
            used += cell_len;
            batch.push(built.bytes);
            i += 1;
        }
        current_pages = next_level;
    }

    Ok(current_pages[0].0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Storage;

    #[test]
    fn builds_an_index_over_an_existing_table() {
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 512).unwrap();
        for i in 0..30i64 {
            crate::btree::table_mutator::insert(&mut pager, 1, i, format!("v{i}").as_bytes(), |p| Ok(p.extend())).unwrap();
        }
        let root = build_index(
            &mut pager,
            1,
            |rowid, _payload| vec![Value::Integer(rowid), Value::Integer(rowid)],
            |p| Ok(p.extend()),
        )
        .unwrap();

        let mut cursor = crate::btree::index::Cursor::new(&mut pager, root);
        assert!(cursor.move_first().unwrap());
        let mut count = 0;
        loop {
            count += 1;
            if !cursor.move_next().unwrap() {
                break;
            }
        }
        assert_eq!(count, 30);
    }

    #[test]
    fn builds_an_empty_index_for_an_empty_table() {
        let mut pager = Pager::create(Storage::Memory(Vec::new()), 512).unwrap();
        let root = build_index(&mut pager, 1, |rowid, _| vec![Value::Integer(rowid)], |p| Ok(p.extend())).unwrap();
        let mut cursor = crate::btree::index::Cursor::new(&mut pager, root);
        assert!(!cursor.move_first().unwrap());
    }
}
