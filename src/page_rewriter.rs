//! Generic page rewriting: the schema-agnostic byte-shuffling operations
//! shared by every kind of b-tree page (table or index, leaf or interior).
//! Operates on already-encoded cell byte slices and leaves interpreting
//! them to the caller -- `btree::table_mutator` inlines an equivalent of
//! `build_leaf_page`/`build_interior_page` for table pages; `btree::index`
//! and `populate` call through here instead of duplicating it, since index
//! pages and the bulk index builder share the exact same rebuild-from-cells
//! shape.
//!
//! Two families of operation live here: `build_leaf_page`/`build_interior_page`
//! rebuild a page from a caller-held cell list (used for splits, where the
//! caller already has the full list in hand to divide in two); `try_insert_cell`/
//! `remove_cell`/`defragment_page` mutate a page that's already on disk without
//! requiring the caller to have decoded every cell first. Grounded in the
//! page-header layout in `erictune-diydb/src/btree/header.rs`, generalized
//! from read-only parsing to in-place mutation.

use crate::cell::{self, PageHeader, PageKind};
use crate::pager::{PageNum, Pager};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("cell set does not fit in a page of this size")]
    DoesNotFit,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rebuilds a leaf page from scratch containing exactly `cells`, in the
/// order given (callers are responsible for having already sorted them).
/// Used for splits, where the caller already holds the full decoded cell
/// list to divide between the two halves -- `try_insert_cell` is the
/// cheaper choice when no split is needed.
///
/// `page_num` is needed (not just the page size) because page 1 carries
/// the 100-byte `DbHeader` before its btree header; that prefix is read
/// back from the existing page and copied forward so the database header
/// is never clobbered by a schema-table rebuild.
pub fn build_leaf_page(pager: &mut Pager, page_num: PageNum, kind: PageKind, cells: &[Vec<u8>]) -> Result<Vec<u8>> {
    assert!(kind.is_leaf());
    build_page(pager, page_num, kind, cells, None)
}

/// Rebuilds an interior page from scratch containing exactly `cells` (each
/// already carrying its left-child pointer) plus the given right-child
/// pointer.
pub fn build_interior_page(pager: &mut Pager, page_num: PageNum, kind: PageKind, cells: &[Vec<u8>], right_child: PageNum) -> Result<Vec<u8>> {
    assert!(!kind.is_leaf());
    build_page(pager, page_num, kind, cells, Some(right_child))
}

fn build_page(pager: &mut Pager, page_num: PageNum, kind: PageKind, cells: &[Vec<u8>], right_child: Option<PageNum>) -> Result<Vec<u8>> {
    let usable_size = pager.page_size();
    let off = Pager::btree_header_offset(page_num);
    let needed: usize = off + kind.header_size() + cells.len() * 2 + cells.iter().map(|c| c.len()).sum::<usize>();
    if needed > usable_size as usize {
        return Err(Error::DoesNotFit);
    }
    let mut page = vec![0u8; usable_size as usize];
    if off > 0 {
        let existing = pager.get_page_owned(page_num).map_err(|_| Error::DoesNotFit)?;
        page[0..off].copy_from_slice(&existing[0..off]);
    }
    let mut content_start = usable_size as usize;
    let mut pointers = Vec::with_capacity(cells.len());
    for c in cells {
        content_start -= c.len();
        page[content_start..content_start + c.len()].copy_from_slice(c);
        pointers.push(content_start as u16);
    }
    let header = PageHeader {
        kind,
        first_freeblock: 0,
        cell_count: cells.len() as u16,
        cell_content_start: content_start as u32,
        fragmented_free_bytes: 0,
        right_child,
    };
    cell::write_header(&mut page, off, &header).map_err(|_| Error::DoesNotFit)?;
    for (i, ptr) in pointers.iter().enumerate() {
        cell::set_cell_pointer(&mut page, off, kind, i, *ptr);
    }
    Ok(page)
}

/// Inserts `new_cell` into a caller-held, already-sorted vector of cell
/// bytes at the position its key would keep it sorted, returning `true` if
/// the resulting set still fits on one page (the caller checks this with
/// `build_leaf_page`/`build_interior_page` before committing; this
/// function only does the insertion-point bookkeeping callers repeat).
pub fn insertion_point<K: Ord>(keys: &[K], new_key: &K) -> usize {
    keys.partition_point(|k| k < new_key)
}

/// Tries to insert `new_cell` at pointer-array slot `sort_index` without
/// touching any other cell's bytes: the new cell is appended to the content
/// area and a single pointer is spliced into the array at `sort_index`. If
/// the gap between the pointer array and the content area isn't big enough
/// but the page's total free space (including freeblocks and fragmented
/// bytes) is, `defragment_page` runs first and the insert is retried --
/// `cell_len` is only needed for that retry path, to let `defragment_page`
/// read the page's existing live cells. Returns `Ok(false)` (page left
/// untouched) if even a full defragmentation wouldn't make room, in which
/// case the caller falls back to a split via `build_leaf_page`/`build_interior_page`.
pub fn try_insert_cell(
    pager: &mut Pager,
    page_num: PageNum,
    kind: PageKind,
    new_cell: &[u8],
    sort_index: usize,
    cell_len: impl Fn(&[u8]) -> usize,
) -> Result<bool> {
    if !insert_fits_contiguously(pager, page_num, kind, new_cell.len())? {
        if !total_free_space(pager, page_num, kind)?.map(|free| free >= new_cell.len() + 2).unwrap_or(false) {
            return Ok(false);
        }
        defragment_page(pager, page_num, kind, cell_len)?;
        if !insert_fits_contiguously(pager, page_num, kind, new_cell.len())? {
            return Ok(false);
        }
    }

    let off = Pager::btree_header_offset(page_num);
    let mut page = pager.get_page_owned(page_num).map_err(|_| Error::DoesNotFit)?;
    let hdr = cell::parse_header(&page, off).map_err(|_| Error::DoesNotFit)?;
    let content_start = hdr.cell_content_start as usize;
    let new_content_start = content_start - new_cell.len();
    page[new_content_start..content_start].copy_from_slice(new_cell);
    for i in (sort_index..hdr.cell_count as usize).rev() {
        let v = cell::get_cell_pointer(&page, off, kind, i);
        cell::set_cell_pointer(&mut page, off, kind, i + 1, v);
    }
    cell::set_cell_pointer(&mut page, off, kind, sort_index, new_content_start as u16);
    let mut new_hdr = hdr;
    new_hdr.cell_count += 1;
    new_hdr.cell_content_start = new_content_start as u32;
    cell::write_header(&mut page, off, &new_hdr).map_err(|_| Error::DoesNotFit)?;
    pager.write_page(page_num, &page).map_err(|_| Error::DoesNotFit)?;
    Ok(true)
}

fn insert_fits_contiguously(pager: &mut Pager, page_num: PageNum, kind: PageKind, new_cell_len: usize) -> Result<bool> {
    let off = Pager::btree_header_offset(page_num);
    let page = pager.get_page_owned(page_num).map_err(|_| Error::DoesNotFit)?;
    let hdr = cell::parse_header(&page, off).map_err(|_| Error::DoesNotFit)?;
    let ptr_array_end = cell::pointer_array_offset(off, kind) + hdr.cell_count as usize * 2;
    let content_start = hdr.cell_content_start as usize;
    Ok(ptr_array_end + 2 + new_cell_len <= content_start)
}

/// Total reclaimable space on the page: the contiguous gap plus every
/// freeblock on the chain plus the fragmented-byte count. `None` if the
/// freeblock chain is malformed (an offset runs off the page).
fn total_free_space(pager: &mut Pager, page_num: PageNum, kind: PageKind) -> Result<Option<usize>> {
    let off = Pager::btree_header_offset(page_num);
    let page = pager.get_page_owned(page_num).map_err(|_| Error::DoesNotFit)?;
    let hdr = cell::parse_header(&page, off).map_err(|_| Error::DoesNotFit)?;
    let ptr_array_end = cell::pointer_array_offset(off, kind) + hdr.cell_count as usize * 2;
    let content_start = hdr.cell_content_start as usize;
    let mut free = content_start.saturating_sub(ptr_array_end);
    let mut next = hdr.first_freeblock as usize;
    while next != 0 {
        if next + 4 > page.len() {
            return Ok(None);
        }
        let nxt = u16::from_be_bytes([page[next], page[next + 1]]) as usize;
        let size = u16::from_be_bytes([page[next + 2], page[next + 3]]) as usize;
        free += size;
        next = nxt;
    }
    free += hdr.fragmented_free_bytes as usize;
    Ok(Some(free))
}

/// Removes the cell at pointer-array slot `index` in place: the pointer
/// array is compacted by one entry and the vacated content-area span (whose
/// length the caller must supply, since only the caller knows how to parse
/// its own cell layout) is threaded onto the page's freeblock chain rather
/// than reclaimed immediately. Nothing in this crate's allocator consumes
/// freeblocks yet -- `defragment_page` is what actually reclaims the space
/// -- but the chain is maintained correctly so a future allocator can.
pub fn remove_cell(pager: &mut Pager, page_num: PageNum, kind: PageKind, index: usize, cell_len: usize) -> Result<()> {
    let off = Pager::btree_header_offset(page_num);
    let mut page = pager.get_page_owned(page_num).map_err(|_| Error::DoesNotFit)?;
    let hdr = cell::parse_header(&page, off).map_err(|_| Error::DoesNotFit)?;
    let removed_ptr = cell::get_cell_pointer(&page, off, kind, index) as usize;

    if cell_len >= 4 {
        page[removed_ptr..removed_ptr + 2].copy_from_slice(&hdr.first_freeblock.to_be_bytes());
        page[removed_ptr + 2..removed_ptr + 4].copy_from_slice(&(cell_len as u16).to_be_bytes());
    }

    for i in index..hdr.cell_count as usize - 1 {
        let v = cell::get_cell_pointer(&page, off, kind, i + 1);
        cell::set_cell_pointer(&mut page, off, kind, i, v);
    }

    let mut new_hdr = hdr;
    new_hdr.cell_count -= 1;
    if cell_len >= 4 {
        new_hdr.first_freeblock = removed_ptr as u16;
    } else {
        new_hdr.fragmented_free_bytes = new_hdr.fragmented_free_bytes.saturating_add(cell_len as u8);
    }
    // The vacated span may have been the content area's low-water mark;
    // recompute it as the minimum pointer still live on the page.
    new_hdr.cell_content_start = (0..new_hdr.cell_count as usize)
        .map(|i| cell::get_cell_pointer(&page, off, kind, i) as u32)
        .min()
        .unwrap_or(page.len() as u32);
    cell::write_header(&mut page, off, &new_hdr).map_err(|_| Error::DoesNotFit)?;
    pager.write_page(page_num, &page).map_err(|_| Error::DoesNotFit)?;
    Ok(())
}

/// Reclaims every freeblock and fragmented byte on a page by reading its
/// live cells straight off the pointer array and rebuilding the page dense
/// from scratch, exactly as `build_leaf_page`/`build_interior_page` do for
/// a caller-held cell list -- the difference is this reads the cells
/// itself, so it can be called as a standalone compaction step rather than
/// threaded through an insert or delete. `cell_len` parses a cell's leading
/// bytes (varint header, payload, optional overflow pointer) to tell this
/// function how many bytes to read starting at its pointer.
pub fn defragment_page(pager: &mut Pager, page_num: PageNum, kind: PageKind, cell_len: impl Fn(&[u8]) -> usize) -> Result<()> {
    let off = Pager::btree_header_offset(page_num);
    let page = pager.get_page_owned(page_num).map_err(|_| Error::DoesNotFit)?;
    let hdr = cell::parse_header(&page, off).map_err(|_| Error::DoesNotFit)?;
    let mut cells = Vec::with_capacity(hdr.cell_count as usize);
    for i in 0..hdr.cell_count as usize {
        let ptr = cell::get_cell_pointer(&page, off, kind, i) as usize;
        let len = cell_len(&page[ptr..]);
        cells.push(page[ptr..ptr + len].to_vec());
    }
    let rebuilt = build_page(pager, page_num, kind, &cells, hdr.right_child)?;
    pager.write_page(page_num, &rebuilt).map_err(|_| Error::DoesNotFit)?;
    Ok(())
}

/// Picks the split point for an overlong cell list: the first index where
/// the cumulative byte size of the left half reaches at least half the
/// total, so neither half is more than roughly half the page over budget.
pub fn choose_split_point(cells: &[Vec<u8>]) -> usize {
    let total: usize = cells.iter().map(|c| c.len()).sum();
    let half = total.div_ceil(2);
    let mut acc = 0usize;
    for (i, c) in cells.iter().enumerate() {
        acc += c.len();
        if acc >= half {
            return i;
        }
    }
    cells.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Storage;

    fn new_pager(page_size: u32) -> Pager {
        Pager::create(Storage::Memory(Vec::new()), page_size).unwrap()
    }

    #[test]
    fn build_leaf_page_round_trips_cell_count() {
        let mut pager = new_pager(512);
        let page_num = pager.extend();
        let cells: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 10]).collect();
        let page = build_leaf_page(&mut pager, page_num, PageKind::LeafIndex, &cells).unwrap();
        let hdr = cell::parse_header(&page, 0).unwrap();
        assert_eq!(hdr.cell_count, 5);
    }

    #[test]
    fn oversized_cell_set_does_not_fit() {
        let mut pager = new_pager(512);
        let page_num = pager.extend();
        let cells: Vec<Vec<u8>> = (0..100).map(|i| vec![i as u8; 50]).collect();
        assert_eq!(build_leaf_page(&mut pager, page_num, PageKind::LeafIndex, &cells), Err(Error::DoesNotFit));
    }

    #[test]
    fn split_point_balances_byte_totals() {
        let cells: Vec<Vec<u8>> = vec![vec![0; 10], vec![0; 10], vec![0; 10], vec![0; 10]];
        let split = choose_split_point(&cells);
        assert_eq!(split, 1); // after 2 cells (20 bytes) >= half of 40
    }

    #[test]
    fn rebuilding_page_one_preserves_the_database_header_prefix() {
        let mut pager = new_pager(512);
        let before = pager.get_page_owned(1).unwrap();
        let cells: Vec<Vec<u8>> = vec![vec![7u8; 10]];
        let page = build_leaf_page(&mut pager, 1, PageKind::LeafIndex, &cells).unwrap();
        assert_eq!(&page[0..crate::dbheader::HEADER_SIZE], &before[0..crate::dbheader::HEADER_SIZE]);
        let hdr = cell::parse_header(&page, crate::dbheader::HEADER_SIZE).unwrap();
        assert_eq!(hdr.cell_count, 1);
    }

    #[test]
    fn try_insert_cell_adds_a_cell_without_disturbing_the_others() {
        let mut pager = new_pager(512);
        let page_num = pager.extend();
        let cells: Vec<Vec<u8>> = vec![vec![1u8; 10], vec![3u8; 10]];
        let page = build_leaf_page(&mut pager, page_num, PageKind::LeafIndex, &cells).unwrap();
        pager.write_page(page_num, &page).unwrap();

        let new_cell = vec![2u8; 10];
        assert!(try_insert_cell(&mut pager, page_num, PageKind::LeafIndex, &new_cell, 1, |b| 10.min(b.len())).unwrap());

        let page = pager.get_page_owned(page_num).unwrap();
        let hdr = cell::parse_header(&page, 0).unwrap();
        assert_eq!(hdr.cell_count, 3);
        let ptr0 = cell::get_cell_pointer(&page, 0, PageKind::LeafIndex, 0) as usize;
        assert_eq!(&page[ptr0..ptr0 + 10], vec![1u8; 10].as_slice());
        let ptr2 = cell::get_cell_pointer(&page, 0, PageKind::LeafIndex, 2) as usize;
        assert_eq!(&page[ptr2..ptr2 + 10], vec![3u8; 10].as_slice());
    }

    #[test]
    fn try_insert_cell_reports_when_it_does_not_fit() {
        let mut pager = new_pager(64);
        let page_num = pager.extend();
        let cells: Vec<Vec<u8>> = vec![vec![1u8; 20]];
        let page = build_leaf_page(&mut pager, page_num, PageKind::LeafIndex, &cells).unwrap();
        pager.write_page(page_num, &page).unwrap();

        let new_cell = vec![2u8; 40];
        assert!(!try_insert_cell(&mut pager, page_num, PageKind::LeafIndex, &new_cell, 1, |b| 20.min(b.len())).unwrap());
        let page = pager.get_page_owned(page_num).unwrap();
        let hdr = cell::parse_header(&page, 0).unwrap();
        assert_eq!(hdr.cell_count, 1);
    }

    #[test]
    fn remove_cell_compacts_the_pointer_array() {
        let mut pager = new_pager(512);
        let page_num = pager.extend();
        let cells: Vec<Vec<u8>> = vec![vec![1u8; 10], vec![2u8; 10], vec![3u8; 10]];
        let page = build_leaf_page(&mut pager, page_num, PageKind::LeafIndex, &cells).unwrap();
        pager.write_page(page_num, &page).unwrap();

        remove_cell(&mut pager, page_num, PageKind::LeafIndex, 1, 10).unwrap();

        let page = pager.get_page_owned(page_num).unwrap();
        let hdr = cell::parse_header(&page, 0).unwrap();
        assert_eq!(hdr.cell_count, 2);
        assert_ne!(hdr.first_freeblock, 0);
        let ptr0 = cell::get_cell_pointer(&page, 0, PageKind::LeafIndex, 0) as usize;
        assert_eq!(&page[ptr0..ptr0 + 10], vec![1u8; 10].as_slice());
        let ptr1 = cell::get_cell_pointer(&page, 0, PageKind::LeafIndex, 1) as usize;
        assert_eq!(&page[ptr1..ptr1 + 10], vec![3u8; 10].as_slice());
    }

    #[test]
    fn defragment_page_rebuilds_from_the_pages_own_live_cells() {
        let mut pager = new_pager(512);
        let page_num = pager.extend();
        let cells: Vec<Vec<u8>> = vec![vec![1u8; 10], vec![2u8; 10], vec![3u8; 10]];
        let page = build_leaf_page(&mut pager, page_num, PageKind::LeafIndex, &cells).unwrap();
        pager.write_page(page_num, &page).unwrap();
        remove_cell(&mut pager, page_num, PageKind::LeafIndex, 1, 10).unwrap();

        defragment_page(&mut pager, page_num, PageKind::LeafIndex, |bytes| 10.min(bytes.len())).unwrap();

        let page = pager.get_page_owned(page_num).unwrap();
        let hdr = cell::parse_header(&page, 0).unwrap();
        assert_eq!(hdr.cell_count, 2);
        assert_eq!(hdr.first_freeblock, 0);
        assert_eq!(hdr.fragmented_free_bytes, 0);
    }

    #[test]
    fn try_insert_cell_defragments_before_giving_up() {
        // Pack a page exactly full (zero initial slack), free the middle
        // cell (leaving a freeblock, not contiguous free space), then
        // insert a cell too big for the leftover contiguous gap alone but
        // small enough once the freeblock is reclaimed.
        let mut pager = new_pager(56);
        let page_num = pager.extend();
        let cells: Vec<Vec<u8>> = vec![vec![1u8; 14], vec![2u8; 14], vec![3u8; 14]];
        let page = build_leaf_page(&mut pager, page_num, PageKind::LeafIndex, &cells).unwrap();
        pager.write_page(page_num, &page).unwrap();
        remove_cell(&mut pager, page_num, PageKind::LeafIndex, 1, 14).unwrap();

        let new_cell = vec![9u8; 12];
        assert!(try_insert_cell(&mut pager, page_num, PageKind::LeafIndex, &new_cell, 1, |b| 14.min(b.len())).unwrap());

        let page = pager.get_page_owned(page_num).unwrap();
        let hdr = cell::parse_header(&page, 0).unwrap();
        assert_eq!(hdr.cell_count, 3);
        assert_eq!(hdr.first_freeblock, 0);
    }
}
