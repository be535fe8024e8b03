//! Overflow chain: the linked list of extra pages a cell's payload spills
//! into when it does not fit inline. Each overflow page starts with a
//! 4-byte big-endian pointer to the next overflow page (0 for the last
//! page), followed by as many payload bytes as the usable page size allows.
//! See https://www.sqlite.org/fileformat2.html#overflow_pages.

use crate::pager::{PageNum, Pager};
use std::collections::HashSet;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error("overflow chain is shorter than the payload size requires")]
    ChainTooShort,
    #[error("overflow chain contains a cycle")]
    Cycle,
}

pub type Result<T> = std::result::Result<T, Error>;

const NEXT_PTR_SIZE: usize = 4;

/// Reads `remaining` bytes of overflow payload starting at `first_page`,
/// appending them to `out`. Detects cycles by tracking every page number
/// visited; a well-formed chain never revisits a page.
pub fn read_chain(pager: &Pager, first_page: PageNum, remaining: u64, out: &mut Vec<u8>) -> Result<()> {
    let usable_size = pager.page_size(); // overflow pages carry no reserved-bytes distinction in this design
    let mut page_num = first_page;
    let mut remaining = remaining;
    let mut visited = HashSet::new();
    while remaining > 0 {
        if !visited.insert(page_num) {
            return Err(Error::Cycle);
        }
        let page = pager.get_page(page_num)?;
        let next = u32::from_be_bytes([page[0], page[1], page[2], page[3]]);
        let capacity = usable_size as usize - NEXT_PTR_SIZE;
        let take = capacity.min(remaining as usize);
        out.extend_from_slice(&page[NEXT_PTR_SIZE..NEXT_PTR_SIZE + take]);
        remaining -= take as u64;
        if remaining > 0 {
            if next == 0 {
                return Err(Error::ChainTooShort);
            }
            page_num = next;
        }
    }
    Ok(())
}

/// Writes `payload` across a freshly allocated chain of overflow pages,
/// returning the first page number. `allocate_page` is supplied by the
/// caller (the transaction layer) so overflow page allocation participates
/// in the same freelist-or-extend policy as any other new page.
pub fn write_chain(
    pager: &mut Pager,
    payload: &[u8],
    mut allocate_page: impl FnMut(&mut Pager) -> Result<PageNum>,
) -> Result<PageNum> {
    let usable_size = pager.page_size() as usize;
    let capacity = usable_size - NEXT_PTR_SIZE;
    let page_numbers: Vec<PageNum> = {
        let n_pages = payload.len().div_ceil(capacity).max(1);
        let mut v = Vec::with_capacity(n_pages);
        for _ in 0..n_pages {
            v.push(allocate_page(pager)?);
        }
        v
    };

    for (i, &page_num) in page_numbers.iter().enumerate() {
        let start = i * capacity;
        let end = (start + capacity).min(payload.len());
        let next = if i + 1 < page_numbers.len() { page_numbers[i + 1] } else { 0 };
        let mut page = vec![0u8; usable_size];
        page[0..4].copy_from_slice(&next.to_be_bytes());
        page[NEXT_PTR_SIZE..NEXT_PTR_SIZE + (end - start)].copy_from_slice(&payload[start..end]);
        pager.write_page(page_num, &page)?;
    }
    Ok(page_numbers[0])
}

/// Frees every page in an overflow chain by handing each page number to
/// `free_page` (supplied by the transaction layer, which threads them onto
/// the freelist). Stops at a cycle rather than looping forever.
pub fn free_chain(pager: &Pager, first_page: PageNum, mut free_page: impl FnMut(PageNum)) -> Result<()> {
    let mut page_num = first_page;
    let mut visited = HashSet::new();
    loop {
        if !visited.insert(page_num) {
            return Err(Error::Cycle);
        }
        let page = pager.get_page(page_num)?;
        let next = u32::from_be_bytes([page[0], page[1], page[2], page[3]]);
        free_page(page_num);
        if next == 0 {
            break;
        }
        page_num = next;
    }
    Ok(())
}
