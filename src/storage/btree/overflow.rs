//! Overflow page chains.
//!
//! Payload that does not fit locally is spilled to a singly linked list
//! of overflow pages. Each page stores the next page number in its first
//! 4 bytes (0 terminates the chain) followed by payload bytes. Chains are
//! acyclic; walks are bounded by the database page count.

use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, write_u32};
use super::{allocate_btree_page, free_btree_page, BtShared};

/// Payload bytes stored per overflow page.
pub fn chain_capacity(usable_size: u32) -> usize {
    usable_size as usize - 4
}

/// Write `spill` to a freshly allocated chain and return its head page.
pub fn write_chain(shared: &mut BtShared, spill: &[u8]) -> Result<Pgno> {
    debug_assert!(!spill.is_empty());
    let capacity = chain_capacity(shared.usable_size);
    let n_page = spill.len().div_ceil(capacity);
    let mut pages = Vec::with_capacity(n_page);
    for _ in 0..n_page {
        pages.push(allocate_btree_page(shared)?);
    }
    for (i, chunk) in spill.chunks(capacity).enumerate() {
        let pgno = pages[i];
        let next = if i + 1 < n_page { pages[i + 1] } else { 0 };
        let mut page = shared.pager.get(pgno)?;
        shared.pager.write(&mut page)?;
        page.data.fill(0);
        write_u32(&mut page.data, 0, next)?;
        page.data[4..4 + chunk.len()].copy_from_slice(chunk);
        shared.pager.write_page_to_cache(&page);
    }
    trace!(head = pages[0], pages = n_page, "overflow chain written");
    Ok(pages[0])
}

/// Read `out.len()` payload bytes starting `offset` bytes into the chain.
///
/// `cache` is the cursor's overflow-page-number cache: chain page numbers
/// indexed by chain position, filled in as the walk discovers them so
/// repeated incremental-blob reads skip the walk.
pub fn read_chain(
    shared: &mut BtShared,
    head: Pgno,
    offset: usize,
    out: &mut [u8],
    mut cache: Option<&mut Vec<Pgno>>,
) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let capacity = chain_capacity(shared.usable_size);
    let first_idx = offset / capacity;

    // Start from the deepest cached position at or before the target.
    let (mut idx, mut pgno) = match cache.as_deref() {
        Some(c) if !c.is_empty() => {
            let known = first_idx.min(c.len() - 1);
            (known, c[known])
        }
        _ => {
            if let Some(c) = cache.as_deref_mut() {
                c.push(head);
            }
            (0, head)
        }
    };

    let max_steps = shared.pager.db_size as usize + 1;
    let mut pos = idx * capacity;
    let end = offset + out.len();
    let mut written = 0usize;
    let mut steps = 0usize;

    while pos < end {
        if pgno == 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "overflow chain too short"));
        }
        steps += 1;
        if steps > max_steps {
            return Err(Error::with_message(ErrorCode::Corrupt, "overflow chain cycle"));
        }
        let page = shared.pager.get(pgno)?;
        let next = read_u32(&page.data, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        if pos + capacity > offset {
            let page_start = offset.saturating_sub(pos);
            let take = (capacity - page_start).min(end - pos - page_start);
            out[written..written + take]
                .copy_from_slice(&page.data[4 + page_start..4 + page_start + take]);
            written += take;
        }
        pos += capacity;
        idx += 1;
        if let Some(c) = cache.as_deref_mut() {
            if next != 0 && c.len() == idx {
                c.push(next);
            }
        }
        pgno = next;
    }
    Ok(())
}

/// Overwrite chain bytes starting `offset` bytes in. Only incremental-blob
/// writes use this; the chain shape never changes.
pub fn write_chain_at(
    shared: &mut BtShared,
    head: Pgno,
    offset: usize,
    buf: &[u8],
    mut cache: Option<&mut Vec<Pgno>>,
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let capacity = chain_capacity(shared.usable_size);
    let (mut idx, mut pgno) = match cache.as_deref() {
        Some(c) if !c.is_empty() => {
            let known = (offset / capacity).min(c.len() - 1);
            (known, c[known])
        }
        _ => (0, head),
    };

    let max_steps = shared.pager.db_size as usize + 1;
    let mut pos = idx * capacity;
    let end = offset + buf.len();
    let mut consumed = 0usize;
    let mut steps = 0usize;

    while pos < end {
        if pgno == 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "overflow chain too short"));
        }
        steps += 1;
        if steps > max_steps {
            return Err(Error::with_message(ErrorCode::Corrupt, "overflow chain cycle"));
        }
        let mut page = shared.pager.get(pgno)?;
        let next = read_u32(&page.data, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        if pos + capacity > offset {
            let page_start = offset.saturating_sub(pos);
            let take = (capacity - page_start).min(end - pos - page_start);
            shared.pager.write(&mut page)?;
            page.data[4 + page_start..4 + page_start + take]
                .copy_from_slice(&buf[consumed..consumed + take]);
            shared.pager.write_page_to_cache(&page);
            consumed += take;
        }
        pos += capacity;
        idx += 1;
        if let Some(c) = cache.as_deref_mut() {
            if next != 0 && c.len() == idx {
                c.push(next);
            }
        }
        pgno = next;
    }
    Ok(())
}

/// Free every page of the chain headed at `head`, returning the count.
pub fn free_chain(shared: &mut BtShared, head: Pgno) -> Result<u32> {
    let mut next = head;
    let mut freed = 0u32;
    let max_steps = shared.pager.db_size + 1;
    while next != 0 {
        if freed >= max_steps {
            return Err(Error::with_message(ErrorCode::Corrupt, "overflow chain cycle"));
        }
        let page = shared.pager.get(next)?;
        let following = read_u32(&page.data, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        free_btree_page(shared, next)?;
        freed += 1;
        next = following;
    }
    trace!(head, freed, "overflow chain freed");
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::tests_support::memory_shared;

    #[test]
    fn test_chain_roundtrip() {
        let mut shared = memory_shared(512);
        let spill: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let head = write_chain(&mut shared, &spill).unwrap();
        let mut out = vec![0u8; spill.len()];
        read_chain(&mut shared, head, 0, &mut out, None).unwrap();
        assert_eq!(out, spill);
    }

    #[test]
    fn test_chain_page_count() {
        let mut shared = memory_shared(512);
        let capacity = chain_capacity(512);
        let spill = vec![7u8; capacity * 2 + 1];
        let before = shared.pager.db_size;
        write_chain(&mut shared, &spill).unwrap();
        assert_eq!(shared.pager.db_size, before + 3);
    }

    #[test]
    fn test_partial_reads_with_cache() {
        let mut shared = memory_shared(512);
        let spill: Vec<u8> = (0..3000u32).map(|i| (i % 197) as u8).collect();
        let head = write_chain(&mut shared, &spill).unwrap();
        let mut cache: Vec<crate::types::Pgno> = Vec::new();
        for &(offset, len) in &[(0usize, 100usize), (1500, 600), (2900, 100), (508, 516)] {
            let mut out = vec![0u8; len];
            read_chain(&mut shared, head, offset, &mut out, Some(&mut cache)).unwrap();
            assert_eq!(out, &spill[offset..offset + len], "offset {offset}");
        }
        assert!(!cache.is_empty());
        assert_eq!(cache[0], head);
    }

    #[test]
    fn test_free_chain_counts_pages() {
        let mut shared = memory_shared(512);
        let spill = vec![1u8; chain_capacity(512) * 3];
        let head = write_chain(&mut shared, &spill).unwrap();
        let freed = free_chain(&mut shared, head).unwrap();
        assert_eq!(freed, 3);
        assert_eq!(shared.free_pages.len(), 3);
    }

    #[test]
    fn test_read_past_chain_end_is_corrupt() {
        let mut shared = memory_shared(512);
        let spill = vec![2u8; 100];
        let head = write_chain(&mut shared, &spill).unwrap();
        let mut out = vec![0u8; 600];
        let err = read_chain(&mut shared, head, 0, &mut out, None).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Corrupt);
    }

    #[test]
    fn test_chain_write_at() {
        let mut shared = memory_shared(512);
        let spill = vec![0u8; 1200];
        let head = write_chain(&mut shared, &spill).unwrap();
        write_chain_at(&mut shared, head, 600, b"patched", None).unwrap();
        let mut out = vec![0u8; 1200];
        read_chain(&mut shared, head, 0, &mut out, None).unwrap();
        assert_eq!(&out[600..607], b"patched");
        assert!(out[..600].iter().all(|&b| b == 0));
    }
}
