//! Tree balancing.
//!
//! A loop walks from the cursor's page toward the root until no page on
//! the path is overfull (staged cells) or underfull (less than a third of
//! the usable space in use). Each iteration picks one of three
//! strategies:
//!
//! * `deeper` — the root itself is overfull: push its content into a new
//!   child and balance that child next.
//! * `quick` — a table leaf overflowed by exactly one cell appended at
//!   its tail and it is the right-most child of a non-root parent: give
//!   the cell a fresh right sibling. The common append workload path.
//! * `non-root` — redistribute the page and up to two siblings (plus the
//!   parent's divider cells) evenly over one page more or fewer.
//!
//! Divider cells pushed into a parent that cannot hold them are staged on
//! the parent and consumed by the next loop iteration; the staging byte
//! vectors are the ownership-explicit form of the carry-over scratch
//! buffer, released on every path when the iteration that consumes them
//! ends.

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::parse_cell_at;
use super::cursor::CursorCore;
use super::encoding::{read_u32, read_varint_at, write_varint};
use super::page::MemPage;
use super::types::{
    MIN_CELL_SIZE, PAGE_HEADER_SIZE_INTERIOR, PAGE_HEADER_SIZE_LEAF, PTF_INDEX_INTERIOR,
    PTF_TABLE_INTERIOR,
};
use super::{allocate_btree_page, btree_get_page, free_btree_page, write_mem_page, BtShared};

/// Balance the tree along the cursor's path, walking upward until every
/// page on it satisfies the fill invariants. The cursor is left at the
/// highest level visited; callers re-seek afterwards.
pub(crate) fn balance(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    let n_min = shared.usable_size as i32 * 2 / 3;
    let mut deeper_calls = 0u8;
    let mut quick_calls = 0u8;

    loop {
        let i_page = core.i_page as usize;
        let overfull = core.pages[i_page].is_overfull();

        if i_page == 0 {
            if !overfull {
                break;
            }
            debug_assert_eq!(deeper_calls, 0);
            deeper_calls += 1;
            debug!(root = core.pages[0].pgno, "balance: deeper");
            balance_deeper(shared, core)?;
            continue;
        }

        if !overfull && core.pages[i_page].n_free <= n_min {
            break;
        }

        let parent_is_root = i_page - 1 == 0;
        let idx = core.aidx[i_page - 1];
        let (left, right) = core.pages.split_at_mut(i_page);
        let parent = &mut left[i_page - 1];
        let page = &mut right[0];

        let use_quick = page.has_data
            && page.n_overflow() == 1
            && page.a_ovfl[0].idx == page.n_cell
            && !parent_is_root
            && idx == parent.n_cell;

        if use_quick {
            debug_assert_eq!(quick_calls, 0);
            quick_calls += 1;
            debug!(pgno = page.pgno, "balance: quick");
            balance_quick(shared, parent, page)?;
        } else {
            debug!(pgno = page.pgno, "balance: non-root");
            balance_nonroot(shared, parent, parent_is_root, idx, page)?;
        }

        // The next iteration balances the parent, whose updated image
        // (possibly with staged dividers) is already on the path.
        core.pages.truncate(i_page);
        core.aidx.truncate(i_page);
        core.i_page -= 1;
        core.info = None;
        core.valid_nkey = false;
    }
    Ok(())
}

fn real_cells(page: &MemPage) -> Result<Vec<Vec<u8>>> {
    let mut cells = Vec::with_capacity(page.n_cell as usize);
    for i in 0..page.n_cell {
        let ptr = page.cell_ptr(i)?;
        let info = parse_cell_at(page, ptr)?;
        cells.push(page.data[ptr as usize..ptr as usize + info.n_size as usize].to_vec());
    }
    Ok(cells)
}

/// Root-only strategy: allocate a child, move the root's content (staged
/// cells included) into it, and leave the root as an empty interior page
/// whose right-most pointer is the child.
fn balance_deeper(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    let child_pgno = allocate_btree_page(shared)?;
    let root = &mut core.pages[0];

    let mut child = MemPage::zeroed(
        child_pgno,
        shared.page_size,
        shared.usable_size,
        root.flags_byte(),
        shared.limits,
    )?;
    let cells = real_cells(root)?;
    child.rebuild(&cells)?;
    if !root.is_leaf {
        child.rightmost_ptr = root.rightmost_ptr;
        child.write_header()?;
    }
    child.a_ovfl = std::mem::take(&mut root.a_ovfl);

    let interior_flags = if root.is_intkey {
        PTF_TABLE_INTERIOR
    } else {
        PTF_INDEX_INTERIOR
    };
    let mut new_root = MemPage::zeroed(
        root.pgno,
        shared.page_size,
        shared.usable_size,
        interior_flags,
        shared.limits,
    )?;
    if root.pgno == 1 {
        // Preserve the file header living in front of the page header.
        new_root.data[..super::types::FILE_HEADER_SIZE]
            .copy_from_slice(&root.data[..super::types::FILE_HEADER_SIZE]);
    }
    new_root.rightmost_ptr = Some(child_pgno);
    new_root.write_header()?;
    *root = new_root;

    let root_snapshot = core.pages[0].clone();
    write_mem_page(shared, &root_snapshot)?;
    write_mem_page(shared, &child)?;

    core.pages.push(child);
    core.aidx[0] = 0;
    core.aidx.push(0);
    core.i_page = 1;
    core.info = None;
    core.valid_nkey = false;
    Ok(())
}

/// Append-path strategy: the single staged cell goes onto a brand-new
/// right sibling; a divider carrying the page's largest key goes into the
/// parent, and the new page becomes the parent's right-most child.
fn balance_quick(shared: &mut BtShared, parent: &mut MemPage, page: &mut MemPage) -> Result<()> {
    debug_assert!(page.has_data && page.n_overflow() == 1);

    let new_pgno = allocate_btree_page(shared)?;
    let mut new_page = MemPage::zeroed(
        new_pgno,
        shared.page_size,
        shared.usable_size,
        page.flags_byte(),
        shared.limits,
    )?;
    let staged = page.a_ovfl.pop().unwrap();
    new_page.rebuild(&[staged.cell])?;

    // Divider key: the largest key still on the filled page.
    let last_ptr = page.cell_ptr(page.n_cell - 1)?;
    let last = parse_cell_at(page, last_ptr)?;
    let mut divider = Vec::with_capacity(13);
    divider.extend_from_slice(&page.pgno.to_be_bytes());
    write_varint(last.n_key as u64, &mut divider);

    let at = parent.n_cell;
    parent.insert_cell(at, divider)?;
    parent.rightmost_ptr = Some(new_pgno);
    parent.write_header()?;

    write_mem_page(shared, page)?;
    write_mem_page(shared, &new_page)?;
    write_mem_page(shared, parent)?;
    Ok(())
}

fn cell_cost(cell: &[u8]) -> usize {
    cell.len().max(MIN_CELL_SIZE) + 2
}

/// Integer key of a raw table-leaf cell.
fn table_leaf_key(cell: &[u8]) -> i64 {
    let (_, n1) = read_varint_at(cell, 0);
    read_varint_at(cell, n1).0 as i64
}

/// General strategy: redistribute the page plus up to two siblings (and
/// the dividers between them) evenly across a possibly different number
/// of pages, then rewrite the dividers in the parent. The parent may in
/// turn become overfull or underfull; the balance loop handles it next.
fn balance_nonroot(
    shared: &mut BtShared,
    parent: &mut MemPage,
    parent_is_root: bool,
    idx: u16,
    page: &mut MemPage,
) -> Result<()> {
    // A parent serving as parent carries at most the one staged divider
    // a delete or quick-balance pushed into it.
    debug_assert!(parent.n_overflow() <= 1);
    let staged_divider: Option<(usize, Vec<u8>)> = parent
        .a_ovfl
        .first()
        .map(|c| (c.idx as usize, c.cell.clone()));
    let n_staged = staged_divider.is_some() as usize;
    let n_children = parent.n_cell as usize + n_staged + 1;

    // Divider at logical index `j` of the parent.
    let logical_divider = |parent: &MemPage, j: usize| -> Result<Vec<u8>> {
        if let Some((o, bytes)) = &staged_divider {
            if j == *o {
                return Ok(bytes.clone());
            }
            let array_idx = if j > *o { j - 1 } else { j };
            let ptr = parent.cell_ptr(array_idx as u16)?;
            let info = parse_cell_at(parent, ptr)?;
            return Ok(parent.data[ptr as usize..ptr as usize + info.n_size as usize].to_vec());
        }
        let ptr = parent.cell_ptr(j as u16)?;
        let info = parse_cell_at(parent, ptr)?;
        Ok(parent.data[ptr as usize..ptr as usize + info.n_size as usize].to_vec())
    };
    // Child page at logical child position `c`.
    let logical_child = |parent: &MemPage, c: usize| -> Result<Pgno> {
        if let Some((o, bytes)) = &staged_divider {
            if c == *o {
                return read_u32(bytes, 0).ok_or(Error::new(ErrorCode::Corrupt));
            }
            let pos = if c > *o { c - 1 } else { c };
            return parent.child_pgno(pos as u16);
        }
        parent.child_pgno(c as u16)
    };

    // Sibling window: the page plus up to two neighbors, preferring a
    // window around the page; a staged parent divider must fall inside
    // the window's divider range.
    let n_old = n_children.min(3);
    let first = if let Some((o, _)) = &staged_divider {
        o.saturating_sub(1).min(n_children - n_old)
    } else {
        let idx = idx as usize;
        if idx == 0 {
            0
        } else if idx >= n_children - 1 {
            n_children - n_old
        } else {
            idx - 1
        }
    };

    let mut old_pages: Vec<MemPage> = Vec::with_capacity(n_old);
    for k in 0..n_old {
        let pgno = logical_child(parent, first + k)?;
        if pgno == page.pgno {
            old_pages.push(page.clone());
        } else {
            old_pages.push(btree_get_page(shared, pgno)?);
        }
    }

    let leaf_level = old_pages[0].is_leaf;
    let leaf_data = leaf_level && old_pages[0].has_data;
    // Table leaves regenerate dividers from their largest key; every
    // other level pulls dividers out of the combined cell run.
    let divider_consumed = !leaf_data;

    // Flatten the window: sibling cells with the dividers between them.
    let mut combined: Vec<Vec<u8>> = Vec::new();
    for k in 0..n_old {
        combined.extend(old_pages[k].logical_cells()?);
        if k < n_old - 1 {
            let mut div = logical_divider(parent, first + k)?;
            if leaf_level {
                if !leaf_data {
                    // Index leaf: the divider is a real entry; strip the
                    // child pointer to get the leaf-format cell.
                    combined.push(div[4..].to_vec());
                }
            } else {
                // Interior: the divider joins the run carrying the left
                // sibling's right-most child.
                let rightmost = old_pages[k]
                    .rightmost_ptr
                    .ok_or(Error::new(ErrorCode::Corrupt))?;
                div[..4].copy_from_slice(&rightmost.to_be_bytes());
                combined.push(div);
            }
        }
    }
    let rightmost_total = if leaf_level {
        None
    } else {
        Some(
            old_pages[n_old - 1]
                .rightmost_ptr
                .ok_or(Error::new(ErrorCode::Corrupt))?,
        )
    };

    // Remove the old dividers from the parent, highest index first.
    let staged_o = staged_divider.as_ref().map(|(o, _)| *o);
    parent.a_ovfl.clear();
    for j in (first..first + n_old - 1).rev() {
        if Some(j) == staged_o {
            continue;
        }
        let array_idx = match staged_o {
            Some(o) if j > o => j - 1,
            _ => j,
        };
        let ptr = parent.cell_ptr(array_idx as u16)?;
        let size = parse_cell_at(parent, ptr)?.n_size;
        parent.drop_cell(array_idx as u16, size)?;
    }

    // Partition the run into groups, greedily then evened right-to-left
    // so the tail pages do not end up nearly empty.
    let hdr_size = if leaf_level {
        PAGE_HEADER_SIZE_LEAF
    } else {
        PAGE_HEADER_SIZE_INTERIOR
    };
    let capacity = shared.usable_size as usize - hdr_size;

    // bnd[k]: for consumed dividers, the index of the divider cell after
    // group k; otherwise the index where group k+1 starts.
    let mut bnd: Vec<usize> = Vec::new();
    {
        let mut sz = 0usize;
        let mut start = 0usize;
        let mut i = 0usize;
        while i < combined.len() {
            let c = cell_cost(&combined[i]);
            if sz + c > capacity && i > start {
                if divider_consumed && i + 1 == combined.len() {
                    // The divider must leave a non-empty last group;
                    // carve it one cell earlier.
                    if i - 1 <= start {
                        return Err(Error::new(ErrorCode::Corrupt));
                    }
                    bnd.push(i - 1);
                } else {
                    bnd.push(i);
                }
                start = bnd[bnd.len() - 1] + if divider_consumed { 1 } else { 0 };
                i = start;
                sz = 0;
                continue;
            }
            sz += c;
            i += 1;
        }
        if divider_consumed {
            if let Some(&last) = bnd.last() {
                if last + 1 >= combined.len() {
                    return Err(Error::new(ErrorCode::Corrupt));
                }
            }
        }
    }
    let m = bnd.len() + 1;

    let group_range = |k: usize, bnd: &[usize]| -> (usize, usize) {
        let start = if k == 0 {
            0
        } else if divider_consumed {
            bnd[k - 1] + 1
        } else {
            bnd[k - 1]
        };
        let end = if k == m - 1 { combined.len() } else { bnd[k] };
        (start, end)
    };
    let group_size = |k: usize, bnd: &[usize]| -> usize {
        let (s, e) = group_range(k, bnd);
        combined[s..e].iter().map(|c| cell_cost(c)).sum()
    };

    if m > 1 {
        for k in (1..m).rev() {
            let mut sz_right = group_size(k, &bnd);
            let mut sz_left = group_size(k - 1, &bnd);
            loop {
                let b = bnd[k - 1];
                let (left_start, _) = group_range(k - 1, &bnd);
                if b == 0 || b - 1 < left_start + 1 {
                    break;
                }
                let outgoing = cell_cost(&combined[b - 1]);
                let incoming = if divider_consumed {
                    cell_cost(&combined[b])
                } else {
                    outgoing
                };
                if sz_right != 0 && sz_right + incoming > sz_left - outgoing {
                    break;
                }
                bnd[k - 1] -= 1;
                sz_right += incoming;
                sz_left -= outgoing;
            }
        }
    }

    // Assign page numbers: reuse the old siblings, allocate extras, free
    // leftovers.
    let old_pgnos: Vec<Pgno> = old_pages.iter().map(|p| p.pgno).collect();
    let mut new_pgnos: Vec<Pgno> = Vec::with_capacity(m);
    for k in 0..m {
        if k < n_old {
            new_pgnos.push(old_pgnos[k]);
        } else {
            new_pgnos.push(allocate_btree_page(shared)?);
        }
    }
    for k in m..n_old {
        free_btree_page(shared, old_pgnos[k])?;
    }
    debug!(
        old = n_old,
        new = m,
        cells = combined.len(),
        "balance: redistribute"
    );

    // Build the new sibling pages.
    let flags = old_pages[0].flags_byte();
    for k in 0..m {
        let (start, end) = group_range(k, &bnd);
        // A lone empty page is legal: it arises when the last entry of a
        // root's only child is deleted, and root collapse absorbs it.
        if start >= end && m > 1 {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let mut np = MemPage::zeroed(
            new_pgnos[k],
            shared.page_size,
            shared.usable_size,
            flags,
            shared.limits,
        )?;
        np.rebuild(&combined[start..end])?;
        if !leaf_level {
            let rightmost = if k < m - 1 {
                // The outgoing divider's child becomes this page's
                // right-most subtree.
                read_u32(&combined[bnd[k]], 0).ok_or(Error::new(ErrorCode::Corrupt))?
            } else {
                rightmost_total.unwrap()
            };
            np.rightmost_ptr = Some(rightmost);
            np.write_header()?;
        }
        write_mem_page(shared, &np)?;
    }

    // Re-link the parent. The child pointer just right of the window
    // still names the old last sibling; point it at the new one before
    // the fresh dividers go in.
    if first + n_old == n_children {
        parent.rightmost_ptr = Some(new_pgnos[m - 1]);
        parent.write_header()?;
    } else {
        parent.set_child_pgno(first as u16, new_pgnos[m - 1])?;
    }
    for k in 0..m - 1 {
        let divider = if leaf_data {
            let (_, end) = group_range(k, &bnd);
            let mut div = Vec::with_capacity(13);
            div.extend_from_slice(&new_pgnos[k].to_be_bytes());
            write_varint(table_leaf_key(&combined[end - 1]) as u64, &mut div);
            div
        } else if leaf_level {
            let mut div = Vec::with_capacity(4 + combined[bnd[k]].len());
            div.extend_from_slice(&new_pgnos[k].to_be_bytes());
            div.extend_from_slice(&combined[bnd[k]]);
            div
        } else {
            let mut div = combined[bnd[k]].clone();
            div[..4].copy_from_slice(&new_pgnos[k].to_be_bytes());
            div
        };
        parent.insert_cell((first + k) as u16, divider)?;
    }
    write_mem_page(shared, parent)?;

    // An emptied root absorbs its single remaining child, shrinking the
    // tree by one level.
    if parent_is_root && parent.n_cell == 0 && parent.a_ovfl.is_empty() && m == 1 {
        let child = btree_get_page(shared, new_pgnos[0])?;
        let cells = child.logical_cells()?;
        let mut new_root = MemPage::zeroed(
            parent.pgno,
            shared.page_size,
            shared.usable_size,
            child.flags_byte(),
            shared.limits,
        )?;
        if parent.pgno == 1 {
            new_root.data[..super::types::FILE_HEADER_SIZE]
                .copy_from_slice(&parent.data[..super::types::FILE_HEADER_SIZE]);
        }
        if new_root.rebuild(&cells).is_ok() {
            if !child.is_leaf {
                new_root.rightmost_ptr = child.rightmost_ptr;
                new_root.write_header()?;
            }
            free_btree_page(shared, child.pgno)?;
            *parent = new_root;
            let snapshot = parent.clone();
            write_mem_page(shared, &snapshot)?;
            debug!(root = snapshot.pgno, "balance: root collapsed");
        }
    }

    Ok(())
}
