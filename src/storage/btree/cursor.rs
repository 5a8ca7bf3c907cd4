//! Tree cursors: a stateful pointer into one B-tree.
//!
//! A cursor tracks the root-to-leaf path as decoded pages plus the cell
//! index within each. Movement routines mirror in-order traversal: table
//! trees carry entries only on leaves, so interior separators are skipped;
//! index trees carry real entries on interior pages and stop on them.
//!
//! State transitions (see `types::CursorState`): a mutation on the
//! same tree saves every other cursor's position (`RequireSeek`);
//! `restore_position` re-seeks the saved key and arms `skip_next` so the
//! next `next()`/`previous()` does not skip or repeat an entry.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::{parse_cell, CellInfo};
use super::page::MemPage;
use super::payload;
use super::types::{CursorState, BTCURSOR_MAX_DEPTH};
use super::{btree_get_page, BtShared, KeyInfo};

#[derive(Clone, Debug)]
pub(crate) enum SavedKey {
    Int(i64),
    Blob(Vec<u8>),
}

/// The mutable core of a cursor. Lives in a slot owned by `BtShared` so
/// mutations on the tree can reach every open cursor; the public
/// `BtCursor` is a handle onto the slot.
pub(crate) struct CursorCore {
    pub root_page: Pgno,
    pub state: CursorState,
    /// Error stored when `state == Fault`.
    pub fault: ErrorCode,
    pub writable: bool,
    pub incrblob: bool,
    /// `previous()` is a no-op if negative, `next()` if positive.
    pub skip_next: i32,
    pub key_info: Option<Arc<KeyInfo>>,
    pub saved_key: Option<SavedKey>,
    /// Index of the current page within `pages`; -1 when unpositioned.
    pub i_page: i8,
    pub pages: Vec<MemPage>,
    pub aidx: SmallVec<[u16; BTCURSOR_MAX_DEPTH]>,
    /// Lazily parsed cell under the cursor; any mutation invalidates it.
    pub info: Option<CellInfo>,
    pub n_key: i64,
    pub valid_nkey: bool,
    /// Overflow-page-number cache for incremental-blob access.
    pub overflow_cache: Vec<Pgno>,
}

impl CursorCore {
    pub(crate) fn new(
        root_page: Pgno,
        writable: bool,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Self {
        Self {
            root_page,
            state: CursorState::Invalid,
            fault: ErrorCode::Ok,
            writable,
            incrblob: false,
            skip_next: 0,
            key_info,
            saved_key: None,
            i_page: -1,
            pages: Vec::new(),
            aidx: SmallVec::new(),
            info: None,
            n_key: 0,
            valid_nkey: false,
            overflow_cache: Vec::new(),
        }
    }

    pub(crate) fn page(&self) -> &MemPage {
        &self.pages[self.i_page as usize]
    }

    pub(crate) fn page_mut(&mut self) -> &mut MemPage {
        let i = self.i_page as usize;
        &mut self.pages[i]
    }

    pub(crate) fn ix(&self) -> u16 {
        self.aidx[self.i_page as usize]
    }

    pub(crate) fn set_ix(&mut self, ix: u16) {
        let i = self.i_page as usize;
        self.aidx[i] = ix;
        self.info = None;
    }

    pub(crate) fn clear_position(&mut self) {
        self.pages.clear();
        self.aidx.clear();
        self.i_page = -1;
        self.info = None;
        self.valid_nkey = false;
        self.overflow_cache.clear();
    }
}

/// Parse (and cache) the cell under the cursor.
pub(crate) fn cursor_cell_info(core: &mut CursorCore) -> Result<CellInfo> {
    if let Some(info) = &core.info {
        return Ok(info.clone());
    }
    let info = parse_cell(core.page(), core.ix())?;
    let intkey = core.page().is_intkey;
    core.n_key = info.n_key;
    core.valid_nkey = intkey;
    core.info = Some(info.clone());
    Ok(info)
}

pub(crate) fn move_to_root(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    core.clear_position();
    core.saved_key = None;
    core.skip_next = 0;
    let root = btree_get_page(shared, core.root_page)?;
    let empty = root.n_cell == 0 && root.is_leaf;
    core.pages.push(root);
    core.aidx.push(0);
    core.i_page = 0;
    core.state = if empty {
        CursorState::Invalid
    } else {
        CursorState::Valid
    };
    Ok(())
}

pub(crate) fn move_to_child(
    shared: &mut BtShared,
    core: &mut CursorCore,
    pgno: Pgno,
) -> Result<()> {
    debug_assert_eq!(core.state, CursorState::Valid);
    if core.i_page as usize >= BTCURSOR_MAX_DEPTH - 1 {
        return Err(Error::with_message(ErrorCode::Corrupt, "tree too deep"));
    }
    let child = btree_get_page(shared, pgno)?;
    // Leaf and interior levels never interleave, and key kinds match
    // through a root-to-leaf path.
    if child.n_cell < 1 || child.is_intkey != core.page().is_intkey {
        return Err(Error::with_message(ErrorCode::Corrupt, "child page mismatch"));
    }
    core.pages.push(child);
    core.aidx.push(0);
    core.i_page += 1;
    core.info = None;
    core.valid_nkey = false;
    Ok(())
}

pub(crate) fn move_to_parent(core: &mut CursorCore) {
    debug_assert!(core.i_page > 0);
    core.pages.pop();
    core.aidx.pop();
    core.i_page -= 1;
    core.info = None;
    core.valid_nkey = false;
}

/// Descend to the left-most leaf beneath the current position.
pub(crate) fn move_to_leftmost(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    loop {
        if core.page().is_leaf {
            core.set_ix(0);
            return Ok(());
        }
        let child = core.page().child_pgno(core.ix())?;
        move_to_child(shared, core, child)?;
    }
}

/// Descend to the right-most leaf beneath the current position, leaving
/// interior indices past their last cell.
pub(crate) fn move_to_rightmost(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    loop {
        let page = core.page();
        if page.is_leaf {
            let last = page.n_cell - 1;
            core.set_ix(last);
            return Ok(());
        }
        let n_cell = page.n_cell;
        core.set_ix(n_cell);
        let child = core.page().child_pgno(n_cell)?;
        move_to_child(shared, core, child)?;
    }
}

/// Position on the first entry. Returns true when the tree is empty.
pub(crate) fn first(shared: &mut BtShared, core: &mut CursorCore) -> Result<bool> {
    move_to_root(shared, core)?;
    if core.state == CursorState::Invalid {
        return Ok(true);
    }
    move_to_leftmost(shared, core)?;
    Ok(false)
}

/// Position on the last entry. Returns true when the tree is empty.
pub(crate) fn last(shared: &mut BtShared, core: &mut CursorCore) -> Result<bool> {
    move_to_root(shared, core)?;
    if core.state == CursorState::Invalid {
        return Ok(true);
    }
    move_to_rightmost(shared, core)?;
    Ok(false)
}

/// Advance to the in-order successor. Returns true when the cursor ran
/// off the end and became Invalid.
pub(crate) fn next(shared: &mut BtShared, core: &mut CursorCore) -> Result<bool> {
    match core.state {
        CursorState::Fault => return Err(Error::new(core.fault)),
        CursorState::Invalid => return Ok(true),
        CursorState::RequireSeek => {
            restore_position(shared, core)?;
            if core.state == CursorState::Invalid {
                return Ok(true);
            }
        }
        CursorState::Valid => {}
    }
    if core.skip_next > 0 {
        core.skip_next = 0;
        return Ok(false);
    }
    core.skip_next = 0;
    core.info = None;
    core.valid_nkey = false;

    let ix = core.ix() + 1;
    core.set_ix(ix);
    if ix >= core.page().n_cell {
        if !core.page().is_leaf {
            let rightmost = core.page().child_pgno(core.page().n_cell)?;
            move_to_child(shared, core, rightmost)?;
            move_to_leftmost(shared, core)?;
            return Ok(false);
        }
        loop {
            if core.i_page == 0 {
                core.state = CursorState::Invalid;
                return Ok(true);
            }
            move_to_parent(core);
            if core.ix() < core.page().n_cell {
                break;
            }
        }
        if core.page().is_intkey {
            // Table-tree separators are not entries.
            return next(shared, core);
        }
        return Ok(false);
    }
    if core.page().is_leaf {
        return Ok(false);
    }
    move_to_leftmost(shared, core)?;
    Ok(false)
}

/// Step to the in-order predecessor. Returns true when the cursor ran off
/// the front and became Invalid.
pub(crate) fn previous(shared: &mut BtShared, core: &mut CursorCore) -> Result<bool> {
    match core.state {
        CursorState::Fault => return Err(Error::new(core.fault)),
        CursorState::Invalid => return Ok(true),
        CursorState::RequireSeek => {
            restore_position(shared, core)?;
            if core.state == CursorState::Invalid {
                return Ok(true);
            }
        }
        CursorState::Valid => {}
    }
    if core.skip_next < 0 {
        core.skip_next = 0;
        return Ok(false);
    }
    core.skip_next = 0;
    core.info = None;
    core.valid_nkey = false;

    if !core.page().is_leaf {
        let child = core.page().child_pgno(core.ix())?;
        move_to_child(shared, core, child)?;
        move_to_rightmost(shared, core)?;
        return Ok(false);
    }
    while core.ix() == 0 {
        if core.i_page == 0 {
            core.state = CursorState::Invalid;
            return Ok(true);
        }
        move_to_parent(core);
    }
    let ix = core.ix() - 1;
    core.set_ix(ix);
    if core.page().is_intkey && !core.page().is_leaf {
        return previous(shared, core);
    }
    Ok(false)
}

/// Seek an integer key: descends choosing the first separator not smaller
/// than the target; at the leaf, lands on the first key >= target, or the
/// last key when every key is smaller. Returns the comparison of the
/// final visited key against the target (-1, 0, +1), or -1 on an empty
/// tree (cursor Invalid).
pub(crate) fn table_moveto(
    shared: &mut BtShared,
    core: &mut CursorCore,
    int_key: i64,
) -> Result<i32> {
    // Fast path: already on the requested key.
    if core.state == CursorState::Valid && core.valid_nkey && core.n_key == int_key {
        return Ok(0);
    }
    move_to_root(shared, core)?;
    if core.state == CursorState::Invalid {
        return Ok(-1);
    }
    loop {
        let page = core.page();
        let mut lwr: u16 = 0;
        let mut upr: u16 = page.n_cell;
        while lwr < upr {
            let mid = (lwr + upr) / 2;
            let key = parse_cell(page, mid)?.n_key;
            if key < int_key {
                lwr = mid + 1;
            } else {
                upr = mid;
            }
        }
        if core.page().is_leaf {
            let page = core.page();
            if lwr < page.n_cell {
                core.set_ix(lwr);
                let info = cursor_cell_info(core)?;
                return Ok(if info.n_key == int_key { 0 } else { 1 });
            }
            let last = page.n_cell - 1;
            core.set_ix(last);
            cursor_cell_info(core)?;
            return Ok(-1);
        }
        core.set_ix(lwr);
        let child = core.page().child_pgno(lwr)?;
        move_to_child(shared, core, child)?;
    }
}

/// Seek a byte-string key in an index tree. Interior cells are real
/// entries: an exact match on an interior page stops there. Conventions
/// otherwise match `table_moveto`.
pub(crate) fn index_moveto(
    shared: &mut BtShared,
    core: &mut CursorCore,
    key: &[u8],
) -> Result<i32> {
    let key_info = core.key_info.clone();
    let compare = |cell_key: &[u8]| -> std::cmp::Ordering {
        match &key_info {
            Some(ki) => ki.compare_records(cell_key, key),
            None => cell_key.cmp(key),
        }
    };

    move_to_root(shared, core)?;
    if core.state == CursorState::Invalid {
        return Ok(-1);
    }
    loop {
        let mut lwr: u16 = 0;
        let mut upr: u16 = core.page().n_cell;
        let mut exact: Option<u16> = None;
        while lwr < upr {
            let mid = (lwr + upr) / 2;
            let info = parse_cell(core.page(), mid)?;
            let cell_key = if info.has_overflow() {
                let page = core.page().clone();
                payload::cell_payload(shared, &page, &info)?
            } else {
                let start = info.payload_offset();
                core.page().data[start..start + info.n_local as usize].to_vec()
            };
            match compare(&cell_key) {
                std::cmp::Ordering::Less => lwr = mid + 1,
                std::cmp::Ordering::Greater => upr = mid,
                std::cmp::Ordering::Equal => {
                    exact = Some(mid);
                    break;
                }
            }
        }
        if let Some(mid) = exact {
            core.set_ix(mid);
            cursor_cell_info(core)?;
            return Ok(0);
        }
        if core.page().is_leaf {
            let page = core.page();
            if lwr < page.n_cell {
                core.set_ix(lwr);
                cursor_cell_info(core)?;
                return Ok(1);
            }
            let last = page.n_cell - 1;
            core.set_ix(last);
            cursor_cell_info(core)?;
            return Ok(-1);
        }
        core.set_ix(lwr);
        let child = core.page().child_pgno(lwr)?;
        move_to_child(shared, core, child)?;
    }
}

/// Record the cursor's key and release its page path; the cursor goes to
/// `RequireSeek` until `restore_position` runs.
pub(crate) fn save_position(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    debug_assert_eq!(core.state, CursorState::Valid);
    let info = cursor_cell_info(core)?;
    if core.page().is_intkey {
        core.saved_key = Some(SavedKey::Int(info.n_key));
    } else {
        let page = core.page().clone();
        let key = payload::cell_payload(shared, &page, &info)?;
        core.saved_key = Some(SavedKey::Blob(key));
    }
    core.clear_position();
    core.state = CursorState::RequireSeek;
    Ok(())
}

/// Seek back to a saved position. Returns true when the cursor stands on
/// the saved key; false when that key is gone (the cursor then points at
/// the nearest neighbor, with `skip_next` armed so iteration neither
/// repeats nor skips an entry) or the tree emptied.
pub(crate) fn restore_position(
    shared: &mut BtShared,
    core: &mut CursorCore,
) -> Result<bool> {
    match core.state {
        CursorState::Fault => return Err(Error::new(core.fault)),
        CursorState::RequireSeek => {}
        _ => return Ok(core.state == CursorState::Valid),
    }
    let pending_skip = core.skip_next;
    let Some(saved) = core.saved_key.take() else {
        core.state = CursorState::Invalid;
        return Ok(false);
    };
    core.state = CursorState::Invalid;
    let res = match &saved {
        SavedKey::Int(key) => table_moveto(shared, core, *key)?,
        SavedKey::Blob(key) => index_moveto(shared, core, key)?,
    };
    // An exact landing keeps any deferred skip; otherwise the seek result
    // itself tells the next movement what to do.
    core.skip_next = if res == 0 { pending_skip } else { res };
    Ok(core.state == CursorState::Valid && res == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::cell::{assemble_cell, BtreePayload};
    use crate::storage::btree::tests_support::memory_shared;
    use crate::storage::btree::types::PTF_TABLE_LEAF;
    use crate::storage::btree::write_mem_page;

    /// Build a single-leaf table tree holding the given keys.
    fn leaf_root(shared: &mut BtShared, keys: &[i64]) -> Pgno {
        let pgno = crate::storage::btree::allocate_btree_page(shared).unwrap();
        let mut page = MemPage::zeroed(
            pgno,
            shared.page_size,
            shared.usable_size,
            PTF_TABLE_LEAF,
            shared.limits,
        )
        .unwrap();
        for (i, &key) in keys.iter().enumerate() {
            let cell = assemble_cell(&page, &BtreePayload::table(key, vec![b'x'; 4]))
                .unwrap()
                .cell;
            page.insert_cell(i as u16, cell).unwrap();
        }
        write_mem_page(shared, &page).unwrap();
        pgno
    }

    #[test]
    fn test_empty_tree_first_last() {
        let mut shared = memory_shared(512);
        let root = leaf_root(&mut shared, &[]);
        let mut core = CursorCore::new(root, false, None);
        assert!(first(&mut shared, &mut core).unwrap());
        assert_eq!(core.state, CursorState::Invalid);
        assert!(last(&mut shared, &mut core).unwrap());
        assert!(next(&mut shared, &mut core).unwrap());
        assert!(previous(&mut shared, &mut core).unwrap());
    }

    #[test]
    fn test_scan_forward_and_back() {
        let mut shared = memory_shared(512);
        let root = leaf_root(&mut shared, &[1, 3, 5, 7]);
        let mut core = CursorCore::new(root, false, None);
        assert!(!first(&mut shared, &mut core).unwrap());
        let mut seen = vec![cursor_cell_info(&mut core).unwrap().n_key];
        while !next(&mut shared, &mut core).unwrap() {
            seen.push(cursor_cell_info(&mut core).unwrap().n_key);
        }
        assert_eq!(seen, vec![1, 3, 5, 7]);

        assert!(!last(&mut shared, &mut core).unwrap());
        let mut back = vec![cursor_cell_info(&mut core).unwrap().n_key];
        while !previous(&mut shared, &mut core).unwrap() {
            back.push(cursor_cell_info(&mut core).unwrap().n_key);
        }
        assert_eq!(back, vec![7, 5, 3, 1]);
    }

    #[test]
    fn test_table_moveto_results() {
        let mut shared = memory_shared(512);
        let root = leaf_root(&mut shared, &[10, 20, 30]);
        let mut core = CursorCore::new(root, false, None);
        assert_eq!(table_moveto(&mut shared, &mut core, 20).unwrap(), 0);
        assert_eq!(core.n_key, 20);
        // Absent key between entries: lands on the successor.
        assert_eq!(table_moveto(&mut shared, &mut core, 25).unwrap(), 1);
        assert_eq!(core.n_key, 30);
        // Past the end: lands on the last entry.
        assert_eq!(table_moveto(&mut shared, &mut core, 99).unwrap(), -1);
        assert_eq!(core.n_key, 30);
    }

    #[test]
    fn test_save_restore_same_key() {
        let mut shared = memory_shared(512);
        let root = leaf_root(&mut shared, &[10, 20, 30]);
        let mut core = CursorCore::new(root, false, None);
        table_moveto(&mut shared, &mut core, 20).unwrap();
        save_position(&mut shared, &mut core).unwrap();
        assert_eq!(core.state, CursorState::RequireSeek);
        assert!(restore_position(&mut shared, &mut core).unwrap());
        assert_eq!(core.n_key, 20);
        assert_eq!(core.skip_next, 0);
    }

    #[test]
    fn test_restore_after_key_vanished_points_at_successor() {
        let mut shared = memory_shared(512);
        let root = leaf_root(&mut shared, &[10, 30]);
        let mut core = CursorCore::new(root, false, None);
        table_moveto(&mut shared, &mut core, 10).unwrap();
        // Fake a saved position for a key that does not exist.
        core.saved_key = Some(SavedKey::Int(20));
        core.clear_position();
        core.state = CursorState::RequireSeek;
        assert!(!restore_position(&mut shared, &mut core).unwrap());
        assert_eq!(core.n_key, 30);
        assert_eq!(core.skip_next, 1);
        // The armed skip makes the following next() a no-op.
        assert!(!next(&mut shared, &mut core).unwrap());
        assert_eq!(cursor_cell_info(&mut core).unwrap().n_key, 30);
    }

    #[test]
    fn test_fault_state_returns_stored_code() {
        let mut shared = memory_shared(512);
        let root = leaf_root(&mut shared, &[1]);
        let mut core = CursorCore::new(root, false, None);
        first(&mut shared, &mut core).unwrap();
        core.state = CursorState::Fault;
        core.fault = ErrorCode::NoMem;
        assert_eq!(
            next(&mut shared, &mut core).unwrap_err().code(),
            ErrorCode::NoMem
        );
    }
}
