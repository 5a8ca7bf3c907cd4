//! B-tree engine: disk-backed, variable-length-key, paginated B+-trees
//! with cursored traversal, insertion, deletion and rebalancing.
//!
//! Table trees key entries by a 64-bit integer and keep all entries on
//! leaves; index trees key entries by byte strings (serialized records
//! compared through [`KeyInfo`]) and carry entries on interior pages as
//! well. Payload that does not fit a page spills into an overflow chain.
//!
//! Concurrency model: all state shared between cursors of one database
//! lives in [`BtShared`] behind a `parking_lot::RwLock`; every cursor
//! operation acquires it for its duration. Cursors themselves are slot
//! handles — their mutable cores are owned by `BtShared`, which is what
//! lets a mutation save the position of every other cursor on the tree.

mod balance;
pub mod cell;
pub mod cursor;
pub mod encoding;
pub mod overflow;
pub mod page;
pub mod payload;
pub mod types;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::Vfs;
use crate::storage::pager::{Pager, PagerOpenFlags};
use crate::types::{Pgno, RowId};

pub use cell::{BtreePayload, CellInfo};
pub use types::{
    BtLock, BtreeOpenFlags, BtsFlags, CursorFlags, CursorState, DbHeader, PayloadLimits,
    TransState, BTREE_BLOBKEY, BTREE_INTKEY, KEYINFO_ORDER_DESC, KEYINFO_ORDER_NULLS_FIRST,
    PTF_INDEX_INTERIOR, PTF_INDEX_LEAF, PTF_TABLE_INTERIOR, PTF_TABLE_LEAF,
};

use cursor::CursorCore;
use encoding::{read_u32, read_varint_at, write_u32};
use page::MemPage;
use types::{TableLockEntry, FILE_HEADER_SIZE, HDR_FREE_PAGE_COUNT};

// ============================================================================
// Collation and record comparison
// ============================================================================

/// Collation sequence for text comparison.
#[derive(Clone)]
pub enum CollSeq {
    /// Byte-wise comparison (default).
    Binary,
    /// ASCII case-insensitive.
    NoCase,
    /// Ignore trailing spaces.
    RTrim,
    Custom {
        name: String,
        cmp: Arc<dyn Fn(&str, &str) -> std::cmp::Ordering + Send + Sync>,
    },
}

impl CollSeq {
    pub fn compare(&self, a: &str, b: &str) -> std::cmp::Ordering {
        match self {
            CollSeq::Binary => a.cmp(b),
            CollSeq::NoCase => a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()),
            CollSeq::RTrim => a.trim_end().cmp(b.trim_end()),
            CollSeq::Custom { cmp, .. } => cmp(a, b),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CollSeq::Binary => "BINARY",
            CollSeq::NoCase => "NOCASE",
            CollSeq::RTrim => "RTRIM",
            CollSeq::Custom { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for CollSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollSeq({})", self.name())
    }
}

impl Default for CollSeq {
    fn default() -> Self {
        CollSeq::Binary
    }
}

/// One decoded field of a serialized record.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordField {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl RecordField {
    fn rank(&self) -> u8 {
        // Null < numeric < text < blob
        match self {
            RecordField::Null => 0,
            RecordField::Int(_) | RecordField::Float(_) => 1,
            RecordField::Text(_) => 2,
            RecordField::Blob(_) => 3,
        }
    }
}

/// Parse a serialized record (header of serial types, then field bytes)
/// into field values. Malformed records decode to as many fields as the
/// bytes support.
pub fn parse_record_fields(data: &[u8]) -> Vec<RecordField> {
    if data.is_empty() {
        return Vec::new();
    }
    let (hdr_size, n0) = read_varint_at(data, 0);
    let hdr_size = (hdr_size as usize).min(data.len());
    if hdr_size < n0 {
        return Vec::new();
    }
    let mut serial_types = Vec::new();
    let mut off = n0;
    while off < hdr_size {
        let (st, used) = read_varint_at(data, off);
        if used == 0 {
            break;
        }
        serial_types.push(st);
        off += used;
    }

    let mut fields = Vec::with_capacity(serial_types.len());
    let mut pos = hdr_size;
    for st in serial_types {
        let rest = if pos < data.len() { &data[pos..] } else { &[][..] };
        let (field, size) = deserialize_field(rest, st);
        fields.push(field);
        pos += size;
    }
    fields
}

fn deserialize_field(data: &[u8], serial_type: u64) -> (RecordField, usize) {
    fn int_be(data: &[u8], n: usize) -> Option<i64> {
        if data.len() < n {
            return None;
        }
        let mut v: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in &data[..n] {
            v = (v << 8) | b as i64;
        }
        Some(v)
    }
    match serial_type {
        0 => (RecordField::Null, 0),
        1 => (int_be(data, 1).map_or(RecordField::Null, RecordField::Int), 1),
        2 => (int_be(data, 2).map_or(RecordField::Null, RecordField::Int), 2),
        3 => (int_be(data, 3).map_or(RecordField::Null, RecordField::Int), 3),
        4 => (int_be(data, 4).map_or(RecordField::Null, RecordField::Int), 4),
        5 => (int_be(data, 6).map_or(RecordField::Null, RecordField::Int), 6),
        6 => (int_be(data, 8).map_or(RecordField::Null, RecordField::Int), 8),
        7 => {
            if data.len() < 8 {
                return (RecordField::Null, 8);
            }
            let bits = u64::from_be_bytes(data[..8].try_into().unwrap());
            (RecordField::Float(f64::from_bits(bits)), 8)
        }
        8 => (RecordField::Int(0), 0),
        9 => (RecordField::Int(1), 0),
        st if st >= 12 && st % 2 == 0 => {
            let len = ((st - 12) / 2) as usize;
            let len = len.min(data.len());
            (RecordField::Blob(data[..len].to_vec()), len)
        }
        st if st >= 13 => {
            let len = ((st - 13) / 2) as usize;
            let len = len.min(data.len());
            (
                RecordField::Text(String::from_utf8_lossy(&data[..len]).into_owned()),
                len,
            )
        }
        _ => (RecordField::Null, 0),
    }
}

fn compare_record_fields(a: &RecordField, b: &RecordField, coll: &CollSeq) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let rank = a.rank().cmp(&b.rank());
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (RecordField::Null, RecordField::Null) => Ordering::Equal,
        (RecordField::Int(x), RecordField::Int(y)) => x.cmp(y),
        (RecordField::Int(x), RecordField::Float(y)) => {
            (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (RecordField::Float(x), RecordField::Int(y)) => {
            x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal)
        }
        (RecordField::Float(x), RecordField::Float(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (RecordField::Text(x), RecordField::Text(y)) => coll.compare(x, y),
        (RecordField::Blob(x), RecordField::Blob(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Key comparison callback for index trees and the sorter: composite-key
/// arity plus per-field sort flags and collation sequences.
#[derive(Clone, Default)]
pub struct KeyInfo {
    /// Number of key columns.
    pub n_key_field: u16,
    /// `KEYINFO_ORDER_*` flags per column.
    pub sort_flags: Vec<u8>,
    pub collations: Vec<CollSeq>,
}

impl KeyInfo {
    pub fn new(n_key_field: u16) -> Self {
        Self {
            n_key_field,
            sort_flags: vec![0; n_key_field as usize],
            collations: vec![CollSeq::Binary; n_key_field as usize],
        }
    }

    pub fn with_collations(n_key_field: u16, collations: Vec<CollSeq>) -> Self {
        let mut colls = collations;
        colls.resize(n_key_field as usize, CollSeq::Binary);
        Self {
            n_key_field,
            sort_flags: vec![0; n_key_field as usize],
            collations: colls,
        }
    }

    /// Compare two serialized records over the first `n_key_field`
    /// columns; ties break on field count.
    pub fn compare_records(&self, rec_a: &[u8], rec_b: &[u8]) -> std::cmp::Ordering {
        let fields_a = parse_record_fields(rec_a);
        let fields_b = parse_record_fields(rec_b);
        let n = (self.n_key_field as usize)
            .min(fields_a.len())
            .min(fields_b.len());
        for i in 0..n {
            let desc = self
                .sort_flags
                .get(i)
                .is_some_and(|f| f & KEYINFO_ORDER_DESC != 0);
            let coll = self.collations.get(i).cloned().unwrap_or(CollSeq::Binary);
            let cmp = compare_record_fields(&fields_a[i], &fields_b[i], &coll);
            if cmp != std::cmp::Ordering::Equal {
                return if desc { cmp.reverse() } else { cmp };
            }
        }
        fields_a.len().cmp(&fields_b.len())
    }
}

/// True when any of the record's first `n_fields` columns is NULL.
pub fn record_has_null(data: &[u8], n_fields: usize) -> bool {
    parse_record_fields(data)
        .iter()
        .take(n_fields)
        .any(|f| matches!(f, RecordField::Null))
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared by every cursor of one database: the pager, the payload
/// limits, the free-page list, the cursor slots and the table locks.
pub struct BtShared {
    pub pager: Pager,
    pub page_size: u32,
    pub usable_size: u32,
    pub reserve: u8,
    pub limits: PayloadLimits,
    pub in_transaction: TransState,
    pub bts_flags: BtsFlags,
    pub schema_cookie: u32,
    /// Pages returned to the free list; the count is mirrored into the
    /// file header.
    pub free_pages: Vec<Pgno>,
    free_pages_snapshot: Option<Vec<Pgno>>,
    pub(crate) cursors: Vec<Option<CursorCore>>,
    pub(crate) table_locks: Vec<TableLockEntry>,
    pub interrupted: Arc<AtomicBool>,
}

impl BtShared {
    fn alloc_cursor(&mut self, core: CursorCore) -> usize {
        for (id, slot) in self.cursors.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(core);
                return id;
            }
        }
        self.cursors.push(Some(core));
        self.cursors.len() - 1
    }

    fn take_cursor(&mut self, id: usize) -> Result<CursorCore> {
        self.cursors
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(Error::with_message(ErrorCode::Misuse, "cursor slot gone"))
    }

    fn put_cursor(&mut self, id: usize, core: CursorCore) {
        self.cursors[id] = Some(core);
    }

    fn close_cursor(&mut self, id: usize) {
        if let Some(slot) = self.cursors.get_mut(id) {
            *slot = None;
        }
    }
}

fn check_interrupt(shared: &BtShared) -> Result<()> {
    if shared.interrupted.load(Ordering::Relaxed) {
        return Err(Error::new(ErrorCode::Interrupt));
    }
    Ok(())
}

/// Fetch and decode a page.
pub(crate) fn btree_get_page(shared: &mut BtShared, pgno: Pgno) -> Result<MemPage> {
    let page = shared.pager.get(pgno)?;
    MemPage::init_from_disk(pgno, page.data, shared.usable_size, shared.limits)
}

/// Push a decoded page's image through the pager (journal + publish).
pub(crate) fn write_mem_page(shared: &mut BtShared, page: &MemPage) -> Result<()> {
    let mut db_page = shared.pager.get(page.pgno)?;
    shared.pager.write(&mut db_page)?;
    db_page.data.copy_from_slice(&page.data);
    shared.pager.write_page_to_cache(&db_page);
    Ok(())
}

fn update_free_page_count(shared: &mut BtShared, delta: i32) -> Result<()> {
    let mut page = shared.pager.get(1)?;
    shared.pager.write(&mut page)?;
    let current = read_u32(&page.data, HDR_FREE_PAGE_COUNT).unwrap_or(0);
    let updated = if delta.is_negative() {
        current.saturating_sub(delta.unsigned_abs())
    } else {
        current.saturating_add(delta as u32)
    };
    write_u32(&mut page.data, HDR_FREE_PAGE_COUNT, updated)?;
    shared.pager.write_page_to_cache(&page);
    Ok(())
}

/// Allocate a page, preferring the free list.
pub(crate) fn allocate_btree_page(shared: &mut BtShared) -> Result<Pgno> {
    if let Some(pgno) = shared.free_pages.pop() {
        update_free_page_count(shared, -1)?;
        return Ok(pgno);
    }
    Ok(shared.pager.allocate_page())
}

/// Return a page to the free list.
pub(crate) fn free_btree_page(shared: &mut BtShared, pgno: Pgno) -> Result<()> {
    debug_assert_ne!(pgno, 1);
    shared.free_pages.push(pgno);
    update_free_page_count(shared, 1)
}

/// Save the position of every cursor on `root` except `except`; they go
/// to `RequireSeek` until restored.
pub(crate) fn save_all_cursors(
    shared: &mut BtShared,
    root: Pgno,
    except: Option<usize>,
) -> Result<()> {
    for id in 0..shared.cursors.len() {
        if Some(id) == except {
            continue;
        }
        let Some(mut core) = shared.cursors[id].take() else {
            continue;
        };
        let res = if core.root_page == root && core.state == CursorState::Valid {
            cursor::save_position(shared, &mut core)
        } else {
            Ok(())
        };
        shared.cursors[id] = Some(core);
        res?;
    }
    Ok(())
}

/// Trip every cursor sharing this cache into `Fault` carrying `code`.
/// Used after a mid-balance failure leaves the cache inconsistent.
pub(crate) fn trip_all_cursors(shared: &mut BtShared, code: ErrorCode) {
    for slot in shared.cursors.iter_mut() {
        if let Some(core) = slot {
            core.clear_position();
            core.saved_key = None;
            core.state = CursorState::Fault;
            core.fault = code;
        }
    }
}

/// Invalidate incremental-blob cursors positioned on `n_key`.
fn invalidate_incrblob_cursors(shared: &mut BtShared, n_key: RowId, except: Option<usize>) {
    for (id, slot) in shared.cursors.iter_mut().enumerate() {
        if Some(id) == except {
            continue;
        }
        if let Some(core) = slot {
            if core.incrblob && core.n_key == n_key {
                core.clear_position();
                core.saved_key = None;
                core.state = CursorState::Invalid;
            }
        }
    }
}

fn new_db(shared: &mut BtShared) -> Result<()> {
    let pgno = shared.pager.allocate_page();
    debug_assert_eq!(pgno, 1);
    let mut root = MemPage::zeroed(
        1,
        shared.page_size,
        shared.usable_size,
        PTF_TABLE_LEAF,
        shared.limits,
    )?;
    let header = DbHeader {
        page_size: shared.page_size,
        reserve: shared.reserve,
        file_format: 1,
        free_page_count: 0,
        schema_cookie: 0,
    };
    header.write(&mut root.data)?;
    write_mem_page(shared, &root)
}

// ============================================================================
// Btree handle
// ============================================================================

pub struct Btree {
    pub shared: Arc<RwLock<BtShared>>,
}

impl Btree {
    /// Open a database. `path: None` (or the MEMORY flag) keeps all pages
    /// in memory. A fresh database gets its file header and the root of
    /// tree 1 (an empty table tree) created on page 1.
    pub fn open(
        vfs: Arc<dyn Vfs>,
        path: Option<&str>,
        page_size: u32,
        flags: BtreeOpenFlags,
    ) -> Result<Btree> {
        if !(types::MIN_PAGE_SIZE..=types::MAX_PAGE_SIZE).contains(&page_size)
            || !page_size.is_power_of_two()
        {
            return Err(Error::with_message(ErrorCode::Misuse, "bad page size"));
        }
        let mut pager_flags = PagerOpenFlags::empty();
        if flags.contains(BtreeOpenFlags::MEMORY) {
            pager_flags |= PagerOpenFlags::MEMORY;
        }
        if flags.contains(BtreeOpenFlags::OMIT_JOURNAL) {
            pager_flags |= PagerOpenFlags::OMIT_JOURNAL;
        }
        let pager = Pager::open(vfs.as_ref(), path, page_size, pager_flags)?;
        let existing = pager.db_size > 0;

        let mut shared = BtShared {
            pager,
            page_size,
            usable_size: page_size,
            reserve: 0,
            limits: PayloadLimits::for_usable_size(page_size),
            in_transaction: TransState::None,
            bts_flags: BtsFlags::empty(),
            schema_cookie: 0,
            free_pages: Vec::new(),
            free_pages_snapshot: None,
            cursors: Vec::new(),
            table_locks: Vec::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
        };

        if existing {
            let page1 = shared.pager.get(1)?;
            let header = DbHeader::parse(&page1.data)?;
            if header.page_size != page_size {
                return Err(Error::with_message(ErrorCode::Corrupt, "page size mismatch"));
            }
            shared.reserve = header.reserve;
            shared.usable_size = page_size - header.reserve as u32;
            shared.limits = PayloadLimits::for_usable_size(shared.usable_size);
            shared.schema_cookie = header.schema_cookie;
        } else {
            shared.pager.begin(true)?;
            new_db(&mut shared)?;
            shared.pager.commit()?;
            shared.bts_flags |= BtsFlags::INITIALLY_EMPTY;
        }
        debug!(page_size, existing, "btree open");
        Ok(Btree {
            shared: Arc::new(RwLock::new(shared)),
        })
    }

    /// Handle for the cooperative interrupt flag.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.read().interrupted)
    }

    pub fn begin_trans(&self, write: bool) -> Result<()> {
        let mut shared = self.shared.write();
        shared.pager.begin(write)?;
        if write {
            if shared.in_transaction != TransState::Write {
                shared.free_pages_snapshot = Some(shared.free_pages.clone());
            }
            shared.in_transaction = TransState::Write;
        } else if shared.in_transaction == TransState::None {
            shared.in_transaction = TransState::Read;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut shared = self.shared.write();
        shared.pager.commit()?;
        shared.in_transaction = TransState::None;
        shared.free_pages_snapshot = None;
        Ok(())
    }

    /// Roll the transaction back. Every open cursor is invalidated: the
    /// pages under them may have reverted.
    pub fn rollback(&self) -> Result<()> {
        let mut shared = self.shared.write();
        shared.pager.rollback()?;
        shared.in_transaction = TransState::None;
        if let Some(snapshot) = shared.free_pages_snapshot.take() {
            shared.free_pages = snapshot;
        }
        for slot in shared.cursors.iter_mut() {
            if let Some(core) = slot {
                core.clear_position();
                core.saved_key = None;
                core.state = CursorState::Invalid;
            }
        }
        Ok(())
    }

    pub fn txn_state(&self) -> TransState {
        self.shared.read().in_transaction
    }

    pub fn page_count(&self) -> Pgno {
        self.shared.read().pager.db_size
    }

    pub fn free_page_count(&self) -> u32 {
        self.shared.read().free_pages.len() as u32
    }

    /// Open a cursor on the tree rooted at `root`.
    pub fn cursor(
        &self,
        root: Pgno,
        flags: CursorFlags,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Result<BtCursor> {
        let mut shared = self.shared.write();
        let writable = flags.contains(CursorFlags::WRITE);
        if writable && shared.in_transaction != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "write cursor outside a write transaction",
            ));
        }
        let mut core = CursorCore::new(root, writable, key_info);
        core.incrblob = flags.contains(CursorFlags::INCRBLOB);
        let id = shared.alloc_cursor(core);
        Ok(BtCursor {
            shared: Arc::clone(&self.shared),
            id,
            root_page: root,
        })
    }

    /// Allocate the root page of a new tree. `kind` is `BTREE_INTKEY`
    /// for a table tree or `BTREE_BLOBKEY` for an index tree.
    pub fn create_table(&self, kind: u8) -> Result<Pgno> {
        let mut guard = self.shared.write();
        let shared = &mut *guard;
        if shared.in_transaction != TransState::Write {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        let flags = match kind {
            BTREE_INTKEY => PTF_TABLE_LEAF,
            BTREE_BLOBKEY => PTF_INDEX_LEAF,
            _ => return Err(Error::new(ErrorCode::Misuse)),
        };
        let pgno = allocate_btree_page(shared)?;
        let root = MemPage::zeroed(
            pgno,
            shared.page_size,
            shared.usable_size,
            flags,
            shared.limits,
        )?;
        write_mem_page(shared, &root)?;
        debug!(root = pgno, kind, "create table");
        Ok(pgno)
    }

    /// Delete every entry of the tree rooted at `root`, freeing overflow
    /// chains and interior pages. Returns the number of entries removed.
    pub fn clear_table(&self, root: Pgno) -> Result<i64> {
        let mut guard = self.shared.write();
        let shared = &mut *guard;
        if shared.in_transaction != TransState::Write {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        save_all_cursors(shared, root, None)?;
        // Saved positions cannot outlive their entries.
        for slot in shared.cursors.iter_mut() {
            if let Some(core) = slot {
                if core.root_page == root {
                    core.clear_position();
                    core.saved_key = None;
                    core.state = CursorState::Invalid;
                }
            }
        }
        let count = clear_subtree(shared, root, false)?;
        debug!(root, count, "clear table");
        Ok(count)
    }

    /// Clear the tree and free its root.
    pub fn drop_table(&self, root: Pgno) -> Result<()> {
        self.clear_table(root)?;
        let mut guard = self.shared.write();
        let shared = &mut *guard;
        free_btree_page(shared, root)?;
        Ok(())
    }

    /// Acquire a per-tree read or write lock for `owner`. A writer
    /// excludes every other owner; readers exclude writers.
    pub fn lock_table(&self, root: Pgno, owner: u64, write: bool) -> Result<()> {
        let mut shared = self.shared.write();
        for entry in &shared.table_locks {
            if entry.root == root && entry.owner != owner {
                if write || entry.lock == BtLock::Write {
                    return Err(Error::new(ErrorCode::Locked));
                }
            }
        }
        let wanted = if write { BtLock::Write } else { BtLock::Read };
        if let Some(entry) = shared
            .table_locks
            .iter_mut()
            .find(|e| e.root == root && e.owner == owner)
        {
            if entry.lock == BtLock::Read && wanted == BtLock::Write {
                entry.lock = BtLock::Write;
            }
            return Ok(());
        }
        shared.table_locks.push(TableLockEntry {
            root,
            owner,
            lock: wanted,
        });
        Ok(())
    }

    pub fn unlock_tables(&self, owner: u64) {
        self.shared
            .write()
            .table_locks
            .retain(|e| e.owner != owner);
    }

    /// Depth of the tree rooted at `root`: 1 for a lone leaf.
    pub fn tree_depth(&self, root: Pgno) -> Result<u32> {
        let mut guard = self.shared.write();
        let shared = &mut *guard;
        let mut depth = 1;
        let mut pgno = root;
        loop {
            let page = btree_get_page(shared, pgno)?;
            if page.is_leaf {
                return Ok(depth);
            }
            pgno = page.child_pgno(0)?;
            depth += 1;
        }
    }

    /// Walk trees verifying order, fill, depth uniformity and overflow
    /// chain termination. Problems are reported as text, not errors.
    pub fn integrity_check(&self, roots: &[Pgno], key_info: Option<&KeyInfo>) -> IntegrityCheckResult {
        let mut guard = self.shared.write();
        let shared = &mut *guard;
        let mut result = IntegrityCheckResult::default();
        for &root in roots {
            match check_tree_page(shared, root, true, true, key_info, &mut result) {
                Ok(_) => {}
                Err(err) => result
                    .errors
                    .push(format!("tree {root}: walk failed: {err}")),
            }
        }
        result
    }
}

fn clear_subtree(shared: &mut BtShared, pgno: Pgno, free_page: bool) -> Result<i64> {
    check_interrupt(shared)?;
    let page = btree_get_page(shared, pgno)?;
    let mut count = 0i64;
    for i in 0..page.n_cell {
        let info = cell::parse_cell(&page, i)?;
        if info.has_overflow() {
            let head = info.overflow_pgno(&page)?;
            overflow::free_chain(shared, head)?;
        }
        if !page.is_leaf {
            let child = page.child_pgno(i)?;
            count += clear_subtree(shared, child, true)?;
        }
        if page.is_leaf || page.is_zerodata {
            // Leaf entries, and interior entries of index trees.
            count += 1;
        }
    }
    if !page.is_leaf {
        let rightmost = page.child_pgno(page.n_cell)?;
        count += clear_subtree(shared, rightmost, true)?;
    }
    if free_page {
        free_btree_page(shared, pgno)?;
    } else {
        // The root stays, as an empty leaf of the same kind.
        let flags = if page.is_intkey {
            PTF_TABLE_LEAF
        } else {
            PTF_INDEX_LEAF
        };
        let mut empty = MemPage::zeroed(
            pgno,
            shared.page_size,
            shared.usable_size,
            flags,
            shared.limits,
        )?;
        if pgno == 1 {
            empty.data[..FILE_HEADER_SIZE].copy_from_slice(&page.data[..FILE_HEADER_SIZE]);
        }
        write_mem_page(shared, &empty)?;
    }
    Ok(count)
}

// ============================================================================
// Integrity check
// ============================================================================

#[derive(Debug, Default)]
pub struct IntegrityCheckResult {
    pub errors: Vec<String>,
}

impl IntegrityCheckResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct SubtreeSummary {
    depth: u32,
    min_key: Option<i64>,
    max_key: Option<i64>,
}

fn check_overflow_chain(
    shared: &mut BtShared,
    pgno: Pgno,
    head: Pgno,
    expected: u32,
    result: &mut IntegrityCheckResult,
) {
    let capacity = overflow::chain_capacity(shared.usable_size) as u32;
    let want_pages = expected.div_ceil(capacity);
    let mut next = head;
    let mut seen = 0u32;
    let limit = shared.pager.db_size + 1;
    while next != 0 {
        if seen >= limit {
            result
                .errors
                .push(format!("page {pgno}: overflow chain from {head} does not terminate"));
            return;
        }
        match shared.pager.get(next) {
            Ok(page) => {
                next = read_u32(&page.data, 0).unwrap_or(0);
                seen += 1;
            }
            Err(_) => {
                result
                    .errors
                    .push(format!("page {pgno}: unreadable overflow page {next}"));
                return;
            }
        }
    }
    if seen != want_pages {
        result.errors.push(format!(
            "page {pgno}: overflow chain holds {seen} pages, expected {want_pages}"
        ));
    }
}

fn check_tree_page(
    shared: &mut BtShared,
    pgno: Pgno,
    is_root: bool,
    rightmost_spine: bool,
    key_info: Option<&KeyInfo>,
    result: &mut IntegrityCheckResult,
) -> Result<SubtreeSummary> {
    let page = btree_get_page(shared, pgno)?;

    // The rightmost spine is exempt from the fill bound: the append path
    // grows the tree through nearly empty rightmost siblings.
    if !is_root && !rightmost_spine && page.is_underfull() {
        result.errors.push(format!(
            "page {pgno}: fill below a third of usable space ({} free)",
            page.n_free
        ));
    }
    if page.n_overflow() > 0 {
        result
            .errors
            .push(format!("page {pgno}: staged overflow cells outside a balance"));
    }

    let mut prev_int: Option<i64> = None;
    let mut prev_blob: Option<Vec<u8>> = None;
    let mut child_depth: Option<u32> = None;
    let mut min_key = None;
    let mut max_key = None;

    for i in 0..page.n_cell {
        let info = match cell::parse_cell(&page, i) {
            Ok(info) => info,
            Err(_) => {
                result.errors.push(format!("page {pgno}: cell {i} unparsable"));
                continue;
            }
        };
        if info.has_overflow() {
            let head = info.overflow_pgno(&page)?;
            let spilled = info.n_payload - info.n_local as u32;
            check_overflow_chain(shared, pgno, head, spilled, result);
        }

        if page.is_intkey {
            if let Some(prev) = prev_int {
                if info.n_key <= prev {
                    result.errors.push(format!(
                        "page {pgno}: key {} out of order after {prev}",
                        info.n_key
                    ));
                }
            }
            prev_int = Some(info.n_key);
            min_key = min_key.or(Some(info.n_key));
            max_key = Some(info.n_key);
        } else {
            let key = payload::cell_payload(shared, &page, &info)?;
            if let Some(prev) = &prev_blob {
                let ordering = match key_info {
                    Some(ki) => ki.compare_records(prev, &key),
                    None => prev.as_slice().cmp(&key),
                };
                if ordering != std::cmp::Ordering::Less {
                    result
                        .errors
                        .push(format!("page {pgno}: cell {i} out of order"));
                }
            }
            prev_blob = Some(key);
        }

        if !page.is_leaf {
            let child = page.child_pgno(i)?;
            let summary = check_tree_page(shared, child, false, false, key_info, result)?;
            if let Some(expected) = child_depth {
                if summary.depth != expected {
                    result
                        .errors
                        .push(format!("page {pgno}: leaves at differing depths"));
                }
            }
            child_depth = Some(summary.depth);
            if page.is_intkey {
                if let Some(child_max) = summary.max_key {
                    if child_max > info.n_key {
                        result.errors.push(format!(
                            "page {pgno}: child {child} holds key {child_max} above separator {}",
                            info.n_key
                        ));
                    }
                }
                min_key = match (min_key, summary.min_key) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
    }

    if !page.is_leaf {
        let rightmost = page.child_pgno(page.n_cell)?;
        let summary =
            check_tree_page(shared, rightmost, false, rightmost_spine, key_info, result)?;
        if let Some(expected) = child_depth {
            if summary.depth != expected {
                result
                    .errors
                    .push(format!("page {pgno}: leaves at differing depths"));
            }
        }
        child_depth = Some(summary.depth);
        if page.is_intkey {
            if let (Some(sep), Some(child_min)) = (max_key, summary.min_key) {
                if child_min <= sep {
                    result.errors.push(format!(
                        "page {pgno}: rightmost child holds key {child_min} at or below separator {sep}"
                    ));
                }
            }
            max_key = summary.max_key.or(max_key);
            min_key = min_key.or(summary.min_key);
        }
    }

    Ok(SubtreeSummary {
        depth: child_depth.unwrap_or(0) + 1,
        min_key,
        max_key,
    })
}

// ============================================================================
// Cursor handle
// ============================================================================

/// Handle onto a cursor slot. All movement and mutation happens under the
/// shared lock; dropping the handle releases the slot.
pub struct BtCursor {
    shared: Arc<RwLock<BtShared>>,
    id: usize,
    root_page: Pgno,
}

impl fmt::Debug for BtCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtCursor")
            .field("id", &self.id)
            .field("root_page", &self.root_page)
            .finish()
    }
}

impl BtCursor {
    fn with_core<T>(
        &self,
        f: impl FnOnce(&mut BtShared, &mut CursorCore) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.shared.write();
        let shared = &mut *guard;
        let mut core = shared.take_cursor(self.id)?;
        if core.state == CursorState::Fault {
            let code = core.fault;
            shared.put_cursor(self.id, core);
            return Err(Error::new(code));
        }
        let result = f(shared, &mut core);
        shared.put_cursor(self.id, core);
        result
    }

    pub fn root_page(&self) -> Pgno {
        self.root_page
    }

    pub fn state(&self) -> CursorState {
        let shared = self.shared.read();
        shared.cursors[self.id]
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(CursorState::Invalid)
    }

    pub fn is_valid(&self) -> bool {
        self.state() == CursorState::Valid
    }

    pub fn eof(&self) -> bool {
        !self.is_valid()
    }

    /// True when a mutation elsewhere moved this cursor off its position.
    pub fn has_moved(&self) -> bool {
        self.state() != CursorState::Valid
    }

    /// Position on the first entry; returns true when the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.with_core(cursor::first)
    }

    /// Position on the last entry; returns true when the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        self.with_core(cursor::last)
    }

    /// Advance; returns true when iteration is complete.
    pub fn next(&mut self) -> Result<bool> {
        self.with_core(cursor::next)
    }

    /// Step back; returns true when iteration is complete.
    pub fn previous(&mut self) -> Result<bool> {
        self.with_core(cursor::previous)
    }

    /// Seek an integer key; see [`cursor::table_moveto`] for the result
    /// convention.
    pub fn table_moveto(&mut self, int_key: RowId) -> Result<i32> {
        self.with_core(|shared, core| cursor::table_moveto(shared, core, int_key))
    }

    /// Seek a byte-string key in an index tree.
    pub fn index_moveto(&mut self, key: &[u8]) -> Result<i32> {
        self.with_core(|shared, core| cursor::index_moveto(shared, core, key))
    }

    /// Re-seek a position saved by a mutation elsewhere. Returns true
    /// when the cursor stands on the saved key again.
    pub fn restore_position(&mut self) -> Result<bool> {
        self.with_core(cursor::restore_position)
    }

    /// Integer key of the current entry.
    pub fn integer_key(&self) -> Result<RowId> {
        self.with_core(|_, core| {
            require_valid(core)?;
            Ok(cursor::cursor_cell_info(core)?.n_key)
        })
    }

    pub fn payload_size(&self) -> Result<u32> {
        self.with_core(|_, core| {
            require_valid(core)?;
            Ok(cursor::cursor_cell_info(core)?.n_payload)
        })
    }

    /// Read `amt` payload bytes at `offset` of the current entry.
    pub fn payload(&self, offset: u32, amt: u32) -> Result<Vec<u8>> {
        self.with_core(|shared, core| {
            require_valid(core)?;
            let info = cursor::cursor_cell_info(core)?;
            let page = core.page().clone();
            let cache = if core.incrblob {
                Some(&mut core.overflow_cache)
            } else {
                None
            };
            payload::read_payload(shared, &page, &info, offset, amt, cache)
        })
    }

    /// The full key of an index entry (its payload).
    pub fn key(&self) -> Result<Vec<u8>> {
        let size = self.payload_size()?;
        self.payload(0, size)
    }

    /// Mark this cursor as an incremental-blob handle: overflow page
    /// positions get cached for O(1) repeated access.
    pub fn cache_overflow(&mut self) {
        let mut shared = self.shared.write();
        if let Some(core) = shared.cursors[self.id].as_mut() {
            core.incrblob = true;
            core.overflow_cache.clear();
        }
    }

    /// Overwrite payload bytes of the current entry in place. Only valid
    /// on writable incremental-blob cursors; the payload size is fixed.
    pub fn put_data(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.with_core(|shared, core| {
            require_valid(core)?;
            if !core.writable || !core.incrblob {
                return Err(Error::new(ErrorCode::ReadOnly));
            }
            if shared.in_transaction != TransState::Write {
                return Err(Error::new(ErrorCode::ReadOnly));
            }
            let info = cursor::cursor_cell_info(core)?;
            let i = core.i_page as usize;
            let (pages, cache) = (&mut core.pages, &mut core.overflow_cache);
            payload::write_payload(shared, &mut pages[i], &info, offset, data, Some(cache))
        })
    }

    /// Insert an entry. The cursor ends positioned on it.
    pub fn insert(&mut self, entry: &BtreePayload) -> Result<()> {
        let id = self.id;
        self.with_core(|shared, core| insert_impl(shared, core, id, entry))
    }

    /// Delete the current entry, then reposition at the root.
    pub fn delete(&mut self) -> Result<()> {
        let id = self.id;
        self.with_core(|shared, core| delete_impl(shared, core, id))
    }

    pub fn iter(&mut self) -> BtCursorIter<'_> {
        BtCursorIter {
            cursor: self,
            started: false,
        }
    }
}

impl Drop for BtCursor {
    fn drop(&mut self) {
        self.shared.write().close_cursor(self.id);
    }
}

fn require_valid(core: &CursorCore) -> Result<()> {
    match core.state {
        CursorState::Valid => Ok(()),
        CursorState::Fault => Err(Error::new(core.fault)),
        _ => Err(Error::with_message(ErrorCode::Misuse, "cursor not valid")),
    }
}

/// Iterator over `(integer key, payload)` rows of a table tree.
pub struct BtCursorIter<'a> {
    cursor: &'a mut BtCursor,
    started: bool,
}

impl Iterator for BtCursorIter<'_> {
    type Item = Result<(RowId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            match self.cursor.first() {
                Ok(true) => return None,
                Ok(false) => {}
                Err(err) => return Some(Err(err)),
            }
        } else {
            match self.cursor.next() {
                Ok(true) => return None,
                Ok(false) => {}
                Err(err) => return Some(Err(err)),
            }
        }
        let rowid = match self.cursor.integer_key() {
            Ok(rowid) => rowid,
            Err(err) => return Some(Err(err)),
        };
        let size = match self.cursor.payload_size() {
            Ok(size) => size,
            Err(err) => return Some(Err(err)),
        };
        match self.cursor.payload(0, size) {
            Ok(data) => Some(Ok((rowid, data))),
            Err(err) => Some(Err(err)),
        }
    }
}

// ============================================================================
// Insert and delete
// ============================================================================

fn insert_impl(
    shared: &mut BtShared,
    core: &mut CursorCore,
    self_id: usize,
    entry: &BtreePayload,
) -> Result<()> {
    check_interrupt(shared)?;
    if !core.writable {
        return Err(Error::new(ErrorCode::ReadOnly));
    }
    if shared.in_transaction != TransState::Write {
        return Err(Error::new(ErrorCode::ReadOnly));
    }

    save_all_cursors(shared, core.root_page, Some(self_id))?;
    core.skip_next = 0;

    let root = btree_get_page(shared, core.root_page)?;
    let intkey = root.is_intkey;
    drop(root);

    let res = if intkey {
        cursor::table_moveto(shared, core, entry.n_key)?
    } else {
        let key = entry
            .key
            .as_deref()
            .ok_or(Error::with_message(ErrorCode::Misuse, "index entry without key"))?;
        let r = cursor::index_moveto(shared, core, key)?;
        if r == 0 && core.state == CursorState::Valid {
            // Unique keys: replace by delete + fresh seek. The delete
            // handles entries sitting on interior pages.
            delete_impl(shared, core, self_id)?;
            cursor::index_moveto(shared, core, key)?
        } else {
            r
        }
    };

    let insert_ix = if core.state != CursorState::Valid {
        0
    } else if intkey && res == 0 {
        // Overwrite in place: clear the old cell first.
        let info = cursor::cursor_cell_info(core)?;
        if info.has_overflow() {
            let head = info.overflow_pgno(core.page())?;
            overflow::free_chain(shared, head)?;
        }
        let ix = core.ix();
        core.page_mut().drop_cell(ix, info.n_size)?;
        core.info = None;
        ix
    } else if res > 0 {
        core.ix()
    } else {
        core.ix() + 1
    };

    let mut assembled = cell::assemble_cell(core.page(), entry)?;
    if assembled.has_spill() {
        let head = overflow::write_chain(shared, &assembled.spill)?;
        assembled.set_overflow_pgno(head);
    }
    core.page_mut().insert_cell(insert_ix, assembled.cell)?;
    write_mem_page(shared, core.page())?;

    if core.page().is_overfull() {
        if let Err(err) = balance::balance(shared, core) {
            // A failed balance leaves the cache inconsistent; everyone
            // sharing it must stop.
            trip_all_cursors(shared, err.code());
            return Err(err);
        }
        if intkey {
            cursor::table_moveto(shared, core, entry.n_key)?;
        } else {
            let key = entry.key.as_deref().unwrap();
            cursor::index_moveto(shared, core, key)?;
        }
    } else {
        core.state = CursorState::Valid;
        core.set_ix(insert_ix);
        cursor::cursor_cell_info(core)?;
    }
    Ok(())
}

/// Delete the entry under the cursor.
///
/// When the entry sits on an interior page, the cursor first steps to
/// the in-order predecessor (always a leaf entry inside the child
/// subtree of the deleted cell); that leaf cell, prefixed with the child
/// pointer it replaces, takes the separator's place, which preserves the
/// separator bound without restructuring. Rebalancing then runs from the
/// leaf, and again from the separator's level if the first pass stopped
/// below it.
fn delete_impl(shared: &mut BtShared, core: &mut CursorCore, self_id: usize) -> Result<()> {
    check_interrupt(shared)?;
    if core.state != CursorState::Valid {
        return Err(Error::with_message(ErrorCode::Misuse, "delete on invalid cursor"));
    }
    if !core.writable {
        return Err(Error::new(ErrorCode::ReadOnly));
    }
    if shared.in_transaction != TransState::Write {
        return Err(Error::new(ErrorCode::ReadOnly));
    }
    if core.ix() >= core.page().n_cell {
        return Err(Error::new(ErrorCode::Range));
    }

    let cell_depth = core.i_page as usize;
    let cell_idx = core.ix();
    let on_leaf = core.page().is_leaf;
    let intkey = core.page().is_intkey;
    let target = cursor::cursor_cell_info(core)?;

    core.skip_next = 0;
    if !on_leaf {
        cursor::previous(shared, core)?;
        if core.state != CursorState::Valid {
            return Err(Error::new(ErrorCode::Corrupt));
        }
    }

    save_all_cursors(shared, core.root_page, Some(self_id))?;
    if intkey {
        invalidate_incrblob_cursors(shared, target.n_key, Some(self_id));
    }

    // Free the entry's overflow chain and remove the cell.
    if target.has_overflow() {
        let head = target.overflow_pgno(&core.pages[cell_depth])?;
        overflow::free_chain(shared, head)?;
    }
    core.pages[cell_depth].drop_cell(cell_idx, target.n_size)?;
    write_mem_page(shared, &core.pages[cell_depth])?;
    core.info = None;

    if !on_leaf {
        // Move the predecessor up to stand in for the separator.
        let leaf_level = core.i_page as usize;
        let leaf_last = core.pages[leaf_level].n_cell - 1;
        let linfo = cell::parse_cell(&core.pages[leaf_level], leaf_last)?;
        let child_pgno = core.pages[cell_depth + 1].pgno;
        let ptr = core.pages[leaf_level].cell_ptr(leaf_last)? as usize;
        let mut divider = Vec::with_capacity(4 + linfo.n_size as usize);
        divider.extend_from_slice(&child_pgno.to_be_bytes());
        divider
            .extend_from_slice(&core.pages[leaf_level].data[ptr..ptr + linfo.n_size as usize]);
        core.pages[cell_depth].insert_cell(cell_idx, divider)?;
        write_mem_page(shared, &core.pages[cell_depth])?;
        core.pages[leaf_level].drop_cell(leaf_last, linfo.n_size)?;
        write_mem_page(shared, &core.pages[leaf_level])?;
    }

    let rebalance = (|| -> Result<()> {
        balance::balance(shared, core)?;
        if (core.i_page as usize) > cell_depth {
            core.pages.truncate(cell_depth + 1);
            core.aidx.truncate(cell_depth + 1);
            core.i_page = cell_depth as i8;
            core.info = None;
            balance::balance(shared, core)?;
        }
        Ok(())
    })();
    if let Err(err) = rebalance {
        trip_all_cursors(shared, err.code());
        return Err(err);
    }

    cursor::move_to_root(shared, core)?;
    Ok(())
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::os::vfs::MemoryVfs;

    /// A memory-backed shared state inside an open write transaction,
    /// with the file header and tree-1 root on page 1.
    pub(crate) fn memory_shared(page_size: u32) -> BtShared {
        let vfs = MemoryVfs::new();
        let mut pager = Pager::open(&vfs, None, page_size, PagerOpenFlags::MEMORY).unwrap();
        pager.begin(true).unwrap();
        let mut shared = BtShared {
            pager,
            page_size,
            usable_size: page_size,
            reserve: 0,
            limits: PayloadLimits::for_usable_size(page_size),
            in_transaction: TransState::Write,
            bts_flags: BtsFlags::empty(),
            schema_cookie: 0,
            free_pages: Vec::new(),
            free_pages_snapshot: None,
            cursors: Vec::new(),
            table_locks: Vec::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
        };
        new_db(&mut shared).unwrap();
        shared
    }
}
