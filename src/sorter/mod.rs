//! External merge sorter.
//!
//! Records accumulate in an in-memory linked list. When the list grows
//! past the PMA bounds it is sorted (bottom-up list merge over 64 slots)
//! and flushed to a temporary file as a packed-memory array: a varint
//! with the total content size, the records as `varint(len) || bytes`
//! packed end to end, and 8 trailing zero bytes so any offset within the
//! file supports a 9-byte read. The zero tail is written without
//! advancing the write offset, so only the final tail survives.
//!
//! Reading back merges every PMA through a tournament (loser) tree over
//! at most [`SORTER_MAX_MERGE_COUNT`] iterators: `tree[1]` always indexes
//! the iterator with the smallest current key, EOF loses every
//! comparison, and ties break toward the lower index. With more PMAs
//! than the fan-in allows, batches are merged into a second temporary
//! file and the files swap roles until one final pass can stream to the
//! caller.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{Vfs, VfsFile};
use crate::storage::btree::encoding::{put_varint, read_varint_at, varint_len};
use crate::storage::btree::{record_has_null, KeyInfo};

/// Minimum spill threshold, in pages.
pub const SORTER_MIN_WORKING: usize = 10;

/// Maximum number of PMAs merged in a single pass.
pub const SORTER_MAX_MERGE_COUNT: usize = 16;

/// A single record awaiting sorting. Records form a singly linked list
/// headed at `VdbeSorter::record`.
struct SorterRecord {
    val: Vec<u8>,
    next: Option<Box<SorterRecord>>,
}

/// Drop a record list iteratively; the default recursive drop would
/// recurse once per record.
fn clear_records(mut head: Option<Box<SorterRecord>>) {
    while let Some(mut node) = head {
        head = node.next.take();
    }
}

fn merge_lists(
    key_info: &KeyInfo,
    mut a: Option<Box<SorterRecord>>,
    mut b: Option<Box<SorterRecord>>,
) -> Option<Box<SorterRecord>> {
    let mut head: Option<Box<SorterRecord>> = None;
    let mut tail = &mut head;
    loop {
        match (a.take(), b.take()) {
            (None, None) => break,
            (Some(x), None) => {
                *tail = Some(x);
                break;
            }
            (None, Some(y)) => {
                *tail = Some(y);
                break;
            }
            (Some(mut x), Some(mut y)) => {
                if key_info.compare_records(&x.val, &y.val) != Ordering::Greater {
                    a = x.next.take();
                    b = Some(y);
                    *tail = Some(x);
                } else {
                    b = y.next.take();
                    a = Some(x);
                    *tail = Some(y);
                }
                tail = &mut tail.as_mut().unwrap().next;
            }
        }
    }
    head
}

// ============================================================================
// PMA iterator
// ============================================================================

/// Iterator over one PMA. Caches the current key inside `data`; an
/// iterator at EOF is inactive and loses every tournament comparison.
struct SorterIter {
    read_off: u64,
    /// One byte past the last content byte of this PMA.
    eof: u64,
    data: Vec<u8>,
    key_off: usize,
    key_len: usize,
    active: bool,
}

impl SorterIter {
    fn inactive() -> Self {
        Self {
            read_off: 0,
            eof: 0,
            data: Vec::new(),
            key_off: 0,
            key_len: 0,
            active: false,
        }
    }

    fn key(&self) -> &[u8] {
        &self.data[self.key_off..self.key_off + self.key_len]
    }

    /// Advance to the next record, going inactive at the end of the PMA.
    fn next(&mut self, file: &mut dyn VfsFile) -> Result<()> {
        let remaining = self.eof.saturating_sub(self.read_off);
        if remaining == 0 {
            *self = SorterIter::inactive();
            return Ok(());
        }
        // The zero tail guarantees 9 readable bytes at any offset.
        let n_read = remaining.min(9) as usize;
        if self.data.len() < n_read {
            self.data.resize(n_read, 0);
        }
        file.read_at(self.read_off, &mut self.data[..n_read])?;
        let (n_rec, i_off) = read_varint_at(&self.data, 0);
        let n_rec = n_rec as usize;
        if n_rec == 0 || i_off == 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "empty sorter record"));
        }
        if i_off + n_rec > n_read {
            if i_off + n_rec > self.data.len() {
                let mut n_new = self.data.len().max(128) * 2;
                while i_off + n_rec > n_new {
                    n_new *= 2;
                }
                self.data.resize(n_new, 0);
            }
            let extra = i_off + n_rec - n_read;
            file.read_at(
                self.read_off + n_read as u64,
                &mut self.data[n_read..n_read + extra],
            )?;
        }
        self.key_off = i_off;
        self.key_len = n_rec;
        self.read_off += (i_off + n_rec) as u64;
        self.active = true;
        Ok(())
    }
}

fn file_read_varint(file: &mut dyn VfsFile, offset: u64) -> Result<(u64, u64)> {
    let mut buf = [0u8; 9];
    file.read_at(offset, &mut buf)?;
    let (value, used) = read_varint_at(&buf, 0);
    if used == 0 {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok((value, offset + used as u64))
}

fn file_write_varint(file: &mut dyn VfsFile, offset: u64, value: u64) -> Result<u64> {
    let mut buf = [0u8; 9];
    let used = put_varint(&mut buf, value);
    file.write_at(offset, &buf[..used])?;
    Ok(offset + used as u64)
}

/// Initialize an iterator on the PMA starting at `start`, leaving it on
/// the PMA's first record. Returns the iterator and the PMA's content
/// size.
fn init_iterator(file: &mut dyn VfsFile, start: u64) -> Result<(SorterIter, u64)> {
    let (total, read_off) = file_read_varint(file, start)?;
    let mut iter = SorterIter::inactive();
    iter.read_off = read_off;
    iter.eof = read_off + total;
    iter.data = vec![0u8; 128];
    iter.next(file)?;
    Ok((iter, total))
}

// ============================================================================
// VdbeSorter
// ============================================================================

/// Out-of-core sorter: accumulate with [`write`](VdbeSorter::write),
/// then [`rewind`](VdbeSorter::rewind) and step with
/// [`next`](VdbeSorter::next), reading keys via
/// [`rowkey`](VdbeSorter::rowkey).
pub struct VdbeSorter {
    key_info: Arc<KeyInfo>,
    vfs: Arc<dyn Vfs>,
    record: Option<Box<SorterRecord>>,
    n_in_memory: usize,
    n_pma: usize,
    write_off: u64,
    read_off: u64,
    mn_pma_size: usize,
    /// Zero disables spilling entirely.
    mx_pma_size: usize,
    temp1: Option<Box<dyn VfsFile>>,
    iters: Vec<SorterIter>,
    tree: Vec<usize>,
    n_tree: usize,
    interrupted: Option<Arc<AtomicBool>>,
    memory_pressure: Option<Box<dyn Fn() -> bool + Send>>,
}

impl VdbeSorter {
    pub fn new(vfs: Arc<dyn Vfs>, key_info: Arc<KeyInfo>, page_size: usize, cache_pages: usize) -> Self {
        let cache_pages = cache_pages.max(SORTER_MIN_WORKING);
        Self {
            key_info,
            vfs,
            record: None,
            n_in_memory: 0,
            n_pma: 0,
            write_off: 0,
            read_off: 0,
            mn_pma_size: SORTER_MIN_WORKING * page_size,
            mx_pma_size: cache_pages * page_size,
            temp1: None,
            iters: Vec::new(),
            tree: Vec::new(),
            n_tree: 0,
            interrupted: None,
            memory_pressure: None,
        }
    }

    /// Sorter that keeps everything in memory.
    pub fn in_memory(vfs: Arc<dyn Vfs>, key_info: Arc<KeyInfo>) -> Self {
        let mut sorter = Self::new(vfs, key_info, 4096, SORTER_MIN_WORKING);
        sorter.mx_pma_size = 0;
        sorter
    }

    /// Cooperative interrupt flag, polled between records merged.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupted = Some(flag);
    }

    /// Predicate consulted once the in-memory list passes the minimum
    /// PMA size; returning true forces an early flush.
    pub fn set_memory_pressure_hook(&mut self, hook: Box<dyn Fn() -> bool + Send>) {
        self.memory_pressure = Some(hook);
    }

    pub fn pma_count(&self) -> usize {
        self.n_pma
    }

    fn check_interrupt(&self) -> Result<()> {
        if let Some(flag) = &self.interrupted {
            if flag.load(AtomicOrdering::Relaxed) {
                return Err(Error::new(ErrorCode::Interrupt));
            }
        }
        Ok(())
    }

    /// Add a record.
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        self.n_in_memory += varint_len(record.len() as u64) + record.len();
        let node = Box::new(SorterRecord {
            val: record.to_vec(),
            next: self.record.take(),
        });
        self.record = Some(node);

        // Flush when past the hard bound, or past the soft bound with the
        // host reporting memory pressure.
        let pressured = self
            .memory_pressure
            .as_ref()
            .is_some_and(|hook| hook());
        if self.mx_pma_size > 0
            && (self.n_in_memory > self.mx_pma_size
                || (self.n_in_memory > self.mn_pma_size && pressured))
        {
            self.list_to_pma()?;
            self.n_in_memory = 0;
        }
        Ok(())
    }

    /// Sort the in-memory list: bucketed bottom-up merge over 64 slots.
    fn sort_list(&mut self) {
        let mut slots: Vec<Option<Box<SorterRecord>>> = (0..64).map(|_| None).collect();
        let mut p = self.record.take();
        while let Some(mut node) = p {
            p = node.next.take();
            let mut merged = Some(node);
            let mut i = 0;
            while i < 64 && slots[i].is_some() {
                merged = merge_lists(&self.key_info, merged, slots[i].take());
                i += 1;
            }
            if i == 64 {
                slots[63] = merge_lists(&self.key_info, merged, slots[63].take());
            } else {
                slots[i] = merged;
            }
        }
        let mut all: Option<Box<SorterRecord>> = None;
        for slot in &mut slots {
            all = merge_lists(&self.key_info, all, slot.take());
        }
        self.record = all;
    }

    /// Flush the sorted in-memory list as one PMA.
    fn list_to_pma(&mut self) -> Result<()> {
        if self.n_in_memory == 0 {
            debug_assert!(self.record.is_none());
            return Ok(());
        }
        self.sort_list();

        if self.temp1.is_none() {
            self.temp1 = Some(self.vfs.open_temp()?);
            debug_assert_eq!(self.write_off, 0);
            debug_assert_eq!(self.n_pma, 0);
        }
        let file = self.temp1.as_mut().unwrap();

        self.n_pma += 1;
        let start = self.write_off;
        let mut off = file_write_varint(file.as_mut(), start, self.n_in_memory as u64)?;
        let mut p = self.record.take();
        while let Some(mut node) = p {
            p = node.next.take();
            off = file_write_varint(file.as_mut(), off, node.val.len() as u64)?;
            file.write_at(off, &node.val)?;
            off += node.val.len() as u64;
        }
        debug_assert_eq!(
            (off - start) as usize,
            self.n_in_memory + varint_len(self.n_in_memory as u64)
        );
        self.write_off = off;
        // Terminate the file so any offset can read 9 bytes; the next PMA
        // overwrites this tail.
        file.write_at(off, &[0u8; 8])?;
        debug!(pma = self.n_pma, bytes = self.n_in_memory, "sorter: PMA flushed");
        Ok(())
    }

    /// Recompute `tree[out]` from its two inputs. EOF is greater than any
    /// key; ties break toward the lower iterator index.
    fn do_compare(&mut self, out: usize) {
        debug_assert!(out > 0 && out < self.n_tree);
        let (i1, i2) = if out >= self.n_tree / 2 {
            let i1 = (out - self.n_tree / 2) * 2;
            (i1, i1 + 1)
        } else {
            (self.tree[2 * out], self.tree[2 * out + 1])
        };
        let res = if !self.iters[i1].active {
            i2
        } else if !self.iters[i2].active {
            i1
        } else if self
            .key_info
            .compare_records(self.iters[i1].key(), self.iters[i2].key())
            != Ordering::Greater
        {
            i1
        } else {
            i2
        };
        self.tree[out] = res;
    }

    /// Initialize up to [`SORTER_MAX_MERGE_COUNT`] iterators on the PMAs
    /// at the current read offset and build the tournament tree. Returns
    /// the combined content size.
    fn init_merge(&mut self) -> Result<u64> {
        let mut n_byte = 0u64;
        for i in 0..self.iters.len() {
            self.iters[i] = SorterIter::inactive();
        }
        let file = self.temp1.as_mut().ok_or(Error::new(ErrorCode::Internal))?;
        for i in 0..self.iters.len() {
            let (iter, total) = init_iterator(file.as_mut(), self.read_off)?;
            n_byte += total;
            self.read_off = iter.eof;
            self.iters[i] = iter;
            if self.read_off >= self.write_off {
                break;
            }
        }
        for i in (1..self.n_tree).rev() {
            self.do_compare(i);
        }
        Ok(n_byte)
    }

    /// Advance the winning iterator and replay its path up the tree.
    fn merge_next(&mut self) -> Result<()> {
        let prev = self.tree[1];
        {
            let file = self.temp1.as_mut().ok_or(Error::new(ErrorCode::Internal))?;
            let iter = &mut self.iters[prev];
            iter.next(file.as_mut())?;
        }
        let mut i = (self.n_tree + prev) / 2;
        while i > 0 {
            self.do_compare(i);
            i /= 2;
        }
        Ok(())
    }

    /// Prepare for iterating in sorted order. Returns true when the
    /// sorter holds no records.
    pub fn rewind(&mut self) -> Result<bool> {
        // Nothing spilled: the caller reads straight from the list.
        if self.n_pma == 0 {
            self.sort_list();
            self.n_tree = 0;
            return Ok(self.record.is_none());
        }

        self.list_to_pma()?;
        self.n_in_memory = 0;

        let n_iter = self.n_pma.min(SORTER_MAX_MERGE_COUNT);
        debug_assert!(n_iter > 0);
        let mut n = 2;
        while n < n_iter {
            n *= 2;
        }
        self.iters = (0..n).map(|_| SorterIter::inactive()).collect();
        self.tree = vec![0usize; n];
        self.n_tree = n;
        self.read_off = 0;

        let mut temp2: Option<Box<dyn VfsFile>> = None;
        let mut write2: u64 = 0;

        loop {
            let mut i_new = 0usize;
            while i_new * SORTER_MAX_MERGE_COUNT < self.n_pma {
                // With few enough PMAs the iterators merge incrementally
                // as the caller consumes records; otherwise each batch of
                // SORTER_MAX_MERGE_COUNT runs becomes one PMA on the
                // second file.
                let n_write = self.init_merge()?;
                if self.n_pma <= SORTER_MAX_MERGE_COUNT {
                    break;
                }
                if temp2.is_none() {
                    debug_assert_eq!(write2, 0);
                    temp2 = Some(self.vfs.open_temp()?);
                }
                let out = temp2.as_mut().unwrap();
                write2 = file_write_varint(out.as_mut(), write2, n_write)?;
                loop {
                    self.check_interrupt()?;
                    let winner = self.tree[1];
                    if !self.iters[winner].active {
                        break;
                    }
                    let key_len = self.iters[winner].key_len;
                    let mut frame = Vec::with_capacity(9 + key_len);
                    let mut varint = [0u8; 9];
                    let used = put_varint(&mut varint, key_len as u64);
                    frame.extend_from_slice(&varint[..used]);
                    frame.extend_from_slice(self.iters[winner].key());
                    out.write_at(write2, &frame)?;
                    write2 += frame.len() as u64;
                    self.merge_next()?;
                }
                out.write_at(write2, &[0u8; 8])?;
                i_new += 1;
            }

            if self.n_pma <= SORTER_MAX_MERGE_COUNT {
                break;
            }
            debug!(merged = i_new, "sorter: cascaded merge pass");
            let old_temp1 = self.temp1.take();
            self.temp1 = temp2.take();
            temp2 = old_temp1;
            self.n_pma = i_new;
            self.write_off = write2;
            self.read_off = 0;
            write2 = 0;
        }

        Ok(!self.iters[self.tree[1]].active)
    }

    /// Step to the next record. Returns true at the end of the output.
    pub fn next(&mut self) -> Result<bool> {
        self.check_interrupt()?;
        if self.n_tree > 0 {
            self.merge_next()?;
            Ok(!self.iters[self.tree[1]].active)
        } else {
            self.record = self.record.take().and_then(|mut r| r.next.take());
            Ok(self.record.is_none())
        }
    }

    /// The current record's key, owned by the sorter.
    pub fn rowkey(&self) -> Option<&[u8]> {
        if self.n_tree > 0 {
            let winner = self.tree[1];
            let iter = &self.iters[winner];
            if iter.active {
                Some(iter.key())
            } else {
                None
            }
        } else {
            self.record.as_ref().map(|r| r.val.as_slice())
        }
    }

    /// Compare `key` against the current record over the key columns
    /// only, ignoring the rowid tail. A `key` containing NULL in any key
    /// column sorts before everything, even another NULL-bearing key.
    pub fn compare_current(&self, key: &[u8]) -> Option<Ordering> {
        let current = self.rowkey()?;
        if record_has_null(key, self.key_info.n_key_field as usize) {
            return Some(Ordering::Less);
        }
        Some(self.key_info.compare_records(key, current))
    }

    /// Drop all state; temp files unlink on close.
    pub fn reset(&mut self) {
        clear_records(self.record.take());
        self.n_in_memory = 0;
        self.n_pma = 0;
        self.write_off = 0;
        self.read_off = 0;
        self.temp1 = None;
        self.iters.clear();
        self.tree.clear();
        self.n_tree = 0;
    }
}

impl Drop for VdbeSorter {
    fn drop(&mut self) {
        clear_records(self.record.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vfs::MemoryVfs;

    fn make_int_record(value: i64) -> Vec<u8> {
        let mut record = Vec::new();
        let serial_type: u8 = match value {
            0 => 8,
            1 => 9,
            -128..=127 => 1,
            -32768..=32767 => 2,
            _ => 6,
        };
        record.push(2);
        record.push(serial_type);
        match serial_type {
            1 => record.push(value as u8),
            2 => record.extend(&(value as i16).to_be_bytes()),
            6 => record.extend(&value.to_be_bytes()),
            _ => {}
        }
        record
    }

    fn make_null_record() -> Vec<u8> {
        vec![2, 0]
    }

    fn sorter_with_limits(mn: usize, mx: usize) -> VdbeSorter {
        let vfs: Arc<dyn Vfs> = Arc::new(MemoryVfs::new());
        let mut sorter = VdbeSorter::new(vfs, Arc::new(KeyInfo::new(1)), 1, SORTER_MIN_WORKING);
        sorter.mn_pma_size = mn;
        sorter.mx_pma_size = mx;
        sorter
    }

    fn drain_ints(sorter: &mut VdbeSorter) -> Vec<i64> {
        let mut out = Vec::new();
        loop {
            let Some(key) = sorter.rowkey() else { break };
            let fields = crate::storage::btree::parse_record_fields(key);
            match fields.first() {
                Some(crate::storage::btree::RecordField::Int(v)) => out.push(*v),
                other => panic!("unexpected field {other:?}"),
            }
            if sorter.next().unwrap() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_in_memory_sort() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemoryVfs::new());
        let mut sorter = VdbeSorter::in_memory(vfs, Arc::new(KeyInfo::new(1)));
        for v in [30i64, 10, 20, 25, 5] {
            sorter.write(&make_int_record(v)).unwrap();
        }
        assert!(!sorter.rewind().unwrap());
        assert_eq!(sorter.pma_count(), 0, "no PMA for an in-memory sort");
        assert_eq!(drain_ints(&mut sorter), vec![5, 10, 20, 25, 30]);
    }

    #[test]
    fn test_empty_sorter_rewind_is_eof() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemoryVfs::new());
        let mut sorter = VdbeSorter::in_memory(vfs, Arc::new(KeyInfo::new(1)));
        assert!(sorter.rewind().unwrap());
        assert!(sorter.rowkey().is_none());
    }

    #[test]
    fn test_single_record_writes_no_pma() {
        let mut sorter = sorter_with_limits(16, 64);
        sorter.write(&make_int_record(42)).unwrap();
        assert!(!sorter.rewind().unwrap());
        assert_eq!(sorter.pma_count(), 0);
        assert_eq!(drain_ints(&mut sorter), vec![42]);
    }

    #[test]
    fn test_spill_and_merge() {
        // Tiny bounds force a PMA every few records.
        let mut sorter = sorter_with_limits(8, 32);
        let values: Vec<i64> = (0..100).map(|i| (i * 37) % 101).collect();
        for &v in &values {
            sorter.write(&make_int_record(v)).unwrap();
        }
        assert!(sorter.pma_count() > 1);
        assert!(!sorter.rewind().unwrap());
        let mut expect = values.clone();
        expect.sort_unstable();
        assert_eq!(drain_ints(&mut sorter), expect);
    }

    #[test]
    fn test_cascaded_merge_pass() {
        // Force more PMAs than the merge fan-in.
        let mut sorter = sorter_with_limits(4, 8);
        let values: Vec<i64> = (0..120).map(|i| (i * 53) % 127).collect();
        for &v in &values {
            sorter.write(&make_int_record(v)).unwrap();
        }
        assert!(
            sorter.pma_count() > SORTER_MAX_MERGE_COUNT,
            "need a cascade, got {} PMAs",
            sorter.pma_count()
        );
        assert!(!sorter.rewind().unwrap());
        assert!(
            sorter.pma_count() <= SORTER_MAX_MERGE_COUNT,
            "cascade reduces the PMA count"
        );
        let mut expect = values.clone();
        expect.sort_unstable();
        assert_eq!(drain_ints(&mut sorter), expect);
    }

    #[test]
    fn test_duplicate_keys_survive_merging() {
        let mut sorter = sorter_with_limits(8, 24);
        for _ in 0..10 {
            for v in [3i64, 1, 2] {
                sorter.write(&make_int_record(v)).unwrap();
            }
        }
        assert!(!sorter.rewind().unwrap());
        let got = drain_ints(&mut sorter);
        let mut expect: Vec<i64> = [1i64, 2, 3].repeat(10);
        expect.sort_unstable();
        assert_eq!(got, expect);
    }

    #[test]
    fn test_tournament_winner_is_minimum() {
        let mut sorter = sorter_with_limits(4, 8);
        for v in (0..40).rev() {
            sorter.write(&make_int_record(v)).unwrap();
        }
        assert!(!sorter.rewind().unwrap());
        assert!(sorter.n_tree >= 2);
        let mut prev = i64::MIN;
        loop {
            // tree[1] indexes the minimal iterator: keys come out
            // non-decreasing.
            let winner = sorter.tree[1];
            assert!(sorter.iters[winner].active);
            let fields =
                crate::storage::btree::parse_record_fields(sorter.iters[winner].key());
            let crate::storage::btree::RecordField::Int(v) = fields[0] else {
                panic!("bad field");
            };
            assert!(v >= prev);
            prev = v;
            if sorter.next().unwrap() {
                break;
            }
        }
    }

    #[test]
    fn test_compare_current_null_first() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemoryVfs::new());
        let mut sorter = VdbeSorter::in_memory(vfs, Arc::new(KeyInfo::new(1)));
        sorter.write(&make_int_record(-100)).unwrap();
        sorter.rewind().unwrap();
        // A NULL-bearing probe sorts before everything.
        assert_eq!(
            sorter.compare_current(&make_null_record()),
            Some(Ordering::Less)
        );
        assert_eq!(
            sorter.compare_current(&make_int_record(-100)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            sorter.compare_current(&make_int_record(5)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_memory_pressure_hook_forces_flush() {
        let mut sorter = sorter_with_limits(4, 1 << 30);
        sorter.set_memory_pressure_hook(Box::new(|| true));
        for v in 0..10i64 {
            sorter.write(&make_int_record(v)).unwrap();
        }
        // The soft bound plus constant pressure spills early despite the
        // huge hard bound.
        assert!(sorter.pma_count() > 0);
    }

    #[test]
    fn test_interrupt_stops_merge() {
        let mut sorter = sorter_with_limits(4, 8);
        for v in 0..50i64 {
            sorter.write(&make_int_record(v)).unwrap();
        }
        let flag = Arc::new(AtomicBool::new(false));
        sorter.set_interrupt(Arc::clone(&flag));
        assert!(!sorter.rewind().unwrap());
        flag.store(true, AtomicOrdering::Relaxed);
        assert_eq!(sorter.next().unwrap_err().code(), ErrorCode::Interrupt);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut sorter = sorter_with_limits(8, 24);
        for v in 0..30i64 {
            sorter.write(&make_int_record(v)).unwrap();
        }
        sorter.rewind().unwrap();
        sorter.reset();
        assert_eq!(sorter.pma_count(), 0);
        sorter.write(&make_int_record(2)).unwrap();
        sorter.write(&make_int_record(1)).unwrap();
        assert!(!sorter.rewind().unwrap());
        assert_eq!(drain_ints(&mut sorter), vec![1, 2]);
    }
}
