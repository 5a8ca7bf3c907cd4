//! Cell parsing and assembly.
//!
//! A cell is laid out as
//! `[child ptr (4, interior only)][payload varint][key varint | (index trees: none)]
//! [local payload][overflow page number (4, only when spilled)]`.
//! Table trees put the integer key after the payload length; index trees
//! have no separate key, the payload *is* the key.
//!
//! The split between local payload and the overflow chain is computed by
//! [`local_payload_size`]. Changing that distribution in any way produces
//! an incompatible file format.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, read_varint, read_varint32, write_varint};
use super::page::MemPage;
use super::types::MIN_CELL_SIZE;

/// A parse of one cell, derived from the page image; never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CellInfo {
    /// Offset of the cell within its page.
    pub cell_offset: u16,
    /// Integer key for table trees; payload length for index trees.
    pub n_key: i64,
    /// Bytes of data payload (zero on index and interior pages).
    pub n_data: u32,
    /// Total payload bytes, local and spilled together.
    pub n_payload: u32,
    /// Size of the cell header (child pointer + varints).
    pub n_header: u16,
    /// Payload bytes stored on the page itself.
    pub n_local: u16,
    /// Offset, within the cell, of the first-overflow-page number;
    /// zero when the payload is fully local.
    pub overflow_offset: u16,
    /// Total size of the cell on this page.
    pub n_size: u16,
}

impl CellInfo {
    pub fn has_overflow(&self) -> bool {
        self.overflow_offset != 0
    }

    /// First page of the overflow chain, read from the page image.
    pub fn overflow_pgno(&self, page: &MemPage) -> Result<Pgno> {
        if !self.has_overflow() {
            return Err(Error::new(ErrorCode::Internal));
        }
        let at = self.cell_offset as usize + self.overflow_offset as usize;
        read_u32(&page.data, at).ok_or(Error::new(ErrorCode::Corrupt))
    }

    /// Offset of the local payload within the page.
    pub fn payload_offset(&self) -> usize {
        self.cell_offset as usize + self.n_header as usize
    }
}

/// How much of an `n_payload`-byte payload stays on the page. Payloads up
/// to `max_local` are fully local; larger ones keep
/// `min_local + (n_payload - min_local) % (usable - 4)` bytes when that
/// stays within `max_local`, else exactly `min_local`. This minimizes
/// wasted space on the last overflow page while keeping the local share
/// within `[min_local, max_local]`.
pub fn local_payload_size(page: &MemPage, n_payload: u32) -> u16 {
    let max_local = page.max_local as u32;
    if n_payload <= max_local {
        return n_payload as u16;
    }
    let min_local = page.min_local as u32;
    let ovfl_space = page.usable_size - 4;
    let surplus = min_local + (n_payload - min_local) % ovfl_space;
    if surplus <= max_local {
        surplus as u16
    } else {
        min_local as u16
    }
}

/// Parse cell `index` of `page`.
pub fn parse_cell(page: &MemPage, index: u16) -> Result<CellInfo> {
    parse_cell_at(page, page.cell_ptr(index)?)
}

/// Parse the cell starting at `cell_offset`.
pub fn parse_cell_at(page: &MemPage, cell_offset: u16) -> Result<CellInfo> {
    let start = cell_offset as usize;
    if start >= page.data.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }

    let mut n = page.child_ptr_size as usize;
    let payload: u32;
    let n_key: i64;
    let n_data: u32;

    if page.is_intkey {
        if page.has_data {
            let (p, used) = read_varint32(&page.data, start + n)?;
            payload = p;
            n += used;
        } else {
            payload = 0;
        }
        let (key, used) = read_varint(&page.data, start + n)?;
        n_key = key as i64;
        n += used;
        n_data = payload;
    } else {
        let (p, used) = read_varint32(&page.data, start + n)?;
        payload = p;
        n += used;
        n_key = payload as i64;
        n_data = 0;
    }

    let mut info = CellInfo {
        cell_offset,
        n_key,
        n_data,
        n_payload: payload,
        n_header: n as u16,
        ..CellInfo::default()
    };

    if payload <= page.max_local as u32 {
        // Common case: the whole payload is local.
        info.n_local = payload as u16;
        info.n_size = ((n as u32 + payload).max(MIN_CELL_SIZE as u32)) as u16;
        info.overflow_offset = 0;
        let end = start + n + payload as usize;
        if end > page.data.len() {
            return Err(Error::new(ErrorCode::Corrupt));
        }
    } else {
        let local = local_payload_size(page, payload);
        info.n_local = local;
        info.overflow_offset = local + n as u16;
        info.n_size = info.overflow_offset + 4;
        let end = start + info.n_size as usize;
        if end > page.data.len() {
            return Err(Error::new(ErrorCode::Corrupt));
        }
    }
    Ok(info)
}

/// Payload handed to cell assembly.
pub struct BtreePayload {
    /// Key bytes for index trees.
    pub key: Option<Vec<u8>>,
    /// Integer key for table trees.
    pub n_key: i64,
    /// Data bytes for table trees.
    pub data: Option<Vec<u8>>,
    /// Trailing zero bytes appended to the data.
    pub n_zero: u32,
}

impl BtreePayload {
    pub fn table(n_key: i64, data: Vec<u8>) -> Self {
        Self {
            key: None,
            n_key,
            data: Some(data),
            n_zero: 0,
        }
    }

    pub fn index(key: Vec<u8>) -> Self {
        Self {
            key: Some(key),
            n_key: 0,
            data: None,
            n_zero: 0,
        }
    }
}

/// A cell assembled for insertion. When the payload spills, `cell` ends
/// with 4 zero bytes reserved for the first overflow page number — the
/// caller allocates the chain for `spill` and patches them.
pub struct AssembledCell {
    pub cell: Vec<u8>,
    pub spill: Vec<u8>,
}

impl AssembledCell {
    pub fn has_spill(&self) -> bool {
        !self.spill.is_empty()
    }

    /// Patch the reserved tail with the overflow chain head.
    pub fn set_overflow_pgno(&mut self, pgno: Pgno) {
        debug_assert!(self.has_spill());
        let at = self.cell.len() - 4;
        self.cell[at..].copy_from_slice(&pgno.to_be_bytes());
    }
}

/// Build a leaf cell for `payload` on a page shaped like `page`.
pub fn assemble_cell(page: &MemPage, payload: &BtreePayload) -> Result<AssembledCell> {
    if !page.is_leaf {
        return Err(Error::new(ErrorCode::Internal));
    }
    let mut cell = Vec::new();
    let full: Vec<u8>;

    if page.is_intkey {
        let data = payload.data.as_deref().unwrap_or(&[]);
        let n_payload = data.len() as u32 + payload.n_zero;
        write_varint(n_payload as u64, &mut cell);
        write_varint(payload.n_key as u64, &mut cell);
        let mut buf = Vec::with_capacity(n_payload as usize);
        buf.extend_from_slice(data);
        buf.resize(n_payload as usize, 0);
        full = buf;
    } else {
        let key = payload
            .key
            .as_deref()
            .ok_or(Error::with_message(ErrorCode::Misuse, "index cell without key"))?;
        write_varint(key.len() as u64, &mut cell);
        full = key.to_vec();
    }

    let n_payload = full.len() as u32;
    let local = local_payload_size(page, n_payload) as usize;
    cell.extend_from_slice(&full[..local]);
    let spill = full[local..].to_vec();
    if !spill.is_empty() {
        // Reserve the overflow pointer slot.
        cell.extend_from_slice(&[0u8; 4]);
    }
    Ok(AssembledCell { cell, spill })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::page::MemPage;
    use crate::storage::btree::types::{
        PayloadLimits, PTF_INDEX_LEAF, PTF_TABLE_INTERIOR, PTF_TABLE_LEAF,
    };

    fn page(flags: u8) -> MemPage {
        let limits = PayloadLimits::for_usable_size(1024);
        MemPage::zeroed(2, 1024, 1024, flags, limits).unwrap()
    }

    #[test]
    fn test_local_payload_boundaries() {
        let leaf = page(PTF_TABLE_LEAF);
        let max_local = leaf.max_local as u32;
        assert_eq!(local_payload_size(&leaf, max_local), max_local as u16);
        // One byte past the boundary spills.
        let local = local_payload_size(&leaf, max_local + 1);
        assert!(local < (max_local + 1) as u16);
        assert!(local >= leaf.min_local);
    }

    #[test]
    fn test_spill_formula_modular_distribution() {
        let leaf = page(PTF_TABLE_LEAF);
        let min_local = leaf.min_local as u32;
        let usable = leaf.usable_size - 4;
        let n_payload = 4000u32;
        let surplus = min_local + (n_payload - min_local) % usable;
        let expect = if surplus <= leaf.max_local as u32 {
            surplus
        } else {
            min_local
        };
        assert_eq!(local_payload_size(&leaf, n_payload) as u32, expect);
    }

    #[test]
    fn test_parse_assemble_roundtrip_inline() {
        let mut p = page(PTF_TABLE_LEAF);
        let assembled =
            assemble_cell(&p, &BtreePayload::table(42, b"hello".to_vec())).unwrap();
        assert!(!assembled.has_spill());
        p.insert_cell(0, assembled.cell.clone()).unwrap();
        let info = parse_cell(&p, 0).unwrap();
        assert_eq!(info.n_key, 42);
        assert_eq!(info.n_payload, 5);
        assert_eq!(info.n_local, 5);
        assert!(!info.has_overflow());
        let start = info.payload_offset();
        assert_eq!(&p.data[start..start + 5], b"hello");
        // The cell bytes on the page equal the assembled bytes.
        let ptr = p.cell_ptr(0).unwrap() as usize;
        assert_eq!(&p.data[ptr..ptr + assembled.cell.len()], &assembled.cell[..]);
    }

    #[test]
    fn test_assemble_spills_past_max_local() {
        let p = page(PTF_TABLE_LEAF);
        let big = vec![0xabu8; p.max_local as usize + 1];
        let mut assembled = assemble_cell(&p, &BtreePayload::table(1, big)).unwrap();
        assert!(assembled.has_spill());
        assembled.set_overflow_pgno(9);
        let tail = &assembled.cell[assembled.cell.len() - 4..];
        assert_eq!(tail, &9u32.to_be_bytes());
    }

    #[test]
    fn test_parse_spilled_cell() {
        let mut p = page(PTF_TABLE_LEAF);
        let n_payload = 4000u32;
        let big = vec![0x5au8; n_payload as usize];
        let mut assembled = assemble_cell(&p, &BtreePayload::table(3, big)).unwrap();
        assembled.set_overflow_pgno(7);
        p.insert_cell(0, assembled.cell).unwrap();
        let info = parse_cell(&p, 0).unwrap();
        assert_eq!(info.n_payload, n_payload);
        assert_eq!(info.n_local, local_payload_size(&p, n_payload));
        assert!(info.has_overflow());
        assert_eq!(info.overflow_pgno(&p).unwrap(), 7);
        assert_eq!(info.n_size, info.overflow_offset + 4);
    }

    #[test]
    fn test_index_cell_key_is_payload() {
        let mut p = page(PTF_INDEX_LEAF);
        let assembled =
            assemble_cell(&p, &BtreePayload::index(b"composite-key".to_vec())).unwrap();
        p.insert_cell(0, assembled.cell).unwrap();
        let info = parse_cell(&p, 0).unwrap();
        assert_eq!(info.n_key, 13);
        assert_eq!(info.n_payload, 13);
        assert_eq!(info.n_data, 0);
    }

    #[test]
    fn test_table_interior_cell() {
        let p = page(PTF_TABLE_INTERIOR);
        // Interior table cell: child pointer then key varint only.
        let mut cell = vec![0, 0, 0, 5];
        write_varint(1000, &mut cell);
        let mut p2 = p;
        p2.insert_cell(0, cell).unwrap();
        let info = parse_cell(&p2, 0).unwrap();
        assert_eq!(info.n_key, 1000);
        assert_eq!(info.n_payload, 0);
        assert_eq!(info.n_local, 0);
        assert_eq!(p2.child_pgno(0).unwrap(), 5);
    }

    #[test]
    fn test_minimum_cell_size() {
        let mut p = page(PTF_TABLE_LEAF);
        let assembled = assemble_cell(&p, &BtreePayload::table(1, Vec::new())).unwrap();
        assert_eq!(assembled.cell.len(), 2);
        p.insert_cell(0, assembled.cell).unwrap();
        let info = parse_cell(&p, 0).unwrap();
        assert_eq!(info.n_size, 4);
    }

    #[test]
    fn test_zero_padded_payload() {
        let mut p = page(PTF_TABLE_LEAF);
        let mut payload = BtreePayload::table(8, b"ab".to_vec());
        payload.n_zero = 3;
        let assembled = assemble_cell(&p, &payload).unwrap();
        p.insert_cell(0, assembled.cell).unwrap();
        let info = parse_cell(&p, 0).unwrap();
        assert_eq!(info.n_payload, 5);
        let start = info.payload_offset();
        assert_eq!(&p.data[start..start + 5], b"ab\0\0\0");
    }
}
