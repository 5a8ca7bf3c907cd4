//! Single-page layout: header, cell index array, free-block chain, and
//! the overflow-cell staging area.
//!
//! Page layout: an 8-byte header (12 on interior pages, which append the
//! right-most child pointer), the cell index array of big-endian 16-bit
//! offsets, a gap, then cell content growing from the tail of the usable
//! area. Freed cell space is threaded into a chain of free blocks sorted
//! by offset; fragments under 4 bytes are only counted. On page 1 the
//! header starts after the 100-byte file header.
//!
//! After every public operation the page is either well-formed or carries
//! staged overflow cells in `a_ovfl`; the balancer is the only consumer of
//! that staging area.

use smallvec::SmallVec;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::parse_cell_at;
use super::encoding::{read_u16, read_u32, write_u16, write_u32};
use super::types::{
    PayloadLimits, CELL_PTR_SIZE, FILE_HEADER_SIZE, MAX_OVERFLOW_CELLS, MIN_CELL_SIZE,
    PAGE_HEADER_SIZE_INTERIOR, PAGE_HEADER_SIZE_LEAF, PTF_INDEX_INTERIOR, PTF_INDEX_LEAF,
    PTF_TABLE_INTERIOR, PTF_TABLE_LEAF,
};

/// A cell that did not fit on the page, staged together with the index it
/// is meant to occupy.
#[derive(Clone, Debug)]
pub struct OvflCell {
    pub idx: u16,
    pub cell: Vec<u8>,
}

/// In-memory image of one B-tree page plus decoded header fields.
#[derive(Clone)]
pub struct MemPage {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub is_init: bool,
    pub is_leaf: bool,
    pub is_intkey: bool,
    pub is_zerodata: bool,
    /// Cells carry a data payload (table leaves).
    pub has_data: bool,
    pub child_ptr_size: u8,
    pub hdr_offset: u16,
    pub max_local: u16,
    pub min_local: u16,
    pub usable_size: u32,
    pub n_cell: u16,
    /// Start of the cell content area. Stored as u32 because a 65536-byte
    /// page encodes it as 0 on disk.
    pub cell_content: u32,
    pub first_freeblock: u16,
    pub n_frag: u8,
    pub n_free: i32,
    pub rightmost_ptr: Option<Pgno>,
    pub a_ovfl: SmallVec<[OvflCell; 2]>,
}

fn decode_flags(flags: u8) -> Result<(bool, bool, bool, bool)> {
    // (leaf, intkey, zerodata, has_data)
    match flags {
        PTF_TABLE_LEAF => Ok((true, true, false, true)),
        PTF_TABLE_INTERIOR => Ok((false, true, false, false)),
        PTF_INDEX_LEAF => Ok((true, false, true, false)),
        PTF_INDEX_INTERIOR => Ok((false, false, true, false)),
        _ => Err(Error::with_message(ErrorCode::Corrupt, "bad page flags")),
    }
}

impl MemPage {
    /// Initialize a fresh page image carrying `flags`.
    pub fn zeroed(
        pgno: Pgno,
        page_size: u32,
        usable_size: u32,
        flags: u8,
        limits: PayloadLimits,
    ) -> Result<MemPage> {
        let (is_leaf, is_intkey, is_zerodata, has_data) = decode_flags(flags)?;
        let hdr_offset = if pgno == 1 { FILE_HEADER_SIZE as u16 } else { 0 };
        let mut page = MemPage {
            pgno,
            data: vec![0u8; page_size as usize],
            is_init: true,
            is_leaf,
            is_intkey,
            is_zerodata,
            has_data,
            child_ptr_size: if is_leaf { 0 } else { 4 },
            hdr_offset,
            max_local: 0,
            min_local: 0,
            usable_size,
            n_cell: 0,
            cell_content: usable_size,
            first_freeblock: 0,
            n_frag: 0,
            n_free: 0,
            rightmost_ptr: if is_leaf { None } else { Some(0) },
            a_ovfl: SmallVec::new(),
        };
        page.apply_limits(limits);
        let hdr = page.hdr();
        page.data[hdr] = flags;
        page.n_free =
            usable_size as i32 - page.hdr() as i32 - page.header_size() as i32;
        page.write_header()?;
        Ok(page)
    }

    /// Decode a page image read from the pager.
    pub fn init_from_disk(
        pgno: Pgno,
        data: Vec<u8>,
        usable_size: u32,
        limits: PayloadLimits,
    ) -> Result<MemPage> {
        let hdr_offset: u16 = if pgno == 1 { FILE_HEADER_SIZE as u16 } else { 0 };
        let hdr = hdr_offset as usize;
        if data.len() < hdr + PAGE_HEADER_SIZE_LEAF {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let flags = data[hdr];
        let (is_leaf, is_intkey, is_zerodata, has_data) = decode_flags(flags)?;
        let first_freeblock = read_u16(&data, hdr + 1).ok_or(Error::new(ErrorCode::Corrupt))?;
        let n_cell = read_u16(&data, hdr + 3).ok_or(Error::new(ErrorCode::Corrupt))?;
        let raw_content = read_u16(&data, hdr + 5).ok_or(Error::new(ErrorCode::Corrupt))?;
        let cell_content = if raw_content == 0 {
            65536
        } else {
            raw_content as u32
        };
        let n_frag = data[hdr + 7];
        let rightmost_ptr = if is_leaf {
            None
        } else {
            Some(read_u32(&data, hdr + 8).ok_or(Error::new(ErrorCode::Corrupt))?)
        };
        let mut page = MemPage {
            pgno,
            data,
            is_init: true,
            is_leaf,
            is_intkey,
            is_zerodata,
            has_data,
            child_ptr_size: if is_leaf { 0 } else { 4 },
            hdr_offset,
            max_local: 0,
            min_local: 0,
            usable_size,
            n_cell,
            cell_content,
            first_freeblock,
            n_frag,
            n_free: 0,
            rightmost_ptr,
            a_ovfl: SmallVec::new(),
        };
        page.apply_limits(limits);
        if (page.ptr_array_end() as u32) > page.cell_content
            || page.cell_content > usable_size
        {
            return Err(Error::with_message(ErrorCode::Corrupt, "cell content overlap"));
        }
        page.n_free = page.compute_free_space()?;
        Ok(page)
    }

    fn apply_limits(&mut self, limits: PayloadLimits) {
        if self.is_intkey {
            self.max_local = limits.max_leaf;
            self.min_local = limits.min_leaf;
        } else {
            self.max_local = limits.max_local;
            self.min_local = limits.min_local;
        }
    }

    #[inline]
    pub fn hdr(&self) -> usize {
        self.hdr_offset as usize
    }

    pub fn flags_byte(&self) -> u8 {
        self.data[self.hdr()]
    }

    pub fn header_size(&self) -> usize {
        if self.is_leaf {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        }
    }

    #[inline]
    pub fn ptr_array_start(&self) -> usize {
        self.hdr() + self.header_size()
    }

    #[inline]
    pub fn ptr_array_end(&self) -> usize {
        self.ptr_array_start() + self.n_cell as usize * CELL_PTR_SIZE
    }

    /// Number of staged overflow cells.
    pub fn n_overflow(&self) -> usize {
        self.a_ovfl.len()
    }

    pub fn is_overfull(&self) -> bool {
        !self.a_ovfl.is_empty()
    }

    /// A page holding less than a third of its usable space is underfull
    /// and triggers a balance.
    pub fn is_underfull(&self) -> bool {
        self.n_free > (self.usable_size as i32) * 2 / 3
    }

    /// Sync decoded header fields back into the page image.
    pub fn write_header(&mut self) -> Result<()> {
        let hdr = self.hdr();
        write_u16(&mut self.data, hdr + 1, self.first_freeblock)?;
        write_u16(&mut self.data, hdr + 3, self.n_cell)?;
        let raw_content = if self.cell_content == 65536 {
            0
        } else {
            self.cell_content as u16
        };
        write_u16(&mut self.data, hdr + 5, raw_content)?;
        self.data[hdr + 7] = self.n_frag;
        if let Some(rightmost) = self.rightmost_ptr {
            write_u32(&mut self.data, hdr + 8, rightmost)?;
        }
        Ok(())
    }

    /// Offset of cell `index` within the page.
    pub fn cell_ptr(&self, index: u16) -> Result<u16> {
        if index >= self.n_cell {
            return Err(Error::new(ErrorCode::Range));
        }
        let offset = self.ptr_array_start() + index as usize * CELL_PTR_SIZE;
        let ptr = read_u16(&self.data, offset).ok_or(Error::new(ErrorCode::Corrupt))?;
        if (ptr as u32) < self.hdr() as u32 + self.header_size() as u32
            || ptr as u32 >= self.usable_size
        {
            return Err(Error::with_message(ErrorCode::Corrupt, "cell pointer out of range"));
        }
        Ok(ptr)
    }

    /// Child page number for child position `index`; `index == n_cell`
    /// resolves to the right-most pointer.
    pub fn child_pgno(&self, index: u16) -> Result<Pgno> {
        if self.is_leaf {
            return Err(Error::new(ErrorCode::Internal));
        }
        if index == self.n_cell {
            return self.rightmost_ptr.ok_or(Error::new(ErrorCode::Corrupt));
        }
        let ptr = self.cell_ptr(index)? as usize;
        read_u32(&self.data, ptr).ok_or(Error::new(ErrorCode::Corrupt))
    }

    pub fn set_child_pgno(&mut self, index: u16, pgno: Pgno) -> Result<()> {
        if self.is_leaf {
            return Err(Error::new(ErrorCode::Internal));
        }
        if index == self.n_cell {
            self.rightmost_ptr = Some(pgno);
            let hdr = self.hdr();
            return write_u32(&mut self.data, hdr + 8, pgno);
        }
        let ptr = self.cell_ptr(index)? as usize;
        write_u32(&mut self.data, ptr, pgno)
    }

    fn compute_free_space(&self) -> Result<i32> {
        let gap = self.cell_content as i32 - self.ptr_array_end() as i32;
        if gap < 0 {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let mut n_free = gap + self.n_frag as i32;

        let usable_end = self.usable_size as usize;
        let mut pc = self.first_freeblock as usize;
        let mut prev_end = 0usize;
        let max_blocks = usable_end / 4;
        let mut steps = 0usize;
        while pc != 0 {
            if pc + 4 > usable_end || pc < prev_end {
                return Err(Error::with_message(ErrorCode::Corrupt, "free block chain"));
            }
            let size = read_u16(&self.data, pc + 2).ok_or(Error::new(ErrorCode::Corrupt))?;
            if size < 4 || pc + size as usize > usable_end {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            n_free += size as i32;
            prev_end = pc + size as usize;
            pc = read_u16(&self.data, pc).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
            steps += 1;
            if steps > max_blocks {
                return Err(Error::new(ErrorCode::Corrupt));
            }
        }
        Ok(n_free)
    }

    /// Allocate `n_byte` bytes of cell space. Searches the free-block
    /// chain first, then the gap between the cell index array and the
    /// content area; defragments when the gap is too small but the total
    /// free space suffices.
    pub fn allocate_space(&mut self, n_byte: usize) -> Result<u16> {
        let n_byte = n_byte.max(4);
        if (self.n_free as usize) < n_byte {
            return Err(Error::new(ErrorCode::Full));
        }

        // Free-block chain search (first fit).
        let hdr = self.hdr();
        let mut prev_ptr_offset = hdr + 1;
        let mut pc = self.first_freeblock as usize;
        while pc != 0 {
            let next = read_u16(&self.data, pc).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
            let size = read_u16(&self.data, pc + 2).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
            if size >= n_byte {
                if size < n_byte + 4 {
                    // Too small to split; the leftover becomes a fragment.
                    write_u16(&mut self.data, prev_ptr_offset, next as u16)?;
                    if prev_ptr_offset == hdr + 1 {
                        self.first_freeblock = next as u16;
                    }
                    let leftover = (size - n_byte) as u8;
                    if leftover > 0 {
                        self.n_frag = self.n_frag.saturating_add(leftover);
                        self.data[hdr + 7] = self.n_frag;
                    }
                    self.n_free -= n_byte as i32;
                    return Ok(pc as u16);
                }
                // Allocate from the tail of the block.
                let new_size = size - n_byte;
                write_u16(&mut self.data, pc + 2, new_size as u16)?;
                self.n_free -= n_byte as i32;
                return Ok((pc + new_size) as u16);
            }
            prev_ptr_offset = pc;
            pc = next;
        }

        // Gap between the index array and the content area.
        let gap = self.cell_content as usize - self.ptr_array_end();
        if gap < n_byte {
            self.defragment()?;
        }
        let gap = self.cell_content as usize - self.ptr_array_end();
        if gap < n_byte {
            return Err(Error::new(ErrorCode::Full));
        }
        self.cell_content -= n_byte as u32;
        let offset = self.cell_content;
        self.n_free -= n_byte as i32;
        self.write_header()?;
        Ok(offset as u16)
    }

    /// Return `size` bytes at `offset` to the free-block chain, coalescing
    /// with adjacent blocks. Blocks under 4 bytes become fragments.
    pub fn free_space(&mut self, offset: u16, size: u16) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let hdr = self.hdr();
        let start = offset as usize;
        let mut size = size as usize;
        let freed = size;

        if size < 4 {
            self.n_frag = self.n_frag.saturating_add(size as u8);
            self.data[hdr + 7] = self.n_frag;
            self.n_free += freed as i32;
            return Ok(());
        }

        // Find the insertion point; the chain is sorted by offset.
        let mut prev = 0usize; // 0 means the chain head lives in the header
        let mut pc = self.first_freeblock as usize;
        while pc != 0 && pc < start {
            prev = pc;
            pc = read_u16(&self.data, pc).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
        }
        if pc != 0 && start + size > pc {
            return Err(Error::with_message(ErrorCode::Corrupt, "freeing into free block"));
        }

        let mut start = start;
        let mut next_link = pc;

        // Coalesce with the following block.
        if pc != 0 && start + size == pc {
            let pc_size =
                read_u16(&self.data, pc + 2).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
            next_link = read_u16(&self.data, pc).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
            size += pc_size;
        }

        // Coalesce with the preceding block.
        if prev != 0 {
            let prev_size =
                read_u16(&self.data, prev + 2).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
            if prev + prev_size == start {
                start = prev;
                size += prev_size;
                prev = {
                    // The predecessor of `prev` stays linked to it.
                    let mut scan = 0usize;
                    let mut cur = self.first_freeblock as usize;
                    while cur != 0 && cur != start {
                        scan = cur;
                        cur = read_u16(&self.data, cur)
                            .ok_or(Error::new(ErrorCode::Corrupt))?
                            as usize;
                    }
                    scan
                };
            }
        }

        // Link the (possibly merged) block in.
        write_u16(&mut self.data, start, next_link as u16)?;
        write_u16(&mut self.data, start + 2, size as u16)?;
        if prev == 0 {
            self.first_freeblock = start as u16;
            write_u16(&mut self.data, hdr + 1, start as u16)?;
        } else {
            write_u16(&mut self.data, prev, start as u16)?;
        }

        // A block abutting the content area extends it instead.
        if start as u32 == self.cell_content {
            self.cell_content += size as u32;
            self.first_freeblock = next_link as u16;
            write_u16(&mut self.data, hdr + 1, next_link as u16)?;
            self.write_header()?;
        }

        self.n_free += freed as i32;
        Ok(())
    }

    /// Move all cells to the tail of the usable area, consolidating free
    /// space into a single gap.
    pub fn defragment(&mut self) -> Result<()> {
        let usable_end = self.usable_size as usize;
        let mut cells: Vec<(usize, Vec<u8>)> = Vec::with_capacity(self.n_cell as usize);
        for i in 0..self.n_cell {
            let ptr = self.cell_ptr(i)?;
            let info = parse_cell_at(self, ptr)?;
            let size = info.n_size as usize;
            cells.push((i as usize, self.data[ptr as usize..ptr as usize + size].to_vec()));
        }

        let mut write_offset = usable_end;
        for (index, cell) in &cells {
            write_offset -= cell.len();
            self.data[write_offset..write_offset + cell.len()].copy_from_slice(cell);
            let ptr_offset = self.ptr_array_start() + index * CELL_PTR_SIZE;
            write_u16(&mut self.data, ptr_offset, write_offset as u16)?;
        }

        self.first_freeblock = 0;
        self.n_frag = 0;
        self.cell_content = write_offset as u32;
        self.n_free = write_offset as i32 - self.ptr_array_end() as i32;
        self.write_header()?;
        Ok(())
    }

    /// Insert `cell` so it becomes cell `index`. When the page is already
    /// carrying staged cells, or the cell does not fit, it is staged in
    /// `a_ovfl` instead and the caller must balance.
    pub fn insert_cell(&mut self, index: u16, cell: Vec<u8>) -> Result<()> {
        let logical_count = self.n_cell as usize + self.a_ovfl.len();
        if (index as usize) > logical_count {
            return Err(Error::new(ErrorCode::Range));
        }
        if !self.a_ovfl.is_empty()
            || cell.len().max(MIN_CELL_SIZE) + CELL_PTR_SIZE > self.n_free as usize
        {
            if self.a_ovfl.len() >= MAX_OVERFLOW_CELLS {
                return Err(Error::with_message(ErrorCode::Internal, "staging area full"));
            }
            let pos = self
                .a_ovfl
                .iter()
                .position(|c| c.idx > index)
                .unwrap_or(self.a_ovfl.len());
            self.a_ovfl.insert(pos, OvflCell { idx: index, cell });
            return Ok(());
        }

        let offset = self.allocate_space(cell.len())?;
        self.data[offset as usize..offset as usize + cell.len()].copy_from_slice(&cell);

        // Shift the tail of the index array right and write the new entry.
        let insert_at = self.ptr_array_start() + index as usize * CELL_PTR_SIZE;
        let end = self.ptr_array_end();
        if insert_at < end {
            self.data.copy_within(insert_at..end, insert_at + CELL_PTR_SIZE);
        }
        write_u16(&mut self.data, insert_at, offset)?;
        self.n_cell += 1;
        self.n_free -= CELL_PTR_SIZE as i32;
        self.write_header()?;
        Ok(())
    }

    /// Remove cell `index`, returning its space to the free-block chain.
    pub fn drop_cell(&mut self, index: u16, size: u16) -> Result<()> {
        debug_assert!(self.a_ovfl.is_empty());
        let ptr = self.cell_ptr(index)?;
        self.free_space(ptr, size)?;

        let from = self.ptr_array_start() + (index as usize + 1) * CELL_PTR_SIZE;
        let to = self.ptr_array_start() + index as usize * CELL_PTR_SIZE;
        let end = self.ptr_array_end();
        self.data.copy_within(from..end, to);
        self.n_cell -= 1;
        self.n_free += CELL_PTR_SIZE as i32;
        self.write_header()?;
        Ok(())
    }

    /// The page's cells in logical order, with staged overflow cells
    /// spliced in at their intended positions.
    pub fn logical_cells(&self) -> Result<Vec<Vec<u8>>> {
        let total = self.n_cell as usize + self.a_ovfl.len();
        let mut cells = Vec::with_capacity(total);
        let mut ovfl = self.a_ovfl.iter().peekable();
        let mut real = 0u16;
        for j in 0..total {
            if let Some(staged) = ovfl.peek() {
                if staged.idx as usize == j {
                    cells.push(staged.cell.clone());
                    ovfl.next();
                    continue;
                }
            }
            let ptr = self.cell_ptr(real)?;
            let info = parse_cell_at(self, ptr)?;
            cells.push(self.data[ptr as usize..ptr as usize + info.n_size as usize].to_vec());
            real += 1;
        }
        Ok(cells)
    }

    /// Rewrite the content area from scratch with the given cells. The
    /// header flags, right-most pointer, and staging area are preserved.
    pub fn rebuild(&mut self, cells: &[Vec<u8>]) -> Result<()> {
        let usable_end = self.usable_size as usize;
        let ptr_start = self.ptr_array_start();
        let ptr_end = ptr_start + cells.len() * CELL_PTR_SIZE;

        // Every cell occupies at least MIN_CELL_SIZE bytes on the page.
        let total: usize = cells.iter().map(|c| c.len().max(MIN_CELL_SIZE)).sum();
        if ptr_end + total > usable_end {
            return Err(Error::new(ErrorCode::Full));
        }

        self.data[ptr_start..usable_end].fill(0);
        let mut write_offset = usable_end;
        for (i, cell) in cells.iter().enumerate() {
            write_offset -= cell.len().max(MIN_CELL_SIZE);
            self.data[write_offset..write_offset + cell.len()].copy_from_slice(cell);
            write_u16(&mut self.data, ptr_start + i * CELL_PTR_SIZE, write_offset as u16)?;
        }
        self.n_cell = cells.len() as u16;
        self.cell_content = write_offset as u32;
        self.first_freeblock = 0;
        self.n_frag = 0;
        self.n_free = write_offset as i32 - ptr_end as i32;
        self.write_header()?;
        Ok(())
    }

    /// (offset, size) pairs of the free-block chain, for tests.
    pub fn free_block_chain(&self) -> Vec<(u16, u16)> {
        let mut chain = Vec::new();
        let mut pc = self.first_freeblock as usize;
        let mut steps = 0;
        while pc != 0 && steps < 1000 {
            if pc + 4 > self.usable_size as usize {
                break;
            }
            let size = read_u16(&self.data, pc + 2).unwrap_or(0);
            chain.push((pc as u16, size));
            pc = read_u16(&self.data, pc).unwrap_or(0) as usize;
            steps += 1;
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::cell::parse_cell;
    use crate::storage::btree::encoding::write_varint;
    use crate::storage::btree::types::PTF_TABLE_LEAF;

    fn test_limits() -> PayloadLimits {
        PayloadLimits::for_usable_size(512)
    }

    fn leaf_page() -> MemPage {
        MemPage::zeroed(2, 512, 512, PTF_TABLE_LEAF, test_limits()).unwrap()
    }

    fn table_leaf_cell(key: i64, data: &[u8]) -> Vec<u8> {
        let mut cell = Vec::new();
        write_varint(data.len() as u64, &mut cell);
        write_varint(key as u64, &mut cell);
        cell.extend_from_slice(data);
        cell
    }

    #[test]
    fn test_zeroed_page_free_space() {
        let page = leaf_page();
        assert_eq!(page.n_free, 512 - 8);
        assert_eq!(page.cell_content, 512);
        assert_eq!(page.n_cell, 0);
    }

    #[test]
    fn test_insert_and_reparse() {
        let mut page = leaf_page();
        page.insert_cell(0, table_leaf_cell(7, b"abc")).unwrap();
        assert_eq!(page.n_cell, 1);
        let info = parse_cell(&page, 0).unwrap();
        assert_eq!(info.n_key, 7);
        assert_eq!(info.n_payload, 3);
    }

    #[test]
    fn test_insert_shifts_pointer_array() {
        let mut page = leaf_page();
        page.insert_cell(0, table_leaf_cell(1, b"a")).unwrap();
        page.insert_cell(1, table_leaf_cell(3, b"c")).unwrap();
        page.insert_cell(1, table_leaf_cell(2, b"b")).unwrap();
        let keys: Vec<i64> = (0..3)
            .map(|i| parse_cell(&page, i).unwrap().n_key)
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_cell_creates_free_block() {
        let mut page = leaf_page();
        page.insert_cell(0, table_leaf_cell(1, b"aaaa")).unwrap();
        page.insert_cell(1, table_leaf_cell(2, b"bbbb")).unwrap();
        let free_before = page.n_free;
        let info = parse_cell(&page, 0).unwrap();
        page.drop_cell(0, info.n_size).unwrap();
        assert_eq!(page.n_cell, 1);
        assert_eq!(page.n_free, free_before + info.n_size as i32 + 2);
        assert_eq!(parse_cell(&page, 0).unwrap().n_key, 2);
    }

    #[test]
    fn test_free_block_reuse() {
        let mut page = leaf_page();
        for i in 0..4 {
            page.insert_cell(i, table_leaf_cell(i as i64, b"xxxxxxxx")).unwrap();
        }
        let info = parse_cell(&page, 1).unwrap();
        page.drop_cell(1, info.n_size).unwrap();
        assert!(!page.free_block_chain().is_empty());
        // The next same-sized insert reuses the freed block.
        let content_before = page.cell_content;
        page.insert_cell(1, table_leaf_cell(10, b"yyyyyyyy")).unwrap();
        assert_eq!(page.cell_content, content_before);
    }

    #[test]
    fn test_free_block_coalesce_adjacent() {
        let mut page = leaf_page();
        for i in 0..3 {
            page.insert_cell(i, table_leaf_cell(i as i64, b"zzzzzzzz")).unwrap();
        }
        let size1 = parse_cell(&page, 1).unwrap().n_size;
        // Cells are laid out tail-first, so cell 1 sits just below cell 0.
        page.drop_cell(1, size1).unwrap();
        let size0 = parse_cell(&page, 0).unwrap().n_size;
        page.drop_cell(0, size0).unwrap();
        // Adjacent blocks merged into one.
        assert_eq!(page.free_block_chain().len(), 1);
    }

    #[test]
    fn test_small_free_becomes_fragment() {
        let mut page = leaf_page();
        page.free_space(200, 3).unwrap();
        assert_eq!(page.n_frag, 3);
        assert!(page.free_block_chain().is_empty());
    }

    #[test]
    fn test_defragment_consolidates() {
        let mut page = leaf_page();
        for i in 0..4 {
            page.insert_cell(i, table_leaf_cell(i as i64, b"dddddddd")).unwrap();
        }
        let info = parse_cell(&page, 2).unwrap();
        page.drop_cell(2, info.n_size).unwrap();
        let free = page.n_free;
        page.defragment().unwrap();
        assert_eq!(page.n_free, free);
        assert!(page.free_block_chain().is_empty());
        assert_eq!(page.n_frag, 0);
        let keys: Vec<i64> = (0..3)
            .map(|i| parse_cell(&page, i).unwrap().n_key)
            .collect();
        assert_eq!(keys, vec![0, 1, 3]);
    }

    #[test]
    fn test_insert_stages_when_full() {
        let mut page = leaf_page();
        let mut i = 0u16;
        loop {
            let cell = table_leaf_cell(i as i64, &[0u8; 32]);
            if cell.len() + 2 > page.n_free as usize {
                page.insert_cell(i, cell).unwrap();
                break;
            }
            page.insert_cell(i, cell).unwrap();
            i += 1;
        }
        assert_eq!(page.n_overflow(), 1);
        assert!(page.is_overfull());
        assert_eq!(page.a_ovfl[0].idx, i);
    }

    #[test]
    fn test_logical_cells_splices_staging() {
        let mut page = leaf_page();
        page.insert_cell(0, table_leaf_cell(1, b"a")).unwrap();
        page.insert_cell(1, table_leaf_cell(3, b"c")).unwrap();
        // Force a staged cell at logical position 1.
        page.a_ovfl.push(OvflCell {
            idx: 1,
            cell: table_leaf_cell(2, b"b"),
        });
        let cells = page.logical_cells().unwrap();
        assert_eq!(cells.len(), 3);
        let keys: Vec<u64> = cells
            .iter()
            .map(|c| {
                let (_, n1) = crate::storage::btree::encoding::read_varint_at(c, 0);
                crate::storage::btree::encoding::read_varint_at(c, n1).0
            })
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_rebuild_roundtrip() {
        let mut page = leaf_page();
        let cells = vec![
            table_leaf_cell(1, b"aa"),
            table_leaf_cell(2, b"bb"),
            table_leaf_cell(3, b"cc"),
        ];
        page.rebuild(&cells).unwrap();
        assert_eq!(page.n_cell, 3);
        let reparsed = page.logical_cells().unwrap();
        assert_eq!(reparsed, cells);
        // A rebuilt page re-initializes cleanly from its own image.
        let reloaded =
            MemPage::init_from_disk(2, page.data.clone(), 512, test_limits()).unwrap();
        assert_eq!(reloaded.n_cell, 3);
        assert_eq!(reloaded.n_free, page.n_free);
    }

    #[test]
    fn test_rebuild_too_large_fails() {
        let mut page = leaf_page();
        let cells: Vec<Vec<u8>> = (0..10).map(|i| table_leaf_cell(i, &[0u8; 64])).collect();
        assert_eq!(page.rebuild(&cells).unwrap_err().code(), ErrorCode::Full);
    }

    #[test]
    fn test_init_from_disk_rejects_bad_flags() {
        let mut data = vec![0u8; 512];
        data[0] = 0xff;
        assert!(MemPage::init_from_disk(2, data, 512, test_limits()).is_err());
    }
}
