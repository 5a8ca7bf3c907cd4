//! B-tree type definitions, constants, and bitflags.

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u16, read_u32};

// Page flag bits. The flags byte is the first byte of the page header.
pub const PTF_INTKEY: u8 = 0x01;
pub const PTF_ZERODATA: u8 = 0x02;
pub const PTF_LEAFDATA: u8 = 0x04;
pub const PTF_LEAF: u8 = 0x08;
pub const PTF_TABLE_LEAF: u8 = PTF_INTKEY | PTF_LEAFDATA | PTF_LEAF;
pub const PTF_TABLE_INTERIOR: u8 = PTF_INTKEY | PTF_LEAFDATA;
pub const PTF_INDEX_LEAF: u8 = PTF_LEAF | PTF_ZERODATA;
pub const PTF_INDEX_INTERIOR: u8 = PTF_ZERODATA;

pub const PAGE_HEADER_SIZE_LEAF: usize = 8;
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;
pub const CELL_PTR_SIZE: usize = 2;
pub const MIN_CELL_SIZE: usize = 4;
pub const MAX_PAGE_SIZE: u32 = 65536;
pub const MIN_PAGE_SIZE: u32 = 512;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

// Payload-bound scale factors; part of the on-disk format contract.
pub const MAX_EMBEDDED_FRACTION: u32 = 64;
pub const MIN_EMBEDDED_FRACTION: u32 = 32;

/// Maximum root-to-leaf depth a cursor can track.
pub const BTCURSOR_MAX_DEPTH: usize = 20;

/// Maximum number of cells the page staging area holds before a balance
/// is required.
pub const MAX_OVERFLOW_CELLS: usize = 5;

// Tree kinds accepted by create_table.
pub const BTREE_INTKEY: u8 = 1;
pub const BTREE_BLOBKEY: u8 = 2;

/// Database file magic.
pub const FILE_HEADER_MAGIC: &[u8; 16] = b"corelite fmt 1\0\0";
/// Size of the file header on page 1; the b-tree header of page 1 starts
/// right after it.
pub const FILE_HEADER_SIZE: usize = 100;

// Sort order flags for KeyInfo columns.
pub const KEYINFO_ORDER_DESC: u8 = 0x01;
pub const KEYINFO_ORDER_NULLS_FIRST: u8 = 0x02;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeOpenFlags: u8 {
        const OMIT_JOURNAL = 0x01;
        const MEMORY = 0x02;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtsFlags: u16 {
        const READ_ONLY = 0x0001;
        const PAGESIZE_FIXED = 0x0002;
        const INITIALLY_EMPTY = 0x0010;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorFlags: u8 {
        const WRITE = 0x01;
        const INCRBLOB = 0x10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransState {
    None = 0,
    Read = 1,
    Write = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BtLock {
    Read = 1,
    Write = 2,
}

/// Cursor lifecycle tag.
///
/// `Valid`: positioned on an entry. `Invalid`: no entry (empty tree, ran
/// off either end, or never positioned). `RequireSeek`: the tree changed
/// under the cursor; the position was saved and `restore_position` must
/// run before the cursor is used. `Fault`: the shared cache is
/// inconsistent; every use returns the stored error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CursorState {
    Invalid = 0,
    Valid = 1,
    RequireSeek = 2,
    Fault = 3,
}

/// Per-size payload bounds derived from the usable page size. These drive
/// the overflow spill formula and are part of the file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadLimits {
    pub max_local: u16,
    pub min_local: u16,
    pub max_leaf: u16,
    pub min_leaf: u16,
}

impl PayloadLimits {
    pub fn for_usable_size(usable: u32) -> Self {
        let max_local = (usable - 12) * MAX_EMBEDDED_FRACTION / 255 - 23;
        let min_local = (usable - 12) * MIN_EMBEDDED_FRACTION / 255 - 23;
        let max_leaf = usable - 35;
        Self {
            max_local: max_local as u16,
            min_local: min_local as u16,
            max_leaf: max_leaf as u16,
            min_leaf: min_local as u16,
        }
    }
}

/// Database file header, stored in the first 100 bytes of page 1.
///
/// Layout: magic (0..16), page size (16..18), file format (18), reserved
/// bytes per page (20), free page count (36..40), schema cookie (40..44).
pub struct DbHeader {
    pub page_size: u32,
    pub reserve: u8,
    pub file_format: u8,
    pub free_page_count: u32,
    pub schema_cookie: u32,
}

impl DbHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        if &data[0..16] != FILE_HEADER_MAGIC {
            return Err(Error::with_message(ErrorCode::Corrupt, "bad magic"));
        }
        let mut page_size = read_u16(data, 16).ok_or(Error::new(ErrorCode::Corrupt))? as u32;
        if page_size == 1 {
            page_size = 65536;
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let file_format = data[18];
        let reserve = data[20];
        let free_page_count = read_u32(data, 36).unwrap_or(0);
        let schema_cookie = read_u32(data, 40).unwrap_or(0);
        Ok(Self {
            page_size,
            reserve,
            file_format,
            free_page_count,
            schema_cookie,
        })
    }

    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        use super::encoding::{write_u16, write_u32};
        if data.len() < FILE_HEADER_SIZE {
            return Err(Error::new(ErrorCode::Internal));
        }
        data[0..16].copy_from_slice(FILE_HEADER_MAGIC);
        let encoded = if self.page_size == 65536 {
            1u16
        } else {
            self.page_size as u16
        };
        write_u16(data, 16, encoded)?;
        data[18] = self.file_format;
        data[20] = self.reserve;
        write_u32(data, 36, self.free_page_count)?;
        write_u32(data, 40, self.schema_cookie)?;
        Ok(())
    }
}

/// Offset of the free-page-count field within the file header.
pub const HDR_FREE_PAGE_COUNT: usize = 36;

/// B-tree table lock entry for shared cursors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableLockEntry {
    pub(crate) root: Pgno,
    pub(crate) owner: u64,
    pub(crate) lock: BtLock,
}
