//! Typed payload access across the local cell bytes and the overflow
//! chain.
//!
//! Reads satisfy as much as possible from the local portion of the cell,
//! then continue into the overflow chain. Writes are restricted to
//! incremental-blob handles and never change the payload size.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::CellInfo;
use super::overflow;
use super::page::MemPage;
use super::BtShared;

/// Read `amt` payload bytes starting at `offset`.
pub fn read_payload(
    shared: &mut BtShared,
    page: &MemPage,
    info: &CellInfo,
    offset: u32,
    amt: u32,
    cache: Option<&mut Vec<Pgno>>,
) -> Result<Vec<u8>> {
    let end = offset
        .checked_add(amt)
        .ok_or(Error::new(ErrorCode::Range))?;
    if end > info.n_payload {
        return Err(Error::new(ErrorCode::Range));
    }
    let mut out = vec![0u8; amt as usize];
    let mut filled = 0usize;

    let local = info.n_local as u32;
    if offset < local {
        let take = (local - offset).min(amt) as usize;
        let start = info.payload_offset() + offset as usize;
        out[..take].copy_from_slice(&page.data[start..start + take]);
        filled = take;
    }

    if filled < amt as usize {
        let head = info.overflow_pgno(page)?;
        let chain_offset = (offset + filled as u32 - local) as usize;
        overflow::read_chain(shared, head, chain_offset, &mut out[filled..], cache)?;
    }
    Ok(out)
}

/// The complete payload of a cell.
pub fn cell_payload(
    shared: &mut BtShared,
    page: &MemPage,
    info: &CellInfo,
) -> Result<Vec<u8>> {
    read_payload(shared, page, info, 0, info.n_payload, None)
}

/// Overwrite `buf.len()` payload bytes starting at `offset`. The caller
/// (an incremental-blob cursor) guarantees the write stays within the
/// existing payload; the local portion is updated through the pager and
/// `page` is refreshed to match.
pub fn write_payload(
    shared: &mut BtShared,
    page: &mut MemPage,
    info: &CellInfo,
    offset: u32,
    buf: &[u8],
    cache: Option<&mut Vec<Pgno>>,
) -> Result<()> {
    let end = offset
        .checked_add(buf.len() as u32)
        .ok_or(Error::new(ErrorCode::Range))?;
    if end > info.n_payload {
        return Err(Error::new(ErrorCode::Range));
    }
    let mut consumed = 0usize;

    let local = info.n_local as u32;
    if offset < local {
        let take = (local - offset).min(buf.len() as u32) as usize;
        let start = info.payload_offset() + offset as usize;
        let mut db_page = shared.pager.get(page.pgno)?;
        shared.pager.write(&mut db_page)?;
        db_page.data.copy_from_slice(&page.data);
        db_page.data[start..start + take].copy_from_slice(&buf[..take]);
        shared.pager.write_page_to_cache(&db_page);
        page.data[start..start + take].copy_from_slice(&buf[..take]);
        consumed = take;
    }

    if consumed < buf.len() {
        let head = info.overflow_pgno(page)?;
        let chain_offset = (offset + consumed as u32 - local) as usize;
        overflow::write_chain_at(shared, head, chain_offset, &buf[consumed..], cache)?;
    }
    Ok(())
}
