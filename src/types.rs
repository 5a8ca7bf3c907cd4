//! Core type aliases shared across the storage and sort layers.

/// Page number. Page numbers start at 1; 0 terminates chains.
pub type Pgno = u32;

/// Integer key of a table tree entry.
pub type RowId = i64;
