//! corelite — storage and sort core of an embedded SQL database engine.
//!
//! Two subsystems:
//!
//! * a disk-backed, variable-length-key, paginated B+-tree with cursored
//!   traversal, insertion, deletion and rebalancing, spilling large
//!   payloads to overflow page chains ([`storage::btree`]);
//! * an external merge sorter accumulating records in memory, flushing
//!   presorted runs to a temporary file and merging them through a
//!   tournament tree ([`sorter`]).
//!
//! The SQL front end, bytecode engine, query planner, write-ahead log
//! and schema layer are external collaborators; this crate consumes a
//! page-granular block device ([`storage::pager`]), a virtual file
//! system ([`os::vfs`]), and a key-comparison callback
//! ([`storage::btree::KeyInfo`]).

pub mod error;
pub mod os;
pub mod sorter;
pub mod storage;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use sorter::{VdbeSorter, SORTER_MAX_MERGE_COUNT};
pub use storage::btree::{
    BtCursor, Btree, BtreeOpenFlags, BtreePayload, CollSeq, CursorFlags, CursorState, KeyInfo,
    RecordField, BTREE_BLOBKEY, BTREE_INTKEY,
};
pub use types::{Pgno, RowId};
