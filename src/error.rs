//! Error types and Result alias.

use thiserror::Error as ThisError;

/// Result codes emitted by the storage and sort core.
///
/// `Ok` and `Done` are not failures: `Done` signals the end of an
/// iteration and is distinct from every error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    /// Generic error
    Error = 1,
    /// Internal logic error
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// Callback requested an abort
    Abort = 4,
    /// A resource is busy; the caller may retry
    Busy = 5,
    /// A table lock conflict
    Locked = 6,
    /// A heap allocation failed
    NoMem = 7,
    /// Attempt to write a readonly tree
    ReadOnly = 8,
    /// Operation terminated by the cooperative interrupt flag
    Interrupt = 9,
    /// Disk I/O error
    IoErr = 10,
    /// An on-disk invariant was violated
    Corrupt = 11,
    /// Insertion failed because the page or database is full
    Full = 13,
    /// Library used incorrectly
    Misuse = 21,
    /// Parameter out of range
    Range = 25,
    /// Iteration has no more rows
    Done = 101,
}

impl ErrorCode {
    pub fn is_error(self) -> bool {
        !matches!(self, ErrorCode::Ok | ErrorCode::Done)
    }
}

fn fmt_msg(msg: &Option<String>) -> String {
    match msg {
        Some(m) => format!(": {m}"),
        None => String::new(),
    }
}

/// An error carrying one of the core's result codes and an optional
/// context message.
#[derive(Debug, Clone, ThisError)]
#[error("{:?}{}", .code, fmt_msg(.msg))]
pub struct Error {
    pub code: ErrorCode,
    msg: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, msg: None }
    }

    pub fn with_message(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: Some(msg.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_message(ErrorCode::IoErr, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
