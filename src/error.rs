use std::{error::Error, fmt, io};

use backtrace::Backtrace;

/// Errors surfaced by the buffer pool and the tree.
///
/// Logic errors (duplicate message keys, exhausted page-id space, flushing
/// with nothing to flush) are programmer errors and panic instead.
pub enum StorageError {
    /// Every loaded page is pinned, no victim could be evicted.
    BufferFull,

    /// An I/O error from the segment layer, with the OS error attached.
    Io(io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Print the backtrace of the current call site to stderr. Handy when an
    /// error is about to be swallowed by a retry loop somewhere up the stack.
    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        eprintln!("{}\n{:?}", self, bt);
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::BufferFull => write!(f, "buffer is full"),
            StorageError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl fmt::Debug for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}
