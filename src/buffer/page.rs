use std::sync::RwLock;

/// Load/write-back state of a buffered page.
///
/// Transitions are linear: `Reading -> Clean <-> Dirty -> Writing`, and a
/// `Writing` page is gone from the pool once the write-back finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Reading,
    Clean,
    Dirty,
    Writing,
}

/// An in-memory page: the page id plus a heap-allocated byte buffer.
///
/// The buffer sits behind its own `RwLock` so that a fix can hand out data
/// guards without touching the pool-wide mutex. The pin discipline (at most
/// one exclusive fix, or any number of shared fixes) guarantees the lock is
/// uncontended in practice.
pub struct Page {
    id: u64,
    buf: RwLock<Box<[u8]>>,
}

impl Page {
    pub(crate) fn new(id: u64, page_size: usize) -> Self {
        Self {
            id,
            buf: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn buf(&self) -> &RwLock<Box<[u8]>> {
        &self.buf
    }
}
