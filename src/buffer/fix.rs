use std::sync::{Arc, Mutex, RwLockReadGuard, RwLockWriteGuard};

use super::{
    page::{DataState, Page},
    pool::PoolState,
};
use crate::utils::HandyRwLock;

fn unfix(state: &Mutex<PoolState>, page_id: u64) {
    let mut st = state.lock().unwrap();
    if let Some(frame) = st.frames.get_mut(&page_id) {
        if frame.fix_count > 0 {
            frame.fix_count -= 1;
        } else {
            frame.fix_count = 0;
        }
    }
}

/// A pinned, read-only view of a page. Dropping the fix releases the pin.
///
/// Fixes cannot be cloned; moving one transfers the pin.
pub struct SharedFix {
    page: Arc<Page>,
    state: Arc<Mutex<PoolState>>,
}

impl SharedFix {
    pub(crate) fn new(page: Arc<Page>, state: Arc<Mutex<PoolState>>) -> Self {
        Self { page, state }
    }

    pub fn page_id(&self) -> u64 {
        self.page.id()
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.page.buf().rl()
    }
}

impl Drop for SharedFix {
    fn drop(&mut self) {
        unfix(&self.state, self.page.id());
    }
}

/// A pinned, writable view of a page. The only holder while it lives.
pub struct ExclusiveFix {
    page: Arc<Page>,
    state: Arc<Mutex<PoolState>>,
}

impl ExclusiveFix {
    pub(crate) fn new(page: Arc<Page>, state: Arc<Mutex<PoolState>>) -> Self {
        Self { page, state }
    }

    pub fn page_id(&self) -> u64 {
        self.page.id()
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.page.buf().rl()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.page.buf().wl()
    }

    /// Mark the page for write-back. Only ever moves `Clean` to `Dirty`.
    pub fn set_dirty(&self) {
        let mut st = self.state.lock().unwrap();
        if let Some(frame) = st.frames.get_mut(&self.page.id()) {
            if frame.state == DataState::Clean {
                frame.state = DataState::Dirty;
            }
        }
    }
}

impl Drop for ExclusiveFix {
    fn drop(&mut self) {
        unfix(&self.state, self.page.id());
    }
}
