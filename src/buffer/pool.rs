use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, error};

use super::{
    fix::{ExclusiveFix, SharedFix},
    page::{DataState, Page},
};
use crate::{
    error::{StorageError, StorageResult},
    io::{self, SegmentFile},
    utils::HandyRwLock,
};

pub(crate) struct Frame {
    pub(crate) page: Arc<Page>,

    /// -1 encodes "held exclusive", 0 free, > 0 the number of shared holders.
    pub(crate) fix_count: i64,

    pub(crate) state: DataState,

    /// Which replacement queue the page currently sits in.
    pub(crate) in_lru: bool,
}

/// Page table and replacement queues, all guarded by one pool-wide mutex.
pub(crate) struct PoolState {
    pub(crate) frames: HashMap<u64, Frame>,

    /// Pages seen exactly once, in load order.
    pub(crate) fifo: VecDeque<u64>,

    /// Pages fixed at least twice, least recently used at the front.
    pub(crate) lru: VecDeque<u64>,
}

/// A buffer pool over segmented page files.
///
/// Maps 64-bit page ids (high 16 bits: segment, low 48 bits: page number) to
/// in-memory pages of a fixed size, lends them out through pinned fixes, and
/// replaces unpinned pages with a 2Q policy: a FIFO queue for pages seen
/// once, an LRU queue for pages fixed again.
///
/// Within one thread, do not fix a page that conflicts with a fix the thread
/// already holds (a second exclusive fix of the same page would wait on
/// itself).
pub struct BufferManager {
    page_size: usize,
    capacity: usize,
    directory: PathBuf,
    state: Arc<Mutex<PoolState>>,
}

impl BufferManager {
    /// A pool holding up to `capacity` pages of `page_size` bytes, backed by
    /// files under the `SEGMENT_DIRECTORY` environment directory.
    pub fn new(page_size: usize, capacity: usize) -> Self {
        Self::with_directory(page_size, capacity, io::default_directory().to_path_buf())
    }

    pub fn with_directory(page_size: usize, capacity: usize, directory: impl Into<PathBuf>) -> Self {
        assert!(capacity > 0);
        assert!(page_size > 0);
        Self {
            page_size,
            capacity,
            directory: directory.into(),
            state: Arc::new(Mutex::new(PoolState {
                frames: HashMap::new(),
                fifo: VecDeque::new(),
                lru: VecDeque::new(),
            })),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pin a page for reading. Blocks while the page is held exclusively.
    pub fn fix(&self, page_id: u64) -> StorageResult<SharedFix> {
        let page = self.fix_page(page_id, false)?;
        Ok(SharedFix::new(page, Arc::clone(&self.state)))
    }

    /// Pin a page for reading and writing. Blocks while any other fix exists.
    pub fn fix_exclusive(&self, page_id: u64) -> StorageResult<ExclusiveFix> {
        let page = self.fix_page(page_id, true)?;
        Ok(ExclusiveFix::new(page, Arc::clone(&self.state)))
    }

    /// Whether the page is resident. Advisory: the answer may be stale by the
    /// time the caller acts on it.
    pub fn in_memory(&self, page_id: u64) -> bool {
        let st = self.state.lock().unwrap();
        match st.frames.get(&page_id) {
            Some(f) => f.state != DataState::Writing,
            None => false,
        }
    }

    /// Whether the page is resident and modified. Advisory, see `in_memory`.
    pub fn is_dirty(&self, page_id: u64) -> bool {
        let st = self.state.lock().unwrap();
        match st.frames.get(&page_id) {
            Some(f) => f.state == DataState::Dirty,
            None => false,
        }
    }

    /// Contents of the FIFO queue, head first. Testing interface.
    pub fn fifo_page_ids(&self) -> Vec<u64> {
        self.state.lock().unwrap().fifo.iter().copied().collect()
    }

    /// Contents of the LRU queue, head first. Testing interface.
    pub fn lru_page_ids(&self) -> Vec<u64> {
        self.state.lock().unwrap().lru.iter().copied().collect()
    }

    fn fix_page(&self, page_id: u64, exclusive: bool) -> StorageResult<Arc<Page>> {
        loop {
            {
                let mut st = self.state.lock().unwrap();
                if st.frames.contains_key(&page_id) {
                    if let Some(page) = Self::try_fix_existing(&mut st, page_id, exclusive) {
                        return Ok(page);
                    }
                    // incompatible pin mode or a write-back in flight
                } else {
                    return self.try_fix_new(&mut st, page_id, exclusive);
                }
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn try_fix_existing(st: &mut PoolState, page_id: u64, exclusive: bool) -> Option<Arc<Page>> {
        let frame = st.frames.get_mut(&page_id).unwrap();
        if frame.state == DataState::Writing {
            return None;
        }

        let can_fix = if exclusive {
            frame.fix_count == 0
        } else {
            frame.fix_count >= 0
        };
        if !can_fix {
            return None;
        }

        frame.fix_count = if exclusive { -1 } else { frame.fix_count + 1 };
        let was_in_lru = frame.in_lru;
        frame.in_lru = true;
        let page = Arc::clone(&frame.page);

        // a re-fixed page moves (or is refreshed) to the LRU tail
        let queue = if was_in_lru { &mut st.lru } else { &mut st.fifo };
        if let Some(pos) = queue.iter().position(|id| *id == page_id) {
            queue.remove(pos);
        }
        st.lru.push_back(page_id);

        Some(page)
    }

    fn try_fix_new(
        &self,
        st: &mut PoolState,
        page_id: u64,
        exclusive: bool,
    ) -> StorageResult<Arc<Page>> {
        if st.frames.len() >= self.capacity {
            self.evict_one(st)?;
        }

        let page = Arc::new(Page::new(page_id, self.page_size));
        st.frames.insert(
            page_id,
            Frame {
                page: Arc::clone(&page),
                fix_count: if exclusive { -1 } else { 1 },
                state: DataState::Reading,
                in_lru: false,
            },
        );
        st.fifo.push_back(page_id);

        debug!("loading page {:#x}", page_id);
        let loaded = (|| -> StorageResult<()> {
            let mut file = SegmentFile::open(&self.directory, page_id, self.page_size)?;
            let mut buf = page.buf().wl();
            file.read_page(&mut buf)
        })();

        match loaded {
            Ok(()) => {
                st.frames.get_mut(&page_id).unwrap().state = DataState::Clean;
                Ok(page)
            }
            Err(e) => {
                // drop the half-constructed slot so a later fix can retry
                st.frames.remove(&page_id);
                if let Some(pos) = st.fifo.iter().position(|id| *id == page_id) {
                    st.fifo.remove(pos);
                }
                Err(e)
            }
        }
    }

    /// Evict one unpinned page, scanning FIFO head to tail, then LRU. A dirty
    /// victim is written back first.
    fn evict_one(&self, st: &mut PoolState) -> StorageResult<()> {
        let victim = st
            .fifo
            .iter()
            .copied()
            .find(|id| st.frames[id].fix_count == 0)
            .or_else(|| {
                st.lru
                    .iter()
                    .copied()
                    .find(|id| st.frames[id].fix_count == 0)
            });

        let victim = match victim {
            Some(v) => v,
            None => return Err(StorageError::BufferFull),
        };

        if st.frames[&victim].state == DataState::Dirty {
            let page = Arc::clone(&st.frames[&victim].page);
            st.frames.get_mut(&victim).unwrap().state = DataState::Writing;
            if let Err(e) = self.write_back(&page) {
                st.frames.get_mut(&victim).unwrap().state = DataState::Dirty;
                return Err(e);
            }
        }

        debug!("evicting page {:#x}", victim);
        let frame = st.frames.remove(&victim).unwrap();
        let queue = if frame.in_lru { &mut st.lru } else { &mut st.fifo };
        if let Some(pos) = queue.iter().position(|id| *id == victim) {
            queue.remove(pos);
        }
        Ok(())
    }

    fn write_back(&self, page: &Page) -> StorageResult<()> {
        let buf = page.buf().rl();
        let mut file = SegmentFile::open(&self.directory, page.id(), self.page_size)?;
        file.write_page(&buf)
    }
}

impl Drop for BufferManager {
    /// Write back every dirty page; everything else is discarded.
    fn drop(&mut self) {
        let st = self.state.lock().unwrap();
        for frame in st.frames.values() {
            if frame.state == DataState::Dirty {
                if let Err(e) = self.write_back(&frame.page) {
                    error!(
                        "write-back of page {:#x} failed on shutdown: {}",
                        frame.page.id(),
                        e
                    );
                }
            }
        }
    }
}
