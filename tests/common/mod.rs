use std::sync::Arc;

use betree::BufferManager;
use tempfile::TempDir;

/// Set up logging (idempotent) for a test.
pub fn setup() {
    betree::init_log();
}

/// A pool over a scratch directory. The directory is removed when the
/// returned guard drops, so keep it alive as long as the pool.
pub fn new_pool(page_size: usize, capacity: usize) -> (Arc<BufferManager>, TempDir) {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(BufferManager::with_directory(
        page_size,
        capacity,
        dir.path(),
    ));
    (pool, dir)
}
