use std::sync::Arc;

use betree::{BufferManager, StorageError};

mod common;

#[test]
fn test_fix_single() {
    let (pool, _dir) = common::new_pool(1024, 10);

    let expected: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    {
        let fix = pool.fix_exclusive(1).unwrap();
        fix.data_mut().copy_from_slice(&expected);
        fix.set_dirty();
        drop(fix);
        assert_eq!(vec![1], pool.fifo_page_ids());
        assert!(pool.lru_page_ids().is_empty());
    }
    {
        let fix = pool.fix(1).unwrap();
        assert_eq!(expected[..], fix.data()[..]);
        drop(fix);
        assert!(pool.fifo_page_ids().is_empty());
        assert_eq!(vec![1], pool.lru_page_ids());
    }
}

#[test]
fn test_fifo_eviction_order() {
    let (pool, _dir) = common::new_pool(1024, 10);

    for i in 1..=10u64 {
        let _fix = pool.fix(i).unwrap();
    }
    assert_eq!((1..=10).collect::<Vec<u64>>(), pool.fifo_page_ids());
    assert!(pool.lru_page_ids().is_empty());

    {
        let _fix = pool.fix(11).unwrap();
    }
    assert_eq!((2..=11).collect::<Vec<u64>>(), pool.fifo_page_ids());
    assert!(pool.lru_page_ids().is_empty());
    assert!(!pool.in_memory(1));
}

#[test]
fn test_second_fix_moves_to_lru() {
    let (pool, _dir) = common::new_pool(1024, 2);

    let _ = pool.fix(1).unwrap();
    let _ = pool.fix(2).unwrap();
    assert_eq!(vec![1, 2], pool.fifo_page_ids());
    assert!(pool.lru_page_ids().is_empty());

    let _ = pool.fix(2).unwrap();
    assert_eq!(vec![1], pool.fifo_page_ids());
    assert_eq!(vec![2], pool.lru_page_ids());
}

#[test]
fn test_lru_refresh() {
    let (pool, _dir) = common::new_pool(1024, 10);

    let _ = pool.fix(1).unwrap();
    let _ = pool.fix(1).unwrap();
    let _ = pool.fix(2).unwrap();
    let _ = pool.fix(2).unwrap();
    assert!(pool.fifo_page_ids().is_empty());
    assert_eq!(vec![1, 2], pool.lru_page_ids());

    let _ = pool.fix(1).unwrap();
    assert!(pool.fifo_page_ids().is_empty());
    assert_eq!(vec![2, 1], pool.lru_page_ids());

    // a refresh must not duplicate the entry
    let _ = pool.fix(1).unwrap();
    assert_eq!(vec![2, 1], pool.lru_page_ids());
}

#[test]
fn test_buffer_full() {
    let (pool, _dir) = common::new_pool(1024, 10);

    let mut fixes = Vec::new();
    for i in 1..=10u64 {
        fixes.push(pool.fix(i).unwrap());
    }

    match pool.fix(11) {
        Err(StorageError::BufferFull) => {}
        other => panic!("expected buffer_full, got {:?}", other.map(|f| f.page_id())),
    }

    // releasing one pin makes room again
    fixes.pop();
    let fix = pool.fix(11).unwrap();
    assert_eq!(11, fix.page_id());
}

#[test]
fn test_dirty_page_write_back_on_eviction() {
    let (pool, dir) = common::new_pool(1024, 2);

    {
        let fix = pool.fix_exclusive(0).unwrap();
        fix.data_mut()[0..8].copy_from_slice(&0xdeadbeefu64.to_le_bytes());
        fix.set_dirty();
    }
    // pull two more pages through a 2-page pool, evicting page 0
    let _ = pool.fix(1).unwrap();
    let _ = pool.fix(2).unwrap();
    assert!(!pool.in_memory(0));

    // reopen with a fresh pool, the write-back must be on disk
    drop(pool);
    let pool = Arc::new(BufferManager::with_directory(1024, 2, dir.path()));
    let fix = pool.fix(0).unwrap();
    assert_eq!(0xdeadbeefu64.to_le_bytes()[..], fix.data()[0..8]);
}

#[test]
fn test_persistence_across_restart() {
    let (pool, dir) = common::new_pool(1024, 10);

    for segment in 0..3u64 {
        for page in 0..10u64 {
            let page_id = (segment << 48) | page;
            let fix = pool.fix_exclusive(page_id).unwrap();
            let value = segment * 10 + page;
            fix.data_mut()[0..8].copy_from_slice(&value.to_le_bytes());
            fix.set_dirty();
        }
    }
    drop(pool);

    let pool = Arc::new(BufferManager::with_directory(1024, 10, dir.path()));
    for segment in 0..3u64 {
        for page in 0..10u64 {
            let page_id = (segment << 48) | page;
            let fix = pool.fix(page_id).unwrap();
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&fix.data()[0..8]);
            assert_eq!(segment * 10 + page, u64::from_le_bytes(buf));
        }
    }
}

#[test]
fn test_exclusive_excludes_shared() {
    let (pool, _dir) = common::new_pool(1024, 4);

    let fix = pool.fix_exclusive(1).unwrap();
    fix.data_mut()[0] = 7;
    fix.set_dirty();

    // a shared fix from another thread must wait until the pin is gone
    let (sender, receiver) = crossbeam::channel::unbounded();
    let pool2 = Arc::clone(&pool);
    let handle = std::thread::spawn(move || {
        let shared = pool2.fix(1).unwrap();
        sender.send(shared.data()[0]).unwrap();
    });

    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(receiver.is_empty());

    drop(fix);
    handle.join().unwrap();
    assert_eq!(7, receiver.recv().unwrap());
}

#[test]
fn test_concurrent_writers_distinct_pages() {
    let (pool, dir) = common::new_pool(1024, 32);

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let pool = Arc::clone(&pool);
        handles.push(std::thread::spawn(move || {
            for i in 0..8u64 {
                let page_id = t * 8 + i;
                let fix = pool.fix_exclusive(page_id).unwrap();
                fix.data_mut()[0..8].copy_from_slice(&(page_id * 3).to_le_bytes());
                fix.set_dirty();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    drop(pool);

    let pool = BufferManager::with_directory(1024, 32, dir.path());
    for page_id in 0..32u64 {
        let fix = pool.fix(page_id).unwrap();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&fix.data()[0..8]);
        assert_eq!(page_id * 3, u64::from_le_bytes(buf));
    }
}
