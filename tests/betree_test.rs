use betree::BeTree;
use itertools::Itertools;
use rand::prelude::*;

mod common;

const PAGE_SIZE: usize = 1024;
const EPSILON: usize = 256;

/// Leaf capacity for u64 keys and values at the test page size.
const LEAF_CAP: u64 = 63;
/// Inner fanout minus one at the test page size and epsilon.
const INNER_CAP: u64 = 47;

fn new_tree(capacity: usize) -> (BeTree<u64, u64>, tempfile::TempDir) {
    let (pool, dir) = common::new_pool(PAGE_SIZE, capacity);
    (BeTree::new(0, pool, EPSILON), dir)
}

#[test]
fn test_singleton_insert() {
    let (mut tree, _dir) = new_tree(64);

    tree.insert(12, 34).unwrap();
    assert!(tree.size() <= tree.size_pending());
    assert_eq!(1, tree.size_pending());
    assert_eq!(Some(34), tree.find(&12).unwrap());
    assert_eq!(None, tree.find(&13).unwrap());
    assert_eq!(1, tree.depth().unwrap());
}

#[test]
fn test_leaf_fill_then_split() {
    let (mut tree, _dir) = new_tree(64);

    for i in 0..=LEAF_CAP {
        tree.insert(i, i).unwrap();
    }

    // the root grew into an inner node over two leaves
    assert_eq!(2, tree.depth().unwrap());
    assert_eq!(LEAF_CAP + 1, tree.size_pending());
    assert_eq!(2 * LEAF_CAP, tree.capacity());
    for i in 0..=LEAF_CAP {
        assert_eq!(Some(i), tree.find(&i).unwrap(), "key {}", i);
    }
    tree.check_invariants().unwrap();
}

#[test]
fn test_mass_linear_insert() {
    let (mut tree, _dir) = new_tree(512);
    let n = LEAF_CAP * INNER_CAP * 2;

    for i in 0..n {
        tree.insert(i, i).unwrap();
    }

    assert_eq!(n, tree.size_pending());
    assert_eq!(None, tree.find(&n).unwrap());
    tree.check_invariants().unwrap();

    let mut expect = 0;
    for (k, v) in tree.iter() {
        assert_eq!(expect, k);
        assert_eq!(expect, v);
        expect += 1;
    }
    assert_eq!(n, expect);
}

#[test]
fn test_mass_reverse_insert() {
    let (mut tree, _dir) = new_tree(512);
    let n = LEAF_CAP * INNER_CAP * 2;

    for i in (1..n).rev() {
        tree.insert(i, i).unwrap();
    }

    assert_eq!(n - 1, tree.size_pending());
    tree.check_invariants().unwrap();

    // key 0 was never inserted
    assert_eq!(Some((1, 1)), tree.lower_bound(0).next());

    let mut expect = 1;
    for (k, _) in tree.iter() {
        assert_eq!(expect, k);
        expect += 1;
    }
    assert_eq!(n, expect);
}

#[test]
fn test_random_insert() {
    let (mut tree, _dir) = new_tree(512);
    let mut rng = rand::thread_rng();

    let mut keys: Vec<u64> = Vec::new();
    for _ in 0..10_000 {
        let k: u64 = rng.gen();
        tree.insert(k, 0).unwrap();
        keys.push(k);
    }

    assert_eq!(10_000, tree.size_pending());
    assert!(tree.size() <= tree.size_pending());
    tree.check_invariants().unwrap();

    for k in keys.iter() {
        assert!(tree.find(k).unwrap().is_some(), "key {} lost", k);
    }

    let sorted: Vec<u64> = tree.iter().map(|(k, _)| k).collect();
    assert!(sorted.iter().tuple_windows().all(|(a, b)| a < b));
    assert_eq!(10_000, sorted.len());
}

#[test]
fn test_insert_is_insert_if_absent() {
    let (mut tree, _dir) = new_tree(64);

    tree.insert(5, 1).unwrap();
    let before = tree.size_pending();
    tree.insert(5, 2).unwrap();

    assert_eq!(before, tree.size_pending());
    assert_eq!(Some(1), tree.find(&5).unwrap());
}

#[test]
fn test_insert_if_absent_survives_buffering() {
    let (mut tree, _dir) = new_tree(512);

    // push the tree past the root-leaf stage
    for i in 0..LEAF_CAP * 4 {
        tree.insert(i, i * 10).unwrap();
    }
    let size = tree.size();

    // duplicates are buffered as messages but resolve to no-ops
    for i in 0..LEAF_CAP * 4 {
        tree.insert(i, 9999).unwrap();
    }
    for i in 0..LEAF_CAP * 4 {
        assert_eq!(Some(i * 10), tree.find(&i).unwrap(), "key {}", i);
    }
    assert!(tree.size() >= size);
    tree.check_invariants().unwrap();
}

#[test]
fn test_insert_or_assign_overwrites() {
    let (mut tree, _dir) = new_tree(512);

    for i in 0..LEAF_CAP * 4 {
        tree.insert(i, i).unwrap();
    }
    for i in 0..LEAF_CAP * 4 {
        tree.insert_or_assign(i, i + 1000).unwrap();
    }
    for i in 0..LEAF_CAP * 4 {
        assert_eq!(Some(i + 1000), tree.find(&i).unwrap(), "key {}", i);
    }

    // assigning an absent key inserts it
    tree.insert_or_assign(1 << 40, 7).unwrap();
    assert_eq!(Some(7), tree.find(&(1 << 40)).unwrap());
    tree.check_invariants().unwrap();
}

#[test]
fn test_erase_round_trip() {
    let (mut tree, _dir) = new_tree(512);
    let n = LEAF_CAP * 4;

    for i in 0..n {
        tree.insert(i, i).unwrap();
    }
    for i in (0..n).filter(|i| i % 3 == 0) {
        tree.erase(i).unwrap();
    }

    for i in 0..n {
        let expect = if i % 3 == 0 { None } else { Some(i) };
        assert_eq!(expect, tree.find(&i).unwrap(), "key {}", i);
    }
    assert_eq!(n - (n + 2) / 3, tree.size_pending());

    let survivors: Vec<u64> = tree.iter().map(|(k, _)| k).collect();
    assert_eq!((n - (n + 2) / 3) as usize, survivors.len());
    assert!(survivors.iter().all(|k| k % 3 != 0));
    tree.check_invariants().unwrap();
}

#[test]
fn test_erase_then_reinsert() {
    let (mut tree, _dir) = new_tree(512);

    for i in 0..LEAF_CAP * 4 {
        tree.insert(i, i).unwrap();
    }
    tree.erase(10).unwrap();
    assert_eq!(None, tree.find(&10).unwrap());

    // a later insert wins over the buffered erase
    tree.insert(10, 777).unwrap();
    assert_eq!(Some(777), tree.find(&10).unwrap());
    tree.check_invariants().unwrap();
}

fn double(v: u64) -> u64 {
    v * 2
}

#[test]
fn test_upsert() {
    let (mut tree, _dir) = new_tree(512);

    // root-leaf fast path
    tree.insert(3, 21).unwrap();
    tree.upsert(3, double).unwrap();
    assert_eq!(Some(42), tree.find(&3).unwrap());

    // buffered path: push past the root-leaf stage first
    for i in 100..100 + LEAF_CAP * 4 {
        tree.insert(i, i).unwrap();
    }
    tree.upsert(100, double).unwrap();
    assert_eq!(Some(200), tree.find(&100).unwrap());

    // an upsert on an absent key is dropped
    let pending = tree.size_pending();
    tree.upsert(1 << 40, double).unwrap();
    assert_eq!(pending, tree.size_pending());
    assert_eq!(None, tree.find(&(1 << 40)).unwrap());

    // drive more traffic through so the upserts reach the leaves
    for i in 1000..1000 + LEAF_CAP * 8 {
        tree.insert(i, i).unwrap();
    }
    assert_eq!(Some(42), tree.find(&3).unwrap());
    assert_eq!(Some(200), tree.find(&100).unwrap());
    tree.check_invariants().unwrap();
}

#[test]
fn test_bounds() {
    let (mut tree, _dir) = new_tree(512);

    for i in (0..LEAF_CAP * 4).map(|i| i * 10) {
        tree.insert(i, i).unwrap();
    }

    assert_eq!(Some((50, 50)), tree.lower_bound(50).next());
    assert_eq!(Some((50, 50)), tree.lower_bound(41).next());
    assert_eq!(Some((60, 60)), tree.upper_bound(50).next());
    assert_eq!(Some((0, 0)), tree.iter().next());
    assert_eq!(None, tree.lower_bound(LEAF_CAP * 4 * 10).next());
}

#[test]
fn test_conservation() {
    let (mut tree, _dir) = new_tree(512);
    let mut live = std::collections::BTreeSet::new();
    let mut rng = rand::thread_rng();

    for _ in 0..4000 {
        let k: u64 = rng.gen_range(0, 600);
        if rng.gen_range(0, 3) == 0 {
            // erase only keys we know are live to keep pending sane
            if let Some(k) = live.iter().next().copied() {
                tree.erase(k).unwrap();
                live.remove(&k);
            }
        } else if live.insert(k) {
            tree.insert(k, k).unwrap();
        }
    }

    assert_eq!(live.len() as u64, tree.size_pending());
    let keys: Vec<u64> = tree.iter().map(|(k, _)| k).collect();
    assert_eq!(live.iter().copied().collect::<Vec<_>>(), keys);
    tree.check_invariants().unwrap();
}

#[test]
fn test_depth_growth() {
    let (mut tree, _dir) = new_tree(512);

    assert_eq!(0, tree.depth().unwrap());
    tree.insert(0, 0).unwrap();
    assert_eq!(1, tree.depth().unwrap());

    for i in 1..LEAF_CAP * INNER_CAP * 2 {
        tree.insert(i, i).unwrap();
    }
    assert!(tree.depth().unwrap() >= 3);
    assert!(tree.capacity() >= tree.size());
    tree.check_invariants().unwrap();
}
