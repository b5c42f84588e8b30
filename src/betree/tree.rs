use std::{marker::PhantomData, sync::Arc};

use log::debug;

use crate::{
    betree::{
        inner::{self, InnerPage, InnerPageMut},
        leaf::{self, LeafPage, LeafPageMut},
        message::{
            decode_upsert, MessageKey, UpsertFn, TAG_ERASE, TAG_INSERT, TAG_INSERT_OR_ASSIGN,
            TAG_UPSERT,
        },
        node, page_id, rbtree,
    },
    buffer::{BufferManager, ExclusiveFix, SharedFix},
    error::StorageResult,
    io::Datum,
};

/// A write-optimized ordered map over one segment of a buffer pool.
///
/// Mutations are buffered as messages in the inner nodes' message maps and
/// pushed towards the leaves in batches when a map runs out of space. One
/// mutator at a time per tree (enforced by `&mut self`); readers share pages
/// through shared fixes.
pub struct BeTree<K: Datum, V: Datum> {
    pub(crate) segment_id: u16,
    pub(crate) pool: Arc<BufferManager>,
    pub(crate) epsilon: usize,

    pub(crate) root: Option<u64>,
    pub(crate) next_page_id: u64,
    pub(crate) next_timestamp: u64,

    /// Entries committed in leaves.
    pub(crate) count: u64,
    pub(crate) leaf_count: u64,
    /// Net effect of the messages still in flight.
    pub(crate) pending: i64,

    pub(crate) _marker: PhantomData<(K, V)>,
}

enum RootLeafOutcome {
    Done,
    NeedGrow,
}

impl<K: Datum, V: Datum> BeTree<K, V> {
    pub fn new(segment_id: u16, pool: Arc<BufferManager>, epsilon: usize) -> Self {
        let page_size = pool.page_size();
        assert!(epsilon < page_size, "epsilon must leave room for pivots");
        assert!(epsilon <= u16::max_value() as usize);
        assert!(
            epsilon
                >= rbtree::HEADER_SIZE
                    + rbtree::entry_size::<K, V>(TAG_INSERT)
                    + rbtree::entry_size::<K, V>(TAG_UPSERT),
            "epsilon too small for even a couple of messages"
        );
        assert!(leaf::capacity_for::<K, V>(page_size) >= 2);
        assert!(inner::capacity_for::<K>(page_size, epsilon) >= 3);

        Self {
            segment_id,
            pool,
            epsilon,
            root: None,
            next_page_id: 0,
            next_timestamp: 1,
            count: 0,
            leaf_count: 0,
            pending: 0,
            _marker: PhantomData,
        }
    }

    /// Committed entries (messages still buffered not included).
    pub fn size(&self) -> u64 {
        self.count
    }

    /// Committed entries plus the net effect of buffered messages.
    pub fn size_pending(&self) -> u64 {
        assert!(self.pending >= 0 || self.count as i64 >= -self.pending);
        (self.count as i64 + self.pending) as u64
    }

    /// Total entry slots across all leaves.
    pub fn capacity(&self) -> u64 {
        self.leaf_count * leaf::capacity_for::<K, V>(self.pool.page_size()) as u64
    }

    /// Number of node levels on a root-to-leaf path; 0 for the empty tree.
    pub fn depth(&self) -> StorageResult<u32> {
        match self.root {
            None => Ok(0),
            Some(r) => {
                let fix = self.fix(r)?;
                let level = node::level(&fix.data()[..]);
                Ok(level as u32 + 1)
            }
        }
    }

    pub(crate) fn fix(&self, page_no: u64) -> StorageResult<SharedFix> {
        self.pool.fix(page_id::compose(self.segment_id, page_no))
    }

    pub(crate) fn fix_exclusive(&self, page_no: u64) -> StorageResult<ExclusiveFix> {
        self.pool
            .fix_exclusive(page_id::compose(self.segment_id, page_no))
    }

    pub(crate) fn new_leaf(&mut self) -> StorageResult<ExclusiveFix> {
        let page_no = self.next_page_id;
        self.next_page_id += 1;
        let fix = self.fix_exclusive(page_no)?;
        {
            let mut g = fix.data_mut();
            LeafPageMut::<K, V>::new(&mut g[..]).init();
        }
        fix.set_dirty();
        self.leaf_count += 1;
        Ok(fix)
    }

    pub(crate) fn new_inner(&mut self, level: u16) -> StorageResult<ExclusiveFix> {
        let page_no = self.next_page_id;
        self.next_page_id += 1;
        let fix = self.fix_exclusive(page_no)?;
        {
            let mut g = fix.data_mut();
            InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).init(level);
        }
        fix.set_dirty();
        Ok(fix)
    }

    /// Exclusively fix the root, allocating a leaf root on first use.
    pub(crate) fn root_fix_exclusive(&mut self) -> StorageResult<ExclusiveFix> {
        match self.root {
            Some(r) => self.fix_exclusive(r),
            None => {
                self.root = Some(self.next_page_id);
                self.new_leaf()
            }
        }
    }

    /// Split `child`, promoting the pivot into `parent`. A `None` parent
    /// grows the tree: a fresh inner root one level up is allocated and
    /// `child` becomes its leftmost subtree. On return, `child` is the half
    /// whose range contains `key`.
    pub(crate) fn split(
        &mut self,
        parent: &mut Option<ExclusiveFix>,
        child: &mut ExclusiveFix,
        key: &K,
    ) -> StorageResult<()> {
        if parent.is_none() {
            let level = node::level(&child.data()[..]) + 1;
            let new_root_no = self.next_page_id;
            let fix = self.new_inner(level)?;
            debug!("root grows to level {}", level);
            self.root = Some(new_root_no);
            *parent = Some(fix);
        }

        let child_is_leaf = node::is_leaf(&child.data()[..]);
        let split_page_no = self.next_page_id;
        let (split_key, split_fix) = if child_is_leaf {
            let sfix = self.new_leaf()?;
            let k = {
                let mut cg = child.data_mut();
                let mut sg = sfix.data_mut();
                LeafPageMut::<K, V>::new(&mut cg[..]).split(&mut LeafPageMut::new(&mut sg[..]))
            };
            (k, sfix)
        } else {
            let level = node::level(&child.data()[..]);
            let sfix = self.new_inner(level)?;
            let k = {
                let mut cg = child.data_mut();
                let mut sg = sfix.data_mut();
                InnerPageMut::<K, V>::new(&mut cg[..], self.epsilon)
                    .split(&mut InnerPageMut::new(&mut sg[..], self.epsilon))
            };
            (k, sfix)
        };

        let pfix = parent.as_mut().unwrap();
        {
            let mut pg = pfix.data_mut();
            let mut pnode = InnerPageMut::<K, V>::new(&mut pg[..], self.epsilon);
            if pnode.count() == 0 {
                // fresh root: the split child is its leftmost subtree
                pnode.set_child(0, page_id::page_no(child.page_id()));
            }
            pnode.insert(&split_key, split_page_no);
        }
        pfix.set_dirty();
        child.set_dirty();
        split_fix.set_dirty();

        if !(*key < split_key) {
            *child = split_fix;
        }
        Ok(())
    }

    /// Insert-if-absent. A key already present (committed or buffered) is
    /// left untouched.
    pub fn insert(&mut self, key: K, value: V) -> StorageResult<()> {
        let mut root_fix = self.root_fix_exclusive()?;

        if node::is_leaf(&root_fix.data()[..]) {
            let outcome = {
                let mut g = root_fix.data_mut();
                let mut leaf = LeafPageMut::<K, V>::new(&mut g[..]);
                let idx = leaf.lower_bound(&key);
                if leaf.is_equal(&key, idx) {
                    return Ok(());
                }
                if leaf.full() {
                    RootLeafOutcome::NeedGrow
                } else {
                    leaf.make_space(&key, idx);
                    leaf.set_value(idx, &value);
                    RootLeafOutcome::Done
                }
            };
            match outcome {
                RootLeafOutcome::Done => {
                    self.count += 1;
                    root_fix.set_dirty();
                    return Ok(());
                }
                RootLeafOutcome::NeedGrow => {
                    root_fix = self.grow_root(root_fix, &key)?;
                }
            }
        }

        let mk = MessageKey {
            key,
            timestamp: self.next_timestamp,
        };
        let inserted = {
            let mut g = root_fix.data_mut();
            InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).message_insert(&mk, &value)
        };
        if !inserted {
            root_fix = self.flush(root_fix, rbtree::entry_size::<K, V>(TAG_INSERT))?;
            let inserted = {
                let mut g = root_fix.data_mut();
                InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).message_insert(&mk, &value)
            };
            assert!(inserted, "message map out of space after flush");
        }
        self.next_timestamp += 1;
        self.pending += 1;
        root_fix.set_dirty();
        Ok(())
    }

    /// Insert or overwrite.
    pub fn insert_or_assign(&mut self, key: K, value: V) -> StorageResult<()> {
        let mut root_fix = self.root_fix_exclusive()?;

        if node::is_leaf(&root_fix.data()[..]) {
            enum Direct {
                Assigned,
                Inserted,
                NeedGrow,
            }
            let outcome = {
                let mut g = root_fix.data_mut();
                let mut leaf = LeafPageMut::<K, V>::new(&mut g[..]);
                let idx = leaf.lower_bound(&key);
                if leaf.is_equal(&key, idx) {
                    leaf.set_value(idx, &value);
                    Direct::Assigned
                } else if leaf.full() {
                    Direct::NeedGrow
                } else {
                    leaf.make_space(&key, idx);
                    leaf.set_value(idx, &value);
                    Direct::Inserted
                }
            };
            match outcome {
                Direct::Assigned => {
                    root_fix.set_dirty();
                    return Ok(());
                }
                Direct::Inserted => {
                    self.count += 1;
                    root_fix.set_dirty();
                    return Ok(());
                }
                Direct::NeedGrow => {
                    root_fix = self.grow_root(root_fix, &key)?;
                }
            }
        }

        let mk = MessageKey {
            key,
            timestamp: self.next_timestamp,
        };
        let inserted = {
            let mut g = root_fix.data_mut();
            InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).message_insert_or_assign(&mk, &value)
        };
        if !inserted {
            root_fix = self.flush(root_fix, rbtree::entry_size::<K, V>(TAG_INSERT_OR_ASSIGN))?;
            let inserted = {
                let mut g = root_fix.data_mut();
                InnerPageMut::<K, V>::new(&mut g[..], self.epsilon)
                    .message_insert_or_assign(&mk, &value)
            };
            assert!(inserted, "message map out of space after flush");
        }
        self.next_timestamp += 1;
        self.pending += 1;
        root_fix.set_dirty();
        Ok(())
    }

    /// Apply `f` to the value at `key` if the key is live; a pending upsert
    /// over an absent key is dropped when it reaches a leaf.
    pub fn upsert(&mut self, key: K, f: UpsertFn<V>) -> StorageResult<()> {
        let root_fix = self.root_fix_exclusive()?;

        if node::is_leaf(&root_fix.data()[..]) {
            let changed = {
                let mut g = root_fix.data_mut();
                let mut leaf = LeafPageMut::<K, V>::new(&mut g[..]);
                let idx = leaf.lower_bound(&key);
                if leaf.is_equal(&key, idx) {
                    let old = leaf.value(idx);
                    leaf.set_value(idx, &f(old));
                    true
                } else {
                    false
                }
            };
            if changed {
                root_fix.set_dirty();
            }
            return Ok(());
        }

        let mk = MessageKey {
            key,
            timestamp: self.next_timestamp,
        };
        let mut root_fix = root_fix;
        let inserted = {
            let mut g = root_fix.data_mut();
            InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).message_upsert(&mk, f)
        };
        if !inserted {
            root_fix = self.flush(root_fix, rbtree::entry_size::<K, V>(TAG_UPSERT))?;
            let inserted = {
                let mut g = root_fix.data_mut();
                InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).message_upsert(&mk, f)
            };
            assert!(inserted, "message map out of space after flush");
        }
        self.next_timestamp += 1;
        root_fix.set_dirty();
        Ok(())
    }

    /// Remove `key` if present; a no-op otherwise.
    pub fn erase(&mut self, key: K) -> StorageResult<()> {
        let root_fix = self.root_fix_exclusive()?;

        if node::is_leaf(&root_fix.data()[..]) {
            let erased = {
                let mut g = root_fix.data_mut();
                let mut leaf = LeafPageMut::<K, V>::new(&mut g[..]);
                let idx = leaf.lower_bound(&key);
                if leaf.is_equal(&key, idx) {
                    leaf.erase(idx);
                    true
                } else {
                    false
                }
            };
            if erased {
                self.count -= 1;
                root_fix.set_dirty();
            }
            return Ok(());
        }

        let mk = MessageKey {
            key,
            timestamp: self.next_timestamp,
        };
        let mut root_fix = root_fix;
        let inserted = {
            let mut g = root_fix.data_mut();
            InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).message_erase(&mk)
        };
        if !inserted {
            root_fix = self.flush(root_fix, rbtree::entry_size::<K, V>(TAG_ERASE))?;
            let inserted = {
                let mut g = root_fix.data_mut();
                InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).message_erase(&mk)
            };
            assert!(inserted, "message map out of space after flush");
        }
        self.next_timestamp += 1;
        self.pending -= 1;
        root_fix.set_dirty();
        Ok(())
    }

    /// Resolve `key` against the committed leaf entry and every buffered
    /// message on its root-to-leaf path, replayed in timestamp order.
    pub fn find(&self, key: &K) -> StorageResult<Option<V>> {
        let root = match self.root {
            None => return Ok(None),
            Some(r) => r,
        };

        let mut msgs: Vec<(u64, u8, Vec<u8>)> = Vec::new();
        let mut fix = self.fix(root)?;
        loop {
            let next_no;
            {
                let g = fix.data();
                let d = &g[..];
                if node::is_leaf(d) {
                    let leaf = LeafPage::<K, V>::new(d);
                    let idx = leaf.lower_bound(key);
                    let base = if leaf.is_equal(key, idx) {
                        Some(leaf.value(idx))
                    } else {
                        None
                    };
                    return Ok(Self::replay(base, &mut msgs));
                }

                let inner = InnerPage::<K, V>::new(d, self.epsilon);
                let m = inner.messages();
                let (mut it, end) = m.key_range(*key);
                while it != end {
                    msgs.push((m.key_at(it).timestamp, m.tag_at(it), m.payload_at(it).to_vec()));
                    it = m.next(it);
                }
                next_no = inner.lower_bound_child(key);
            }
            fix = self.fix(next_no)?;
        }
    }

    fn replay(base: Option<V>, msgs: &mut Vec<(u64, u8, Vec<u8>)>) -> Option<V> {
        msgs.sort_by_key(|m| m.0);
        let mut cur = base;
        for (_, tag, payload) in msgs.iter() {
            match *tag {
                TAG_INSERT => {
                    if cur.is_none() {
                        cur = Some(V::read_from(payload));
                    }
                }
                TAG_INSERT_OR_ASSIGN => {
                    cur = Some(V::read_from(payload));
                }
                TAG_UPSERT => {
                    if let Some(v) = cur {
                        cur = Some(decode_upsert::<V>(payload)(v));
                    }
                }
                TAG_ERASE => {
                    cur = None;
                }
                _ => unreachable!("invalid message tag"),
            }
        }
        cur
    }

    /// Turn a full root leaf into an inner root with two leaf children and
    /// return the new root's fix.
    fn grow_root(&mut self, root_fix: ExclusiveFix, key: &K) -> StorageResult<ExclusiveFix> {
        let mut parent: Option<ExclusiveFix> = None;
        let mut child = root_fix;
        self.split(&mut parent, &mut child, key)?;
        Ok(parent.expect("split allocates the new root"))
    }

    /// Walk the whole tree and panic on any violated structural invariant.
    /// Testing aid: ordering inside nodes, pivot containment, message
    /// routing, red-black shape of every message map, and the aggregate
    /// counters.
    pub fn check_invariants(&self) -> StorageResult<()> {
        let root = match self.root {
            None => {
                assert_eq!(0, self.count);
                return Ok(());
            }
            Some(r) => r,
        };

        // (page_no, expected_level, lower bound exclusive, upper bound inclusive)
        let mut stack: Vec<(u64, Option<u16>, Option<K>, Option<K>)> = vec![(root, None, None, None)];
        let mut committed = 0u64;
        let mut leaves = 0u64;

        while let Some((page_no, expect_level, min, max)) = stack.pop() {
            let fix = self.fix(page_no)?;
            let g = fix.data();
            let d = &g[..];

            let level = node::level(d);
            if let Some(el) = expect_level {
                assert_eq!(el, level, "child level mismatch");
            }

            if node::is_leaf(d) {
                let leaf = LeafPage::<K, V>::new(d);
                leaves += 1;
                committed += leaf.count() as u64;
                for i in 0..leaf.count() {
                    let k = leaf.key(i);
                    if i > 0 {
                        assert!(leaf.key(i - 1) < k, "leaf keys not strictly increasing");
                    }
                    if let Some(ref lo) = min {
                        assert!(*lo < k, "leaf key below the subtree range");
                    }
                    if let Some(ref hi) = max {
                        assert!(k <= *hi, "leaf key above the subtree range");
                    }
                }
                continue;
            }

            let inner = InnerPage::<K, V>::new(d, self.epsilon);
            assert!(inner.count() > 0, "inner node without pivots");
            inner.messages().check_rb_invariants();

            for i in 0..inner.count() {
                let k = inner.key(i);
                if i > 0 {
                    assert!(inner.key(i - 1) < k, "pivots not strictly increasing");
                }
                if let Some(ref lo) = min {
                    assert!(*lo < k, "pivot below the subtree range");
                }
                if let Some(ref hi) = max {
                    assert!(k <= *hi, "pivot above the subtree range");
                }
            }

            for i in 0..=inner.count() {
                let lo = if i > 0 { Some(inner.key(i - 1)) } else { min };
                let hi = if i < inner.count() {
                    Some(inner.key(i))
                } else {
                    max
                };

                // buffered messages must lie in the range they route to
                let m = inner.messages();
                let (mut it, end) = inner.map_range(i);
                while it != end {
                    let k = m.key_at(it).key;
                    if let Some(ref l) = lo {
                        assert!(*l < k, "message below its child range");
                    }
                    if let Some(ref h) = hi {
                        assert!(k <= *h, "message above its child range");
                    }
                    it = m.next(it);
                }

                stack.push((inner.child(i), Some(level - 1), lo, hi));
            }
        }

        assert_eq!(self.count, committed, "committed entry count drifted");
        assert_eq!(self.leaf_count, leaves, "leaf count drifted");
        Ok(())
    }
}
