//! Inner pages: the node header, the embedded message map (epsilon bytes at
//! a fixed offset), `count` pivot keys and `count + 1` child page numbers.
//!
//! The subtree at `child[i]` covers the half-open interval
//! `(key[i - 1], key[i]]`, unbounded at either end.

use std::marker::PhantomData;

use crate::{
    betree::{
        message::{
            encode_upsert, value_size, MessageKey, UpsertFn, TAG_ERASE, TAG_INSERT,
            TAG_INSERT_OR_ASSIGN, TAG_UPSERT,
        },
        node,
        rbtree::{MessageMap, MessageMapMut},
    },
    io::Datum,
};

pub fn capacity_for<K: Datum>(page_size: usize, epsilon: usize) -> usize {
    (page_size - node::NODE_HEADER - 8 - epsilon) / (K::SIZE + 8)
}

pub struct InnerPage<'a, K: Datum, V: Datum> {
    data: &'a [u8],
    epsilon: usize,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: Datum, V: Datum> InnerPage<'a, K, V> {
    pub fn new(data: &'a [u8], epsilon: usize) -> Self {
        Self {
            data,
            epsilon,
            _marker: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        capacity_for::<K>(self.data.len(), self.epsilon)
    }

    pub fn level(&self) -> u16 {
        node::level(self.data)
    }

    pub fn count(&self) -> u16 {
        node::count(self.data)
    }

    pub fn full(&self) -> bool {
        (self.count() as usize) >= self.capacity()
    }

    fn key_off(&self, idx: u16) -> usize {
        node::NODE_HEADER + self.epsilon + idx as usize * K::SIZE
    }

    fn child_off(&self, idx: u16) -> usize {
        node::NODE_HEADER + self.epsilon + self.capacity() * K::SIZE + idx as usize * 8
    }

    pub fn key(&self, idx: u16) -> K {
        debug_assert!(idx < self.count());
        K::read_from(&self.data[self.key_off(idx)..])
    }

    /// Segment-relative page number of the `idx`-th child, `idx <= count`.
    pub fn child(&self, idx: u16) -> u64 {
        debug_assert!(idx <= self.count());
        u64::read_from(&self.data[self.child_off(idx)..])
    }

    /// Index of the child whose range holds keys `>= key`.
    pub fn lb_index(&self, key: &K) -> u16 {
        let mut lo = 0u16;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index of the child whose range holds keys `> key`.
    pub fn ub_index(&self, key: &K) -> u16 {
        let mut lo = 0u16;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn lower_bound_child(&self, key: &K) -> u64 {
        self.child(self.lb_index(key))
    }

    pub fn upper_bound_child(&self, key: &K) -> u64 {
        self.child(self.ub_index(key))
    }

    pub fn messages(&self) -> MessageMap<'a, K, V> {
        MessageMap::new(&self.data[node::NODE_HEADER..node::NODE_HEADER + self.epsilon])
    }

    /// Iterator bounds over the buffered messages routed to `child[idx]`,
    /// i.e. those with user key in `(key[idx - 1], key[idx]]`.
    pub fn map_range(&self, idx: u16) -> (u16, u16) {
        let m = self.messages();
        let begin = if idx > 0 {
            m.upper_bound(&MessageKey::max(self.key(idx - 1)))
        } else {
            m.first()
        };
        let end = if idx < self.count() {
            m.upper_bound(&MessageKey::max(self.key(idx)))
        } else {
            0
        };
        (begin, end)
    }
}

pub struct InnerPageMut<'a, K: Datum, V: Datum> {
    data: &'a mut [u8],
    epsilon: usize,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: Datum, V: Datum> InnerPageMut<'a, K, V> {
    pub fn new(data: &'a mut [u8], epsilon: usize) -> Self {
        Self {
            data,
            epsilon,
            _marker: PhantomData,
        }
    }

    pub fn view(&self) -> InnerPage<'_, K, V> {
        InnerPage::new(self.data, self.epsilon)
    }

    /// Format a fresh inner node at `level` with an empty message map.
    pub fn init(&mut self, level: u16) {
        debug_assert!(level > 0);
        node::set_level(self.data, level);
        node::set_count(self.data, 0);
        self.messages_mut().init();
    }

    pub fn capacity(&self) -> usize {
        self.view().capacity()
    }

    pub fn level(&self) -> u16 {
        self.view().level()
    }

    pub fn count(&self) -> u16 {
        self.view().count()
    }

    pub fn full(&self) -> bool {
        self.view().full()
    }

    pub fn key(&self, idx: u16) -> K {
        self.view().key(idx)
    }

    pub fn child(&self, idx: u16) -> u64 {
        self.view().child(idx)
    }

    pub fn map_range(&self, idx: u16) -> (u16, u16) {
        self.view().map_range(idx)
    }

    pub fn messages(&self) -> MessageMap<'_, K, V> {
        MessageMap::new(&self.data[node::NODE_HEADER..node::NODE_HEADER + self.epsilon])
    }

    pub fn messages_mut(&mut self) -> MessageMapMut<'_, K, V> {
        MessageMapMut::new(&mut self.data[node::NODE_HEADER..node::NODE_HEADER + self.epsilon])
    }

    fn key_off(&self, idx: u16) -> usize {
        node::NODE_HEADER + self.epsilon + idx as usize * K::SIZE
    }

    fn child_off(&self, idx: u16) -> usize {
        node::NODE_HEADER + self.epsilon + self.capacity() * K::SIZE + idx as usize * 8
    }

    pub fn set_key(&mut self, idx: u16, key: &K) {
        let off = self.key_off(idx);
        key.write_to(&mut self.data[off..]);
    }

    pub fn set_child(&mut self, idx: u16, page_no: u64) {
        let off = self.child_off(idx);
        page_no.write_to(&mut self.data[off..]);
    }

    pub fn set_count(&mut self, count: u16) {
        node::set_count(self.data, count);
    }

    /// Insert a pivot and the page right of it, keeping pivots sorted.
    /// The node must not be full.
    pub fn insert(&mut self, key: &K, split_page: u64) {
        let count = self.count();
        assert!((count as usize) < self.capacity());

        let mut i = count;
        while i > 0 {
            if self.key(i - 1) < *key {
                break;
            }
            let k = self.key(i - 1);
            self.set_key(i, &k);
            let c = self.child(i);
            self.set_child(i + 1, c);
            i -= 1;
        }

        self.set_key(i, key);
        self.set_child(i + 1, split_page);
        self.set_count(count + 1);
    }

    pub fn message_insert(&mut self, mk: &MessageKey<K>, value: &V) -> bool {
        let mut payload = vec![0u8; V::SIZE];
        value.write_to(&mut payload);
        self.messages_mut().insert(mk, TAG_INSERT, &payload)
    }

    pub fn message_insert_or_assign(&mut self, mk: &MessageKey<K>, value: &V) -> bool {
        let mut payload = vec![0u8; V::SIZE];
        value.write_to(&mut payload);
        self.messages_mut().insert(mk, TAG_INSERT_OR_ASSIGN, &payload)
    }

    pub fn message_upsert(&mut self, mk: &MessageKey<K>, f: UpsertFn<V>) -> bool {
        let mut payload = [0u8; 8];
        encode_upsert::<V>(f, &mut payload);
        self.messages_mut().insert(mk, TAG_UPSERT, &payload)
    }

    pub fn message_erase(&mut self, mk: &MessageKey<K>) -> bool {
        self.messages_mut().insert(mk, TAG_ERASE, &[])
    }

    /// Re-buffer a message drained from a parent node, keeping its original
    /// key and timestamp.
    pub fn apply(&mut self, mk: &MessageKey<K>, tag: u8, payload: &[u8]) -> bool {
        debug_assert_eq!(value_size::<V>(tag) - 1, payload.len());
        self.messages_mut().insert(mk, tag, payload)
    }

    /// Move the upper half of the pivots and children to the empty node
    /// `other`, push up the middle key, and migrate every buffered message
    /// whose user key is strictly greater than that pivot.
    pub fn split(&mut self, other: &mut InnerPageMut<'_, K, V>) -> K {
        let count = self.count();
        debug_assert!(count > 2);
        debug_assert_eq!(self.level(), other.level());
        debug_assert_eq!(0, other.count());

        let start = count / 2;
        for i in start + 1..count {
            let k = self.key(i);
            other.set_key(i - start - 1, &k);
            let c = self.child(i);
            other.set_child(i - start - 1, c);
        }
        let c = self.child(count);
        other.set_child(count - start - 1, c);

        other.set_count(count - start - 1);
        self.set_count(start);

        let pivot = K::read_from(&self.data[self.key_off(start)..]);

        // messages above the pivot belong to the new sibling
        let mut it = self.messages().upper_bound(&MessageKey::max(pivot));
        while it != 0 {
            let (mk, tag, payload, next) = {
                let m = self.messages();
                (m.key_at(it), m.tag_at(it), m.payload_at(it).to_vec(), m.next(it))
            };
            let applied = other.apply(&mk, tag, &payload);
            assert!(applied, "sibling message map overflow during split");
            self.messages_mut().erase(it);
            it = next;
        }

        pivot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: usize = 256;

    fn new_inner(buf: &mut [u8], level: u16) -> InnerPageMut<'_, u64, u64> {
        let mut inner = InnerPageMut::new(buf, EPSILON);
        inner.init(level);
        inner
    }

    #[test]
    fn test_capacity() {
        assert_eq!(47, capacity_for::<u64>(1024, EPSILON));
        assert_eq!(239, capacity_for::<u64>(4096, EPSILON));
    }

    #[test]
    fn test_pivot_insert_and_routing() {
        let mut buf = vec![0u8; 1024];
        let mut inner = new_inner(&mut buf, 1);
        inner.set_child(0, 100);

        inner.insert(&10, 101);
        inner.insert(&30, 103);
        inner.insert(&20, 102);

        assert_eq!(3, inner.count());
        assert_eq!(vec![10, 20, 30], (0..3).map(|i| inner.key(i)).collect::<Vec<_>>());

        let v = inner.view();
        // keys <= pivot route left of it
        assert_eq!(100, v.lower_bound_child(&5));
        assert_eq!(100, v.lower_bound_child(&10));
        assert_eq!(101, v.lower_bound_child(&11));
        assert_eq!(103, v.lower_bound_child(&31));
        // upper_bound treats the pivot itself as belonging left
        assert_eq!(101, v.upper_bound_child(&10));
        assert_eq!(103, v.upper_bound_child(&30));
    }

    #[test]
    fn test_message_range_by_child() {
        let mut buf = vec![0u8; 1024];
        let mut inner = new_inner(&mut buf, 1);
        inner.set_child(0, 100);
        inner.insert(&10, 101);
        inner.insert(&20, 102);

        let mut ts = 1;
        for key in [5u64, 10, 11, 20, 25].iter() {
            assert!(inner.message_insert(&MessageKey { key: *key, timestamp: ts }, key));
            ts += 1;
        }

        // child 0 covers (-inf, 10]: messages 5 and 10
        let keys_of = |inner: &InnerPageMut<'_, u64, u64>, idx: u16| {
            let (mut it, end) = inner.map_range(idx);
            let m = inner.messages();
            let mut out = Vec::new();
            while it != end {
                out.push(m.key_at(it).key);
                it = m.next(it);
            }
            out
        };
        assert_eq!(vec![5, 10], keys_of(&inner, 0));
        assert_eq!(vec![11, 20], keys_of(&inner, 1));
        assert_eq!(vec![25], keys_of(&inner, 2));
    }

    #[test]
    fn test_split_pushes_middle_key_up() {
        let mut buf = vec![0u8; 1024];
        let mut inner = new_inner(&mut buf, 1);
        inner.set_child(0, 100);
        for i in 1..=5u64 {
            inner.insert(&(i * 10), 100 + i);
        }
        // pivots: 10 20 30 40 50, children: 100..105

        let mut ts = 1;
        for key in [15u64, 25, 35, 45].iter() {
            assert!(inner.message_insert(&MessageKey { key: *key, timestamp: ts }, key));
            ts += 1;
        }

        let mut buf2 = vec![0u8; 1024];
        let mut other = new_inner(&mut buf2, 1);
        let pivot = inner.split(&mut other);

        assert_eq!(30, pivot);
        assert_eq!(2, inner.count());
        assert_eq!(2, other.count());
        assert_eq!(vec![10, 20], (0..2).map(|i| inner.key(i)).collect::<Vec<_>>());
        assert_eq!(vec![40, 50], (0..2).map(|i| other.key(i)).collect::<Vec<_>>());
        assert_eq!(102, inner.child(2));
        assert_eq!(103, other.child(0));
        assert_eq!(105, other.child(2));

        // messages <= pivot stay, the rest moved
        assert_eq!(2, inner.messages().size());
        assert_eq!(2, other.messages().size());
        inner.messages().check_rb_invariants();
        other.messages().check_rb_invariants();
    }
}
