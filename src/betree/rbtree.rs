//! An ordered map of buffered messages, packed into a fixed byte budget
//! inside an inner-node page.
//!
//! The map is a red-black tree laid out entirely within its byte slice:
//!
//! ```text
//! [ Header | Node 1 | Node 2 | ... --- free --- | val_k | ... | val_1 ]
//! ```
//!
//! Node slots grow upward from the header, tagged values grow downward from
//! the end. Erased nodes are detached from the tree and left behind as
//! tombstones (`Deleted` color) until an insert runs out of contiguous free
//! space and compacts both arenas.
//!
//! Keys are `(user key, timestamp)` pairs, so multiple messages for one user
//! key coexist and iterate oldest first. Node references are u16 slot
//! indices (1-based, 0 is the null reference); value references are u16 byte
//! offsets from the start of the map.

use std::marker::PhantomData;

use crate::{
    betree::message::{value_size, MessageKey},
    io::Datum,
};

pub const HEADER_SIZE: usize = 12;

const OFF_ROOT: usize = 0;
const OFF_NODE_COUNT: usize = 2;
const OFF_DATA_START: usize = 4;
const OFF_FREE_SPACE: usize = 6;
const OFF_DELETED_COUNT: usize = 8;
const OFF_DEAD_BYTES: usize = 10;

const BLACK: u8 = 0;
const RED: u8 = 1;
const DELETED: u8 = 2;

/// Byte footprint of one node slot.
pub fn node_size<K: Datum>() -> usize {
    // key, timestamp, value offset, parent, left, right, color
    K::SIZE + 8 + 2 + 2 + 2 + 2 + 1
}

/// Bytes an insert of the given variant consumes (node slot + tagged value).
pub fn entry_size<K: Datum, V: Datum>(tag: u8) -> usize {
    node_size::<K>() + value_size::<V>(tag)
}

fn get_u16(d: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([d[off], d[off + 1]])
}

fn put_u16(d: &mut [u8], off: usize, v: u16) {
    d[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn slot_off<K: Datum>(idx: u16) -> usize {
    debug_assert!(idx > 0);
    HEADER_SIZE + (idx as usize - 1) * node_size::<K>()
}

fn root(d: &[u8]) -> u16 {
    get_u16(d, OFF_ROOT)
}

fn node_count(d: &[u8]) -> u16 {
    get_u16(d, OFF_NODE_COUNT)
}

fn key_at<K: Datum>(d: &[u8], idx: u16) -> MessageKey<K> {
    let off = slot_off::<K>(idx);
    MessageKey {
        key: K::read_from(&d[off..]),
        timestamp: u64::read_from(&d[off + K::SIZE..]),
    }
}

fn voff<K: Datum>(d: &[u8], idx: u16) -> u16 {
    get_u16(d, slot_off::<K>(idx) + K::SIZE + 8)
}

fn parent<K: Datum>(d: &[u8], idx: u16) -> u16 {
    get_u16(d, slot_off::<K>(idx) + K::SIZE + 10)
}

fn left<K: Datum>(d: &[u8], idx: u16) -> u16 {
    get_u16(d, slot_off::<K>(idx) + K::SIZE + 12)
}

fn right<K: Datum>(d: &[u8], idx: u16) -> u16 {
    get_u16(d, slot_off::<K>(idx) + K::SIZE + 14)
}

fn color<K: Datum>(d: &[u8], idx: u16) -> u8 {
    d[slot_off::<K>(idx) + K::SIZE + 16]
}

fn minimum<K: Datum>(d: &[u8], mut idx: u16) -> u16 {
    while left::<K>(d, idx) != 0 {
        idx = left::<K>(d, idx);
    }
    idx
}

fn first<K: Datum>(d: &[u8]) -> u16 {
    let r = root(d);
    if r == 0 {
        0
    } else {
        minimum::<K>(d, r)
    }
}

fn next<K: Datum>(d: &[u8], idx: u16) -> u16 {
    let r = right::<K>(d, idx);
    if r != 0 {
        return minimum::<K>(d, r);
    }
    let mut cur = idx;
    let mut p = parent::<K>(d, cur);
    while p != 0 && cur == right::<K>(d, p) {
        cur = p;
        p = parent::<K>(d, p);
    }
    p
}

/// First node whose key is >= `mk`, 0 if none.
fn lower_bound<K: Datum>(d: &[u8], mk: &MessageKey<K>) -> u16 {
    let mut cur = root(d);
    let mut res = 0;
    while cur != 0 {
        if key_at::<K>(d, cur) < *mk {
            cur = right::<K>(d, cur);
        } else {
            res = cur;
            cur = left::<K>(d, cur);
        }
    }
    res
}

/// First node whose key is > `mk`, 0 if none.
fn upper_bound<K: Datum>(d: &[u8], mk: &MessageKey<K>) -> u16 {
    let mut cur = root(d);
    let mut res = 0;
    while cur != 0 {
        if key_at::<K>(d, cur) <= *mk {
            cur = right::<K>(d, cur);
        } else {
            res = cur;
            cur = left::<K>(d, cur);
        }
    }
    res
}

/// Read-only view of a message map inside a borrowed byte slice.
pub struct MessageMap<'a, K: Datum, V: Datum> {
    data: &'a [u8],
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: Datum, V: Datum> MessageMap<'a, K, V> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        (node_count(self.data) - get_u16(self.data, OFF_DELETED_COUNT)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Free bytes an insert could use, counting tombstone space that the
    /// next compaction would reclaim.
    pub fn capacity_bytes(&self) -> usize {
        (get_u16(self.data, OFF_FREE_SPACE) + get_u16(self.data, OFF_DEAD_BYTES)) as usize
    }

    pub fn first(&self) -> u16 {
        first::<K>(self.data)
    }

    pub fn next(&self, idx: u16) -> u16 {
        next::<K>(self.data, idx)
    }

    pub fn lower_bound(&self, mk: &MessageKey<K>) -> u16 {
        lower_bound::<K>(self.data, mk)
    }

    pub fn upper_bound(&self, mk: &MessageKey<K>) -> u16 {
        upper_bound::<K>(self.data, mk)
    }

    pub fn find(&self, mk: &MessageKey<K>) -> u16 {
        let idx = self.lower_bound(mk);
        if idx != 0 && key_at::<K>(self.data, idx) == *mk {
            idx
        } else {
            0
        }
    }

    /// All messages whose user key equals `key`, oldest first.
    pub fn key_range(&self, key: K) -> (u16, u16) {
        (
            self.lower_bound(&MessageKey::min(key)),
            self.upper_bound(&MessageKey::max(key)),
        )
    }

    pub fn key_at(&self, idx: u16) -> MessageKey<K> {
        key_at::<K>(self.data, idx)
    }

    pub fn tag_at(&self, idx: u16) -> u8 {
        self.data[voff::<K>(self.data, idx) as usize]
    }

    pub fn payload_at(&self, idx: u16) -> &'a [u8] {
        let off = voff::<K>(self.data, idx) as usize;
        let tag = self.data[off];
        &self.data[off + 1..off + value_size::<V>(tag)]
    }

    /// Bytes this entry occupies (node slot plus tagged value).
    pub fn entry_bytes_at(&self, idx: u16) -> usize {
        entry_size::<K, V>(self.tag_at(idx))
    }

    /// Walk the whole structure and panic on any violated red-black, BST or
    /// bookkeeping invariant. Testing aid.
    pub fn check_rb_invariants(&self) {
        let d = self.data;
        let r = root(d);
        if r == 0 {
            assert_eq!(0, self.size());
            return;
        }
        assert_eq!(BLACK, color::<K>(d, r), "root must be black");
        assert_eq!(0, parent::<K>(d, r));

        let mut stack: Vec<(u16, u32)> = vec![(r, 0)];
        let mut black_depth: Option<u32> = None;
        let mut live = 0usize;

        while let Some((idx, depth)) = stack.pop() {
            if idx == 0 {
                match black_depth {
                    None => black_depth = Some(depth),
                    Some(bd) => assert_eq!(bd, depth, "unequal black depth"),
                }
                continue;
            }

            live += 1;
            let c = color::<K>(d, idx);
            assert_ne!(DELETED, c, "tombstone reachable from the root");

            let l = left::<K>(d, idx);
            let rr = right::<K>(d, idx);
            if c == RED {
                if l != 0 {
                    assert_eq!(BLACK, color::<K>(d, l), "red node with red child");
                }
                if rr != 0 {
                    assert_eq!(BLACK, color::<K>(d, rr), "red node with red child");
                }
            }
            if l != 0 {
                assert_eq!(idx, parent::<K>(d, l));
            }
            if rr != 0 {
                assert_eq!(idx, parent::<K>(d, rr));
            }

            let is_black = (c == BLACK) as u32;
            stack.push((l, depth + is_black));
            stack.push((rr, depth + is_black));
        }

        assert_eq!(live, self.size(), "reachable nodes vs size mismatch");

        // global ordering via an in-order walk
        let mut it = self.first();
        let mut prev: Option<MessageKey<K>> = None;
        while it != 0 {
            let k = self.key_at(it);
            if let Some(p) = prev {
                assert!(p < k, "in-order keys not strictly increasing");
            }
            prev = Some(k);
            it = self.next(it);
        }
    }
}

/// Mutable view of a message map inside a borrowed byte slice.
pub struct MessageMapMut<'a, K: Datum, V: Datum> {
    data: &'a mut [u8],
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: Datum, V: Datum> MessageMapMut<'a, K, V> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    pub fn view(&self) -> MessageMap<'_, K, V> {
        MessageMap::new(self.data)
    }

    /// Format an empty map over the whole slice.
    pub fn init(&mut self) {
        let len = self.data.len();
        assert!(len <= u16::max_value() as usize);
        assert!(len >= HEADER_SIZE + entry_size::<K, V>(0));
        put_u16(self.data, OFF_ROOT, 0);
        put_u16(self.data, OFF_NODE_COUNT, 0);
        put_u16(self.data, OFF_DATA_START, len as u16);
        put_u16(self.data, OFF_FREE_SPACE, (len - HEADER_SIZE) as u16);
        put_u16(self.data, OFF_DELETED_COUNT, 0);
        put_u16(self.data, OFF_DEAD_BYTES, 0);
    }

    /// Insert a message. Returns false iff the map lacks space even after
    /// compaction. Inserting an already-present `(key, timestamp)` pair is a
    /// logic error and panics.
    pub fn insert(&mut self, mk: &MessageKey<K>, tag: u8, payload: &[u8]) -> bool {
        let nsize = node_size::<K>();
        let vsize = value_size::<V>(tag);
        debug_assert_eq!(vsize - 1, payload.len());
        let need = nsize + vsize;

        if (get_u16(self.data, OFF_FREE_SPACE) as usize) < need
            && get_u16(self.data, OFF_DEAD_BYTES) != 0
        {
            self.compress();
        }
        if (get_u16(self.data, OFF_FREE_SPACE) as usize) < need {
            return false;
        }

        // find the attachment point
        let mut p = 0u16;
        let mut go_left = false;
        let mut cur = root(self.data);
        while cur != 0 {
            let ck = key_at::<K>(self.data, cur);
            p = cur;
            if *mk < ck {
                go_left = true;
                cur = left::<K>(self.data, cur);
            } else if ck < *mk {
                go_left = false;
                cur = right::<K>(self.data, cur);
            } else {
                panic!("duplicate message key: {:?}", mk);
            }
        }

        // reserve the value at the low end of the value heap
        let ds = get_u16(self.data, OFF_DATA_START) as usize - vsize;
        self.data[ds] = tag;
        self.data[ds + 1..ds + vsize].copy_from_slice(payload);
        put_u16(self.data, OFF_DATA_START, ds as u16);

        // reserve the node slot
        let idx = node_count(self.data) + 1;
        put_u16(self.data, OFF_NODE_COUNT, idx);
        let off = slot_off::<K>(idx);
        mk.key.write_to(&mut self.data[off..]);
        mk.timestamp.write_to(&mut self.data[off + K::SIZE..]);
        put_u16(self.data, off + K::SIZE + 8, ds as u16);
        put_u16(self.data, off + K::SIZE + 10, p);
        put_u16(self.data, off + K::SIZE + 12, 0);
        put_u16(self.data, off + K::SIZE + 14, 0);
        self.data[off + K::SIZE + 16] = RED;

        let free = get_u16(self.data, OFF_FREE_SPACE) as usize - need;
        put_u16(self.data, OFF_FREE_SPACE, free as u16);

        if p == 0 {
            put_u16(self.data, OFF_ROOT, idx);
            self.set_color(idx, BLACK);
            return true;
        }
        if go_left {
            self.set_left(p, idx);
        } else {
            self.set_right(p, idx);
        }
        self.insert_fixup(idx);
        true
    }

    /// Detach the node from the tree and tombstone its slot. Constant
    /// amortized cost; indices of other nodes stay valid.
    pub fn erase(&mut self, z: u16) {
        debug_assert_ne!(0, z);
        debug_assert_ne!(DELETED, color::<K>(self.data, z));

        let mut y_color = color::<K>(self.data, z);
        let x;
        let x_parent;

        if left::<K>(self.data, z) == 0 {
            x = right::<K>(self.data, z);
            x_parent = parent::<K>(self.data, z);
            self.transplant(z, x);
        } else if right::<K>(self.data, z) == 0 {
            x = left::<K>(self.data, z);
            x_parent = parent::<K>(self.data, z);
            self.transplant(z, x);
        } else {
            // replace z by its in-order successor, relinking (not copying)
            // so indices of other nodes stay stable
            let y = minimum::<K>(self.data, right::<K>(self.data, z));
            y_color = color::<K>(self.data, y);
            x = right::<K>(self.data, y);
            if parent::<K>(self.data, y) == z {
                x_parent = y;
            } else {
                x_parent = parent::<K>(self.data, y);
                self.transplant(y, x);
                let zr = right::<K>(self.data, z);
                self.set_right(y, zr);
                self.set_parent(zr, y);
            }
            self.transplant(z, y);
            let zl = left::<K>(self.data, z);
            self.set_left(y, zl);
            self.set_parent(zl, y);
            self.set_color(y, color::<K>(self.data, z));
        }

        if y_color == BLACK {
            self.erase_fixup(x, x_parent);
        }

        // tombstone the slot; the bytes are reclaimed by compress()
        let tag = self.data[voff::<K>(self.data, z) as usize];
        let dead = node_size::<K>() + value_size::<V>(tag);
        self.set_color(z, DELETED);
        put_u16(
            self.data,
            OFF_DELETED_COUNT,
            get_u16(self.data, OFF_DELETED_COUNT) + 1,
        );
        put_u16(
            self.data,
            OFF_DEAD_BYTES,
            get_u16(self.data, OFF_DEAD_BYTES) + dead as u16,
        );
    }

    fn set_parent(&mut self, idx: u16, v: u16) {
        if idx != 0 {
            put_u16(self.data, slot_off::<K>(idx) + K::SIZE + 10, v);
        }
    }

    fn set_left(&mut self, idx: u16, v: u16) {
        put_u16(self.data, slot_off::<K>(idx) + K::SIZE + 12, v);
    }

    fn set_right(&mut self, idx: u16, v: u16) {
        put_u16(self.data, slot_off::<K>(idx) + K::SIZE + 14, v);
    }

    fn set_color(&mut self, idx: u16, c: u8) {
        self.data[slot_off::<K>(idx) + K::SIZE + 16] = c;
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: u16, v: u16) {
        let p = parent::<K>(self.data, u);
        if p == 0 {
            put_u16(self.data, OFF_ROOT, v);
        } else if u == left::<K>(self.data, p) {
            self.set_left(p, v);
        } else {
            self.set_right(p, v);
        }
        self.set_parent(v, p);
    }

    fn rotate_left(&mut self, x: u16) {
        let y = right::<K>(self.data, x);
        debug_assert_ne!(0, y);

        let yl = left::<K>(self.data, y);
        self.set_right(x, yl);
        self.set_parent(yl, x);

        let xp = parent::<K>(self.data, x);
        self.set_parent(y, xp);
        if xp == 0 {
            put_u16(self.data, OFF_ROOT, y);
        } else if x == left::<K>(self.data, xp) {
            self.set_left(xp, y);
        } else {
            self.set_right(xp, y);
        }

        self.set_left(y, x);
        self.set_parent(x, y);
    }

    fn rotate_right(&mut self, x: u16) {
        let y = left::<K>(self.data, x);
        debug_assert_ne!(0, y);

        let yr = right::<K>(self.data, y);
        self.set_left(x, yr);
        self.set_parent(yr, x);

        let xp = parent::<K>(self.data, x);
        self.set_parent(y, xp);
        if xp == 0 {
            put_u16(self.data, OFF_ROOT, y);
        } else if x == left::<K>(self.data, xp) {
            self.set_left(xp, y);
        } else {
            self.set_right(xp, y);
        }

        self.set_right(y, x);
        self.set_parent(x, y);
    }

    fn insert_fixup(&mut self, mut x: u16) {
        loop {
            let p = parent::<K>(self.data, x);
            if p == 0 || color::<K>(self.data, p) == BLACK {
                break;
            }
            // p is red, so it cannot be the root and g exists
            let g = parent::<K>(self.data, p);
            if p == left::<K>(self.data, g) {
                let u = right::<K>(self.data, g);
                if u != 0 && color::<K>(self.data, u) == RED {
                    self.set_color(p, BLACK);
                    self.set_color(u, BLACK);
                    self.set_color(g, RED);
                    x = g;
                } else {
                    if x == right::<K>(self.data, p) {
                        x = p;
                        self.rotate_left(x);
                    }
                    let p = parent::<K>(self.data, x);
                    let g = parent::<K>(self.data, p);
                    self.set_color(p, BLACK);
                    self.set_color(g, RED);
                    self.rotate_right(g);
                }
            } else {
                let u = left::<K>(self.data, g);
                if u != 0 && color::<K>(self.data, u) == RED {
                    self.set_color(p, BLACK);
                    self.set_color(u, BLACK);
                    self.set_color(g, RED);
                    x = g;
                } else {
                    if x == left::<K>(self.data, p) {
                        x = p;
                        self.rotate_right(x);
                    }
                    let p = parent::<K>(self.data, x);
                    let g = parent::<K>(self.data, p);
                    self.set_color(p, BLACK);
                    self.set_color(g, RED);
                    self.rotate_left(g);
                }
            }
        }
        let r = root(self.data);
        self.set_color(r, BLACK);
    }

    /// Restore the equal-black-height invariant after removing a black node.
    /// `x` (possibly null) carries the missing black, `xp` is its parent.
    fn erase_fixup(&mut self, mut x: u16, mut xp: u16) {
        while x != root(self.data) && (x == 0 || color::<K>(self.data, x) == BLACK) {
            if xp == 0 {
                break;
            }
            if x == left::<K>(self.data, xp) {
                let mut w = right::<K>(self.data, xp);
                if color::<K>(self.data, w) == RED {
                    self.set_color(w, BLACK);
                    self.set_color(xp, RED);
                    self.rotate_left(xp);
                    w = right::<K>(self.data, xp);
                }
                let wl = left::<K>(self.data, w);
                let wr = right::<K>(self.data, w);
                let wl_black = wl == 0 || color::<K>(self.data, wl) == BLACK;
                let wr_black = wr == 0 || color::<K>(self.data, wr) == BLACK;
                if wl_black && wr_black {
                    self.set_color(w, RED);
                    x = xp;
                    xp = parent::<K>(self.data, x);
                } else {
                    if wr_black {
                        if wl != 0 {
                            self.set_color(wl, BLACK);
                        }
                        self.set_color(w, RED);
                        self.rotate_right(w);
                        w = right::<K>(self.data, xp);
                    }
                    let xpc = color::<K>(self.data, xp);
                    self.set_color(w, xpc);
                    self.set_color(xp, BLACK);
                    let wr = right::<K>(self.data, w);
                    if wr != 0 {
                        self.set_color(wr, BLACK);
                    }
                    self.rotate_left(xp);
                    x = root(self.data);
                    xp = 0;
                }
            } else {
                let mut w = left::<K>(self.data, xp);
                if color::<K>(self.data, w) == RED {
                    self.set_color(w, BLACK);
                    self.set_color(xp, RED);
                    self.rotate_right(xp);
                    w = left::<K>(self.data, xp);
                }
                let wl = left::<K>(self.data, w);
                let wr = right::<K>(self.data, w);
                let wl_black = wl == 0 || color::<K>(self.data, wl) == BLACK;
                let wr_black = wr == 0 || color::<K>(self.data, wr) == BLACK;
                if wl_black && wr_black {
                    self.set_color(w, RED);
                    x = xp;
                    xp = parent::<K>(self.data, x);
                } else {
                    if wl_black {
                        if wr != 0 {
                            self.set_color(wr, BLACK);
                        }
                        self.set_color(w, RED);
                        self.rotate_left(w);
                        w = left::<K>(self.data, xp);
                    }
                    let xpc = color::<K>(self.data, xp);
                    self.set_color(w, xpc);
                    self.set_color(xp, BLACK);
                    let wl = left::<K>(self.data, w);
                    if wl != 0 {
                        self.set_color(wl, BLACK);
                    }
                    self.rotate_right(xp);
                    x = root(self.data);
                    xp = 0;
                }
            }
        }
        if x != 0 {
            self.set_color(x, BLACK);
        }
    }

    /// Close the gaps left by tombstones: slide live node slots toward the
    /// header, live values toward the end of the slice, and remap every
    /// stored index and offset. Invalidates outstanding node indices.
    fn compress(&mut self) {
        let n = node_count(self.data);
        let nsize = node_size::<K>();

        let mut remap = vec![0u16; n as usize + 1];
        let mut live = 0u16;
        for i in 1..=n {
            if color::<K>(self.data, i) != DELETED {
                live += 1;
                remap[i as usize] = live;
            }
        }

        for i in 1..=n {
            let ni = remap[i as usize];
            if ni != 0 && ni != i {
                let src = slot_off::<K>(i);
                let dst = slot_off::<K>(ni);
                self.data.copy_within(src..src + nsize, dst);
            }
        }
        put_u16(self.data, OFF_NODE_COUNT, live);

        let r = root(self.data);
        put_u16(self.data, OFF_ROOT, remap[r as usize]);
        for i in 1..=live {
            let p = parent::<K>(self.data, i);
            self.set_parent(i, remap[p as usize]);
            let l = left::<K>(self.data, i);
            self.set_left(i, remap[l as usize]);
            let rr = right::<K>(self.data, i);
            self.set_right(i, remap[rr as usize]);
        }

        // compact values towards the high end, highest offsets first
        let mut values: Vec<(u16, u16, usize)> = (1..=live)
            .map(|i| {
                let off = voff::<K>(self.data, i);
                let tag = self.data[off as usize];
                (i, off, value_size::<V>(tag))
            })
            .collect();
        values.sort_by(|a, b| b.1.cmp(&a.1));

        let mut new_off = self.data.len();
        for (i, off, size) in values {
            new_off -= size;
            if new_off != off as usize {
                self.data.copy_within(off as usize..off as usize + size, new_off);
            }
            put_u16(self.data, slot_off::<K>(i) + K::SIZE + 8, new_off as u16);
        }
        put_u16(self.data, OFF_DATA_START, new_off as u16);

        let free = get_u16(self.data, OFF_FREE_SPACE) + get_u16(self.data, OFF_DEAD_BYTES);
        put_u16(self.data, OFF_FREE_SPACE, free);
        put_u16(self.data, OFF_DELETED_COUNT, 0);
        put_u16(self.data, OFF_DEAD_BYTES, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::betree::message::{TAG_ERASE, TAG_INSERT};
    use crate::io::Datum;

    // insertion order producing an irregular tree shape
    const TRAVERSAL_TEST: [u64; 17] = [1, 10, 8, 3, 6, 4, 7, 11, 9, 17, 2, 5, 15, 14, 13, 16, 12];

    fn new_map(buf: &mut [u8]) -> MessageMapMut<'_, u64, u64> {
        let mut m = MessageMapMut::new(buf);
        m.init();
        m
    }

    fn insert_value(m: &mut MessageMapMut<'_, u64, u64>, mk: MessageKey<u64>, v: u64) -> bool {
        let mut payload = [0u8; 8];
        v.write_to(&mut payload);
        m.insert(&mk, TAG_INSERT, &payload)
    }

    fn insert_erase(m: &mut MessageMapMut<'_, u64, u64>, mk: MessageKey<u64>) -> bool {
        m.insert(&mk, TAG_ERASE, &[])
    }

    #[test]
    fn test_linear_insertion() {
        let mut buf = vec![0u8; 255];
        let mut m = new_map(&mut buf);

        let mut i = 0;
        while insert_erase(&mut m, MessageKey { key: i, timestamp: 0 }) {
            i += 1;
            m.view().check_rb_invariants();
        }
        assert!(i > 0);
        assert_eq!(i as usize, m.view().size());
    }

    #[test]
    fn test_linear_reverse_insertion() {
        let mut buf = vec![0u8; 255];
        let mut m = new_map(&mut buf);

        let mut i = u64::max_value();
        while insert_erase(&mut m, MessageKey { key: i, timestamp: 0 }) {
            i -= 1;
            m.view().check_rb_invariants();
        }
        assert_eq!(u64::max_value() - i, m.view().size() as u64);
    }

    #[test]
    fn test_same_key_timestamp_order() {
        let mut buf = vec![0u8; 255];
        let mut m = new_map(&mut buf);

        // same user key, alternating timestamps
        assert!(insert_value(&mut m, MessageKey { key: 5, timestamp: 4 }, 40));
        assert!(insert_value(&mut m, MessageKey { key: 5, timestamp: 1 }, 10));
        assert!(insert_value(&mut m, MessageKey { key: 5, timestamp: 3 }, 30));
        m.view().check_rb_invariants();

        let v = m.view();
        let (mut it, end) = v.key_range(5);
        let mut seen = Vec::new();
        while it != end {
            seen.push(v.key_at(it).timestamp);
            it = v.next(it);
        }
        assert_eq!(vec![1, 3, 4], seen);
    }

    #[test]
    fn test_irregular_insertion_and_iteration() {
        let mut buf = vec![0u8; 1024];
        let mut m = new_map(&mut buf);

        for k in TRAVERSAL_TEST.iter() {
            assert!(insert_value(&mut m, MessageKey { key: *k, timestamp: 0 }, *k));
            m.view().check_rb_invariants();
        }

        let v = m.view();
        let mut it = v.first();
        let mut expect = 1;
        while it != 0 {
            assert_eq!(expect, v.key_at(it).key);
            assert_eq!(expect, u64::read_from(v.payload_at(it)));
            expect += 1;
            it = v.next(it);
        }
        assert_eq!(18, expect);
    }

    #[test]
    fn test_find_and_bounds() {
        let mut buf = vec![0u8; 1024];
        let mut m = new_map(&mut buf);
        assert_eq!(0, m.view().find(&MessageKey { key: 0, timestamp: 0 }));

        let mut i = 1;
        while insert_value(&mut m, MessageKey { key: i, timestamp: 0 }, i) {
            i += 5;
        }

        let v = m.view();
        assert_eq!(0, v.find(&MessageKey { key: 0, timestamp: 0 }));
        assert_eq!(0, v.find(&MessageKey { key: 1, timestamp: 1 }));
        for j in (1..i).step_by(5) {
            let idx = v.find(&MessageKey { key: j, timestamp: 0 });
            assert_ne!(0, idx);
            assert_eq!(j, v.key_at(idx).key);

            let lb = v.lower_bound(&MessageKey { key: j - 1, timestamp: 0 });
            assert_eq!(j, v.key_at(lb).key);
            let ub = v.upper_bound(&MessageKey { key: j, timestamp: u64::max_value() });
            if j + 5 < i {
                assert_eq!(j + 5, v.key_at(ub).key);
            } else {
                assert_eq!(0, ub);
            }
        }
    }

    #[test]
    fn test_single_erase() {
        let mut buf = vec![0u8; 255];
        let mut m = new_map(&mut buf);

        assert!(insert_value(&mut m, MessageKey { key: 1, timestamp: 2 }, 3));
        let idx = m.view().find(&MessageKey { key: 1, timestamp: 2 });
        m.erase(idx);

        assert_eq!(0, m.view().size());
        m.view().check_rb_invariants();
        assert_eq!(0, m.view().first());
    }

    #[test]
    fn test_fill_empty_fill() {
        let mut buf = vec![0u8; 255];
        let mut m = new_map(&mut buf);

        let mut i = 0;
        while insert_erase(&mut m, MessageKey { key: i, timestamp: 0 }) {
            i += 1;
        }
        assert_eq!(i as usize, m.view().size());

        let mut it = m.view().first();
        while it != 0 {
            m.erase(it);
            m.view().check_rb_invariants();
            it = m.view().first();
        }
        assert_eq!(0, m.view().size());

        // tombstones are reclaimed, the map refills to the same count
        let mut j = 0;
        while insert_erase(&mut m, MessageKey { key: j, timestamp: 0 }) {
            j += 1;
            m.view().check_rb_invariants();
        }
        assert_eq!(i, j);
    }

    #[test]
    fn test_erase_by_irregular_order() {
        let mut buf = vec![0u8; 1024];
        let mut m = new_map(&mut buf);

        for k in 1..=TRAVERSAL_TEST.len() as u64 {
            assert!(insert_value(&mut m, MessageKey { key: k, timestamp: 0 }, k));
        }
        for k in TRAVERSAL_TEST.iter() {
            let idx = m.view().find(&MessageKey { key: *k, timestamp: 0 });
            assert_ne!(0, idx);
            m.erase(idx);
            m.view().check_rb_invariants();
        }
        assert_eq!(0, m.view().size());
    }

    #[test]
    fn test_capacity_accounting() {
        let mut buf = vec![0u8; 255];
        let mut m = new_map(&mut buf);
        let total = m.view().capacity_bytes();
        assert_eq!(255 - HEADER_SIZE, total);

        assert!(insert_value(&mut m, MessageKey { key: 1, timestamp: 0 }, 1));
        let one = entry_size::<u64, u64>(TAG_INSERT);
        assert_eq!(total - one, m.view().capacity_bytes());

        let idx = m.view().find(&MessageKey { key: 1, timestamp: 0 });
        m.erase(idx);
        // tombstone bytes count as capacity again
        assert_eq!(total, m.view().capacity_bytes());
    }
}
