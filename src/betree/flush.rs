//! Batched message propagation: when the root's message map runs out of
//! space, the tree picks the child with the largest queued batch, pins a
//! path downward and applies messages either to a deeper message map or,
//! at the bottom, to the leaves themselves (splitting as needed).

use std::collections::BTreeMap;

use log::debug;

use crate::{
    betree::{
        inner::{InnerPage, InnerPageMut},
        leaf::{LeafPage, LeafPageMut},
        message::{decode_upsert, TAG_ERASE, TAG_INSERT, TAG_INSERT_OR_ASSIGN, TAG_UPSERT},
        node, page_id,
        tree::BeTree,
    },
    buffer::ExclusiveFix,
    error::StorageResult,
    io::Datum,
};

struct FlushEntry {
    fix: ExclusiveFix,
    /// Child index the next drain from this node goes to.
    index: u16,
    /// Total message bytes queued for that child.
    bytes: usize,
}

struct LeafSlot {
    fix: ExclusiveFix,
    in_tree: bool,
}

impl<K: Datum, V: Datum> BeTree<K, V> {
    /// Push message batches down the tree until the root's message map has
    /// at least `min_bytes` of capacity. Consumes the root fix and returns
    /// a fix of the (possibly new) root.
    pub(crate) fn flush(
        &mut self,
        root_fix: ExclusiveFix,
        min_bytes: usize,
    ) -> StorageResult<ExclusiveFix> {
        let eps = self.epsilon;
        debug!(
            "flushing segment {} until {} map bytes are free",
            self.segment_id, min_bytes
        );

        let mut flushes: Vec<FlushEntry> = Vec::new();
        {
            let g = root_fix.data();
            let root = InnerPage::<K, V>::new(&g[..], eps);
            assert!(
                !root.messages().is_empty(),
                "flush requested with no buffered messages"
            );
        }
        {
            let (index, bytes) = self.find_flush(&root_fix)?;
            flushes.push(FlushEntry {
                fix: root_fix,
                index,
                bytes,
            });
        }

        // Leaves touched by this flush, keyed by the exclusive lower bound
        // of their key range; the leftmost leaf has no bound. The batch
        // keeps them pinned until the new ones are attached.
        let mut left_leaf: Option<LeafSlot> = None;
        let mut leaves: BTreeMap<K, LeafSlot> = BTreeMap::new();
        let mut refresh_root = false;

        loop {
            {
                let g = flushes[0].fix.data();
                let root = InnerPage::<K, V>::new(&g[..], eps);
                if root.messages().capacity_bytes() >= min_bytes {
                    break;
                }
            }

            if refresh_root {
                // the root's chosen batch was just drained; pick anew
                let (index, bytes) = self.find_flush(&flushes[0].fix)?;
                flushes[0].index = index;
                flushes[0].bytes = bytes;
                refresh_root = false;
            }

            let (child_no, src_index, src_bytes, src_level) = {
                let e = flushes.last().unwrap();
                let g = e.fix.data();
                let inner = InnerPage::<K, V>::new(&g[..], eps);
                (inner.child(e.index), e.index, e.bytes, inner.level())
            };

            if src_level > 1 {
                let target = self.fix_exclusive(child_no)?;
                debug_assert!(!node::is_leaf(&target.data()[..]));
                let capacity = {
                    let g = target.data();
                    InnerPage::<K, V>::new(&g[..], eps).messages().capacity_bytes()
                };
                if capacity < src_bytes {
                    let (index, bytes) = self.find_flush(&target)?;
                    // find_flush may already have drained into dirty children
                    let capacity = {
                        let g = target.data();
                        InnerPage::<K, V>::new(&g[..], eps).messages().capacity_bytes()
                    };
                    if capacity < src_bytes {
                        flushes.push(FlushEntry {
                            fix: target,
                            index,
                            bytes,
                        });
                        continue;
                    }
                }

                {
                    let src = flushes.last().unwrap();
                    let mut sg = src.fix.data_mut();
                    let mut tg = target.data_mut();
                    let mut s = InnerPageMut::<K, V>::new(&mut sg[..], eps);
                    let mut t = InnerPageMut::<K, V>::new(&mut tg[..], eps);
                    drain_range(&mut s, src_index, &mut t);
                }
                flushes.last().unwrap().fix.set_dirty();
                target.set_dirty();
            } else {
                // the target is a leaf; it may already be pinned in the
                // batch from an earlier round, in which case re-fixing it
                // would wait on our own pin
                let child_pid = page_id::compose(self.segment_id, child_no);
                let pinned = left_leaf
                    .as_ref()
                    .map_or(false, |s| s.fix.page_id() == child_pid)
                    || leaves.values().any(|s| s.fix.page_id() == child_pid);
                if !pinned {
                    let target = self.fix_exclusive(child_no)?;
                    debug_assert!(node::is_leaf(&target.data()[..]));

                    // register it under the nearest pivot left of the
                    // drained range
                    let lower: Option<K> = flushes.iter().rev().find_map(|e| {
                        if e.index > 0 {
                            let g = e.fix.data();
                            Some(InnerPage::<K, V>::new(&g[..], eps).key(e.index - 1))
                        } else {
                            None
                        }
                    });
                    match lower {
                        Some(k) => {
                            leaves.insert(
                                k,
                                LeafSlot {
                                    fix: target,
                                    in_tree: true,
                                },
                            );
                        }
                        None => {
                            left_leaf = Some(LeafSlot {
                                fix: target,
                                in_tree: true,
                            });
                        }
                    }
                }

                {
                    let src = flushes.last().unwrap();
                    // split the borrows: the source fix is only read/erased,
                    // the leaf batch and the tree counters are mutated
                    let src_fix = &src.fix;
                    self.drain_leaf_batch(src_fix, src_index, &mut left_leaf, &mut leaves)?;
                }
                flushes.last().unwrap().fix.set_dirty();
            }

            if flushes.len() > 1 {
                flushes.pop();
            } else {
                refresh_root = true;
            }
        }

        // release the pinned path, then attach the freshly created leaves
        // by a descent from the root (splitting full nodes on the way)
        flushes.clear();
        let mut new_leaves: Vec<(K, u64)> = Vec::new();
        for (k, slot) in leaves.iter() {
            if !slot.in_tree {
                new_leaves.push((*k, page_id::page_no(slot.fix.page_id())));
            }
        }
        drop(leaves);
        drop(left_leaf);

        for (pivot, page_no) in new_leaves {
            self.attach_leaf(&pivot, page_no)?;
        }

        let root_no = self.root.expect("flush on an empty tree");
        self.fix_exclusive(root_no)
    }

    /// Pick the child of `fix` with the largest total of queued message
    /// bytes. As a shortcut, message batches whose inner child is already
    /// resident and dirty are pushed down right away while they fit.
    pub(crate) fn find_flush(&mut self, fix: &ExclusiveFix) -> StorageResult<(u16, usize)> {
        let eps = self.epsilon;
        let (count, level) = {
            let g = fix.data();
            (node::count(&g[..]), node::level(&g[..]))
        };

        let mut best_index = 0u16;
        let mut best_bytes = 0usize;

        for i in 0..=count {
            if level > 1 {
                let child_no = {
                    let g = fix.data();
                    InnerPage::<K, V>::new(&g[..], eps).child(i)
                };
                if self
                    .pool
                    .is_dirty(page_id::compose(self.segment_id, child_no))
                {
                    let child_fix = self.fix_exclusive(child_no)?;
                    let moved = {
                        let mut sg = fix.data_mut();
                        let mut cg = child_fix.data_mut();
                        let mut s = InnerPageMut::<K, V>::new(&mut sg[..], eps);
                        let mut c = InnerPageMut::<K, V>::new(&mut cg[..], eps);
                        drain_while_fits(&mut s, i, &mut c)
                    };
                    if moved {
                        fix.set_dirty();
                    }
                }
            }

            let bytes = {
                let g = fix.data();
                let inner = InnerPage::<K, V>::new(&g[..], eps);
                let m = inner.messages();
                let (mut it, end) = inner.map_range(i);
                let mut total = 0usize;
                while it != end {
                    total += m.entry_bytes_at(it);
                    it = m.next(it);
                }
                total
            };
            if bytes > best_bytes {
                best_bytes = bytes;
                best_index = i;
            }
        }

        // best_bytes may be 0 when the pre-drain above emptied the map; the
        // flush loop's capacity check terminates in that case
        Ok((best_index, best_bytes))
    }

    /// Apply one drained batch to the leaves, splitting them as needed. New
    /// leaves land in the batch map tagged `in_tree: false`.
    fn drain_leaf_batch(
        &mut self,
        src_fix: &ExclusiveFix,
        src_index: u16,
        left_leaf: &mut Option<LeafSlot>,
        leaves: &mut BTreeMap<K, LeafSlot>,
    ) -> StorageResult<()> {
        let eps = self.epsilon;

        let (mut it, end) = {
            let g = src_fix.data();
            InnerPage::<K, V>::new(&g[..], eps).map_range(src_index)
        };

        while it != end {
            let (key, tag, payload, next) = {
                let g = src_fix.data();
                let inner = InnerPage::<K, V>::new(&g[..], eps);
                let m = inner.messages();
                (m.key_at(it).key, m.tag_at(it), m.payload_at(it).to_vec(), m.next(it))
            };

            loop {
                let slot_key: Option<K> = leaves.range(..key).next_back().map(|(k, _)| *k);

                let (present, full, idx) = {
                    let slot = match slot_key {
                        Some(ref k) => leaves.get(k).expect("batch leaf vanished"),
                        None => left_leaf.as_ref().expect("leftmost batch leaf missing"),
                    };
                    let g = slot.fix.data();
                    let leaf = LeafPage::<K, V>::new(&g[..]);
                    let idx = leaf.lower_bound(&key);
                    (leaf.is_equal(&key, idx), leaf.full(), idx)
                };

                let needs_space = match tag {
                    TAG_INSERT | TAG_INSERT_OR_ASSIGN => !present,
                    _ => false,
                };
                if needs_space && full {
                    let new_fix = self.new_leaf()?;
                    let pivot = {
                        let slot = match slot_key {
                            Some(ref k) => leaves.get(k).expect("batch leaf vanished"),
                            None => left_leaf.as_ref().expect("leftmost batch leaf missing"),
                        };
                        let mut lg = slot.fix.data_mut();
                        let mut ng = new_fix.data_mut();
                        let pivot = LeafPageMut::<K, V>::new(&mut lg[..])
                            .split(&mut LeafPageMut::new(&mut ng[..]));
                        slot.fix.set_dirty();
                        pivot
                    };
                    leaves.insert(
                        pivot,
                        LeafSlot {
                            fix: new_fix,
                            in_tree: false,
                        },
                    );
                    // the key may now belong to the new sibling, re-resolve
                    continue;
                }

                {
                    let slot = match slot_key {
                        Some(ref k) => leaves.get(k).expect("batch leaf vanished"),
                        None => left_leaf.as_ref().expect("leftmost batch leaf missing"),
                    };
                    match tag {
                        TAG_INSERT => {
                            if !present {
                                let mut g = slot.fix.data_mut();
                                let mut leaf = LeafPageMut::<K, V>::new(&mut g[..]);
                                leaf.make_space(&key, idx);
                                leaf.set_value(idx, &V::read_from(&payload));
                                drop(g);
                                slot.fix.set_dirty();
                                self.count += 1;
                            }
                            self.pending -= 1;
                        }
                        TAG_INSERT_OR_ASSIGN => {
                            let mut g = slot.fix.data_mut();
                            let mut leaf = LeafPageMut::<K, V>::new(&mut g[..]);
                            if present {
                                leaf.set_value(idx, &V::read_from(&payload));
                            } else {
                                leaf.make_space(&key, idx);
                                leaf.set_value(idx, &V::read_from(&payload));
                                self.count += 1;
                            }
                            drop(g);
                            slot.fix.set_dirty();
                            self.pending -= 1;
                        }
                        TAG_UPSERT => {
                            if present {
                                let f = decode_upsert::<V>(&payload);
                                let mut g = slot.fix.data_mut();
                                let mut leaf = LeafPageMut::<K, V>::new(&mut g[..]);
                                let old = leaf.value(idx);
                                leaf.set_value(idx, &f(old));
                                drop(g);
                                slot.fix.set_dirty();
                            }
                        }
                        TAG_ERASE => {
                            if present {
                                let mut g = slot.fix.data_mut();
                                LeafPageMut::<K, V>::new(&mut g[..]).erase(idx);
                                drop(g);
                                slot.fix.set_dirty();
                                self.count -= 1;
                            }
                            self.pending += 1;
                        }
                        _ => unreachable!("invalid message tag"),
                    }
                }
                break;
            }

            {
                let mut sg = src_fix.data_mut();
                let mut inner = InnerPageMut::<K, V>::new(&mut sg[..], eps);
                inner.messages_mut().erase(it);
            }
            it = next;
        }

        Ok(())
    }

    /// Hook a freshly created leaf into the tree: descend to its parent
    /// level, splitting every full inner node on the way down (which may
    /// grow the root), then insert the pivot.
    fn attach_leaf(&mut self, pivot: &K, leaf_page_no: u64) -> StorageResult<()> {
        let root_no = self.root.expect("attach on an empty tree");
        let mut parent: Option<ExclusiveFix> = None;
        let mut cur = self.fix_exclusive(root_no)?;

        loop {
            let (level, full) = {
                let g = cur.data();
                let inner = InnerPage::<K, V>::new(&g[..], self.epsilon);
                (inner.level(), inner.full())
            };
            debug_assert!(level >= 1, "attach descended into a leaf");

            if full {
                self.split(&mut parent, &mut cur, pivot)?;
            }

            if level == 1 {
                {
                    let mut g = cur.data_mut();
                    InnerPageMut::<K, V>::new(&mut g[..], self.epsilon).insert(pivot, leaf_page_no);
                }
                cur.set_dirty();
                return Ok(());
            }

            let child_no = {
                let g = cur.data();
                InnerPage::<K, V>::new(&g[..], self.epsilon).lower_bound_child(pivot)
            };
            let next = self.fix_exclusive(child_no)?;
            parent = Some(cur);
            cur = next;
        }
    }
}

/// Move every message in `s`'s range for child `index` into `t`. `t` must
/// have room for the whole batch.
fn drain_range<K: Datum, V: Datum>(
    s: &mut InnerPageMut<'_, K, V>,
    index: u16,
    t: &mut InnerPageMut<'_, K, V>,
) {
    let (mut it, end) = s.map_range(index);
    while it != end {
        let (mk, tag, payload, next) = {
            let m = s.messages();
            (m.key_at(it), m.tag_at(it), m.payload_at(it).to_vec(), m.next(it))
        };
        let applied = t.apply(&mk, tag, &payload);
        assert!(applied, "target message map overflow during flush");
        s.messages_mut().erase(it);
        it = next;
    }
}

/// Like `drain_range`, but stop at the first message that no longer fits.
/// Returns whether anything moved.
fn drain_while_fits<K: Datum, V: Datum>(
    s: &mut InnerPageMut<'_, K, V>,
    index: u16,
    t: &mut InnerPageMut<'_, K, V>,
) -> bool {
    let (mut it, end) = s.map_range(index);
    let mut moved = false;
    while it != end {
        let (mk, tag, payload, next) = {
            let m = s.messages();
            (m.key_at(it), m.tag_at(it), m.payload_at(it).to_vec(), m.next(it))
        };
        if !t.apply(&mk, tag, &payload) {
            break;
        }
        s.messages_mut().erase(it);
        moved = true;
        it = next;
    }
    moved
}
