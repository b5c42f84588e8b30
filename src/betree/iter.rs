//! Ordered iteration over the live contents of a tree.
//!
//! There are no sibling pointers; every advance re-descends from the root.
//! A descent merges the smallest committed leaf key beyond the bound with
//! the smallest qualifying buffered message key per inner node, then the
//! winner is resolved through the same message replay `find` uses (a key
//! erased by a pending message is skipped).

use std::ops::Bound;

use crate::{
    betree::{
        inner::InnerPage,
        leaf::LeafPage,
        message::MessageKey,
        node,
        tree::BeTree,
    },
    error::StorageResult,
    io::Datum,
};

pub struct TreeIter<'a, K: Datum, V: Datum> {
    tree: &'a BeTree<K, V>,
    bound: Bound<K>,
}

impl<'a, K: Datum, V: Datum> TreeIter<'a, K, V> {
    pub(crate) fn new(tree: &'a BeTree<K, V>, bound: Bound<K>) -> Self {
        Self { tree, bound }
    }
}

impl<'a, K: Datum, V: Datum> Iterator for TreeIter<'a, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self
                .tree
                .min_key_beyond(&self.bound)
                .expect("io error while iterating")?;
            self.bound = Bound::Excluded(key);

            if let Some(value) = self.tree.find(&key).expect("io error while iterating") {
                return Some((key, value));
            }
            // the key only existed under a pending erase, skip it
        }
    }
}

impl<K: Datum, V: Datum> BeTree<K, V> {
    /// Iterate every live entry in ascending key order.
    pub fn iter(&self) -> TreeIter<'_, K, V> {
        TreeIter::new(self, Bound::Unbounded)
    }

    /// Iterate starting at the smallest live key `>= key`.
    pub fn lower_bound(&self, key: K) -> TreeIter<'_, K, V> {
        TreeIter::new(self, Bound::Included(key))
    }

    /// Iterate starting at the smallest live key `> key`.
    pub fn upper_bound(&self, key: K) -> TreeIter<'_, K, V> {
        TreeIter::new(self, Bound::Excluded(key))
    }

    /// The smallest key (committed or buffered) within `bound`, or None if
    /// the tree holds nothing there. The caller still has to resolve the
    /// key against pending messages.
    pub(crate) fn min_key_beyond(&self, bound: &Bound<K>) -> StorageResult<Option<K>> {
        let root = match self.root {
            None => return Ok(None),
            Some(r) => r,
        };

        let mut best: Option<K> = None;
        let mut bound = *bound;

        loop {
            // right edge of the subtree this descent commits to
            let mut boundary: Option<K> = None;
            let mut fix = self.fix(root)?;

            loop {
                let next_no;
                {
                    let g = fix.data();
                    let d = &g[..];

                    if node::is_leaf(d) {
                        let leaf = LeafPage::<K, V>::new(d);
                        let idx = match &bound {
                            Bound::Unbounded => 0,
                            Bound::Included(k) => leaf.lower_bound(k),
                            Bound::Excluded(k) => leaf.upper_bound(k),
                        };
                        if idx < leaf.count() {
                            let k = leaf.key(idx);
                            best = Some(match best {
                                Some(b) if b < k => b,
                                _ => k,
                            });
                        }
                        break;
                    }

                    let inner = InnerPage::<K, V>::new(d, self.epsilon);
                    let m = inner.messages();
                    let mit = match &bound {
                        Bound::Unbounded => m.first(),
                        Bound::Included(k) => m.lower_bound(&MessageKey::min(*k)),
                        Bound::Excluded(k) => m.upper_bound(&MessageKey::max(*k)),
                    };
                    if mit != 0 {
                        let k = m.key_at(mit).key;
                        best = Some(match best {
                            Some(b) if b < k => b,
                            _ => k,
                        });
                    }

                    let ci = match &bound {
                        Bound::Unbounded => 0,
                        Bound::Included(k) => inner.lb_index(k),
                        Bound::Excluded(k) => inner.ub_index(k),
                    };
                    if ci < inner.count() {
                        // subtree ranges nest, the deepest pivot is tightest
                        boundary = Some(inner.key(ci));
                    }
                    next_no = inner.child(ci);
                }
                fix = self.fix(next_no)?;
            }

            match (best, boundary) {
                // a candidate inside the explored range is authoritative
                (Some(b), Some(br)) if b <= br => return Ok(Some(b)),
                // the rightmost subtree was explored, nothing can follow
                (_, None) => return Ok(best),
                // keys between the subtree edge and the candidate may exist
                (_, Some(br)) => bound = Bound::Excluded(br),
            }
        }
    }
}
