//! Object references and the process-wide ref cache.

use super::{layout::ObjClass, ObjectId};
use crate::{
    error::Result,
    ilist::{Link, LinkArena, ListHead},
    pal::{Pal, PalPtr, Tx, PAL_NULL},
    tree::{KeyBundle, RecBundle, Tree},
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A transient handle to one object inside a container. Holds the pinned
/// container root and lazily resolves the object-index record, so repeated
/// access to a cached object skips the index walk.
pub(crate) struct ObjRef {
    oid: ObjectId,
    pal: Pal,
    cont_root: PalPtr,
    rec: Mutex<PalPtr>,
}

impl ObjRef {
    fn new(pal: Pal, cont_root: PalPtr, oid: ObjectId) -> ObjRef {
        ObjRef {
            oid,
            pal,
            cont_root,
            rec: Mutex::new(PAL_NULL),
        }
    }

    pub(crate) fn oid(&self) -> ObjectId {
        self.oid
    }

    fn index(&self) -> Tree<ObjClass> {
        Tree::open(&self.pal, self.cont_root)
    }

    /// The object-index record, or `None` for a never-written object. The
    /// read path treats that as "empty everywhere", not an error.
    pub(crate) fn tree_init_read(&self) -> Option<PalPtr> {
        let mut cached = self.rec.lock();
        if !cached.is_null() {
            return Some(*cached);
        }
        let bytes = self.oid.to_bytes();
        let mut rb = RecBundle::default();
        match self.index().lookup(&KeyBundle::bytes(&bytes), &mut rb) {
            Ok(()) => {
                *cached = rb.rec;
                Some(rb.rec)
            }
            Err(_) => None,
        }
    }

    /// Find or create the object-index record inside the caller's
    /// transaction. The result must not be cached until the transaction
    /// commits; see [`ObjRef::set_rec`].
    pub(crate) fn tree_init_write(&self, tx: &mut Tx<'_>) -> Result<PalPtr> {
        let bytes = self.oid.to_bytes();
        let mut rb = RecBundle::default();
        self.index().update(tx, &KeyBundle::bytes(&bytes), &mut rb)?;
        Ok(rb.rec)
    }

    /// Publish the record location after a successful commit.
    pub(crate) fn set_rec(&self, rec: PalPtr) {
        *self.rec.lock() = rec;
    }
}

struct Slot {
    key: (u64, ObjectId),
    obj: Option<Arc<ObjRef>>,
    link: Link,
}

impl LinkArena for Vec<Slot> {
    fn link(&self, idx: u32) -> Link {
        self[idx as usize].link
    }

    fn link_mut(&mut self, idx: u32) -> &mut Link {
        &mut self[idx as usize].link
    }
}

struct CacheInner {
    map: FxHashMap<(u64, ObjectId), u32>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    lru: ListHead,
}

/// Bounded `(container, object) -> ref` cache. Hits are O(1) and refresh
/// recency; entries nobody holds stay cached until capacity evicts them from
/// the cold end. Entries with outstanding holders are never evicted.
pub(crate) struct ObjCache {
    inner: Mutex<CacheInner>,
    cap: usize,
}

impl ObjCache {
    pub(crate) fn new(cap: usize) -> ObjCache {
        ObjCache {
            inner: Mutex::new(CacheInner {
                map: FxHashMap::default(),
                slots: Vec::new(),
                free: Vec::new(),
                lru: ListHead::new(),
            }),
            cap,
        }
    }

    pub(crate) fn hold(
        &self,
        coh_cookie: u64,
        pal: &Pal,
        cont_root: PalPtr,
        oid: ObjectId,
    ) -> Arc<ObjRef> {
        let key = (coh_cookie, oid);
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if let Some(&slot) = inner.map.get(&key) {
            inner.lru.remove(&mut inner.slots, slot);
            inner.lru.push_back(&mut inner.slots, slot);
            return inner.slots[slot as usize].obj.clone().expect("live slot");
        }

        while inner.map.len() >= self.cap {
            let victim = {
                let mut at = inner.lru.front();
                loop {
                    match at {
                        None => break None,
                        Some(idx) => {
                            let pinned = inner.slots[idx as usize]
                                .obj
                                .as_ref()
                                .map(|o| Arc::strong_count(o) > 1)
                                .unwrap_or(false);
                            if pinned {
                                at = inner.lru.next_of(&inner.slots, idx);
                            } else {
                                break Some(idx);
                            }
                        }
                    }
                }
            };
            match victim {
                None => break, // every entry is held, let the cache overshoot
                Some(idx) => {
                    let old_key = inner.slots[idx as usize].key;
                    log::trace!("evicting object ref {:?}", old_key.1);
                    inner.lru.remove(&mut inner.slots, idx);
                    inner.map.remove(&old_key);
                    inner.slots[idx as usize].obj = None;
                    inner.free.push(idx);
                }
            }
        }

        let obj = Arc::new(ObjRef::new(pal.clone(), cont_root, oid));
        let slot = match inner.free.pop() {
            Some(idx) => {
                inner.slots[idx as usize].key = key;
                inner.slots[idx as usize].obj = Some(obj.clone());
                idx
            }
            None => {
                let idx = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    key,
                    obj: Some(obj.clone()),
                    link: Link::unlinked(idx),
                });
                idx
            }
        };
        inner.map.insert(key, slot);
        inner.lru.push_back(&mut inner.slots, slot);
        obj
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TREE_ROOT_SIZE;

    fn oid(n: u64) -> ObjectId {
        ObjectId { hi: 0, lo: n }
    }

    #[test]
    fn hit_returns_same_ref() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let root = pal.root(TREE_ROOT_SIZE).unwrap();
        let cache = ObjCache::new(4);
        let a = cache.hold(1, &pal, root, oid(7));
        let b = cache.hold(1, &pal, root, oid(7));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_cold_unheld_entries() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let root = pal.root(TREE_ROOT_SIZE).unwrap();
        let cache = ObjCache::new(2);
        let held = cache.hold(1, &pal, root, oid(1));
        cache.hold(1, &pal, root, oid(2));
        cache.hold(1, &pal, root, oid(3));
        assert_eq!(cache.len(), 2);
        // oid 1 is pinned, so oid 2 was the victim
        let again = cache.hold(1, &pal, root, oid(1));
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[test]
    fn distinct_containers_do_not_alias() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let root = pal.root(TREE_ROOT_SIZE).unwrap();
        let cache = ObjCache::new(8);
        let a = cache.hold(1, &pal, root, oid(5));
        let b = cache.hold(2, &pal, root, oid(5));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
