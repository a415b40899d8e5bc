//! Cookie-keyed handle tables.
//!
//! Long-lived entities (event queues, open containers) are exposed to
//! collaborators as opaque 64-bit cookies rather than addresses. A table
//! assigns the cookie on insert; lookups hand out counted references, and a
//! deleted entry stays alive until the last reference drops. The low byte of
//! every cookie tags the entity type so a cookie presented to the wrong
//! table misses instead of aliasing.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::{hash::Hasher, sync::Arc};
use twox_hash::XxHash64;

/// Entity type tags baked into the cookie low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Eq = 1,
    Container = 2,
}

struct Inner<T> {
    map: FxHashMap<u64, Arc<T>>,
    seq: u64,
}

pub struct HandleTable<T> {
    inner: Mutex<Inner<T>>,
    tag: HandleType,
    seed: u64,
}

impl<T> HandleTable<T> {
    pub fn new(tag: HandleType) -> Self {
        HandleTable {
            inner: Mutex::new(Inner {
                map: FxHashMap::default(),
                seq: 0,
            }),
            tag,
            // scrambled cookies: handles must not be guessable from order
            seed: rand::random::<u64>() | 1,
        }
    }

    fn cookie(&self, seq: u64) -> u64 {
        let mut hasher = XxHash64::with_seed(self.seed);
        hasher.write_u64(seq);
        let scrambled = hasher.finish() | (1 << 8); // never all-zero high bits
        (scrambled << 8) | self.tag as u64
    }

    /// Register `val` and assign its cookie.
    pub fn insert(&self, val: Arc<T>) -> u64 {
        let mut inner = self.inner.lock();
        loop {
            inner.seq += 1;
            let cookie = self.cookie(inner.seq);
            if !inner.map.contains_key(&cookie) {
                inner.map.insert(cookie, val);
                return cookie;
            }
        }
    }

    /// Take a counted reference. Dropping the returned `Arc` is the putref.
    pub fn lookup(&self, cookie: u64) -> Option<Arc<T>> {
        if cookie & 0xff != self.tag as u64 {
            return None;
        }
        self.inner.lock().map.get(&cookie).cloned()
    }

    /// Unlink the entry. Outstanding references keep it alive; the free
    /// happens on the last drop.
    pub fn delete(&self, cookie: u64) -> Option<Arc<T>> {
        self.inner.lock().map.remove(&cookie)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}
