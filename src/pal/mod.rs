//! Persistent allocation layer.
//!
//! A pool is one mapping with a header, a bump frontier, and per-size-class
//! free lists. Allocations are identified by [`PalPtr`], an offset-based id
//! that stays valid until the block is freed; live blocks never move.
//!
//! All mutation of pool memory goes through a [`Tx`] scope: writes are
//! undo-logged, allocations are released again on abort, frees are deferred
//! to commit. The transaction engine is deliberately simple; its contract is
//! only what the object engine above needs: typed allocation, dereference,
//! free, and scoped abort that reverses every effect.

mod map;
mod tx;

pub use tx::Tx;

use crate::error::{Error, Result};
use map::Mapping;
use parking_lot::Mutex;
use std::{
    mem::size_of,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

const POOL_MAGIC: u64 = 0x45504f_53544f52; // "EPO STOR"
const POOL_VERSION: u32 = 1;
/// Smallest payload class, 2^4 bytes.
const MIN_CLASS: u32 = 4;
/// Largest payload class, 2^31 bytes.
const NCLASS: usize = 28;
const ALIGN: u64 = 16;

/// Opaque persistent id: a byte offset into the pool. Zero is the null id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PalPtr {
    off: u64,
}

pub const PAL_NULL: PalPtr = PalPtr { off: 0 };

impl PalPtr {
    pub fn is_null(&self) -> bool {
        self.off == 0
    }

    /// Interior pointer `delta` bytes into this allocation.
    pub fn at(&self, delta: usize) -> PalPtr {
        debug_assert!(!self.is_null());
        PalPtr {
            off: self.off + delta as u64,
        }
    }

    pub(crate) fn from_off(off: u64) -> PalPtr {
        PalPtr { off }
    }

    pub(crate) fn off(&self) -> u64 {
        self.off
    }
}

impl Default for PalPtr {
    fn default() -> Self {
        PAL_NULL
    }
}

#[repr(C)]
struct PoolHdr {
    magic: u64,
    version: u32,
    _pad: u32,
    capacity: u64,
    bump: u64,
    root: u64,
    root_len: u64,
    free_heads: [u64; NCLASS],
}

/// Header in front of every block. Freed blocks reuse the first eight bytes
/// of their payload as the free-list link.
#[repr(C)]
struct BlockHdr {
    payload: u64,
    class: u32,
    _pad: u32,
}

const BLOCK_HDR: u64 = size_of::<BlockHdr>() as u64;

struct PalInner {
    map: Mapping,
    /// Serialises transactions and allocator mutation.
    write_lock: Mutex<()>,
    /// Token of the thread inside a transaction scope, zero when none.
    /// Nested `begin` on one pool is a bug; this catches it before the
    /// write lock turns it into a silent deadlock.
    tx_owner: AtomicU64,
}

/// Per-thread token derived from the thread-local storage address; never
/// zero, unique among live threads.
fn thread_token() -> u64 {
    thread_local! {
        static TOKEN: u8 = 0;
    }
    TOKEN.with(|token| token as *const u8 as u64)
}

/// Handle to a pool; cheap to clone, all clones share the mapping.
#[derive(Clone)]
pub struct Pal {
    inner: Arc<PalInner>,
}

fn class_of(len: usize) -> Result<u32> {
    let len = len.max(1 << MIN_CLASS) as u64;
    let rounded = len.next_power_of_two();
    let class = rounded.trailing_zeros() - MIN_CLASS;
    if class as usize >= NCLASS {
        return Err(Error::Nomem);
    }
    Ok(class)
}

fn class_size(class: u32) -> u64 {
    1u64 << (class + MIN_CLASS)
}

impl Pal {
    /// Create or re-open a file-backed pool of `capacity` bytes.
    pub fn open_file(path: &Path, capacity: usize) -> Result<Pal> {
        Pal::from_mapping(Mapping::file(path, capacity)?)
    }

    /// An anonymous pool; contents die with the process.
    pub fn open_anon(capacity: usize) -> Result<Pal> {
        Pal::from_mapping(Mapping::anon(capacity)?)
    }

    fn from_mapping(map: Mapping) -> Result<Pal> {
        let pal = Pal {
            inner: Arc::new(PalInner {
                map,
                write_lock: Mutex::new(()),
                tx_owner: AtomicU64::new(0),
            }),
        };
        {
            let hdr = unsafe { pal.hdr_mut() };
            if hdr.magic == 0 {
                hdr.magic = POOL_MAGIC;
                hdr.version = POOL_VERSION;
                hdr.capacity = pal.inner.map.len() as u64;
                // offset 0 doubles as the null id, keep it out of circulation
                hdr.bump = align_up(size_of::<PoolHdr>() as u64, ALIGN);
                pal.inner.map.sync();
            } else if hdr.magic != POOL_MAGIC || hdr.version != POOL_VERSION {
                return Err(Error::Inval);
            }
        }
        Ok(pal)
    }

    fn hdr(&self) -> &PoolHdr {
        unsafe { &*(self.inner.map.base() as *const PoolHdr) }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn hdr_mut(&self) -> &mut PoolHdr {
        &mut *(self.inner.map.base() as *mut PoolHdr)
    }

    /// The persistent root object, allocated zeroed on first request.
    pub fn root(&self, len: usize) -> Result<PalPtr> {
        let _guard = self.inner.write_lock.lock();
        {
            let hdr = self.hdr();
            if hdr.root != 0 {
                if (hdr.root_len as usize) < len {
                    return Err(Error::Inval);
                }
                return Ok(PalPtr::from_off(hdr.root));
            }
        }
        let root = self.raw_alloc(len)?;
        let hdr = unsafe { self.hdr_mut() };
        hdr.root = root.off();
        hdr.root_len = len as u64;
        self.inner.map.sync();
        Ok(root)
    }

    /// Open a transaction scope. One scope at a time per pool; writers
    /// serialise here. Nesting a scope on the same thread is a bug.
    pub fn begin(&self) -> Tx<'_> {
        assert_ne!(
            self.inner.tx_owner.load(Ordering::Relaxed),
            thread_token(),
            "nested transaction scope on one pool"
        );
        let guard = self.inner.write_lock.lock();
        self.inner.tx_owner.store(thread_token(), Ordering::Relaxed);
        Tx::new(self, guard)
    }

    /// Called by the scope on its way out, while the write lock is still
    /// held.
    pub(crate) fn end_tx_scope(&self) {
        self.inner.tx_owner.store(0, Ordering::Relaxed);
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn slice(&self, ptr: PalPtr, len: usize) -> &[u8] {
        debug_assert!(!ptr.is_null());
        debug_assert!(ptr.off() + len as u64 <= self.hdr().capacity);
        unsafe { std::slice::from_raw_parts(self.inner.map.base().add(ptr.off() as usize), len) }
    }

    /// Mutable view used by the transaction log and by zero-copy staging,
    /// where the block is not yet reachable from any index.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut_raw(&self, ptr: PalPtr, len: usize) -> &mut [u8] {
        debug_assert!(!ptr.is_null());
        std::slice::from_raw_parts_mut(self.inner.map.base().add(ptr.off() as usize), len)
    }

    /// Typed view of a `repr(C)` block.
    pub fn load<T>(&self, ptr: PalPtr) -> &T {
        debug_assert!(ptr.off() % ALIGN == 0 || ptr.off() % size_of::<u64>() as u64 == 0);
        unsafe { &*(self.inner.map.base().add(ptr.off() as usize) as *const T) }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn load_mut_raw<T>(&self, ptr: PalPtr) -> &mut T {
        &mut *(self.inner.map.base().add(ptr.off() as usize) as *mut T)
    }

    /// Usable payload size of a live block.
    pub fn alloc_size(&self, ptr: PalPtr) -> usize {
        let hdr: &BlockHdr = self.load(PalPtr::from_off(ptr.off() - BLOCK_HDR));
        hdr.payload as usize
    }

    pub(crate) fn sync(&self) {
        self.inner.map.sync();
    }

    /// Carve a block out of the pool. Caller holds the write lock.
    pub(crate) fn raw_alloc(&self, len: usize) -> Result<PalPtr> {
        let class = class_of(len)?;
        let hdr = unsafe { self.hdr_mut() };
        let head = hdr.free_heads[class as usize];
        let ptr = if head != 0 {
            // reuse the head of the class list
            let next = u64::from_le_bytes(
                self.slice(PalPtr::from_off(head), 8).try_into().unwrap(),
            );
            hdr.free_heads[class as usize] = next;
            PalPtr::from_off(head)
        } else {
            let need = align_up(BLOCK_HDR + class_size(class), ALIGN);
            if hdr.bump + need > hdr.capacity {
                log::error!(
                    "pool exhausted: bump {} + {} > capacity {}",
                    hdr.bump,
                    need,
                    hdr.capacity
                );
                return Err(Error::Nomem);
            }
            let at = hdr.bump + BLOCK_HDR;
            hdr.bump += need;
            PalPtr::from_off(at)
        };
        let bh: &mut BlockHdr =
            unsafe { self.load_mut_raw(PalPtr::from_off(ptr.off() - BLOCK_HDR)) };
        bh.payload = len as u64;
        bh.class = class;
        unsafe { self.slice_mut_raw(ptr, len) }.fill(0);
        Ok(ptr)
    }

    /// Return a block to its class list. Caller holds the write lock.
    pub(crate) fn raw_free(&self, ptr: PalPtr) {
        debug_assert!(!ptr.is_null());
        let class = {
            let bh: &BlockHdr = self.load(PalPtr::from_off(ptr.off() - BLOCK_HDR));
            bh.class
        };
        let hdr = unsafe { self.hdr_mut() };
        let prev_head = hdr.free_heads[class as usize];
        unsafe { self.slice_mut_raw(ptr, 8) }.copy_from_slice(&prev_head.to_le_bytes());
        hdr.free_heads[class as usize] = ptr.off();
    }
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn alloc_free_reuse() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let mut tx = pal.begin();
        let a = tx.alloc(100).unwrap();
        let b = tx.alloc(100).unwrap();
        assert_ne!(a, b);
        tx.commit();

        let mut tx = pal.begin();
        tx.free(a);
        tx.commit();

        let mut tx = pal.begin();
        let c = tx.alloc(100).unwrap();
        tx.commit();
        assert_eq!(a, c, "freed block comes back from the class list");
    }

    #[test]
    fn abort_reverses_writes_and_allocs() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let mut tx = pal.begin();
        let a = tx.alloc(64).unwrap();
        tx.write(a, 0, b"hello");
        tx.commit();

        let mut tx = pal.begin();
        tx.write(a, 0, b"WORLD");
        let b = tx.alloc(64).unwrap();
        tx.abort();

        assert_eq!(&pal.slice(a, 5)[..], b"hello");
        // the aborted allocation is available again
        let mut tx = pal.begin();
        let c = tx.alloc(64).unwrap();
        tx.commit();
        assert_eq!(b, c);
    }

    #[test]
    fn free_is_deferred_until_commit() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let mut tx = pal.begin();
        let a = tx.alloc(32).unwrap();
        tx.write(a, 0, b"keep");
        tx.commit();

        let mut tx = pal.begin();
        tx.free(a);
        tx.abort();
        assert_eq!(&pal.slice(a, 4)[..], b"keep");
    }

    #[test]
    #[should_panic(expected = "nested transaction scope")]
    fn nested_begin_fails_fast() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let _outer = pal.begin();
        let _inner = pal.begin();
    }

    #[test]
    fn root_is_stable_across_reopen() {
        let file = NamedTempFile::new().unwrap();
        let first = {
            let pal = Pal::open_file(file.path(), 1 << 20).unwrap();
            let root = pal.root(128).unwrap();
            let mut tx = pal.begin();
            tx.write(root, 0, b"rooted");
            tx.commit();
            root
        };
        let pal = Pal::open_file(file.path(), 1 << 20).unwrap();
        let root = pal.root(128).unwrap();
        assert_eq!(first, root);
        assert_eq!(&pal.slice(root, 6)[..], b"rooted");
    }
}
