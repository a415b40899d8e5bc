//! Transaction scopes over a pool.

use super::{Pal, PalPtr};
use crate::error::Result;
use parking_lot::MutexGuard;
use std::mem::size_of;

/// A write scope. Every store is undo-logged; dropping the scope without
/// [`Tx::commit`] aborts it, reversing all writes and releasing every
/// allocation made inside the scope. Frees are deferred to commit so an
/// abort can resurrect them.
pub struct Tx<'a> {
    pal: &'a Pal,
    _guard: MutexGuard<'a, ()>,
    undo: Vec<(PalPtr, Box<[u8]>)>,
    allocs: Vec<PalPtr>,
    frees: Vec<PalPtr>,
    committed: bool,
}

impl<'a> Tx<'a> {
    pub(super) fn new(pal: &'a Pal, guard: MutexGuard<'a, ()>) -> Tx<'a> {
        Tx {
            pal,
            _guard: guard,
            undo: Vec::new(),
            allocs: Vec::new(),
            frees: Vec::new(),
            committed: false,
        }
    }

    /// Allocate a zeroed block of `len` bytes.
    pub fn alloc(&mut self, len: usize) -> Result<PalPtr> {
        let ptr = self.pal.raw_alloc(len)?;
        self.allocs.push(ptr);
        Ok(ptr)
    }

    /// Schedule `ptr` for release at commit.
    pub fn free(&mut self, ptr: PalPtr) {
        debug_assert!(!ptr.is_null());
        self.frees.push(ptr);
    }

    /// Snapshot `len` bytes at `ptr + off` before in-place mutation.
    pub fn add(&mut self, ptr: PalPtr, off: usize, len: usize) {
        let at = ptr.at(off);
        let pre = self.pal.slice(at, len).to_vec().into_boxed_slice();
        self.undo.push((at, pre));
    }

    /// Logged store of `bytes` at `ptr + off`.
    pub fn write(&mut self, ptr: PalPtr, off: usize, bytes: &[u8]) {
        self.add(ptr, off, bytes.len());
        unsafe { self.pal.slice_mut_raw(ptr.at(off), bytes.len()) }.copy_from_slice(bytes);
    }

    /// Logged mutable view of `len` bytes at `ptr`.
    pub fn slice_mut(&mut self, ptr: PalPtr, len: usize) -> &mut [u8] {
        self.add(ptr, 0, len);
        unsafe { self.pal.slice_mut_raw(ptr, len) }
    }

    /// Logged typed view of a `repr(C)` block.
    pub fn load_mut<T>(&mut self, ptr: PalPtr) -> &mut T {
        self.add(ptr, 0, size_of::<T>());
        unsafe { self.pal.load_mut_raw::<T>(ptr) }
    }

    /// Unlogged typed view of a block allocated in this scope. An abort
    /// frees the block wholesale, so no preimage is needed.
    pub fn load_mut_fresh<T>(&mut self, ptr: PalPtr) -> &mut T {
        unsafe { self.pal.load_mut_raw::<T>(ptr) }
    }

    /// Unlogged store into a block allocated in this scope. An abort frees
    /// the block wholesale, so no preimage is needed.
    pub fn write_fresh(&mut self, ptr: PalPtr, off: usize, bytes: &[u8]) {
        debug_assert!(self.allocs.contains(&ptr) || self.allocs.iter().any(|a| {
            a.off() <= ptr.off() && ptr.off() < a.off() + self.pal.alloc_size(*a) as u64
        }));
        unsafe { self.pal.slice_mut_raw(ptr.at(off), bytes.len()) }.copy_from_slice(bytes);
    }

    pub fn pal(&self) -> &Pal {
        self.pal
    }

    /// Publish the scope: apply deferred frees and flush the pool.
    pub fn commit(mut self) {
        for ptr in std::mem::take(&mut self.frees) {
            self.pal.raw_free(ptr);
        }
        self.committed = true;
        self.pal.sync();
    }

    /// Reverse the scope explicitly. Equivalent to dropping it.
    pub fn abort(self) {}

    fn rollback(&mut self) {
        for (ptr, pre) in self.undo.drain(..).rev() {
            unsafe { self.pal.slice_mut_raw(ptr, pre.len()) }.copy_from_slice(&pre);
        }
        for ptr in self.allocs.drain(..) {
            self.pal.raw_free(ptr);
        }
        self.frees.clear();
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.committed {
            log::trace!(
                "tx abort: {} undo records, {} allocations",
                self.undo.len(),
                self.allocs.len()
            );
            self.rollback();
        }
        // the guard field is released after this body runs
        self.pal.end_tx_scope();
    }
}
