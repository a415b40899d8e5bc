//! Persistent record layouts and the tree classes that materialise them.
//!
//! Three record shapes cover the whole hierarchy:
//!
//! - object records: oid plus two inline subtree roots (distribution-key
//!   tree and cookie index),
//! - key records (dkey and akey): stored key bytes plus an inline subtree
//!   root; akey records additionally pin the uniform record size,
//! - extent records: `(idx, epoch)` keyed payload carriers with originator
//!   cookie and checksum fields.
//!
//! Subtree roots are embedded in their parent record, so opening a child
//! tree is a pointer offset, never a copy.

use crate::{
    error::{Error, Result},
    pal::{Pal, PalPtr, Tx, PAL_NULL},
    tree::{KeyBundle, RecBundle, Tree, TreeClass, TreeRoot},
};
use std::{cmp::Ordering, marker::PhantomData, mem::size_of};

/// Object-index record.
#[repr(C)]
pub(crate) struct ObjRec {
    oid_hi: u64,
    oid_lo: u64,
    dkey_root: TreeRoot,
    cookie_root: TreeRoot,
}

const OBJ_REC_SIZE: usize = size_of::<ObjRec>();

fn field_off<T, F>(base: &T, field: &F) -> usize {
    field as *const F as usize - base as *const T as usize
}

pub(crate) fn obj_dkey_root(pal: &Pal, rec: PalPtr) -> PalPtr {
    let hdr = pal.load::<ObjRec>(rec);
    rec.at(field_off(hdr, &hdr.dkey_root))
}

pub(crate) fn obj_cookie_root(pal: &Pal, rec: PalPtr) -> PalPtr {
    let hdr = pal.load::<ObjRec>(rec);
    rec.at(field_off(hdr, &hdr.cookie_root))
}

/// Key record header; the key bytes follow it.
#[repr(C)]
pub(crate) struct KrecHdr {
    key_len: u32,
    _pad: u32,
    /// Uniform record size of the extents below an akey; zero until the
    /// first sized write.
    rsize: u64,
    subtree: TreeRoot,
}

const KREC_HDR_SIZE: usize = size_of::<KrecHdr>();

pub(crate) fn krec_subtree(pal: &Pal, rec: PalPtr) -> PalPtr {
    let hdr = pal.load::<KrecHdr>(rec);
    rec.at(field_off(hdr, &hdr.subtree))
}

pub(crate) fn krec_rsize(pal: &Pal, rec: PalPtr) -> u64 {
    pal.load::<KrecHdr>(rec).rsize
}

pub(crate) fn krec_set_rsize(tx: &mut Tx<'_>, rec: PalPtr, rsize: u64) {
    tx.load_mut::<KrecHdr>(rec).rsize = rsize;
}

/// Extent record header; the payload follows it.
#[repr(C)]
pub(crate) struct IrecHdr {
    idx: u64,
    epoch: u64,
    rsize: u64,
    cs_type: u16,
    cs_size: u16,
    _pad: u32,
    cookie: [u8; 16],
}

pub(crate) const IREC_DATA_OFF: usize = size_of::<IrecHdr>();

/// Allocation size for one extent record of `rsize` payload bytes.
pub(crate) fn irec_size(rsize: u64) -> usize {
    IREC_DATA_OFF + rsize as usize
}

/// Cookie-index record: originator id and the largest epoch seen with it.
#[repr(C)]
pub(crate) struct CookieRec {
    cookie: [u8; 16],
    max_epoch: u64,
}

fn byte_hkey(key: &[u8]) -> [u8; 16] {
    let mut h = [0u8; 16];
    let n = key.len().min(16);
    h[..n].copy_from_slice(&key[..n]);
    h
}

/// Object index: 16-byte oids, prefix is the full key.
pub(crate) struct ObjClass;

impl TreeClass for ObjClass {
    fn hkey(kb: &KeyBundle<'_>) -> [u8; 16] {
        debug_assert_eq!(kb.key.len(), 16);
        byte_hkey(kb.key)
    }

    fn key_cmp(pal: &Pal, rec: PalPtr, kb: &KeyBundle<'_>) -> Ordering {
        let hdr = pal.load::<ObjRec>(rec);
        let mut stored = [0u8; 16];
        stored[..8].copy_from_slice(&hdr.oid_hi.to_be_bytes());
        stored[8..].copy_from_slice(&hdr.oid_lo.to_be_bytes());
        stored.as_slice().cmp(kb.key)
    }

    fn rec_alloc(tx: &mut Tx<'_>, kb: &KeyBundle<'_>, _rb: &mut RecBundle) -> Result<PalPtr> {
        let rec = tx.alloc(OBJ_REC_SIZE)?;
        let hdr = tx.load_mut_fresh::<ObjRec>(rec);
        hdr.oid_hi = u64::from_be_bytes(kb.key[..8].try_into().map_err(|_| Error::Inval)?);
        hdr.oid_lo = u64::from_be_bytes(kb.key[8..16].try_into().map_err(|_| Error::Inval)?);
        Ok(rec)
    }

    fn rec_update(
        _tx: &mut Tx<'_>,
        _rec: PalPtr,
        _kb: &KeyBundle<'_>,
        _rb: &mut RecBundle,
    ) -> Result<Option<PalPtr>> {
        Ok(None)
    }

    fn rec_fetch(pal: &Pal, rec: PalPtr, rb: &mut RecBundle) {
        rb.subtree = obj_dkey_root(pal, rec);
    }

    fn rec_free(tx: &mut Tx<'_>, rec: PalPtr) {
        let pal = tx.pal().clone();
        Tree::<DkeyClass>::open(&pal, obj_dkey_root(&pal, rec))
            .destroy(tx)
            .ok();
        Tree::<CookieClass>::open(&pal, obj_cookie_root(&pal, rec))
            .destroy(tx)
            .ok();
        tx.free(rec);
    }
}

/// dkey/akey records: opaque byte-string keys ordered lexicographically,
/// carrying the child subtree inline. `Child` is the class of that subtree,
/// which makes record teardown recurse to the leaves.
pub(crate) struct KeyClass<Child>(PhantomData<Child>);

pub(crate) type AkeyClass = KeyClass<IrecClass>;
pub(crate) type DkeyClass = KeyClass<AkeyClass>;

impl<Child: TreeClass> TreeClass for KeyClass<Child> {
    fn hkey(kb: &KeyBundle<'_>) -> [u8; 16] {
        byte_hkey(kb.key)
    }

    fn key_cmp(pal: &Pal, rec: PalPtr, kb: &KeyBundle<'_>) -> Ordering {
        let hdr = pal.load::<KrecHdr>(rec);
        let stored = pal.slice(rec.at(KREC_HDR_SIZE), hdr.key_len as usize);
        stored.cmp(kb.key)
    }

    fn rec_alloc(tx: &mut Tx<'_>, kb: &KeyBundle<'_>, _rb: &mut RecBundle) -> Result<PalPtr> {
        let rec = tx.alloc(KREC_HDR_SIZE + kb.key.len())?;
        tx.load_mut_fresh::<KrecHdr>(rec).key_len = kb.key.len() as u32;
        tx.write_fresh(rec, KREC_HDR_SIZE, kb.key);
        Ok(rec)
    }

    fn rec_update(
        _tx: &mut Tx<'_>,
        _rec: PalPtr,
        _kb: &KeyBundle<'_>,
        _rb: &mut RecBundle,
    ) -> Result<Option<PalPtr>> {
        Ok(None)
    }

    fn rec_fetch(pal: &Pal, rec: PalPtr, rb: &mut RecBundle) {
        let hdr = pal.load::<KrecHdr>(rec);
        rb.key_ptr = rec.at(KREC_HDR_SIZE);
        rb.key_len = hdr.key_len as u64;
        rb.rsize = hdr.rsize;
        rb.subtree = krec_subtree(pal, rec);
    }

    fn rec_free(tx: &mut Tx<'_>, rec: PalPtr) {
        let pal = tx.pal().clone();
        Tree::<Child>::open(&pal, krec_subtree(&pal, rec))
            .destroy(tx)
            .ok();
        tx.free(rec);
    }
}

/// Record-extent records keyed by `(idx, epoch)`; the 16-byte prefix is
/// exact, big-endian so numeric and byte order agree.
pub(crate) struct IrecClass;

fn irec_write_hdr(hdr: &mut IrecHdr, kb: &KeyBundle<'_>, rb: &RecBundle) {
    hdr.idx = kb.idx;
    hdr.epoch = kb.epoch;
    hdr.rsize = rb.rsize;
    hdr.cs_type = 0;
    hdr.cs_size = 0;
    hdr.cookie = rb.cookie;
}

impl TreeClass for IrecClass {
    fn hkey(kb: &KeyBundle<'_>) -> [u8; 16] {
        let mut h = [0u8; 16];
        h[..8].copy_from_slice(&kb.idx.to_be_bytes());
        h[8..].copy_from_slice(&kb.epoch.to_be_bytes());
        h
    }

    fn key_cmp(_pal: &Pal, _rec: PalPtr, _kb: &KeyBundle<'_>) -> Ordering {
        Ordering::Equal
    }

    fn rec_alloc(tx: &mut Tx<'_>, kb: &KeyBundle<'_>, rb: &mut RecBundle) -> Result<PalPtr> {
        if !rb.mmid.is_null() {
            // install a staged record, payload is already in place
            let rec = rb.mmid;
            irec_write_hdr(tx.load_mut::<IrecHdr>(rec), kb, rb);
            return Ok(rec);
        }
        let rec = tx.alloc(irec_size(rb.rsize))?;
        irec_write_hdr(tx.load_mut_fresh::<IrecHdr>(rec), kb, rb);
        Ok(rec)
    }

    fn rec_update(
        tx: &mut Tx<'_>,
        rec: PalPtr,
        kb: &KeyBundle<'_>,
        rb: &mut RecBundle,
    ) -> Result<Option<PalPtr>> {
        if !rb.mmid.is_null() {
            let staged = rb.mmid;
            irec_write_hdr(tx.load_mut::<IrecHdr>(staged), kb, rb);
            tx.free(rec);
            return Ok(Some(staged));
        }
        let stored = tx.pal().load::<IrecHdr>(rec).rsize;
        if stored == rb.rsize {
            irec_write_hdr(tx.load_mut::<IrecHdr>(rec), kb, rb);
            return Ok(None);
        }
        // record size changed for this (idx, epoch); reallocate
        let fresh = tx.alloc(irec_size(rb.rsize))?;
        irec_write_hdr(tx.load_mut_fresh::<IrecHdr>(fresh), kb, rb);
        tx.free(rec);
        Ok(Some(fresh))
    }

    fn rec_fetch(pal: &Pal, rec: PalPtr, rb: &mut RecBundle) {
        let hdr = pal.load::<IrecHdr>(rec);
        rb.idx = hdr.idx;
        rb.epoch = hdr.epoch;
        rb.rsize = hdr.rsize;
        rb.cookie = hdr.cookie;
        rb.cs_type = hdr.cs_type;
        rb.cs_size = hdr.cs_size;
        if hdr.rsize > 0 {
            rb.data = rec.at(IREC_DATA_OFF);
            rb.data_len = hdr.rsize;
        } else {
            rb.data = PAL_NULL;
            rb.data_len = 0;
        }
    }

    fn rec_free(tx: &mut Tx<'_>, rec: PalPtr) {
        tx.free(rec);
    }
}

/// Cookie index: 16-byte cookies, value is `max(epoch)` for that
/// originator. The write epoch arrives in the key bundle.
pub(crate) struct CookieClass;

impl TreeClass for CookieClass {
    fn hkey(kb: &KeyBundle<'_>) -> [u8; 16] {
        debug_assert_eq!(kb.key.len(), 16);
        byte_hkey(kb.key)
    }

    fn key_cmp(_pal: &Pal, _rec: PalPtr, _kb: &KeyBundle<'_>) -> Ordering {
        Ordering::Equal
    }

    fn rec_alloc(tx: &mut Tx<'_>, kb: &KeyBundle<'_>, _rb: &mut RecBundle) -> Result<PalPtr> {
        let rec = tx.alloc(size_of::<CookieRec>())?;
        let hdr = tx.load_mut_fresh::<CookieRec>(rec);
        hdr.cookie.copy_from_slice(kb.key);
        hdr.max_epoch = kb.epoch;
        Ok(rec)
    }

    fn rec_update(
        tx: &mut Tx<'_>,
        rec: PalPtr,
        kb: &KeyBundle<'_>,
        _rb: &mut RecBundle,
    ) -> Result<Option<PalPtr>> {
        if tx.pal().load::<CookieRec>(rec).max_epoch < kb.epoch {
            tx.load_mut::<CookieRec>(rec).max_epoch = kb.epoch;
        }
        Ok(None)
    }

    fn rec_fetch(pal: &Pal, rec: PalPtr, rb: &mut RecBundle) {
        rb.epoch = pal.load::<CookieRec>(rec).max_epoch;
    }

    fn rec_free(tx: &mut Tx<'_>, rec: PalPtr) {
        tx.free(rec);
    }
}
