//! Versioned object store.
//!
//! Objects are nested ordered trees: object id to distribution key to
//! attribute key to record extents indexed by `(idx, epoch)`. Every write
//! carries an epoch and an originator cookie; readers resolve a query epoch
//! to the newest record at or below it, and a zero-sized record punches a
//! hole from its epoch onward.
//!
//! Containers are pool-backed; all mutation happens inside pool
//! transactions and rolls back wholesale on failure.

mod io;
mod iter;
pub(crate) mod layout;
mod object;
mod zc;

pub use iter::{obj_iter_prepare, AkeyIter, DkeyIter, EpcExpr, IterEntry, IterOps, IterParam,
               IterType, ObjIter, RecxIter};
pub use zc::{ZcFetch, ZcIov, ZcSgl, ZcUpdate};

use crate::{
    config::StoreConfig,
    error::{Error, Result},
    hhash::{HandleTable, HandleType},
    iov::SgList,
    pal::Pal,
    pal::PalPtr,
    tree::{KeyBundle, RecBundle, Tree, TREE_ROOT_SIZE},
};
use lazy_static::lazy_static;
use object::{ObjCache, ObjRef};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Version tag carried by every record.
pub type Epoch = u64;

/// No write may carry this epoch, which makes it usable as a synthetic
/// probe key for "past the last epoch of an index".
pub const EPOCH_MAX: Epoch = u64::MAX;

/// 128-bit object identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    pub fn new(hi: u64, lo: u64) -> ObjectId {
        ObjectId { hi, lo }
    }

    /// Big-endian so byte order follows numeric order.
    pub(crate) fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.hi.to_be_bytes());
        bytes[8..].copy_from_slice(&self.lo.to_be_bytes());
        bytes
    }
}

/// 128-bit originator id attached to every update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie(pub [u8; 16]);

impl Cookie {
    pub fn new(hi: u64, lo: u64) -> Cookie {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        Cookie(bytes)
    }
}

/// Inclusive epoch interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRange {
    pub lo: Epoch,
    pub hi: Epoch,
}

impl EpochRange {
    /// Everything from `epoch` onward.
    pub fn at(epoch: Epoch) -> EpochRange {
        EpochRange {
            lo: epoch,
            hi: EPOCH_MAX,
        }
    }
}

/// A run of `nr` records of `rsize` bytes starting at index `idx`. A zero
/// `rsize` on update is a punch; on fetch it reports the resolved size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recx {
    pub idx: u64,
    pub nr: u64,
    pub rsize: u64,
}

/// One I/O descriptor: an attribute key, its extents, and optional
/// per-extent epoch ranges.
#[derive(Debug, Clone, Default)]
pub struct IoDesc {
    pub akey: Vec<u8>,
    pub recxs: Vec<Recx>,
    pub eprs: Option<Vec<EpochRange>>,
}

impl IoDesc {
    pub fn new(akey: impl Into<Vec<u8>>, recxs: Vec<Recx>) -> IoDesc {
        IoDesc {
            akey: akey.into(),
            recxs,
            eprs: None,
        }
    }

    /// Total record count across all extents.
    pub fn record_count(&self) -> u64 {
        self.recxs.iter().map(|r| r.nr).sum()
    }

    pub(crate) fn clear_rsizes(&mut self) {
        for recx in &mut self.recxs {
            recx.rsize = 0;
        }
    }
}

/// Opaque container handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContHandle(pub u64);

pub(crate) struct Container {
    pub(crate) pal: Pal,
    pub(crate) root: PalPtr,
    /// Readers share, writers exclude each other and readers; versioned
    /// records make stale reads harmless but the index arrays must not be
    /// reshaped under a reader.
    pub(crate) rw: RwLock<()>,
}

const OBJ_CACHE_SLOTS: usize = 4096;

lazy_static! {
    static ref CONT_TABLE: HandleTable<Container> = HandleTable::new(HandleType::Container);
    static ref OBJ_CACHE: ObjCache = ObjCache::new(OBJ_CACHE_SLOTS);
}

/// Open (or create) a container backed by the configured pool.
pub fn cont_open(cfg: &StoreConfig) -> Result<ContHandle> {
    let pal = match &cfg.path {
        Some(path) => Pal::open_file(path, cfg.pool_bytes)?,
        None => Pal::open_anon(cfg.pool_bytes)?,
    };
    let root = pal.root(TREE_ROOT_SIZE)?;
    let cookie = CONT_TABLE.insert(Arc::new(Container {
        pal,
        root,
        rw: RwLock::new(()),
    }));
    log::debug!("opened container {:#x}", cookie);
    Ok(ContHandle(cookie))
}

/// Drop the handle. Outstanding operations finish on their own references.
pub fn cont_close(coh: ContHandle) -> Result<()> {
    CONT_TABLE.delete(coh.0).map(|_| ()).ok_or(Error::NoHdl)
}

pub(crate) fn cont_lookup(coh: ContHandle) -> Result<Arc<Container>> {
    CONT_TABLE.lookup(coh.0).ok_or(Error::NoHdl)
}

pub(crate) fn obj_hold(co: &Arc<Container>, coh: ContHandle, oid: ObjectId) -> Arc<ObjRef> {
    OBJ_CACHE.hold(coh.0, &co.pal, co.root, oid)
}

/// Fetch an array of descriptors from one object at `epoch`.
///
/// A never-written object, dkey or akey is not an error: the affected
/// descriptors come back with zero record sizes and emptied lists. A
/// descriptor whose list has no iovs performs a size-only probe.
pub fn obj_fetch(
    coh: ContHandle,
    oid: ObjectId,
    epoch: Epoch,
    dkey: &[u8],
    iods: &mut [IoDesc],
    sgls: &mut [SgList],
) -> Result<()> {
    if iods.len() != sgls.len() {
        return Err(Error::Inval);
    }
    log::debug!(
        "fetch {:?}, desc_nr {}, epoch {}",
        oid,
        iods.len(),
        epoch
    );
    let co = cont_lookup(coh)?;
    let _rd = co.rw.read();
    let oref = obj_hold(&co, coh, oid);
    io::dkey_fetch(&co.pal, &oref, epoch, dkey, iods, io::SinkSet::Sgls(sgls))
}

/// Update an array of descriptors in one object at `epoch`, tagged with the
/// originator `cookie`. All effects happen in a single transaction.
pub fn obj_update(
    coh: ContHandle,
    oid: ObjectId,
    epoch: Epoch,
    cookie: Cookie,
    dkey: &[u8],
    iods: &[IoDesc],
    sgls: &[SgList],
) -> Result<()> {
    if iods.len() != sgls.len() {
        return Err(Error::Inval);
    }
    log::debug!(
        "update {:?}, desc_nr {}, cookie {:?} epoch {}",
        oid,
        iods.len(),
        cookie,
        epoch
    );
    let co = cont_lookup(coh)?;
    let _wr = co.rw.write();
    let oref = obj_hold(&co, coh, oid);
    let pal = co.pal.clone();
    let mut tx = pal.begin();
    match io::dkey_update(
        &mut tx,
        &oref,
        epoch,
        cookie,
        dkey,
        iods,
        &mut io::SourceSet::Sgls(sgls),
    ) {
        Ok(obj_rec) => {
            tx.commit();
            oref.set_rec(obj_rec);
            Ok(())
        }
        Err(err) => {
            log::debug!("failed to update object: {:?}", err);
            Err(err)
        }
    }
}

/// Largest epoch any successful update carried for `cookie` on this object.
pub fn cookie_lookup(coh: ContHandle, oid: ObjectId, cookie: Cookie) -> Result<Epoch> {
    let co = cont_lookup(coh)?;
    let _rd = co.rw.read();
    let oref = obj_hold(&co, coh, oid);
    let obj_rec = oref.tree_init_read().ok_or(Error::Nonexist)?;
    let cookie_root = layout::obj_cookie_root(&co.pal, obj_rec);
    let cookie_tree = Tree::<layout::CookieClass>::open(&co.pal, cookie_root);
    let mut rb = RecBundle::default();
    cookie_tree.lookup(&KeyBundle::bytes(&cookie.0), &mut rb)?;
    Ok(rb.epoch)
}

/// Stage a zero-copy fetch: resolve every record and hand back in-place
/// addresses for the transfer engine. Release with [`obj_zc_fetch_end`].
pub fn obj_zc_fetch_begin(
    coh: ContHandle,
    oid: ObjectId,
    epoch: Epoch,
    dkey: &[u8],
    iods: &mut [IoDesc],
) -> Result<ZcFetch> {
    let co = cont_lookup(coh)?;
    let oref = obj_hold(&co, coh, oid);
    let mut zcc = ZcFetch {
        co,
        oref,
        vbufs: Vec::new(),
    };
    zc::zc_fetch_run(&mut zcc, epoch, dkey, iods)?;
    log::debug!("prepared zc buffers for fetching {} descriptors", iods.len());
    Ok(zcc)
}

/// Finish a zero-copy fetch and release the staging context.
pub fn obj_zc_fetch_end(zcc: ZcFetch, err: i32) -> Result<()> {
    drop(zcc);
    match Error::from_code(err) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Stage a zero-copy update: allocate one persistent record per index and
/// hand back their data regions for the transfer engine to fill.
pub fn obj_zc_update_begin(
    coh: ContHandle,
    oid: ObjectId,
    epoch: Epoch,
    dkey: &[u8],
    iods: &[IoDesc],
) -> Result<ZcUpdate> {
    let co = cont_lookup(coh)?;
    let oref = obj_hold(&co, coh, oid);
    let mut zcc = ZcUpdate {
        co,
        oref,
        epoch,
        dkey: dkey.to_vec(),
        iods: iods.to_vec(),
        vbufs: Vec::new(),
        mmids: Vec::new(),
    };
    zcc.stage()?;
    log::debug!("prepared zc buffers for updating {} descriptors", iods.len());
    Ok(zcc)
}

/// Finish a zero-copy update. With `err == 0` the staged records are
/// installed into the extent trees and the cookie index is folded; any
/// other value releases every staged record. The context is consumed either
/// way.
pub fn obj_zc_update_end(mut zcc: ZcUpdate, cookie: Cookie, err: i32) -> Result<()> {
    if err != 0 {
        log::debug!("zc update abandoned: {}", err);
        drop(zcc);
        return match Error::from_code(err) {
            None => Ok(()),
            Some(e) => Err(e),
        };
    }
    zcc.install(cookie)
}
