//! Zero-copy staging contexts.
//!
//! Both directions hand the caller addresses inside the pool so the network
//! layer can move bytes without an intermediate copy. Fetch staging is
//! read-only and transaction-free; update staging allocates records up
//! front inside a transaction, retains their persistent ids, and either
//! installs them on end or frees them all. The two lifecycles share no
//! state, so they are distinct types.

use super::{
    io::{self, SinkSet, SourceSet},
    layout::irec_size,
    object::ObjRef,
    Container, Cookie, Epoch, IoDesc,
};
use crate::{
    error::{Error, Result},
    pal::{PalPtr, PAL_NULL},
};
use std::sync::Arc;

/// One staged address: null for a hole.
#[derive(Debug, Clone, Copy)]
pub struct ZcIov {
    pub(crate) ptr: PalPtr,
    pub(crate) len: u64,
}

impl Default for ZcIov {
    fn default() -> Self {
        ZcIov::hole()
    }
}

impl ZcIov {
    pub(crate) fn new(ptr: PalPtr, len: u64) -> ZcIov {
        ZcIov { ptr, len }
    }

    pub(crate) fn hole() -> ZcIov {
        ZcIov {
            ptr: PAL_NULL,
            len: 0,
        }
    }

    pub fn is_hole(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-descriptor list of staged addresses.
#[derive(Debug, Default)]
pub struct ZcSgl {
    pub iovs: Vec<ZcIov>,
    pub nr_out: usize,
}

/// Staging handle for a zero-copy fetch. Addresses point at live records;
/// the handle pins the object ref until [`super::obj_zc_fetch_end`].
pub struct ZcFetch {
    pub(crate) co: Arc<Container>,
    pub(crate) oref: Arc<ObjRef>,
    pub(crate) vbufs: Vec<ZcSgl>,
}

impl ZcFetch {
    /// The object this staging context is pinned to.
    pub fn object(&self) -> super::ObjectId {
        self.oref.oid()
    }

    /// The staged scatter/gather list of descriptor `at`.
    pub fn sgl(&self, at: usize) -> Result<&ZcSgl> {
        self.vbufs.get(at).ok_or_else(|| {
            log::debug!("invalid descriptor index {}/{}", at, self.vbufs.len());
            Error::Nonexist
        })
    }

    /// Borrow the bytes behind one staged iov; `None` for holes.
    pub fn iov_bytes(&self, at: usize, iov_at: usize) -> Result<Option<&[u8]>> {
        let iov = *self
            .sgl(at)?
            .iovs
            .get(iov_at)
            .ok_or(Error::Nonexist)?;
        if iov.is_hole() {
            return Ok(None);
        }
        Ok(Some(self.co.pal.slice(iov.ptr, iov.len as usize)))
    }
}

/// Staging handle for a zero-copy update: retained persistent ids plus the
/// descriptors to re-run on install. Dropping the handle without an install
/// releases every retained id, opening its own transaction to do so; both
/// teardown paths converge there.
pub struct ZcUpdate {
    pub(crate) co: Arc<Container>,
    pub(crate) oref: Arc<ObjRef>,
    pub(crate) epoch: Epoch,
    pub(crate) dkey: Vec<u8>,
    pub(crate) iods: Vec<IoDesc>,
    pub(crate) vbufs: Vec<ZcSgl>,
    pub(crate) mmids: Vec<Vec<PalPtr>>,
}

impl ZcUpdate {
    pub fn sgl(&self, at: usize) -> Result<&ZcSgl> {
        self.vbufs.get(at).ok_or_else(|| {
            log::debug!("invalid descriptor index {}/{}", at, self.vbufs.len());
            Error::Nonexist
        })
    }

    /// Mutable bytes of one staged record, for the caller (or its RDMA
    /// engine) to fill before the end-call. Staged records are unreachable
    /// from any index, so these writes need no logging.
    pub fn iov_bytes_mut(&mut self, at: usize, iov_at: usize) -> Result<&mut [u8]> {
        let iov = *self
            .vbufs
            .get(at)
            .ok_or(Error::Nonexist)?
            .iovs
            .get(iov_at)
            .ok_or(Error::Nonexist)?;
        if iov.is_hole() || iov.len == 0 {
            return Err(Error::Inval);
        }
        Ok(unsafe { self.co.pal.slice_mut_raw(iov.ptr, iov.len as usize) })
    }

    /// Pre-allocate one record per index of every descriptor and remember
    /// the ids. Runs in its own transaction; a partial failure aborts it,
    /// which already releases this call's allocations.
    pub(crate) fn stage(&mut self) -> Result<()> {
        let pal = self.co.pal.clone();
        let mut tx = pal.begin();
        let mut vbufs = Vec::with_capacity(self.iods.len());
        let mut mmids = Vec::with_capacity(self.iods.len());
        for iod in &self.iods {
            let mut sgl = ZcSgl::default();
            let mut ids = Vec::new();
            for recx in &iod.recxs {
                let size = irec_size(recx.rsize);
                for _ in 0..recx.nr {
                    let rec = match tx.alloc(size) {
                        Ok(rec) => rec,
                        Err(err) => {
                            log::debug!("failed to stage record: {:?}", err);
                            drop(tx);
                            return Err(err);
                        }
                    };
                    ids.push(rec);
                    sgl.iovs.push(ZcIov::new(
                        rec.at(super::layout::IREC_DATA_OFF),
                        recx.rsize,
                    ));
                    sgl.nr_out += 1;
                }
            }
            vbufs.push(sgl);
            mmids.push(ids);
        }
        tx.commit();
        self.vbufs = vbufs;
        self.mmids = mmids;
        Ok(())
    }

    /// Install the staged records by re-running the update algorithm with
    /// the retained ids instead of copying payload.
    pub(crate) fn install(&mut self, cookie: Cookie) -> Result<()> {
        let pal = self.co.pal.clone();
        let _wr = self.co.rw.write();
        let mut tx = pal.begin();
        let rc = io::dkey_update(
            &mut tx,
            &self.oref,
            self.epoch,
            cookie,
            &self.dkey,
            &self.iods,
            &mut SourceSet::Staged(&mut self.mmids),
        );
        match rc {
            Ok(obj_rec) => {
                tx.commit();
                self.oref.set_rec(obj_rec);
                // every id now lives in the extent trees
                for ids in &mut self.mmids {
                    ids.clear();
                }
                Ok(())
            }
            Err(err) => {
                // tx drop aborts: the trees are untouched and every staged
                // id is still ours to free
                Err(err)
            }
        }
    }

    fn release_staged(&mut self) {
        if self.mmids.iter().all(|ids| ids.is_empty()) {
            return;
        }
        let pal = self.co.pal.clone();
        let mut tx = pal.begin();
        for ids in &mut self.mmids {
            for id in ids.drain(..) {
                if !id.is_null() {
                    tx.free(id);
                }
            }
        }
        tx.commit();
    }
}

impl Drop for ZcUpdate {
    fn drop(&mut self) {
        self.release_staged();
    }
}

/// Run the staged fetch for a freshly created context.
pub(crate) fn zc_fetch_run(
    zc: &mut ZcFetch,
    epoch: Epoch,
    dkey: &[u8],
    iods: &mut [IoDesc],
) -> Result<()> {
    let pal = zc.co.pal.clone();
    let _rd = zc.co.rw.read();
    zc.vbufs = (0..iods.len()).map(|_| ZcSgl::default()).collect();
    io::dkey_fetch(
        &pal,
        &zc.oref,
        epoch,
        dkey,
        iods,
        SinkSet::Zc(&mut zc.vbufs),
    )
}
