//! Fetch and update of record-extent sets.
//!
//! The fetch side resolves each requested index with a less-or-equal probe
//! against `(idx, epoch)`: a mismatched index is a hole, a zero-sized record
//! is a punched hole, anything else is data. Leading holes are back-filled
//! once the first real record fixes the record size; an all-hole extent
//! reports size zero and an emptied sink.
//!
//! Updates run inside one pool transaction; dkey/akey/extent subtrees are
//! created on the way down, payload bytes are copied from the source list
//! into the freshly placed records, and the cookie index is folded last.

use super::{
    layout::{
        krec_rsize, krec_set_rsize, obj_cookie_root, AkeyClass, CookieClass, DkeyClass, IrecClass,
    },
    object::ObjRef,
    zc::{ZcIov, ZcSgl},
    Cookie, Epoch, EpochRange, IoDesc, EPOCH_MAX,
};
use crate::{
    error::{Error, Result},
    iov::SgList,
    pal::{Pal, PalPtr, Tx},
    tree::{KeyBundle, Probe, RecBundle, Tree},
};

/// Cursor over a scatter/gather sink; tracks the in-use iov and the offset
/// inside it, advancing across iov boundaries.
pub(crate) struct VecBuf<'a> {
    sgl: &'a mut SgList,
    at: usize,
    off: usize,
}

impl<'a> VecBuf<'a> {
    pub(crate) fn new(sgl: &'a mut SgList) -> VecBuf<'a> {
        for iov in &mut sgl.iovs {
            iov.set_len(0);
        }
        sgl.nr_out = 0;
        VecBuf { sgl, at: 0, off: 0 }
    }

    fn is_exhausted(&self) -> bool {
        debug_assert!(self.at <= self.sgl.iovs.len());
        self.at == self.sgl.iovs.len()
    }

    /// Copy `size` bytes of `src` into the sink, or skip `size` bytes for a
    /// hole (`src == None`, sink bytes stay untouched).
    fn fill(&mut self, src: Option<&[u8]>, size: u64) -> Result<()> {
        let mut src = src;
        let mut size = size as usize;
        while !self.is_exhausted() {
            let iov = &mut self.sgl.iovs[self.at];
            let cap = iov.capacity();
            if cap <= self.off {
                log::error!("invalid iov[{}] {}/{}", self.at, self.off, cap);
                return Err(Error::IoInval);
            }
            let nob = size.min(cap - self.off);
            if let Some(s) = src.as_mut() {
                iov.raw_mut()[self.off..self.off + nob].copy_from_slice(&s[..nob]);
                *s = &s[nob..];
            }
            let first = self.off == 0;
            self.off += nob;
            if first {
                self.sgl.nr_out += 1;
            }
            iov.set_len(self.off);
            if self.off == cap {
                self.off = 0;
                self.at += 1;
            }
            size -= nob;
            if size == 0 {
                return Ok(());
            }
        }
        log::debug!("consumed all iovs, {} bytes left", size);
        Err(Error::IoInval)
    }

    fn clear(&mut self) {
        self.sgl.clear_filled();
    }
}

/// Read cursor over a source scatter/gather list for the update path.
struct SrcBuf<'a> {
    sgl: &'a SgList,
    at: usize,
    off: usize,
}

impl<'a> SrcBuf<'a> {
    fn new(sgl: &'a SgList) -> SrcBuf<'a> {
        SrcBuf { sgl, at: 0, off: 0 }
    }

    fn consume_into(&mut self, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while self.at < self.sgl.iovs.len() && done < out.len() {
            let iov = &self.sgl.iovs[self.at];
            if iov.len() <= self.off {
                log::error!("invalid iov[{}] {}/{}", self.at, self.off, iov.len());
                return Err(Error::IoInval);
            }
            let nob = (out.len() - done).min(iov.len() - self.off);
            out[done..done + nob].copy_from_slice(&iov.as_slice()[self.off..self.off + nob]);
            self.off += nob;
            done += nob;
            if self.off == iov.len() {
                self.off = 0;
                self.at += 1;
            }
        }
        if done < out.len() {
            log::debug!("consumed all iovs, {} bytes short", out.len() - done);
            return Err(Error::IoInval);
        }
        Ok(())
    }
}

/// Where fetched data goes: a copying sink, a size-only probe, or the
/// zero-copy address list.
pub(crate) enum FetchSink<'a> {
    Copy(VecBuf<'a>),
    SizeOnly,
    Zc(&'a mut ZcSgl),
}

/// Fetch one record extent. Resolves each index at the probe epoch, tracks
/// holes, enforces record-size uniformity, and reports the resolved size
/// back through `recx.rsize`.
fn recx_fetch(
    pal: &Pal,
    tree: &Tree<IrecClass>,
    epr: &EpochRange,
    recx: &mut super::Recx,
    sink: &mut FetchSink<'_>,
) -> Result<()> {
    let mut rsize: u64 = match sink {
        FetchSink::SizeOnly => 0,
        _ => recx.rsize,
    };
    let mut holes: u64 = 0;

    for i in 0..recx.nr {
        if let FetchSink::Copy(vbuf) = sink {
            if vbuf.is_exhausted() {
                log::debug!("invalid I/O parameters: {}/{}", vbuf.at, vbuf.sgl.iovs.len());
                return Err(Error::IoInval);
            }
        }

        let kb = KeyBundle::recx(recx.idx + i, epr.lo);
        let mut rb = RecBundle::default();
        let hit = match tree.probe_fetch(Probe::Le, &kb, &mut rb) {
            Ok(()) => rb.idx == recx.idx + i,
            Err(Error::Nonexist) => false,
            Err(err) => {
                log::debug!("failed to fetch index {}: {:?}", recx.idx + i, err);
                return Err(err);
            }
        };

        let rec_rsize = if hit { rb.rsize } else { 0 };
        if rec_rsize == 0 {
            // no record at this index, or a punch
            holes += 1;
        } else {
            if rsize == 0 {
                // first real record fixes the uniform size
                rsize = rec_rsize;
            }
            if rsize != rec_rsize {
                log::error!(
                    "record sizes of all indices must be the same: {}/{}",
                    rsize,
                    rec_rsize
                );
                return Err(Error::IoInval);
            }
            if matches!(sink, FetchSink::SizeOnly) {
                recx.rsize = rsize;
                return Ok(());
            }
        }

        match sink {
            FetchSink::SizeOnly => continue,
            FetchSink::Zc(sgl) => {
                // one iov per index; holes keep a null address
                if rec_rsize == 0 {
                    sgl.iovs.push(ZcIov::hole());
                } else {
                    sgl.iovs.push(ZcIov::new(rb.data, rb.data_len));
                }
                sgl.nr_out += 1;
            }
            FetchSink::Copy(vbuf) => {
                if rec_rsize == 0 {
                    continue;
                }
                if holes != 0 {
                    vbuf.fill(None, holes * rsize)?;
                    holes = 0;
                }
                let bytes = pal.slice(rb.data, rb.data_len as usize);
                vbuf.fill(Some(bytes), rb.data_len)?;
            }
        }
    }

    if holes == recx.nr {
        // nothing but holes, the caller learns size zero
        rsize = 0;
    }

    if let FetchSink::Copy(vbuf) = sink {
        if holes != 0 {
            if rsize == 0 {
                vbuf.clear();
            } else {
                vbuf.fill(None, holes * rsize)?;
            }
        }
    }

    recx.rsize = rsize;
    Ok(())
}

/// Per-descriptor sinks for one fetch call.
pub(crate) enum SinkSet<'a> {
    Sgls(&'a mut [SgList]),
    Zc(&'a mut [ZcSgl]),
}

impl SinkSet<'_> {
    fn len(&self) -> usize {
        match self {
            SinkSet::Sgls(s) => s.len(),
            SinkSet::Zc(z) => z.len(),
        }
    }

    fn sink_at(&mut self, i: usize) -> FetchSink<'_> {
        match self {
            SinkSet::Sgls(sgls) => {
                if sgls[i].iovs.is_empty() {
                    FetchSink::SizeOnly
                } else {
                    FetchSink::Copy(VecBuf::new(&mut sgls[i]))
                }
            }
            SinkSet::Zc(sgls) => FetchSink::Zc(&mut sgls[i]),
        }
    }

    fn empty_at(&mut self, i: usize) {
        match self {
            SinkSet::Sgls(sgls) => sgls[i].clear_filled(),
            SinkSet::Zc(sgls) => {
                sgls[i].iovs.clear();
                sgls[i].nr_out = 0;
            }
        }
    }
}

fn empty_all(iods: &mut [IoDesc], sinks: &mut SinkSet<'_>) {
    for (i, iod) in iods.iter_mut().enumerate() {
        iod.clear_rsizes();
        sinks.empty_at(i);
    }
}

/// Fetch a set of descriptors under one dkey. A missing object, dkey or
/// akey is not an error: the affected descriptors report size zero with
/// emptied sinks.
pub(crate) fn dkey_fetch(
    pal: &Pal,
    oref: &ObjRef,
    epoch: Epoch,
    dkey: &[u8],
    iods: &mut [IoDesc],
    mut sinks: SinkSet<'_>,
) -> Result<()> {
    debug_assert_eq!(iods.len(), sinks.len());

    let obj_rec = match oref.tree_init_read() {
        Some(rec) => rec,
        None => {
            log::debug!("new object, nothing to fetch");
            empty_all(iods, &mut sinks);
            return Ok(());
        }
    };

    let dkey_tree = Tree::<DkeyClass>::open(pal, super::layout::obj_dkey_root(pal, obj_rec));
    let mut rb = RecBundle::default();
    match dkey_tree.lookup(&KeyBundle::bytes(dkey), &mut rb) {
        Ok(()) => {}
        Err(Error::Nonexist) => {
            log::debug!("nonexistent dkey");
            empty_all(iods, &mut sinks);
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let akey_tree = Tree::<AkeyClass>::open(pal, rb.subtree);
    for (i, iod) in iods.iter_mut().enumerate() {
        let mut rb = RecBundle::default();
        match akey_tree.lookup(&KeyBundle::bytes(&iod.akey), &mut rb) {
            Ok(()) => {}
            Err(Error::Nonexist) => {
                log::debug!("nonexistent akey");
                iod.clear_rsizes();
                sinks.empty_at(i);
                continue;
            }
            Err(err) => return Err(err),
        }
        let recx_tree = Tree::<IrecClass>::open(pal, rb.subtree);
        let mut sink = sinks.sink_at(i);
        let whole = EpochRange {
            lo: epoch,
            hi: EPOCH_MAX,
        };
        for j in 0..iod.recxs.len() {
            let epr = iod.eprs.as_ref().map(|e| e[j]).unwrap_or(whole);
            recx_fetch(pal, &recx_tree, &epr, &mut iod.recxs[j], &mut sink)?;
        }
    }
    Ok(())
}

/// Payload source for one update call: the caller's scatter/gather lists,
/// or pre-staged records from a zero-copy context.
pub(crate) enum SourceSet<'a> {
    Sgls(&'a [SgList]),
    Staged(&'a mut [Vec<PalPtr>]),
}

/// Apply a set of descriptors under one dkey inside the caller's
/// transaction. Returns the object-index record so the caller can publish
/// it after commit.
pub(crate) fn dkey_update(
    tx: &mut Tx<'_>,
    oref: &ObjRef,
    epoch: Epoch,
    cookie: Cookie,
    dkey: &[u8],
    iods: &[IoDesc],
    src: &mut SourceSet<'_>,
) -> Result<PalPtr> {
    let pal = tx.pal().clone();
    let obj_rec = oref.tree_init_write(tx)?;

    let dkey_tree = Tree::<DkeyClass>::open(&pal, super::layout::obj_dkey_root(&pal, obj_rec));
    let mut rb = RecBundle::default();
    dkey_tree.update(tx, &KeyBundle::bytes(dkey), &mut rb)?;
    let akey_tree = Tree::<AkeyClass>::open(&pal, rb.subtree);

    for (i, iod) in iods.iter().enumerate() {
        let mut rb = RecBundle::default();
        akey_tree.update(tx, &KeyBundle::bytes(&iod.akey), &mut rb)?;
        let krec = rb.rec;
        let recx_tree = Tree::<IrecClass>::open(&pal, rb.subtree);

        // record sizes below one akey are uniform for good; the first sized
        // write pins them
        let mut pinned = krec_rsize(&pal, krec);
        for recx in &iod.recxs {
            if recx.rsize == 0 {
                continue; // punch
            }
            if pinned == 0 {
                krec_set_rsize(tx, krec, recx.rsize);
                pinned = recx.rsize;
            } else if pinned != recx.rsize {
                log::error!(
                    "record size {} conflicts with akey record size {}",
                    recx.rsize,
                    pinned
                );
                return Err(Error::IoInval);
            }
        }

        let whole = EpochRange {
            lo: epoch,
            hi: EPOCH_MAX,
        };
        let mut sgl_src = match src {
            SourceSet::Sgls(sgls) => Some(SrcBuf::new(&sgls[i])),
            SourceSet::Staged(_) => None,
        };
        let mut staged_at = 0usize;

        for (j, recx) in iod.recxs.iter().enumerate() {
            let epr = iod.eprs.as_ref().map(|e| e[j]).unwrap_or(whole);
            if epr.hi != EPOCH_MAX {
                log::error!("bounded epoch ranges are not supported on update");
                return Err(Error::IoInval);
            }
            for k in 0..recx.nr {
                let kb = KeyBundle::recx(recx.idx + k, epr.lo);
                let mut rb = RecBundle {
                    rsize: recx.rsize,
                    cookie: cookie.0,
                    ..Default::default()
                };
                if let SourceSet::Staged(vecs) = src {
                    rb.mmid = vecs[i][staged_at];
                }
                recx_tree.update(tx, &kb, &mut rb)?;
                staged_at += 1;

                if let Some(sb) = sgl_src.as_mut() {
                    if recx.rsize > 0 {
                        let mut buf = vec![0u8; recx.rsize as usize];
                        sb.consume_into(&mut buf)?;
                        tx.write(rb.data, 0, &buf);
                    }
                }
            }
        }
    }

    // every descriptor landed; fold the originator into the cookie index
    let cookie_tree = Tree::<CookieClass>::open(&pal, obj_cookie_root(&pal, obj_rec));
    let kb = KeyBundle {
        key: &cookie.0,
        idx: 0,
        epoch,
    };
    let mut rb = RecBundle::default();
    cookie_tree.update(tx, &kb, &mut rb)?;

    Ok(obj_rec)
}
