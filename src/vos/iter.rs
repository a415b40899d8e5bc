//! Object content iterators: distribution keys, attribute keys, record
//! extents.
//!
//! All three kinds share one protocol of probe (optionally from an
//! anchor), next, fetch, delete and empty, dispatched over an enum. The
//! record-extent
//! iterator carries an epoch predicate selected at prepare time; its
//! advancement always follows the same schema: try the current position,
//! and on a miss re-probe greater-or-equal (or less-or-equal for the
//! reverse walk), using the maximum epoch as a synthetic key to hop to the
//! next distinct index.

use super::{
    layout::{AkeyClass, DkeyClass, IrecClass},
    object::ObjRef,
    zc::ZcIov,
    Container, ContHandle, Cookie, Epoch, EpochRange, ObjectId, Recx, EPOCH_MAX,
};
use crate::{
    error::{Error, Result},
    pal::Pal,
    tree::{Anchor, Cursor, KeyBundle, Probe, RecBundle, Tree},
};
use enum_dispatch::enum_dispatch;
use std::sync::Arc;

/// Iterator level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterType {
    Dkey,
    Akey,
    Recx,
}

/// Epoch predicate of the record-extent iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpcExpr {
    /// Within the range, ascending.
    Re,
    /// Within the range, descending.
    Rr,
    /// First epoch >= `lo` per index.
    Ge,
    /// Largest epoch <= `lo` per index.
    Le,
    /// Exactly `lo` per index; indices without it are skipped.
    Eq,
}

/// Prepare-time parameters. The keys a level does not use are ignored.
#[derive(Debug, Clone, Copy)]
pub struct IterParam<'a> {
    pub coh: ContHandle,
    pub oid: ObjectId,
    pub dkey: &'a [u8],
    pub akey: &'a [u8],
    pub epr: EpochRange,
    pub epc_expr: EpcExpr,
}

/// One yielded position.
#[derive(Debug, Clone, Default)]
pub struct IterEntry {
    /// Key bytes, for the dkey and akey levels.
    pub key: Vec<u8>,
    /// Matched extent, for the recx level.
    pub recx: Recx,
    pub epoch: Epoch,
    pub cookie: Cookie,
    /// Payload address; a hole for punches.
    pub data: ZcIov,
}

#[enum_dispatch]
pub trait IterOps {
    /// Seek to the first matching position, or reseek from an anchor. A
    /// vanished anchor falls through to the nearest position that still
    /// satisfies the predicate.
    fn probe(&mut self, anchor: Option<&Anchor>) -> Result<()>;

    /// Advance to the next matching position.
    fn next(&mut self) -> Result<()>;

    /// Describe the current position.
    fn fetch(&self) -> Result<IterEntry>;

    /// Capture the current position as an anchor.
    fn anchor(&self) -> Result<Anchor>;

    /// Delete the entry at the current position inside a transaction; a
    /// transaction abort surfaces as the iterator error.
    fn delete(&mut self) -> Result<()>;

    /// Whether the iterated tree holds no entries at all.
    fn empty(&self) -> Result<bool>;
}

/// A prepared iterator; finishing it is dropping it.
#[enum_dispatch(IterOps)]
pub enum ObjIter {
    Dkey(DkeyIter),
    Akey(AkeyIter),
    Recx(RecxIter),
}

fn key_entry(pal: &Pal, rb: &RecBundle) -> IterEntry {
    IterEntry {
        key: pal.slice(rb.key_ptr, rb.key_len as usize).to_vec(),
        ..Default::default()
    }
}

/// Distribution-key iterator with an optional "has this akey" filter.
pub struct DkeyIter {
    _co: Arc<Container>,
    _oref: Arc<ObjRef>,
    pal: Pal,
    cur: Cursor<DkeyClass>,
    akey_cond: Option<Vec<u8>>,
}

impl DkeyIter {
    /// Skip forward until the current dkey satisfies the akey condition:
    /// open its subtree in place, point-look the akey up, advance on miss.
    fn probe_cond(&mut self) -> Result<()> {
        let cond = match &self.akey_cond {
            None => return Ok(()),
            Some(cond) if cond.is_empty() => return Ok(()),
            Some(cond) => cond.clone(),
        };
        loop {
            let mut rb = RecBundle::default();
            self.cur.fetch(&mut rb)?;
            let akey_tree = Tree::<AkeyClass>::open(&self.pal, rb.subtree);
            let mut sub = RecBundle::default();
            match akey_tree.lookup(&KeyBundle::bytes(&cond), &mut sub) {
                Ok(()) => return Ok(()),
                Err(Error::Nonexist) => {}
                Err(err) => return Err(err),
            }
            self.cur.next()?;
        }
    }
}

impl IterOps for DkeyIter {
    fn probe(&mut self, anchor: Option<&Anchor>) -> Result<()> {
        match anchor {
            None => self.cur.probe(Probe::First, &KeyBundle::default())?,
            Some(a) => {
                self.cur.probe_anchor(a)?;
            }
        }
        self.probe_cond()
    }

    fn next(&mut self) -> Result<()> {
        self.cur.next()?;
        self.probe_cond()
    }

    fn fetch(&self) -> Result<IterEntry> {
        let mut rb = RecBundle::default();
        self.cur.fetch(&mut rb)?;
        Ok(key_entry(&self.pal, &rb))
    }

    fn anchor(&self) -> Result<Anchor> {
        self.cur.anchor()
    }

    fn delete(&mut self) -> Result<()> {
        let pal = self.pal.clone();
        let mut tx = pal.begin();
        self.cur.delete(&mut tx)?;
        tx.commit();
        Ok(())
    }

    fn empty(&self) -> Result<bool> {
        Ok(self.cur.tree().is_empty())
    }
}

/// Attribute-key iterator: a plain ordered walk scoped to one dkey.
pub struct AkeyIter {
    _co: Arc<Container>,
    _oref: Arc<ObjRef>,
    pal: Pal,
    cur: Cursor<AkeyClass>,
}

impl IterOps for AkeyIter {
    fn probe(&mut self, anchor: Option<&Anchor>) -> Result<()> {
        match anchor {
            None => self.cur.probe(Probe::First, &KeyBundle::default()),
            Some(a) => self.cur.probe_anchor(a).map(|_| ()),
        }
    }

    fn next(&mut self) -> Result<()> {
        self.cur.next()
    }

    fn fetch(&self) -> Result<IterEntry> {
        let mut rb = RecBundle::default();
        self.cur.fetch(&mut rb)?;
        Ok(key_entry(&self.pal, &rb))
    }

    fn anchor(&self) -> Result<Anchor> {
        self.cur.anchor()
    }

    fn delete(&mut self) -> Result<()> {
        let pal = self.pal.clone();
        let mut tx = pal.begin();
        self.cur.delete(&mut tx)?;
        tx.commit();
        Ok(())
    }

    fn empty(&self) -> Result<bool> {
        Ok(self.cur.tree().is_empty())
    }
}

/// Record-extent iterator scoped to `(dkey, akey)` with an epoch predicate.
pub struct RecxIter {
    _co: Arc<Container>,
    _oref: Arc<ObjRef>,
    pal: Pal,
    cur: Cursor<IrecClass>,
    epr: EpochRange,
    expr: EpcExpr,
}

impl RecxIter {
    fn fetch_pos(&self) -> Result<(u64, Epoch)> {
        let mut rb = RecBundle::default();
        self.cur.fetch(&mut rb)?;
        Ok((rb.idx, rb.epoch))
    }

    fn reprobe(&mut self, opc: Probe, idx: u64, epoch: Epoch) -> Result<(u64, Epoch)> {
        self.cur.probe(opc, &KeyBundle::recx(idx, epoch))?;
        self.fetch_pos()
    }

    /// Walk from the current position to the nearest one satisfying the
    /// epoch predicate.
    fn probe_epr(&mut self, mut at: (u64, Epoch)) -> Result<()> {
        loop {
            let (idx, epoch) = at;
            if epoch == self.epr.lo {
                return Ok(());
            }
            at = match self.expr {
                EpcExpr::Re => {
                    if epoch >= self.epr.lo && epoch <= self.epr.hi {
                        return Ok(());
                    }
                    if epoch < self.epr.lo {
                        self.reprobe(Probe::Ge, idx, self.epr.lo)?
                    } else {
                        // past the range in this index, hop to the next one
                        self.reprobe(Probe::Ge, idx, EPOCH_MAX)?
                    }
                }
                EpcExpr::Rr => {
                    if epoch >= self.epr.lo && epoch <= self.epr.hi {
                        return Ok(());
                    }
                    if epoch > self.epr.hi {
                        self.reprobe(Probe::Le, idx, self.epr.hi)?
                    } else {
                        if idx == 0 {
                            return Err(Error::Nonexist);
                        }
                        self.reprobe(Probe::Le, idx - 1, self.epr.hi)?
                    }
                }
                EpcExpr::Ge => {
                    if epoch > self.epr.lo {
                        return Ok(());
                    }
                    self.reprobe(Probe::Ge, idx, self.epr.lo)?
                }
                EpcExpr::Le => {
                    if epoch < self.epr.lo {
                        // this index has data at or below the boundary;
                        // land on the closest epoch
                        self.reprobe(Probe::Le, idx, self.epr.lo)?;
                        return Ok(());
                    }
                    self.reprobe(Probe::Ge, idx, EPOCH_MAX)?
                }
                EpcExpr::Eq => {
                    if epoch < self.epr.lo {
                        match self.reprobe(Probe::Eq, idx, self.epr.lo) {
                            Ok(_) => return Ok(()),
                            Err(Error::Nonexist) => self.reprobe(Probe::Ge, idx, EPOCH_MAX)?,
                            Err(err) => return Err(err),
                        }
                    } else {
                        self.reprobe(Probe::Ge, idx, EPOCH_MAX)?
                    }
                }
            };
        }
    }
}

impl IterOps for RecxIter {
    fn probe(&mut self, anchor: Option<&Anchor>) -> Result<()> {
        match anchor {
            None => {
                let opc = if self.expr == EpcExpr::Rr {
                    Probe::Last
                } else {
                    Probe::First
                };
                self.cur.probe(opc, &KeyBundle::default())?;
            }
            Some(a) => {
                let exact = self.cur.probe_anchor(a)?;
                if exact {
                    return Ok(());
                }
                // the anchored record was merged or discarded; fall through
                // to the predicate walk from the nearest position
                log::debug!("anchored position is gone, reprobing");
                if self.expr == EpcExpr::Rr {
                    self.cur.prev()?;
                }
            }
        }
        let at = self.fetch_pos()?;
        self.probe_epr(at)
    }

    fn next(&mut self) -> Result<()> {
        let (idx, epoch) = self.fetch_pos()?;
        let at = match self.expr {
            EpcExpr::Re => self.reprobe(Probe::Ge, idx, epoch.saturating_add(1))?,
            EpcExpr::Rr => {
                if epoch == 0 {
                    return Err(Error::Nonexist);
                }
                self.reprobe(Probe::Le, idx, epoch - 1)?
            }
            _ => self.reprobe(Probe::Ge, idx, EPOCH_MAX)?,
        };
        self.probe_epr(at)
    }

    fn fetch(&self) -> Result<IterEntry> {
        let mut rb = RecBundle::default();
        self.cur.fetch(&mut rb)?;
        Ok(IterEntry {
            key: Vec::new(),
            recx: Recx {
                idx: rb.idx,
                nr: 1,
                rsize: rb.rsize,
            },
            epoch: rb.epoch,
            cookie: Cookie(rb.cookie),
            data: if rb.data.is_null() {
                ZcIov::hole()
            } else {
                ZcIov::new(rb.data, rb.data_len)
            },
        })
    }

    fn anchor(&self) -> Result<Anchor> {
        self.cur.anchor()
    }

    fn delete(&mut self) -> Result<()> {
        let pal = self.pal.clone();
        let mut tx = pal.begin();
        self.cur.delete(&mut tx)?;
        tx.commit();
        Ok(())
    }

    fn empty(&self) -> Result<bool> {
        Ok(self.cur.tree().is_empty())
    }
}

/// Prepare an iterator over one object's content.
pub fn obj_iter_prepare(ty: IterType, param: &IterParam<'_>) -> Result<ObjIter> {
    let co = super::cont_lookup(param.coh)?;
    let oref = super::obj_hold(&co, param.coh, param.oid);
    let pal = co.pal.clone();

    let obj_rec = match oref.tree_init_read() {
        Some(rec) => rec,
        None => {
            log::debug!("new object, nothing to iterate");
            return Err(Error::Nonexist);
        }
    };
    let dkey_tree = Tree::<DkeyClass>::open(&pal, super::layout::obj_dkey_root(&pal, obj_rec));

    match ty {
        IterType::Dkey => Ok(ObjIter::Dkey(DkeyIter {
            cur: dkey_tree.cursor(),
            akey_cond: (!param.akey.is_empty()).then(|| param.akey.to_vec()),
            pal,
            _co: co,
            _oref: oref,
        })),
        IterType::Akey => {
            let mut rb = RecBundle::default();
            dkey_tree.lookup(&KeyBundle::bytes(param.dkey), &mut rb)?;
            let akey_tree = Tree::<AkeyClass>::open(&pal, rb.subtree);
            Ok(ObjIter::Akey(AkeyIter {
                cur: akey_tree.cursor(),
                pal,
                _co: co,
                _oref: oref,
            }))
        }
        IterType::Recx => {
            let mut epr = param.epr;
            if epr.lo == 0 {
                // zero means "the most recent": probe from the top
                epr.lo = EPOCH_MAX;
            }
            let mut rb = RecBundle::default();
            dkey_tree.lookup(&KeyBundle::bytes(param.dkey), &mut rb)?;
            let akey_tree = Tree::<AkeyClass>::open(&pal, rb.subtree);
            let mut sub = RecBundle::default();
            akey_tree.lookup(&KeyBundle::bytes(param.akey), &mut sub)?;
            let recx_tree = Tree::<IrecClass>::open(&pal, sub.subtree);
            Ok(ObjIter::Recx(RecxIter {
                cur: recx_tree.cursor(),
                epr,
                expr: param.epc_expr,
                pal,
                _co: co,
                _oref: oref,
            }))
        }
    }
}
