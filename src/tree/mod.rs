//! Key-ordered tree primitive over pool memory.
//!
//! Each tree is a sorted run of fixed-size entries `(hkey, record)` with
//! binary probing, so point lookups and range probes are logarithmic in the
//! number of keys. The 16-byte `hkey` is an order-preserving prefix of the
//! full key; ties fall through to the record class for a full-precision
//! comparison. Records themselves are typed pool allocations produced and
//! consumed through [`TreeClass`] callbacks fed by stack-built bundles.
//!
//! Subtree roots live inline in their parent's record; [`Tree::open`] binds
//! to such a root in place, no copy of the root ever happens.

mod bundle;

pub use bundle::{KeyBundle, RecBundle};

use crate::{
    error::{Error, Result},
    pal::{Pal, PalPtr, Tx},
};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, marker::PhantomData, mem::size_of};

/// Probe opcodes for [`Tree::probe_fetch`] and [`Cursor::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    First,
    Last,
    Ge,
    Le,
    Eq,
}

/// Record-type callbacks: how keys order, how records materialise.
pub trait TreeClass {
    /// Order-preserving 16-byte prefix of the probe key.
    fn hkey(kb: &KeyBundle<'_>) -> [u8; 16];

    /// Full-precision comparison of a stored record against the probe key,
    /// consulted when prefixes tie.
    fn key_cmp(pal: &Pal, rec: PalPtr, kb: &KeyBundle<'_>) -> Ordering;

    /// Allocate and initialise a record for the bundles.
    fn rec_alloc(tx: &mut Tx<'_>, kb: &KeyBundle<'_>, rb: &mut RecBundle) -> Result<PalPtr>;

    /// Refresh an existing record on re-update of the same key. Returning
    /// `Some(new_rec)` replaces the tree entry with a new record; the class
    /// is responsible for releasing the old one.
    fn rec_update(
        tx: &mut Tx<'_>,
        rec: PalPtr,
        kb: &KeyBundle<'_>,
        rb: &mut RecBundle,
    ) -> Result<Option<PalPtr>>;

    /// Describe a stored record into the bundle's output fields.
    fn rec_fetch(pal: &Pal, rec: PalPtr, rb: &mut RecBundle);

    /// Release a record and everything it owns.
    fn rec_free(tx: &mut Tx<'_>, rec: PalPtr);
}

/// On-media tree root: entry-array location and bounds. Lives inline in the
/// parent record (or in the container root for top-level trees).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TreeRoot {
    arr: u64,
    cap: u32,
    count: u32,
}

pub const TREE_ROOT_SIZE: usize = size_of::<TreeRoot>();

const ENTRY_SIZE: usize = 24;
const HKEY_LEN: usize = 16;
const INITIAL_CAP: u32 = 8;

#[derive(Debug, Clone, Copy)]
struct Entry {
    hkey: [u8; HKEY_LEN],
    rec: PalPtr,
}

impl Entry {
    fn decode(buf: &[u8]) -> Entry {
        let mut hkey = [0u8; HKEY_LEN];
        hkey.copy_from_slice(&buf[..HKEY_LEN]);
        Entry {
            hkey,
            rec: PalPtr::from_off(LittleEndian::read_u64(&buf[HKEY_LEN..ENTRY_SIZE])),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[..HKEY_LEN].copy_from_slice(&self.hkey);
        LittleEndian::write_u64(&mut buf[HKEY_LEN..ENTRY_SIZE], self.rec.off());
    }
}

/// Opaque reseek token: the ordered prefix of the position it was taken at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    hkey: [u8; HKEY_LEN],
    set: bool,
}

impl Anchor {
    pub fn is_set(&self) -> bool {
        self.set
    }

    /// Wire form for callers that carry anchors across process boundaries.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|_| Error::Inval)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Anchor> {
        bincode::deserialize(bytes).map_err(|_| Error::Inval)
    }
}

/// A tree bound to a root location in the pool.
pub struct Tree<C> {
    pal: Pal,
    root: PalPtr,
    _class: PhantomData<C>,
}

impl<C> Clone for Tree<C> {
    fn clone(&self) -> Self {
        Tree {
            pal: self.pal.clone(),
            root: self.root,
            _class: PhantomData,
        }
    }
}

impl<C: TreeClass> Tree<C> {
    /// Bind to a root in place. The root may be freshly zeroed (empty tree).
    pub fn open(pal: &Pal, root: PalPtr) -> Tree<C> {
        debug_assert!(!root.is_null());
        Tree {
            pal: pal.clone(),
            root,
            _class: PhantomData,
        }
    }

    pub fn pal(&self) -> &Pal {
        &self.pal
    }

    fn root_val(&self) -> TreeRoot {
        *self.pal.load::<TreeRoot>(self.root)
    }

    pub fn count(&self) -> usize {
        self.root_val().count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn entry(&self, pos: usize) -> Entry {
        let root = self.root_val();
        debug_assert!(pos < root.count as usize);
        let buf = self
            .pal
            .slice(PalPtr::from_off(root.arr).at(pos * ENTRY_SIZE), ENTRY_SIZE);
        Entry::decode(buf)
    }

    fn cmp_at(&self, pos: usize, hkey: &[u8; HKEY_LEN], kb: &KeyBundle<'_>) -> Ordering {
        let entry = self.entry(pos);
        entry
            .hkey
            .cmp(hkey)
            .then_with(|| C::key_cmp(&self.pal, entry.rec, kb))
    }

    /// Leftmost position whose entry is >= the probe key, plus whether the
    /// entry there matches exactly.
    fn locate(&self, hkey: &[u8; HKEY_LEN], kb: &KeyBundle<'_>) -> (usize, bool) {
        let count = self.count();
        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.cmp_at(mid, hkey, kb) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let exact = lo < count && self.cmp_at(lo, hkey, kb) == Ordering::Equal;
        (lo, exact)
    }

    /// Point lookup; fills the bundle's output fields.
    pub fn lookup(&self, kb: &KeyBundle<'_>, rb: &mut RecBundle) -> Result<()> {
        let hkey = C::hkey(kb);
        let (pos, exact) = self.locate(&hkey, kb);
        if !exact {
            return Err(Error::Nonexist);
        }
        let rec = self.entry(pos).rec;
        rb.rec = rec;
        C::rec_fetch(&self.pal, rec, rb);
        Ok(())
    }

    /// Insert-or-refresh. Creates the record (and thus any inline subtree
    /// root) when the key is absent.
    pub fn update(&self, tx: &mut Tx<'_>, kb: &KeyBundle<'_>, rb: &mut RecBundle) -> Result<()> {
        let hkey = C::hkey(kb);
        let (pos, exact) = self.locate(&hkey, kb);
        let rec = if exact {
            let mut rec = self.entry(pos).rec;
            if let Some(new_rec) = C::rec_update(tx, rec, kb, rb)? {
                let root = self.root_val();
                let arr = PalPtr::from_off(root.arr);
                let mut buf = [0u8; 8];
                LittleEndian::write_u64(&mut buf, new_rec.off());
                tx.write(arr, pos * ENTRY_SIZE + HKEY_LEN, &buf);
                rec = new_rec;
            }
            rec
        } else {
            let rec = C::rec_alloc(tx, kb, rb)?;
            self.insert_at(tx, pos, Entry { hkey, rec })?;
            rec
        };
        rb.rec = rec;
        C::rec_fetch(&self.pal, rec, rb);
        Ok(())
    }

    /// Range probe returning the matched record, including the key it was
    /// actually found under (the record-extent fetch path inspects that to
    /// detect holes).
    pub fn probe_fetch(&self, opc: Probe, kb: &KeyBundle<'_>, rb: &mut RecBundle) -> Result<()> {
        let pos = self.probe_pos(opc, kb)?;
        let rec = self.entry(pos).rec;
        rb.rec = rec;
        C::rec_fetch(&self.pal, rec, rb);
        Ok(())
    }

    fn probe_pos(&self, opc: Probe, kb: &KeyBundle<'_>) -> Result<usize> {
        let count = self.count();
        if count == 0 {
            return Err(Error::Nonexist);
        }
        match opc {
            Probe::First => Ok(0),
            Probe::Last => Ok(count - 1),
            Probe::Ge | Probe::Eq => {
                let hkey = C::hkey(kb);
                let (pos, exact) = self.locate(&hkey, kb);
                if opc == Probe::Eq && !exact {
                    return Err(Error::Nonexist);
                }
                if pos == count {
                    return Err(Error::Nonexist);
                }
                Ok(pos)
            }
            Probe::Le => {
                let hkey = C::hkey(kb);
                let (pos, exact) = self.locate(&hkey, kb);
                if exact {
                    Ok(pos)
                } else if pos == 0 {
                    Err(Error::Nonexist)
                } else {
                    Ok(pos - 1)
                }
            }
        }
    }

    fn grow(&self, tx: &mut Tx<'_>) -> Result<()> {
        let root = self.root_val();
        let new_cap = if root.cap == 0 {
            INITIAL_CAP
        } else {
            root.cap * 2
        };
        let new_arr = tx.alloc(new_cap as usize * ENTRY_SIZE)?;
        if root.arr != 0 {
            let live = root.count as usize * ENTRY_SIZE;
            let old = self.pal.slice(PalPtr::from_off(root.arr), live).to_vec();
            tx.write_fresh(new_arr, 0, &old);
            tx.free(PalPtr::from_off(root.arr));
        }
        let r = tx.load_mut::<TreeRoot>(self.root);
        r.arr = new_arr.off();
        r.cap = new_cap;
        Ok(())
    }

    fn insert_at(&self, tx: &mut Tx<'_>, pos: usize, entry: Entry) -> Result<()> {
        if {
            let root = self.root_val();
            root.count == root.cap
        } {
            self.grow(tx)?;
        }
        let root = self.root_val();
        let arr = PalPtr::from_off(root.arr);
        let count = root.count as usize;
        let tail = (count - pos) * ENTRY_SIZE;
        let region = tx.slice_mut(arr.at(pos * ENTRY_SIZE), tail + ENTRY_SIZE);
        region.copy_within(..tail, ENTRY_SIZE);
        entry.encode(&mut region[..ENTRY_SIZE]);
        tx.load_mut::<TreeRoot>(self.root).count += 1;
        Ok(())
    }

    fn delete_at(&self, tx: &mut Tx<'_>, pos: usize) -> Result<()> {
        let root = self.root_val();
        let count = root.count as usize;
        debug_assert!(pos < count);
        let arr = PalPtr::from_off(root.arr);
        let rec = self.entry(pos).rec;
        let tail = (count - pos) * ENTRY_SIZE;
        let region = tx.slice_mut(arr.at(pos * ENTRY_SIZE), tail);
        region.copy_within(ENTRY_SIZE.., 0);
        tx.load_mut::<TreeRoot>(self.root).count -= 1;
        C::rec_free(tx, rec);
        Ok(())
    }

    pub fn cursor(&self) -> Cursor<C> {
        Cursor {
            tree: self.clone(),
            pos: None,
        }
    }

    /// Free every record and the entry array, leaving the root empty. Used
    /// when a parent record that owns this subtree goes away.
    pub fn destroy(&self, tx: &mut Tx<'_>) -> Result<()> {
        let root = self.root_val();
        for pos in 0..root.count as usize {
            C::rec_free(tx, self.entry(pos).rec);
        }
        if root.arr != 0 {
            tx.free(PalPtr::from_off(root.arr));
        }
        let r = tx.load_mut::<TreeRoot>(self.root);
        r.arr = 0;
        r.cap = 0;
        r.count = 0;
        Ok(())
    }
}

/// In-order cursor. Positions are invalidated by structural mutation; use an
/// [`Anchor`] to reseek afterwards.
pub struct Cursor<C> {
    tree: Tree<C>,
    pos: Option<usize>,
}

impl<C: TreeClass> Cursor<C> {
    pub fn probe(&mut self, opc: Probe, kb: &KeyBundle<'_>) -> Result<()> {
        self.pos = Some(self.tree.probe_pos(opc, kb)?);
        Ok(())
    }

    /// Reseek to an anchor. Returns whether the exact anchored position was
    /// found again; on a miss the cursor rests on the nearest following
    /// entry.
    pub fn probe_anchor(&mut self, anchor: &Anchor) -> Result<bool> {
        if !anchor.set {
            return Err(Error::Inval);
        }
        let count = self.tree.count();
        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.tree.entry(mid).hkey < anchor.hkey {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == count {
            return Err(Error::Nonexist);
        }
        self.pos = Some(lo);
        Ok(self.tree.entry(lo).hkey == anchor.hkey)
    }

    pub fn next(&mut self) -> Result<()> {
        let pos = self.pos.ok_or(Error::NoHdl)?;
        if pos + 1 >= self.tree.count() {
            return Err(Error::Nonexist);
        }
        self.pos = Some(pos + 1);
        Ok(())
    }

    pub fn prev(&mut self) -> Result<()> {
        let pos = self.pos.ok_or(Error::NoHdl)?;
        if pos == 0 {
            return Err(Error::Nonexist);
        }
        self.pos = Some(pos - 1);
        Ok(())
    }

    pub fn tree(&self) -> &Tree<C> {
        &self.tree
    }

    /// Describe the current record.
    pub fn fetch(&self, rb: &mut RecBundle) -> Result<()> {
        let pos = self.pos.ok_or(Error::NoHdl)?;
        if pos >= self.tree.count() {
            return Err(Error::Nonexist);
        }
        let rec = self.tree.entry(pos).rec;
        rb.rec = rec;
        C::rec_fetch(self.tree.pal(), rec, rb);
        Ok(())
    }

    /// Position token for reseeking after mutation.
    pub fn anchor(&self) -> Result<Anchor> {
        let pos = self.pos.ok_or(Error::NoHdl)?;
        if pos >= self.tree.count() {
            return Err(Error::Nonexist);
        }
        Ok(Anchor {
            hkey: self.tree.entry(pos).hkey,
            set: true,
        })
    }

    /// Delete the current entry; the cursor ends up on the entry that
    /// followed it.
    pub fn delete(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        let pos = self.pos.ok_or(Error::NoHdl)?;
        if pos >= self.tree.count() {
            return Err(Error::Nonexist);
        }
        self.tree.delete_at(tx, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::Pal;

    /// Minimal byte-key class: record is `u32 key_len ++ key ++ u64 value`.
    struct KvClass;

    impl KvClass {
        fn key_of(pal: &Pal, rec: PalPtr) -> Vec<u8> {
            let len = LittleEndian::read_u32(pal.slice(rec, 4)) as usize;
            pal.slice(rec.at(4), len).to_vec()
        }
    }

    impl TreeClass for KvClass {
        fn hkey(kb: &KeyBundle<'_>) -> [u8; 16] {
            let mut h = [0u8; 16];
            let n = kb.key.len().min(16);
            h[..n].copy_from_slice(&kb.key[..n]);
            h
        }

        fn key_cmp(pal: &Pal, rec: PalPtr, kb: &KeyBundle<'_>) -> Ordering {
            Self::key_of(pal, rec).as_slice().cmp(kb.key)
        }

        fn rec_alloc(tx: &mut Tx<'_>, kb: &KeyBundle<'_>, rb: &mut RecBundle) -> Result<PalPtr> {
            let rec = tx.alloc(4 + kb.key.len() + 8)?;
            let mut hdr = [0u8; 4];
            LittleEndian::write_u32(&mut hdr, kb.key.len() as u32);
            tx.write_fresh(rec, 0, &hdr);
            tx.write_fresh(rec, 4, kb.key);
            let mut val = [0u8; 8];
            LittleEndian::write_u64(&mut val, rb.rsize);
            tx.write_fresh(rec, 4 + kb.key.len(), &val);
            Ok(rec)
        }

        fn rec_update(
            tx: &mut Tx<'_>,
            rec: PalPtr,
            kb: &KeyBundle<'_>,
            rb: &mut RecBundle,
        ) -> Result<Option<PalPtr>> {
            let mut val = [0u8; 8];
            LittleEndian::write_u64(&mut val, rb.rsize);
            tx.write(rec, 4 + kb.key.len(), &val);
            Ok(None)
        }

        fn rec_fetch(pal: &Pal, rec: PalPtr, rb: &mut RecBundle) {
            let len = LittleEndian::read_u32(pal.slice(rec, 4)) as u64;
            rb.key_ptr = rec.at(4);
            rb.key_len = len;
            rb.rsize = LittleEndian::read_u64(pal.slice(rec.at(4 + len as usize), 8));
        }

        fn rec_free(tx: &mut Tx<'_>, rec: PalPtr) {
            tx.free(rec);
        }
    }

    fn mktree(pal: &Pal) -> Tree<KvClass> {
        let root = pal.root(TREE_ROOT_SIZE).unwrap();
        Tree::open(pal, root)
    }

    fn put(tree: &Tree<KvClass>, key: &[u8], val: u64) {
        let pal = tree.pal().clone();
        let mut tx = pal.begin();
        let kb = KeyBundle::bytes(key);
        let mut rb = RecBundle {
            rsize: val,
            ..Default::default()
        };
        tree.update(&mut tx, &kb, &mut rb).unwrap();
        tx.commit();
    }

    fn get(tree: &Tree<KvClass>, key: &[u8]) -> Option<u64> {
        let mut rb = RecBundle::default();
        tree.lookup(&KeyBundle::bytes(key), &mut rb)
            .ok()
            .map(|_| rb.rsize)
    }

    #[test]
    fn insert_lookup_ordered() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let tree = mktree(&pal);
        for (k, v) in [(b"delta".as_ref(), 4u64), (b"alpha", 1), (b"charlie", 3), (b"bravo", 2)]
        {
            put(&tree, k, v);
        }
        assert_eq!(tree.count(), 4);
        assert_eq!(get(&tree, b"alpha"), Some(1));
        assert_eq!(get(&tree, b"delta"), Some(4));
        assert_eq!(get(&tree, b"echo"), None);

        // cursor walks lexicographically
        let mut cur = tree.cursor();
        cur.probe(Probe::First, &KeyBundle::default()).unwrap();
        let mut seen = Vec::new();
        loop {
            let mut rb = RecBundle::default();
            cur.fetch(&mut rb).unwrap();
            seen.push(pal.slice(rb.key_ptr, rb.key_len as usize).to_vec());
            if cur.next().is_err() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![b"alpha".to_vec(), b"bravo".to_vec(), b"charlie".to_vec(), b"delta".to_vec()]
        );
    }

    #[test]
    fn update_in_place() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let tree = mktree(&pal);
        put(&tree, b"key", 1);
        put(&tree, b"key", 9);
        assert_eq!(tree.count(), 1);
        assert_eq!(get(&tree, b"key"), Some(9));
    }

    #[test]
    fn probe_le_ge() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let tree = mktree(&pal);
        for k in [b"b".as_ref(), b"d", b"f"] {
            put(&tree, k, 0);
        }
        let mut rb = RecBundle::default();
        tree.probe_fetch(Probe::Le, &KeyBundle::bytes(b"e"), &mut rb)
            .unwrap();
        assert_eq!(pal.slice(rb.key_ptr, 1), b"d");
        tree.probe_fetch(Probe::Ge, &KeyBundle::bytes(b"e"), &mut rb)
            .unwrap();
        assert_eq!(pal.slice(rb.key_ptr, 1), b"f");
        assert_eq!(
            tree.probe_fetch(Probe::Le, &KeyBundle::bytes(b"a"), &mut rb),
            Err(Error::Nonexist)
        );
        assert_eq!(
            tree.probe_fetch(Probe::Ge, &KeyBundle::bytes(b"g"), &mut rb),
            Err(Error::Nonexist)
        );
    }

    #[test]
    fn grow_past_initial_capacity() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let tree = mktree(&pal);
        for i in 0..100u32 {
            put(&tree, format!("key-{i:03}").as_bytes(), i as u64);
        }
        assert_eq!(tree.count(), 100);
        for i in 0..100u32 {
            assert_eq!(get(&tree, format!("key-{i:03}").as_bytes()), Some(i as u64));
        }
    }

    #[test]
    fn anchor_survives_deletion() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let tree = mktree(&pal);
        for k in [b"a".as_ref(), b"b", b"c", b"d"] {
            put(&tree, k, 0);
        }
        let mut cur = tree.cursor();
        cur.probe(Probe::Ge, &KeyBundle::bytes(b"b")).unwrap();
        let anchor = cur.anchor().unwrap();

        // delete "b" underneath the anchor
        let mut tx = pal.begin();
        let mut doomed = tree.cursor();
        doomed.probe(Probe::Eq, &KeyBundle::bytes(b"b")).unwrap();
        doomed.delete(&mut tx).unwrap();
        tx.commit();

        let mut cur = tree.cursor();
        let exact = cur.probe_anchor(&anchor).unwrap();
        assert!(!exact, "anchored entry is gone");
        let mut rb = RecBundle::default();
        cur.fetch(&mut rb).unwrap();
        assert_eq!(pal.slice(rb.key_ptr, 1), b"c");
    }

    #[test]
    fn abort_leaves_tree_untouched() {
        let pal = Pal::open_anon(1 << 20).unwrap();
        let tree = mktree(&pal);
        put(&tree, b"stable", 7);
        {
            let mut tx = pal.begin();
            let kb = KeyBundle::bytes(b"doomed");
            let mut rb = RecBundle {
                rsize: 1,
                ..Default::default()
            };
            tree.update(&mut tx, &kb, &mut rb).unwrap();
            tx.abort();
        }
        assert_eq!(tree.count(), 1);
        assert_eq!(get(&tree, b"stable"), Some(7));
        assert_eq!(get(&tree, b"doomed"), None);
    }
}
