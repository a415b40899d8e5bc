//! Asynchronous event queue.
//!
//! An event queue tracks client operations from dispatch to completion.
//! Events compose one level deep: a parent completes exactly once, after
//! every child has completed, inheriting the first non-zero child error.
//! Every mutation of the dispatch list, completion list, counters and flags
//! happens under the queue mutex; completion callbacks of pollable events
//! run while it is held, internal (`no_poll`) callbacks and the parent
//! completions they trigger are deferred until after unlock.
//!
//! Queues live behind cookie handles in a process-wide table created by
//! [`eq_lib_init`]; all queues share one transport context.

mod transport;

pub use transport::{LocalTransport, Transport};

use crate::{
    error::{Error, Result},
    hhash::{HandleTable, HandleType},
    ilist::{Link, LinkArena, ListHead},
};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Opaque event-queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EqHandle(pub u64);

/// Event life cycle. Reaping a completed or aborted event returns it to
/// `Init`, ready for another launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvStatus {
    Init,
    Dispatch,
    Completed,
    Abort,
}

/// Composition flags, the advanced-init surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvFlags {
    /// The event is a composite whose launch is explicit even after its
    /// children have started.
    pub need_launch: bool,
    /// The event is internal: completion returns it to `Init` without
    /// entering the completion list, and its callback runs after the queue
    /// lock is dropped.
    pub no_poll: bool,
}

/// Completion callback; receives the completion code and may transform it.
pub type CompCb = Box<dyn FnOnce(i32) -> i32 + Send>;
/// Abort callback.
pub type AbortCb = Box<dyn FnOnce() + Send>;

/// Query selector for [`eq_query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqQuery {
    Completed,
    Dispatch,
    All,
}

impl EqQuery {
    fn completed(self) -> bool {
        matches!(self, EqQuery::Completed | EqQuery::All)
    }

    fn dispatch(self) -> bool {
        matches!(self, EqQuery::Dispatch | EqQuery::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EvId {
    slot: u32,
    gen: u32,
}

/// A handle to one event. Cheap to clone; clones compare equal and refer to
/// the same slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    eq: EqHandle,
    id: EvId,
}

impl Event {
    pub fn eq(&self) -> EqHandle {
        self.eq
    }
}

struct EvState {
    status: EvStatus,
    flags: EvFlags,
    parent: Option<u32>,
    children: ListHead,
    link: Link,
    n_child: u32,
    n_child_if: u32,
    n_child_comp: u32,
    error: i32,
    comp_cb: Option<CompCb>,
    abort_cb: Option<AbortCb>,
    on_comp: bool,
    is_priv: bool,
}

impl EvState {
    fn new(idx: u32, flags: EvFlags) -> EvState {
        EvState {
            status: EvStatus::Init,
            flags,
            parent: None,
            children: ListHead::new(),
            link: Link::unlinked(idx),
            // a composite that must be launched explicitly carries a launch
            // guard, accounted as one pre-dispatched child until the launch
            // releases it
            n_child: u32::from(flags.need_launch),
            n_child_if: u32::from(flags.need_launch),
            n_child_comp: 0,
            error: 0,
            comp_cb: None,
            abort_cb: None,
            on_comp: false,
            is_priv: false,
        }
    }
}

struct EvSlot {
    gen: u32,
    state: Option<EvState>,
}

impl LinkArena for Vec<EvSlot> {
    fn link(&self, idx: u32) -> Link {
        self[idx as usize]
            .state
            .as_ref()
            .expect("linked slot is live")
            .link
    }

    fn link_mut(&mut self, idx: u32) -> &mut Link {
        &mut self[idx as usize]
            .state
            .as_mut()
            .expect("linked slot is live")
            .link
    }
}

struct EqState {
    slots: Vec<EvSlot>,
    free: Vec<u32>,
    disp: ListHead,
    comp: ListHead,
    n_disp: u32,
    n_comp: u32,
    finalizing: bool,
}

impl EqState {
    fn new() -> EqState {
        EqState {
            slots: Vec::new(),
            free: Vec::new(),
            disp: ListHead::new(),
            comp: ListHead::new(),
            n_disp: 0,
            n_comp: 0,
            finalizing: false,
        }
    }

    fn get(&self, id: EvId) -> Result<&EvState> {
        let slot = self.slots.get(id.slot as usize).ok_or(Error::NoHdl)?;
        if slot.gen != id.gen {
            return Err(Error::NoHdl);
        }
        slot.state.as_ref().ok_or(Error::NoHdl)
    }

    fn get_mut(&mut self, id: EvId) -> Result<&mut EvState> {
        let slot = self.slots.get_mut(id.slot as usize).ok_or(Error::NoHdl)?;
        if slot.gen != id.gen {
            return Err(Error::NoHdl);
        }
        slot.state.as_mut().ok_or(Error::NoHdl)
    }

    fn ev(&self, idx: u32) -> &EvState {
        self.slots[idx as usize]
            .state
            .as_ref()
            .expect("live event slot")
    }

    fn ev_mut(&mut self, idx: u32) -> &mut EvState {
        self.slots[idx as usize]
            .state
            .as_mut()
            .expect("live event slot")
    }

    fn id_of(&self, idx: u32) -> EvId {
        EvId {
            slot: idx,
            gen: self.slots[idx as usize].gen,
        }
    }

    fn alloc(&mut self, flags: EvFlags) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].state = Some(EvState::new(idx, flags));
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(EvSlot {
                    gen: 0,
                    state: Some(EvState::new(idx, flags)),
                });
                idx
            }
        }
    }

    fn free_slot(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.state = None;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(idx);
    }
}

pub(crate) struct EqInner {
    lock: Mutex<EqState>,
    ctx: Arc<dyn Transport>,
    cookie: AtomicU64,
}

impl Drop for EqInner {
    fn drop(&mut self) {
        log::trace!(
            "event queue {:#x} released",
            self.cookie.load(Ordering::Relaxed)
        );
    }
}

#[derive(Default)]
struct EqLib {
    refcount: u32,
    table: Option<Arc<HandleTable<EqInner>>>,
    ctx: Option<Arc<dyn Transport>>,
}

lazy_static! {
    static ref EQ_LIB: Mutex<EqLib> = Mutex::new(EqLib::default());
}

thread_local! {
    static TH_PRIV: RefCell<Option<Event>> = RefCell::new(None);
}

/// Initialise the event library. Refcounted: every init needs a matching
/// [`eq_lib_fini`]; all initialisations share one transport context.
pub fn eq_lib_init() -> Result<()> {
    let mut lib = EQ_LIB.lock();
    if lib.refcount > 0 {
        lib.refcount += 1;
        return Ok(());
    }
    lib.table = Some(Arc::new(HandleTable::new(HandleType::Eq)));
    lib.ctx = Some(Arc::new(LocalTransport::new()));
    lib.refcount = 1;
    Ok(())
}

pub fn eq_lib_fini() -> Result<()> {
    let mut lib = EQ_LIB.lock();
    if lib.refcount == 0 {
        return Err(Error::Uninit);
    }
    lib.refcount -= 1;
    if lib.refcount == 0 {
        lib.table = None;
        lib.ctx = None;
    }
    Ok(())
}

fn lib_parts() -> Result<(Arc<HandleTable<EqInner>>, Arc<dyn Transport>)> {
    let lib = EQ_LIB.lock();
    match (&lib.table, &lib.ctx) {
        (Some(table), Some(ctx)) => Ok((Arc::clone(table), Arc::clone(ctx))),
        _ => Err(Error::Uninit),
    }
}

fn eq_lookup(eqh: EqHandle) -> Result<Arc<EqInner>> {
    let (table, _) = lib_parts()?;
    table.lookup(eqh.0).ok_or(Error::Nonexist)
}

/// Create an event queue and return its handle.
pub fn eq_create() -> Result<EqHandle> {
    let (table, ctx) = lib_parts()?;
    let eqx = Arc::new(EqInner {
        lock: Mutex::new(EqState::new()),
        ctx,
        cookie: AtomicU64::new(0),
    });
    let cookie = table.insert(Arc::clone(&eqx));
    eqx.cookie.store(cookie, Ordering::Relaxed);
    log::debug!("created event queue {:#x}", cookie);
    Ok(EqHandle(cookie))
}

struct Deferred {
    cb: CompCb,
    error: i32,
}

/// Run the callbacks of internal events outside the lock. A child's
/// callback runs before its parent's and passes its error along the chain.
fn run_deferred(deferred: Vec<Deferred>) {
    let mut err = 0;
    for d in deferred {
        if d.error != 0 {
            err = d.error;
        }
        let rc = (d.cb)(err);
        if err == 0 {
            err = rc;
        }
    }
}

/// Complete one event: status, callback disposition, error. Returns the
/// (possibly callback-transformed) completion code. `preserve_error` keeps
/// an earlier recorded error in place, the parent-completion rule.
fn complete_one(
    st: &mut EqState,
    idx: u32,
    mut rc: i32,
    preserve_error: bool,
    deferred: &mut Vec<Deferred>,
) -> i32 {
    let ev = st.ev_mut(idx);
    let no_poll = ev.flags.no_poll;
    ev.status = if no_poll {
        EvStatus::Init
    } else {
        EvStatus::Completed
    };
    let cb = ev.comp_cb.take();
    match cb {
        Some(cb) if no_poll => {
            if !preserve_error || ev.error == 0 {
                ev.error = rc;
            }
            deferred.push(Deferred { cb, error: ev.error });
        }
        Some(cb) => {
            rc = cb(rc);
            if !preserve_error || ev.error == 0 {
                ev.error = rc;
            }
        }
        None => {
            if !preserve_error || ev.error == 0 {
                ev.error = rc;
            }
        }
    }
    rc
}

/// List and counter bookkeeping for a top-level event that just finished.
fn finish_top(st: &mut EqState, idx: u32) {
    let (no_poll, on_comp) = {
        let ev = st.ev(idx);
        (ev.flags.no_poll, ev.on_comp)
    };
    if no_poll {
        // internal events never enter the completion list; an abort may
        // have parked the event there in the meantime, take it back out
        if on_comp {
            st.comp.remove(&mut st.slots, idx);
            st.ev_mut(idx).on_comp = false;
            debug_assert!(st.n_comp > 0);
            st.n_comp -= 1;
        } else if st.slots.link(idx).is_linked(idx) {
            st.disp.remove(&mut st.slots, idx);
            debug_assert!(st.n_disp > 0);
            st.n_disp -= 1;
        }
        return;
    }
    if on_comp {
        // aborted earlier; it already sits on the completion list
        return;
    }
    st.disp.remove(&mut st.slots, idx);
    st.comp.push_back(&mut st.slots, idx);
    st.ev_mut(idx).on_comp = true;
    debug_assert!(st.n_disp > 0);
    st.n_disp -= 1;
    st.n_comp += 1;
}

/// Account one completed child (or the launch guard) on `parent`. Returns
/// true when this was the last outstanding child and the parent completed.
fn propagate_to_parent(
    st: &mut EqState,
    parent: u32,
    rc: i32,
    deferred: &mut Vec<Deferred>,
) -> bool {
    {
        let pev = st.ev_mut(parent);
        debug_assert!(pev.n_child_if > 0);
        pev.n_child_if -= 1;
        debug_assert!(pev.n_child_comp < pev.n_child);
        pev.n_child_comp += 1;
        if pev.n_child_comp < pev.n_child {
            if pev.error == 0 {
                pev.error = rc;
            }
            return false;
        }
    }
    complete_one(st, parent, rc, true, deferred);
    true
}

fn complete_locked(st: &mut EqState, idx: u32, rc: i32, deferred: &mut Vec<Deferred>) {
    let rc = complete_one(st, idx, rc, false, deferred);
    match st.ev(idx).parent {
        None => finish_top(st, idx),
        Some(parent) => {
            if propagate_to_parent(st, parent, rc, deferred) {
                finish_top(st, parent);
            }
        }
    }
}

fn launch_locked(st: &mut EqState, idx: u32) {
    st.ev_mut(idx).status = EvStatus::Dispatch;
    let parent = st.ev(idx).parent;
    let top = match parent {
        None => idx,
        Some(p) => {
            st.ev_mut(p).n_child_if += 1;
            // parent already on the dispatch list?
            if st.slots.link(p).is_linked(p) {
                return;
            }
            // explicit composites wait for their own launch call
            if st.ev(p).flags.need_launch {
                return;
            }
            debug_assert_eq!(st.ev(p).n_child_if, 1);
            st.ev_mut(p).status = EvStatus::Dispatch;
            p
        }
    };
    st.disp.push_back(&mut st.slots, top);
    st.n_disp += 1;
}

/// Initialise an event on `eq`, optionally composed under `parent` (which
/// must itself be idle and must not be a child). The advanced form accepts
/// composition flags.
pub fn event_init_adv(flags: EvFlags, eq: EqHandle, parent: Option<&Event>) -> Result<Event> {
    let eqh = match parent {
        Some(p) => p.eq,
        None => eq,
    };
    let eqx = eq_lookup(eqh)?;
    let mut st = eqx.lock.lock();

    if let Some(p) = parent {
        let pst = st.get(p.id)?;
        if pst.status != EvStatus::Init {
            log::error!("parent event is not idle: {:?}", pst.status);
            return Err(Error::Inval);
        }
        if pst.parent.is_some() {
            log::error!("can't nest events");
            return Err(Error::NoPerm);
        }
    }

    let idx = st.alloc(flags);
    if let Some(p) = parent {
        let st = &mut *st;
        st.ev_mut(p.id.slot).n_child += 1;
        // children reuse the queue link; a child is never on the queue lists
        let mut head = st.ev(p.id.slot).children;
        head.push_back(&mut st.slots, idx);
        st.ev_mut(p.id.slot).children = head;
        st.ev_mut(idx).parent = Some(p.id.slot);
    }

    let id = st.id_of(idx);
    Ok(Event { eq: eqh, id })
}

/// Initialise a plain event.
pub fn event_init(eq: EqHandle, parent: Option<&Event>) -> Result<Event> {
    event_init_adv(EvFlags::default(), eq, parent)
}

/// Release an event. Children must not be inflight; a finalised child is
/// unaccounted from its parent.
pub fn event_fini(ev: &Event) -> Result<()> {
    let eqx = eq_lookup(ev.eq)?;
    let mut st = eqx.lock.lock();
    let (status, parent, on_comp) = {
        let evst = st.get(ev.id)?;
        (evst.status, evst.parent, evst.on_comp)
    };

    if let Some(p) = parent {
        if !st.slots.link(ev.id.slot).is_linked(ev.id.slot) {
            log::error!("event not linked to its parent");
            return Err(Error::Inval);
        }
        if st.ev(p).status != EvStatus::Init {
            log::error!("parent event is not idle: {:?}", st.ev(p).status);
            return Err(Error::Inval);
        }
        let st = &mut *st;
        let mut head = st.ev(p).children;
        head.remove(&mut st.slots, ev.id.slot);
        st.ev_mut(p).children = head;
        let pev = st.ev_mut(p);
        pev.n_child -= 1;
        match status {
            EvStatus::Completed => pev.n_child_comp -= 1,
            EvStatus::Abort | EvStatus::Dispatch => pev.n_child_if -= 1,
            EvStatus::Init => {}
        }
        st.free_slot(ev.id.slot);
        return Ok(());
    }

    // validate the children before touching anything
    let children = st.ev(ev.id.slot).children.collect(&st.slots);
    for &child in &children {
        if st.ev(child).status == EvStatus::Dispatch {
            log::error!("child event inflight");
            return Err(Error::Inval);
        }
    }
    {
        let st = &mut *st;
        let mut head = st.ev(ev.id.slot).children;
        for child in children {
            head.remove(&mut st.slots, child);
            let cev = st.ev_mut(child);
            cev.status = EvStatus::Init;
            cev.parent = None;
        }
        st.ev_mut(ev.id.slot).children = head;
    }

    if st.slots.link(ev.id.slot).is_linked(ev.id.slot) {
        let st = &mut *st;
        match status {
            EvStatus::Dispatch => {
                st.disp.remove(&mut st.slots, ev.id.slot);
                st.n_disp -= 1;
            }
            _ if on_comp => {
                st.comp.remove(&mut st.slots, ev.id.slot);
                st.n_comp -= 1;
            }
            _ => {}
        }
    }
    st.free_slot(ev.id.slot);
    Ok(())
}

/// Launch an event: `Init` to `Dispatch`, callbacks armed. All children of
/// a composite must be launched before the composite itself; launching a
/// composite with running children requires the `need_launch` flag from
/// init time.
pub fn event_launch(
    ev: &Event,
    abort_cb: Option<AbortCb>,
    comp_cb: Option<CompCb>,
) -> Result<()> {
    let eqx = eq_lookup(ev.eq)?;
    let mut deferred = Vec::new();
    let mut kick = false;
    {
        let mut st = eqx.lock.lock();
        if st.finalizing {
            log::error!("event queue is finalizing");
            return Err(Error::Nonexist);
        }
        let evst = st.get(ev.id)?;
        if evst.status != EvStatus::Init {
            log::error!("event status should be idle: {:?}", evst.status);
            return Err(Error::NoPerm);
        }
        if !evst.flags.need_launch && !evst.children.is_empty() {
            log::error!("explicit launch of an implicit composite");
            return Err(Error::NoPerm);
        }
        if evst.n_child > evst.n_child_if + evst.n_child_comp {
            log::error!("launch all children before launching the parent");
            return Err(Error::NoPerm);
        }
        {
            let evst = st.get_mut(ev.id)?;
            evst.abort_cb = abort_cb;
            evst.comp_cb = comp_cb;
        }
        launch_locked(&mut st, ev.id.slot);

        let evst = st.ev(ev.id.slot);
        if evst.flags.need_launch && evst.n_child > 1 {
            // the composite has real children; release the launch guard so
            // it can complete once they all have
            log::trace!(
                "nchild {} child_if {} child_comp {}",
                evst.n_child,
                evst.n_child_if,
                evst.n_child_comp
            );
            if propagate_to_parent(&mut st, ev.id.slot, 0, &mut deferred) {
                finish_top(&mut st, ev.id.slot);
                kick = true;
            }
        }
    }
    run_deferred(deferred);
    if kick {
        eqx.ctx.kick();
    }
    Ok(())
}

/// Post a completion for a dispatched (or aborted) event, from the
/// transport callback or the operation itself.
pub fn event_complete(ev: &Event, rc: i32) -> Result<()> {
    let eqx = eq_lookup(ev.eq)?;
    let mut deferred = Vec::new();
    {
        let mut st = eqx.lock.lock();
        let evst = st.get(ev.id)?;
        debug_assert!(
            evst.status == EvStatus::Dispatch || evst.status == EvStatus::Abort,
            "completion of an idle event"
        );
        complete_locked(&mut st, ev.id.slot, rc, &mut deferred);
    }
    run_deferred(deferred);
    eqx.ctx.kick();
    Ok(())
}

fn abort_one(st: &mut EqState, idx: u32) {
    if st.ev(idx).status != EvStatus::Dispatch {
        return;
    }
    // the error is recorded by the eventual completion, so an operation
    // that finished while being aborted keeps its own result
    st.ev_mut(idx).status = EvStatus::Abort;
    if let Some(cb) = st.ev_mut(idx).abort_cb.take() {
        cb();
    }
}

fn abort_locked(st: &mut EqState, idx: u32) {
    abort_one(st, idx);
    for child in st.ev(idx).children.collect(&st.slots) {
        abort_one(st, child);
    }
    // a top-level aborted event moves to the front of the completion list
    // so it is reaped ahead of fresh completions
    if st.ev(idx).parent.is_none() && !st.ev(idx).on_comp {
        st.disp.remove(&mut st.slots, idx);
        st.comp.push_front(&mut st.slots, idx);
        st.ev_mut(idx).on_comp = true;
        debug_assert!(st.n_disp > 0);
        st.n_disp -= 1;
        st.n_comp += 1;
    }
}

/// Abort a dispatched event and its children. Idempotent: aborting an
/// event that is not inflight is a no-op.
pub fn event_abort(ev: &Event) -> Result<()> {
    let eqx = eq_lookup(ev.eq)?;
    {
        let mut st = eqx.lock.lock();
        if st.get(ev.id)?.status != EvStatus::Dispatch {
            return Ok(());
        }
        abort_locked(&mut st, ev.id.slot);
    }
    eqx.ctx.kick();
    Ok(())
}

/// Walk a composite's children: `None` starts at the first, passing the
/// previous child yields the one after it.
pub fn event_next(parent: &Event, prev: Option<&Event>) -> Result<Option<Event>> {
    let eqx = eq_lookup(parent.eq)?;
    let st = eqx.lock.lock();
    st.get(parent.id)?;
    let children = st.ev(parent.id.slot).children;
    let next = match prev {
        None => children.front(),
        Some(c) => {
            st.get(c.id)?;
            children.next_of(&st.slots, c.id.slot)
        }
    };
    Ok(next.map(|idx| Event {
        eq: parent.eq,
        id: st.id_of(idx),
    }))
}

/// The recorded completion code of an event.
pub fn event_error(ev: &Event) -> Result<i32> {
    let eqx = eq_lookup(ev.eq)?;
    let st = eqx.lock.lock();
    Ok(st.get(ev.id)?.error)
}

/// Current state of an event.
pub fn event_status(ev: &Event) -> Result<EvStatus> {
    let eqx = eq_lookup(ev.eq)?;
    let st = eqx.lock.lock();
    Ok(st.get(ev.id)?.status)
}

/// Reap up to `n_events` completed events, blocking up to `timeout_us`
/// microseconds inside the transport progress loop (`-1` blocks
/// indefinitely). With `wait_inf`, the call returns early instead of
/// blocking when nothing is inflight. A timeout is not an error: the call
/// reports however many events were reaped.
pub fn eq_poll(
    eqh: EqHandle,
    wait_inf: bool,
    timeout_us: i64,
    n_events: usize,
) -> Result<Vec<Event>> {
    if n_events == 0 {
        return Err(Error::Inval);
    }
    let eqx = eq_lookup(eqh)?;
    let mut out: Vec<Event> = Vec::new();

    let res = eqx.ctx.progress(timeout_us, &mut || {
        let mut st = eqx.lock.lock();
        let st = &mut *st;
        while out.len() < n_events {
            let idx = match st.comp.front() {
                None => break,
                Some(idx) => idx,
            };
            debug_assert!(st.n_comp > 0);
            st.comp.remove(&mut st.slots, idx);
            st.n_comp -= 1;
            let id = st.id_of(idx);
            let ev = st.ev_mut(idx);
            debug_assert!(ev.status == EvStatus::Completed || ev.status == EvStatus::Abort);
            ev.status = EvStatus::Init;
            ev.on_comp = false;
            out.push(Event { eq: eqh, id });
        }
        // completions stop the progress loop
        if !out.is_empty() {
            return 1;
        }
        if st.finalizing {
            // no new completion can appear
            debug_assert!(st.disp.is_empty());
            return Error::Nonexist.code();
        }
        if wait_inf && st.disp.is_empty() {
            return 1;
        }
        0
    });

    match res {
        Ok(()) => Ok(out),
        Err(Error::Timedout) => Ok(out),
        Err(err) => {
            log::error!("transport progress failed: {:?}", err);
            Err(err)
        }
    }
}

/// Count dispatched and/or completed events without blocking.
pub fn eq_query_count(eqh: EqHandle, query: EqQuery) -> Result<usize> {
    let eqx = eq_lookup(eqh)?;
    let st = eqx.lock.lock();
    let mut count = 0;
    if query.completed() {
        count += st.n_comp as usize;
    }
    if query.dispatch() {
        count += st.n_disp as usize;
    }
    Ok(count)
}

/// Snapshot up to `n_events` events from the completion and/or dispatch
/// lists without reaping them.
pub fn eq_query(eqh: EqHandle, query: EqQuery, n_events: usize) -> Result<Vec<Event>> {
    let eqx = eq_lookup(eqh)?;
    let st = eqx.lock.lock();
    let mut out = Vec::new();
    let mut push_list = |list: &ListHead, out: &mut Vec<Event>| {
        for idx in list.collect(&st.slots) {
            if out.len() == n_events {
                break;
            }
            out.push(Event {
                eq: eqh,
                id: st.id_of(idx),
            });
        }
    };
    if query.completed() {
        push_list(&st.comp, &mut out);
    }
    if query.dispatch() && out.len() < n_events {
        push_list(&st.disp, &mut out);
    }
    Ok(out)
}

/// Tear an event queue down. Without `force`, queued work turns the call
/// into `Busy`; with `force`, inflight events are aborted and completed
/// ones dropped. Either way the handle leaves the table.
pub fn eq_destroy(eqh: EqHandle, force: bool) -> Result<()> {
    let (table, _) = lib_parts()?;
    let eqx = table.lookup(eqh.0).ok_or(Error::Nonexist)?;
    {
        let mut st = eqx.lock.lock();
        if st.finalizing {
            return Err(Error::Nonexist);
        }
        if !force && (!st.disp.is_empty() || !st.comp.is_empty()) {
            return Err(Error::Busy);
        }
        // no new launches from here on
        st.finalizing = true;

        for idx in st.disp.collect(&st.slots) {
            debug_assert!(st.ev(idx).parent.is_none());
            abort_locked(&mut st, idx);
        }
        debug_assert!(st.disp.is_empty());

        let st = &mut *st;
        for idx in st.comp.collect(&st.slots) {
            st.comp.remove(&mut st.slots, idx);
            st.n_comp -= 1;
            st.ev_mut(idx).on_comp = false;
        }
    }
    table.delete(eqh.0);
    eqx.ctx.kick();
    Ok(())
}

/// The calling thread's private event, created with its private queue on
/// first use. The pair gives blocking callers a synchronous surface over
/// the asynchronous machinery.
pub fn event_priv_get() -> Result<Event> {
    TH_PRIV.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(ev) = slot.as_ref() {
            return Ok(ev.clone());
        }
        let eqh = eq_create()?;
        let ev = event_init(eqh, None)?;
        {
            let eqx = eq_lookup(eqh)?;
            let mut st = eqx.lock.lock();
            st.get_mut(ev.id)?.is_priv = true;
        }
        *slot = Some(ev.clone());
        Ok(ev)
    })
}

/// Whether `ev` is the calling context's private event.
pub fn event_is_priv(ev: &Event) -> bool {
    let eqx = match eq_lookup(ev.eq) {
        Ok(eqx) => eqx,
        Err(_) => return false,
    };
    let st = eqx.lock.lock();
    st.get(ev.id).map(|e| e.is_priv).unwrap_or(false)
}

/// Block on the thread-private queue until the private event completes and
/// return its error code.
pub fn event_priv_wait() -> Result<i32> {
    let ev = TH_PRIV
        .with(|cell| cell.borrow().clone())
        .ok_or(Error::Uninit)?;
    eq_poll(ev.eq, true, -1, 1)?;
    event_error(&ev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct LibGuard;

    impl LibGuard {
        fn new() -> LibGuard {
            eq_lib_init().unwrap();
            LibGuard
        }
    }

    impl Drop for LibGuard {
        fn drop(&mut self) {
            let _ = eq_lib_fini();
        }
    }

    #[test]
    fn single_event_round_trip() {
        let _lib = LibGuard::new();
        let eqh = eq_create().unwrap();
        let ev = event_init(eqh, None).unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&fired);
        event_launch(
            &ev,
            None,
            Some(Box::new(move |rc| {
                count.fetch_add(1, Ordering::SeqCst);
                rc
            })),
        )
        .unwrap();
        assert_eq!(event_status(&ev).unwrap(), EvStatus::Dispatch);

        event_complete(&ev, 0).unwrap();
        let reaped = eq_poll(eqh, false, -1, 4).unwrap();
        assert_eq!(reaped, vec![ev.clone()]);
        assert_eq!(event_error(&ev).unwrap(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(event_status(&ev).unwrap(), EvStatus::Init);

        event_fini(&ev).unwrap();
        eq_destroy(eqh, false).unwrap();
    }

    #[test]
    fn composite_completes_once_with_first_child_error() {
        let _lib = LibGuard::new();
        let eqh = eq_create().unwrap();
        let parent = event_init_adv(
            EvFlags {
                need_launch: true,
                no_poll: false,
            },
            eqh,
            None,
        )
        .unwrap();
        let a = event_init(eqh, Some(&parent)).unwrap();
        let b = event_init(eqh, Some(&parent)).unwrap();

        event_launch(&a, None, None).unwrap();
        event_launch(&b, None, None).unwrap();
        let completions = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&completions);
        event_launch(
            &parent,
            None,
            Some(Box::new(move |rc| {
                count.fetch_add(1, Ordering::SeqCst);
                rc
            })),
        )
        .unwrap();

        // nothing to reap yet
        assert_eq!(eq_poll(eqh, true, 0, 4).unwrap(), vec![]);

        event_complete(&b, -5).unwrap();
        assert_eq!(eq_poll(eqh, true, 0, 4).unwrap(), vec![]);

        event_complete(&a, 0).unwrap();
        let reaped = eq_poll(eqh, false, -1, 4).unwrap();
        assert_eq!(reaped, vec![parent.clone()]);
        assert_eq!(event_error(&parent).unwrap(), -5);
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        event_fini(&a).unwrap();
        event_fini(&b).unwrap();
        event_fini(&parent).unwrap();
        eq_destroy(eqh, false).unwrap();
    }

    #[test]
    fn launch_rules() {
        let _lib = LibGuard::new();
        let eqh = eq_create().unwrap();
        let parent = event_init(eqh, None).unwrap();
        let child = event_init(eqh, Some(&parent)).unwrap();

        // implicit composite can't be launched explicitly
        assert_eq!(event_launch(&parent, None, None), Err(Error::NoPerm));

        // child first, then the parent completes with it
        event_launch(&child, None, None).unwrap();
        assert_eq!(event_status(&parent).unwrap(), EvStatus::Dispatch);
        event_complete(&child, 0).unwrap();
        let reaped = eq_poll(eqh, false, -1, 2).unwrap();
        assert_eq!(reaped, vec![parent.clone()]);

        // double launch of a dispatched event is refused
        let solo = event_init(eqh, None).unwrap();
        event_launch(&solo, None, None).unwrap();
        assert_eq!(event_launch(&solo, None, None), Err(Error::NoPerm));
        event_complete(&solo, 0).unwrap();
        eq_poll(eqh, false, -1, 2).unwrap();

        event_fini(&child).unwrap();
        event_fini(&parent).unwrap();
        event_fini(&solo).unwrap();
        eq_destroy(eqh, false).unwrap();
    }

    #[test]
    fn abort_is_idempotent_and_runs_cb_once() {
        let _lib = LibGuard::new();
        let eqh = eq_create().unwrap();
        let ev = event_init(eqh, None).unwrap();
        let aborts = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&aborts);
        event_launch(
            &ev,
            Some(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

        event_abort(&ev).unwrap();
        let status_once = event_status(&ev).unwrap();
        event_abort(&ev).unwrap();
        assert_eq!(event_status(&ev).unwrap(), status_once);
        assert_eq!(status_once, EvStatus::Abort);
        assert_eq!(aborts.load(Ordering::SeqCst), 1);

        // the aborted event is reaped ahead of fresh completions
        let other = event_init(eqh, None).unwrap();
        event_launch(&other, None, None).unwrap();
        event_complete(&other, 0).unwrap();
        let reaped = eq_poll(eqh, false, -1, 1).unwrap();
        assert_eq!(reaped, vec![ev.clone()]);

        eq_poll(eqh, false, -1, 1).unwrap();
        event_fini(&other).unwrap();
        event_fini(&ev).unwrap();
        eq_destroy(eqh, false).unwrap();
    }

    #[test]
    fn no_poll_event_never_enters_completion_list() {
        let _lib = LibGuard::new();
        let eqh = eq_create().unwrap();
        let ev = event_init_adv(
            EvFlags {
                need_launch: false,
                no_poll: true,
            },
            eqh,
            None,
        )
        .unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&fired);
        event_launch(
            &ev,
            None,
            Some(Box::new(move |rc| {
                count.fetch_add(1, Ordering::SeqCst);
                rc
            })),
        )
        .unwrap();
        event_complete(&ev, 0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(event_status(&ev).unwrap(), EvStatus::Init);
        assert_eq!(eq_query_count(eqh, EqQuery::All).unwrap(), 0);
        assert_eq!(eq_poll(eqh, true, 0, 1).unwrap(), vec![]);

        event_fini(&ev).unwrap();
        eq_destroy(eqh, false).unwrap();
    }

    #[test]
    fn query_counts_both_lists() {
        let _lib = LibGuard::new();
        let eqh = eq_create().unwrap();
        let a = event_init(eqh, None).unwrap();
        let b = event_init(eqh, None).unwrap();
        event_launch(&a, None, None).unwrap();
        event_launch(&b, None, None).unwrap();
        assert_eq!(eq_query_count(eqh, EqQuery::Dispatch).unwrap(), 2);

        event_complete(&a, 0).unwrap();
        assert_eq!(eq_query_count(eqh, EqQuery::Dispatch).unwrap(), 1);
        assert_eq!(eq_query_count(eqh, EqQuery::Completed).unwrap(), 1);
        assert_eq!(eq_query(eqh, EqQuery::All, 8).unwrap().len(), 2);

        eq_destroy(eqh, true).unwrap();
    }

    #[test]
    fn destroy_without_force_is_busy_then_force_drains() {
        let _lib = LibGuard::new();
        let eqh = eq_create().unwrap();
        let ev = event_init(eqh, None).unwrap();
        let aborted = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&aborted);
        event_launch(
            &ev,
            Some(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

        assert_eq!(eq_destroy(eqh, false), Err(Error::Busy));
        eq_destroy(eqh, true).unwrap();
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert_eq!(eq_lookup(eqh).err(), Some(Error::Nonexist));
    }

    #[test]
    fn priv_event_is_identifiable_and_waitable() {
        let _lib = LibGuard::new();
        let ev = event_priv_get().unwrap();
        let again = event_priv_get().unwrap();
        assert_eq!(ev, again);
        assert!(event_is_priv(&ev));

        let plain_eq = eq_create().unwrap();
        let plain = event_init(plain_eq, None).unwrap();
        assert!(!event_is_priv(&plain));

        event_launch(&ev, None, None).unwrap();
        event_complete(&ev, -7).unwrap();
        assert_eq!(event_priv_wait().unwrap(), -7);

        event_fini(&plain).unwrap();
        eq_destroy(plain_eq, false).unwrap();
    }
}
