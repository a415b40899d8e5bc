//! Event queue scenarios, including concurrent producers.

use crossbeam_channel::bounded;
use epochstore::event::{
    eq_create, eq_destroy, eq_lib_fini, eq_lib_init, eq_poll, eq_query_count, event_abort,
    event_complete, event_error, event_fini, event_init, event_init_adv, event_launch, event_next,
    event_priv_get, event_priv_wait, event_is_priv, EqQuery, EvFlags, EvStatus,
};
use epochstore::event::event_status;
use epochstore::Error;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

struct Lib;

impl Lib {
    fn new() -> Lib {
        eq_lib_init().unwrap();
        Lib
    }
}

impl Drop for Lib {
    fn drop(&mut self) {
        let _ = eq_lib_fini();
    }
}

#[test]
fn launch_complete_poll() {
    let _lib = Lib::new();
    let eqh = eq_create().unwrap();
    let ev = event_init(eqh, None).unwrap();
    event_launch(&ev, None, Some(Box::new(|rc| rc))).unwrap();
    event_complete(&ev, 0).unwrap();

    let reaped = eq_poll(eqh, false, -1, 1).unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0], ev);
    assert_eq!(event_error(&ev).unwrap(), 0);

    event_fini(&ev).unwrap();
    eq_destroy(eqh, false).unwrap();
}

#[test]
fn composite_parent_reports_first_child_error() {
    let _lib = Lib::new();
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

    // the child list is walkable
    let first = event_next(&parent, None).unwrap().unwrap();
    let second = event_next(&parent, Some(&first)).unwrap().unwrap();
    assert_eq!(first, a);
    assert_eq!(second, b);
    assert_eq!(event_next(&parent, Some(&second)).unwrap(), None);

    event_launch(&a, None, None).unwrap();
    event_launch(&b, None, None).unwrap();
    event_launch(&parent, None, None).unwrap();

    event_complete(&b, -5).unwrap();
    event_complete(&a, 0).unwrap();

    let reaped = eq_poll(eqh, false, -1, 4).unwrap();
    assert_eq!(reaped, vec![parent.clone()]);
    assert_eq!(event_error(&parent).unwrap(), -5);

    event_fini(&a).unwrap();
    event_fini(&b).unwrap();
    event_fini(&parent).unwrap();
    eq_destroy(eqh, false).unwrap();
}

#[test]
fn parent_completion_runs_once_after_all_children() {
    let _lib = Lib::new();
    let eqh = eq_create().unwrap();
    let completions = Arc::new(AtomicU32::new(0));

    for n_children in 1..=4usize {
        let parent = event_init_adv(
            EvFlags {
                need_launch: true,
                no_poll: false,
            },
            eqh,
            None,
        )
        .unwrap();
        let children: Vec<_> = (0..n_children)
            .map(|_| event_init(eqh, Some(&parent)).unwrap())
            .collect();
        for child in &children {
            event_launch(child, None, None).unwrap();
        }
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

        for (i, child) in children.iter().enumerate() {
            // nothing completes before the last child
            assert_eq!(eq_query_count(eqh, EqQuery::Completed).unwrap(), 0);
            event_complete(child, i as i32).unwrap();
        }
        let reaped = eq_poll(eqh, false, -1, 8).unwrap();
        assert_eq!(reaped, vec![parent.clone()]);

        for child in &children {
            event_fini(child).unwrap();
        }
        event_fini(&parent).unwrap();
    }
    assert_eq!(completions.load(Ordering::SeqCst), 4);
    eq_destroy(eqh, false).unwrap();
}

#[test]
fn abort_twice_is_single_abort() {
    let _lib = Lib::new();
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
    event_abort(&ev).unwrap();
    assert_eq!(aborts.load(Ordering::SeqCst), 1);
    assert_eq!(event_status(&ev).unwrap(), EvStatus::Abort);

    let reaped = eq_poll(eqh, false, -1, 1).unwrap();
    assert_eq!(reaped, vec![ev.clone()]);
    event_fini(&ev).unwrap();
    eq_destroy(eqh, false).unwrap();
}

#[test]
fn poll_never_loses_events_across_producers() {
    let _lib = Lib::new();
    let eqh = eq_create().unwrap();
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 32;

    let (tx, rx) = bounded(PRODUCERS * PER_PRODUCER);
    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let code = (p * PER_PRODUCER + i) as i32 + 1;
                let ev = event_init(eqh, None).unwrap();
                event_launch(&ev, None, None).unwrap();
                tx.send(code).unwrap();
                event_complete(&ev, code).unwrap();
            }
        }));
    }
    drop(tx);

    let mut reaped_codes = Vec::new();
    while reaped_codes.len() < PRODUCERS * PER_PRODUCER {
        for ev in eq_poll(eqh, false, -1, 16).unwrap() {
            reaped_codes.push(event_error(&ev).unwrap());
            event_fini(&ev).unwrap();
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut expected: Vec<i32> = rx.iter().collect();
    expected.sort_unstable();
    reaped_codes.sort_unstable();
    assert_eq!(reaped_codes, expected);

    eq_destroy(eqh, false).unwrap();
}

#[test]
fn destroy_force_drains_everything() {
    let _lib = Lib::new();
    let eqh = eq_create().unwrap();

    // one inflight, one completed
    let inflight = event_init(eqh, None).unwrap();
    event_launch(&inflight, None, None).unwrap();
    let done = event_init(eqh, None).unwrap();
    event_launch(&done, None, None).unwrap();
    event_complete(&done, 0).unwrap();

    assert_eq!(eq_destroy(eqh, false), Err(Error::Busy));
    eq_destroy(eqh, true).unwrap();
    assert_eq!(eq_poll(eqh, false, 0, 1), Err(Error::Nonexist));
}

#[test]
fn timeout_poll_reports_zero_events() {
    let _lib = Lib::new();
    let eqh = eq_create().unwrap();
    let ev = event_init(eqh, None).unwrap();
    event_launch(&ev, None, None).unwrap();

    // nothing completes within the deadline
    let reaped = eq_poll(eqh, false, 5_000, 1).unwrap();
    assert!(reaped.is_empty());

    event_complete(&ev, 0).unwrap();
    eq_poll(eqh, false, -1, 1).unwrap();
    event_fini(&ev).unwrap();
    eq_destroy(eqh, false).unwrap();
}

#[test]
fn thread_private_event_waits_synchronously() {
    let _lib = Lib::new();
    let ev = event_priv_get().unwrap();
    assert!(event_is_priv(&ev));

    event_launch(&ev, None, None).unwrap();
    let waiter = ev.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        event_complete(&waiter, -3).unwrap();
    });
    assert_eq!(event_priv_wait().unwrap(), -3);
    handle.join().unwrap();
}
