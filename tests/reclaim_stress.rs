//! Concurrent reads racing release and reclamation.
//!
//! The memory backend flags any buffer disposed while a read is in flight. Every test here ends
//! by asserting that it flagged nothing.

mod common;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Barrier,
    },
    thread,
};

use common::*;
use lbug::{Error, HandleState, ReclaimMode, ReleaseOutcome};
use proptest::prelude::*;

const READERS: usize = 20;

/// Readers each open their own result and read all of it while another thread keeps collecting.
fn fresh_results_under_reclaim(mode: ReclaimMode) {
    init_tracing();
    let conn = edge_connection(mode);
    let counters = conn.backend().counters();
    let rows = AtomicU64::new(0);
    let errors = AtomicU64::new(0);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                conn.reclaimer().collect();
                thread::yield_now();
            }
        });

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let conn = conn.clone();
                let (rows, errors) = (&rows, &errors);
                s.spawn(move || {
                    let result = match conn.query(EDGE_QUERY) {
                        Ok(r) => r,
                        Err(_) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    };
                    let outcome = result.for_each_row(|row| {
                        let values = row.values()?;
                        for (col, v) in values.iter().enumerate() {
                            assert_eq!(*v, edge_value(row.index() as usize, col));
                        }
                        rows.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    });
                    if outcome.is_err() {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for r in readers {
            r.join().expect("reader panicked");
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(rows.load(Ordering::Relaxed), (READERS * EDGE_ROWS) as u64);
    assert_eq!(errors.load(Ordering::Relaxed), 0);

    // Dropping the last connection stops the reaper and drains the queue.
    drop(conn);
    let stats = counters.snapshot();
    assert_eq!(stats.violations, 0);
    assert_eq!(stats.executions, READERS as u64);
    assert_eq!(stats.disposals, stats.executions);
    assert_eq!(stats.live_buffers, 0);
}

#[test]
fn fresh_results_with_deferred_reclaim() {
    fresh_results_under_reclaim(ReclaimMode::Deferred);
}

#[test]
fn fresh_results_with_background_reclaim() {
    fresh_results_under_reclaim(ReclaimMode::Background);
}

#[test]
fn close_races_readers_on_one_result() {
    init_tracing();
    const TRIALS: u64 = 200;
    const THREADS: usize = 8;

    let conn = edge_connection(ReclaimMode::Inline);
    conn.backend().set_read_spin(200);
    let counters = conn.backend().counters();
    let refused = AtomicU64::new(0);

    for trial in 0..TRIALS {
        let result = conn.query(EDGE_QUERY).expect("query");
        let rows: Vec<_> = result
            .cursor()
            .expect("cursor")
            .collect::<lbug::Result<_>>()
            .expect("rows");
        assert_eq!(rows.len(), EDGE_ROWS);
        let start = Barrier::new(THREADS + 1);

        thread::scope(|s| {
            for t in 0..THREADS {
                let rows = rows.clone();
                let (start, refused) = (&start, &refused);
                s.spawn(move || {
                    start.wait();
                    for pass in 0.. {
                        let row = &rows[(t + pass) % rows.len()];
                        let col = (t + pass) % EDGE_COLUMNS;
                        match row.get_value(col) {
                            Ok(v) => assert_eq!(v, edge_value(row.index() as usize, col)),
                            Err(Error::Closing | Error::Released) => {
                                refused.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                });
            }

            let (result, start) = (&result, &start);
            s.spawn(move || {
                start.wait();
                for _ in 0..(trial % 7) * 50 {
                    std::hint::spin_loop();
                }
                assert_ne!(result.close(), ReleaseOutcome::AlreadyRequested);
            });
        });

        assert_eq!(result.state(), HandleState::Closed);
        assert_eq!(counters.snapshot().disposals, trial + 1);
    }

    let stats = counters.snapshot();
    assert_eq!(stats.violations, 0);
    assert_eq!(stats.disposals, TRIALS);
    assert_eq!(stats.live_buffers, 0);
    // Every reader stops on a refused borrow.
    assert_eq!(refused.load(Ordering::Relaxed), TRIALS * THREADS as u64);
}

#[test]
fn dropped_result_while_views_read_on_other_threads() {
    init_tracing();
    const TRIALS: usize = 50;
    const THREADS: usize = 8;
    const PASSES: usize = 40;

    let conn = edge_connection(ReclaimMode::Inline);
    conn.backend().set_read_spin(100);
    let counters = conn.backend().counters();

    for trial in 0..TRIALS {
        let result = conn.query(EDGE_QUERY).expect("query");
        let mut cursor = result.cursor().expect("cursor");
        let rows: Vec<_> = cursor.by_ref().collect::<lbug::Result<_>>().expect("rows");
        let start = Barrier::new(THREADS + 1);

        thread::scope(|s| {
            for t in 0..THREADS {
                let rows = rows.clone();
                let start = &start;
                s.spawn(move || {
                    start.wait();
                    for pass in 0..PASSES {
                        let row = &rows[(t + pass) % rows.len()];
                        let col = (t * 3 + pass) % EDGE_COLUMNS;
                        // The views keep the buffer alive, so every read succeeds.
                        let v = row.get_value(col).expect("read through a live view");
                        assert_eq!(v, edge_value(row.index() as usize, col));
                    }
                });
            }

            let start = &start;
            s.spawn(move || {
                start.wait();
                drop(cursor);
                drop(result);
            });
        });

        // The main thread's views are the last ones left.
        assert_eq!(counters.snapshot().disposals, trial as u64);
        drop(rows);
        assert_eq!(counters.snapshot().disposals, trial as u64 + 1);
    }

    let stats = counters.snapshot();
    assert_eq!(stats.violations, 0);
    assert_eq!(stats.disposals, TRIALS as u64);
    assert_eq!(stats.live_buffers, 0);
}

#[test]
fn release_waits_for_a_borrow_held_on_another_thread() {
    let conn = edge_connection(ReclaimMode::Inline);
    let result = conn.query(EDGE_QUERY).expect("query");
    let handle = result.handle();
    let held = Barrier::new(2);
    let released = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let guard = handle.acquire().expect("borrow");
            held.wait();
            released.wait();
            drop(guard);
        });

        held.wait();
        assert_eq!(result.close(), ReleaseOutcome::Deferred { borrows: 1 });
        assert_eq!(result.state(), HandleState::Closing);
        assert!(matches!(handle.acquire(), Err(Error::Closing)));
        assert_eq!(conn.backend().stats().disposals, 0);
        released.wait();
    });

    assert_eq!(result.state(), HandleState::Closed);
    assert_eq!(conn.backend().stats().disposals, 1);
    assert_eq!(conn.backend().stats().violations, 0);
}

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    DropGuard(usize),
    Release,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Acquire),
        3 => any::<usize>().prop_map(Op::DropGuard),
        1 => Just(Op::Release),
    ]
}

proptest! {
    #[test]
    fn buffer_is_freed_once_and_never_under_a_borrow(
        ops in proptest::collection::vec(arb_op(), 0..64),
    ) {
        let conn = edge_connection(ReclaimMode::Inline);
        let result = conn.query(EDGE_QUERY).unwrap();
        let handle = result.handle();
        let mut guards = Vec::new();
        let mut requested = false;

        for op in ops {
            match op {
                Op::Acquire => match handle.acquire() {
                    Ok(g) => {
                        prop_assert!(!requested);
                        guards.push(g);
                    }
                    Err(Error::Closing) => prop_assert!(requested && !guards.is_empty()),
                    Err(Error::Released) => prop_assert!(requested && guards.is_empty()),
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                },
                Op::DropGuard(i) => {
                    if !guards.is_empty() {
                        let i = i % guards.len();
                        drop(guards.swap_remove(i));
                    }
                }
                Op::Release => {
                    let outcome = result.close();
                    if requested {
                        prop_assert_eq!(outcome, ReleaseOutcome::AlreadyRequested);
                    } else if guards.is_empty() {
                        prop_assert_eq!(outcome, ReleaseOutcome::Freed);
                    } else {
                        prop_assert_eq!(outcome, ReleaseOutcome::Deferred { borrows: guards.len() });
                    }
                    requested = true;
                }
            }

            let disposals = conn.backend().stats().disposals;
            prop_assert_eq!(handle.active_borrows(), guards.len());
            prop_assert_eq!(disposals, u64::from(requested && guards.is_empty()));
        }

        drop(guards);
        drop(result);
        let stats = conn.backend().stats();
        prop_assert_eq!(stats.disposals, 1);
        prop_assert_eq!(stats.violations, 0);
    }
}
