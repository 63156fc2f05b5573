//! Integration tests for task registries
//!
//! These tests validate:
//! - Snapshot counters after draining
//! - Priority entries use the hi tier
//! - Counter and scan views of pending entries
//! - Teardown of entries that never ran
//! - Concurrent allocation against a fixed capacity
//! - Teardown waiting on a concurrent retire

use prometheus_deferred::core::{
    EngineError, EntryId, RegistryStats, RunQueue, TaskRegistry, Tasklet, TaskletPhase,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Park the run queue's only dispatcher until the returned sender fires.
fn occupy(rq: &RunQueue) -> (Tasklet, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let rx = parking_lot::Mutex::new(rx);
    let t = Tasklet::new(rq, "occupier", move |_| {
        let _ = rx.lock().recv();
        Ok(())
    });
    t.schedule().unwrap();
    assert!(wait_for(|| t.phase() == TaskletPhase::Running));
    (t, tx)
}

#[derive(Debug)]
struct Packet {
    seq: u32,
}

#[test]
fn test_three_entries_drain_to_expected_snapshot() {
    let rq = RunQueue::start(2, None).unwrap();
    let registry = TaskRegistry::new("drain", &rq, 8, true, |_, _: &Packet| Ok(()));

    registry.create_tracked(Packet { seq: 1 }, false).unwrap();
    registry.create_tracked(Packet { seq: 2 }, false).unwrap();
    registry.create_tracked(Packet { seq: 3 }, true).unwrap();

    assert!(wait_for(|| registry.snapshot().executed == 3));
    assert!(wait_for(|| registry.snapshot().pending_by_scan == 0));
    let snap = registry.snapshot();
    assert_eq!(
        snap,
        RegistryStats {
            name: "drain".into(),
            created: 3,
            scheduled: 3,
            executed: 3,
            high_priority: 1,
            pending_counter: 0,
            pending_by_scan: 0,
            live: 3,
            capacity: 8,
        }
    );

    registry.teardown().unwrap();
    rq.shutdown();
}

#[test]
fn test_priority_entry_runs_first() {
    let rq = RunQueue::start(1, None).unwrap();
    let (occupier, release) = occupy(&rq);

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    let registry = TaskRegistry::new("priority", &rq, 8, true, move |_, p: &Packet| {
        o.lock().push(p.seq);
        Ok(())
    });
    registry.create_tracked(Packet { seq: 1 }, false).unwrap();
    registry.create_tracked(Packet { seq: 2 }, false).unwrap();
    let hi = registry.create_tracked(Packet { seq: 3 }, true).unwrap();
    assert_eq!(registry.is_priority(hi), Some(true));

    let queued = registry.snapshot();
    assert_eq!(queued.pending_counter, 3);
    assert_eq!(queued.pending_by_scan, 3);

    release.send(()).unwrap();
    assert!(wait_for(|| registry.snapshot().executed == 3));
    assert_eq!(*order.lock(), vec![3, 1, 2]);

    registry.teardown().unwrap();
    occupier.kill().unwrap();
    rq.shutdown();
}

#[test]
fn test_priority_disabled_keeps_submission_order() {
    let rq = RunQueue::start(1, None).unwrap();
    let (occupier, release) = occupy(&rq);

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    let registry = TaskRegistry::new("flat", &rq, 8, false, move |_, p: &Packet| {
        o.lock().push(p.seq);
        Ok(())
    });
    registry.create_tracked(Packet { seq: 1 }, false).unwrap();
    registry.create_tracked(Packet { seq: 2 }, true).unwrap();

    release.send(()).unwrap();
    assert!(wait_for(|| registry.snapshot().executed == 2));
    assert_eq!(*order.lock(), vec![1, 2]);
    assert_eq!(registry.snapshot().high_priority, 1);

    registry.teardown().unwrap();
    occupier.kill().unwrap();
    rq.shutdown();
}

#[test]
fn test_teardown_kills_entries_that_never_ran() {
    let rq = RunQueue::start(1, None).unwrap();
    let (occupier, release) = occupy(&rq);

    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let registry = TaskRegistry::new("abandoned", &rq, 4, true, move |_, _: &Packet| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let ids: Vec<EntryId> = (0..3)
        .map(|seq| registry.create_tracked(Packet { seq }, false).unwrap())
        .collect();

    registry.teardown().unwrap();
    release.send(()).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // The counter still carries the entries that never completed.
    let snap = registry.snapshot();
    assert_eq!(snap.live, 0);
    assert_eq!(snap.pending_by_scan, 0);
    assert_eq!(snap.pending_counter, 3);
    assert!(registry.payload(ids[0]).is_none());
    assert!(matches!(registry.retire(ids[1]), Err(EngineError::InvalidState(_))));

    occupier.kill().unwrap();
    rq.shutdown();
}

#[test]
fn test_concurrent_creation_respects_capacity() {
    let rq = RunQueue::start(2, None).unwrap();
    let registry = TaskRegistry::new("bounded", &rq, 16, true, |_, _: &u64| Ok(()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let registry = registry.clone();
            thread::spawn(move || {
                let mut ok = 0_usize;
                let mut exhausted = 0_usize;
                for i in 0..8 {
                    match registry.create_tracked(t * 100 + i, i % 3 == 0) {
                        Ok(_) => ok += 1,
                        Err(EngineError::AllocationFailure(_)) => exhausted += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                (ok, exhausted)
            })
        })
        .collect();

    let (ok, exhausted) = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .fold((0, 0), |acc, (o, e)| (acc.0 + o, acc.1 + e));
    assert_eq!(ok, 16);
    assert_eq!(exhausted, 16);

    assert!(wait_for(|| registry.snapshot().executed == 16));
    let snap = registry.snapshot();
    assert_eq!(snap.created, 16);
    assert_eq!(snap.live, 16);

    registry.teardown().unwrap();
    rq.shutdown();
}

#[test]
fn test_handler_receives_payload_and_id() {
    let rq = RunQueue::start(1, None).unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let registry = TaskRegistry::new("payloads", &rq, 4, true, move |id: EntryId, p: &String| {
        s.lock().push((id, p.clone()));
        Ok(())
    });
    let id = registry.create_tracked("hello".to_string(), false).unwrap();
    assert!(wait_for(|| registry.is_executed(id) == Some(true)));
    assert_eq!(*seen.lock(), vec![(id, "hello".to_string())]);

    registry.teardown().unwrap();
    rq.shutdown();
}

#[test]
fn test_panicking_handler_still_completes_entry() {
    let rq = RunQueue::start(1, None).unwrap();
    let registry = TaskRegistry::new("panicky", &rq, 4, true, |_, p: &Packet| match p.seq {
        0 => panic!("corrupt packet"),
        1 => anyhow::bail!("bad checksum"),
        _ => Ok(()),
    });
    let panicked = registry.create_tracked(Packet { seq: 0 }, false).unwrap();
    let failed = registry.create_tracked(Packet { seq: 1 }, false).unwrap();

    assert!(wait_for(|| registry.is_executed(panicked) == Some(true)));
    assert!(wait_for(|| registry.is_executed(failed) == Some(true)));
    let snap = registry.snapshot();
    assert_eq!(snap.executed, 2);
    assert_eq!(snap.pending_counter, 0);
    assert_eq!(snap.pending_by_scan, 0);
    assert!(wait_for(|| rq.stats().failed == 2));

    // The dispatcher survived both failures.
    let healthy = registry.create_tracked(Packet { seq: 2 }, false).unwrap();
    assert!(wait_for(|| registry.is_executed(healthy) == Some(true)));
    assert!(wait_for(|| rq.stats().executed == 3));
    assert_eq!(rq.stats().failed, 2);

    registry.teardown().unwrap();
    rq.shutdown();
}

#[test]
fn test_teardown_waits_for_concurrent_retire() {
    let rq = RunQueue::start(1, None).unwrap();
    let (tx, rx) = mpsc::channel::<()>();
    let rx = parking_lot::Mutex::new(rx);
    let started = Arc::new(AtomicBool::new(false));
    let s = Arc::clone(&started);
    let registry = Arc::new(TaskRegistry::new("contended", &rq, 2, true, move |_, _: &Packet| {
        s.store(true, Ordering::SeqCst);
        let _ = rx.lock().recv();
        Ok(())
    }));
    let id = registry.create_tracked(Packet { seq: 0 }, false).unwrap();
    assert!(wait_for(|| started.load(Ordering::SeqCst)));

    // The retire unlinks the entry, then blocks killing the running handler.
    let retiring = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.retire(id))
    };
    assert!(wait_for(|| registry.snapshot().live == 0));

    let torn_down = Arc::new(AtomicBool::new(false));
    let tearing = {
        let registry = Arc::clone(&registry);
        let torn_down = Arc::clone(&torn_down);
        thread::spawn(move || {
            let result = registry.teardown();
            torn_down.store(true, Ordering::SeqCst);
            result
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!torn_down.load(Ordering::SeqCst));

    tx.send(()).unwrap();
    retiring.join().unwrap().unwrap();
    tearing.join().unwrap().unwrap();
    assert!(registry.is_torn_down());
    assert_eq!(registry.snapshot().capacity, 2);
    assert_eq!(registry.snapshot().live, 0);
    rq.shutdown();
}
