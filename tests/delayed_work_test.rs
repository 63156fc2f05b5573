//! Integration tests for delayed work
//!
//! These tests validate:
//! - Self-rescheduling stops at the handler's own limit
//! - The re-arm depth guard
//! - cancel_sync stops a self-rearming chain
//! - Delayed tasklets and delayed queue items behave alike

use prometheus_deferred::config::WorkQueueConfig;
use prometheus_deferred::core::{
    CancelOutcome, DelayOutcome, DelayTarget, DelayedWork, EngineError, RunQueue, TimerService,
    WorkItem, WorkQueue,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(5);

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn test_queue_item_repeats_exactly_five_times() {
    let timers = TimerService::start().unwrap();
    let wq = WorkQueue::create(WorkQueueConfig::dedicated("repeat", 1), None, None).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let dw = DelayedWork::for_queue(&timers, &wq, "repeat-5", None, move |me| {
        if r.fetch_add(1, Ordering::SeqCst) + 1 < 5 {
            me.schedule_after(TICK)?;
        }
        Ok(())
    });

    dw.schedule_after(TICK).unwrap();
    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 5 && !dw.is_pending()));
    thread::sleep(Duration::from_millis(40));
    assert_eq!(runs.load(Ordering::SeqCst), 5);
    assert_eq!(dw.fire_count(), 5);
    assert_eq!(dw.cancel_sync(), CancelOutcome::NotPending);

    timers.shutdown();
    wq.destroy().unwrap();
}

#[test]
fn test_tasklet_repeats_exactly_five_times() {
    let timers = TimerService::start().unwrap();
    let rq = RunQueue::start(2, None).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let dw = DelayedWork::for_tasklet(&timers, &rq, "repeat-5-fast", None, move |me| {
        if r.fetch_add(1, Ordering::SeqCst) + 1 < 5 {
            me.schedule_after(TICK)?;
        }
        Ok(())
    });

    dw.schedule_after(TICK).unwrap();
    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 5 && !dw.is_pending()));
    thread::sleep(Duration::from_millis(40));
    assert_eq!(runs.load(Ordering::SeqCst), 5);

    timers.shutdown();
    rq.shutdown();
}

#[test]
fn test_depth_guard_stops_unbounded_rearm() {
    let timers = TimerService::start().unwrap();
    let wq = WorkQueue::create(WorkQueueConfig::dedicated("guarded", 1), None, None).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let dw = DelayedWork::for_queue(&timers, &wq, "forever", Some(3), move |me| {
        r.fetch_add(1, Ordering::SeqCst);
        me.schedule_after(TICK)?;
        Ok(())
    });

    dw.schedule_after(TICK).unwrap();
    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 4 && !dw.is_pending()));
    thread::sleep(Duration::from_millis(40));
    assert_eq!(runs.load(Ordering::SeqCst), 4);

    if let DelayTarget::Queue { item, .. } = dw.target() {
        let stats = item.stats();
        assert_eq!(stats.failures, 1);
        assert!(stats
            .last_error
            .is_some_and(|e| e.contains("reschedule depth limit 3")));
    } else {
        panic!("expected a queue target");
    }

    // An external schedule starts a fresh chain.
    assert_eq!(dw.schedule_after(TICK).unwrap(), DelayOutcome::Armed);
    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 8 && !dw.is_pending()));

    timers.shutdown();
    wq.destroy().unwrap();
}

#[test]
fn test_cancel_stops_self_rearming_chain() {
    let timers = TimerService::start().unwrap();
    let wq = WorkQueue::create(WorkQueueConfig::dedicated("chain", 1), None, None).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let dw = DelayedWork::for_queue(&timers, &wq, "chain", None, move |me| {
        r.fetch_add(1, Ordering::SeqCst);
        me.schedule_after(Duration::from_millis(2))?;
        Ok(())
    });

    dw.schedule_after(Duration::from_millis(2)).unwrap();
    assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 3));
    assert_eq!(dw.cancel_sync(), CancelOutcome::WasPending);

    let after_cancel = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    assert!(!dw.is_pending());

    timers.shutdown();
    wq.destroy().unwrap();
}

#[test]
fn test_wrapping_an_existing_item() {
    let timers = TimerService::start().unwrap();
    let wq = WorkQueue::create(WorkQueueConfig::dedicated("wrapped", 1), None, None).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let item = WorkItem::new("plain", move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let dw = DelayedWork::new(
        &timers,
        DelayTarget::Queue {
            queue: wq.clone(),
            item: item.clone(),
        },
        None,
    );

    dw.schedule_after(Duration::from_millis(10)).unwrap();
    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1));
    assert_eq!(item.stats().runs, 1);
    assert_eq!(wq.stats().submitted, 1);

    timers.shutdown();
    assert!(matches!(
        dw.schedule_after(TICK),
        Err(EngineError::InvalidState(_))
    ));
    wq.destroy().unwrap();
}
