//! Tests for the observer API

use prometheus_deferred::config::EngineConfig;
use prometheus_deferred::core::{Engine, WorkItem};
use prometheus_deferred::runtime::{health, health_from_report, list_queues, Health};

fn engine() -> Engine {
    Engine::new(
        EngineConfig::default()
            .with_fast_threads(1)
            .with_shared_workers(1),
    )
    .unwrap()
}

#[test]
fn test_health_of_idle_engine() {
    let engine = engine();
    assert_eq!(
        health(&engine),
        Health {
            ok: true,
            queued_tasklets: 0,
            queued_items: 0,
            pending_entries: 0,
        }
    );
    engine.teardown().unwrap();
    assert!(!health(&engine).ok);
}

#[test]
fn test_list_queues_starts_with_system_queue() {
    let engine = engine();
    let _io = engine.create_queue("io").unwrap();
    let report = engine.report();
    let rows = list_queues(&report);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name, "events");
    assert_eq!(rows[0].worker_count, 0);
    assert_eq!(rows[1].name, "io");
    assert_eq!(health_from_report(&report).queued_items, 0);
    engine.teardown().unwrap();
}

#[test]
fn test_health_counts_queued_items() {
    let engine = engine();
    let io = engine.create_queue("io").unwrap();
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let rx = parking_lot::Mutex::new(rx);
    let blocker = WorkItem::new("blocker", move |_| {
        let _ = rx.lock().recv();
        Ok(())
    });
    let waiting = WorkItem::new("waiting", |_| Ok(()));
    io.submit(&blocker).unwrap();
    for _ in 0..500 {
        if blocker.is_running() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    io.submit(&waiting).unwrap();
    assert_eq!(health(&engine).queued_items, 1);

    tx.send(()).unwrap();
    io.flush().unwrap();
    engine.teardown().unwrap();
}
