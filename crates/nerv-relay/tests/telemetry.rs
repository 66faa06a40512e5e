#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nerv_core::clock::ManualClock;
use nerv_relay::obs::{signal, ObserverList, TelemetryBus};
use serde_json::json;

fn bus(enabled: bool) -> (TelemetryBus, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    (TelemetryBus::new(enabled, clock.clone()), clock)
}

#[test]
fn emit_counts_and_timestamps() {
    let (bus, clock) = bus(true);
    bus.emit(signal::EMISSION_SENT, json!({ "msg_id": "m1" }));
    clock.advance(10);
    bus.emit(signal::EMISSION_SENT, json!({ "msg_id": "m2" }));
    bus.signal(signal::ROUTER_START);

    let stats = bus.stats();
    assert_eq!(stats.count(signal::EMISSION_SENT), 2);
    assert_eq!(stats.count(signal::ROUTER_START), 1);
    assert_eq!(stats.count(signal::ROUTER_STOP), 0);
    assert_eq!(
        stats.timestamps.get(&format!("last:{}", signal::EMISSION_SENT)),
        Some(&1_010)
    );
}

#[test]
fn panicking_subscriber_is_isolated() {
    let (bus, _) = bus(true);
    let hits = Arc::new(AtomicUsize::new(0));

    let _ = bus.on(|_| panic!("subscriber bug"));
    let counter = Arc::clone(&hits);
    let _ = bus.on(move |ev| {
        assert_eq!(ev.kind, signal::BUFFER_ENQUEUE);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.emit(signal::BUFFER_ENQUEUE, json!({ "buffer": "outbound", "size": 1 }));
    bus.emit(signal::BUFFER_ENQUEUE, json!({ "buffer": "outbound", "size": 2 }));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(bus.stats().count(signal::BUFFER_ENQUEUE), 2);
}

#[test]
fn disabled_bus_is_silent() {
    let (bus, _) = bus(false);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let _ = bus.on(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.emit(signal::TRANSPORT_ERROR, json!({ "error": "boom" }));
    bus.set_gauge("buffer:outbound:size", 3);

    assert!(!bus.enabled());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let stats = bus.stats();
    assert!(stats.counters.is_empty());
    assert!(stats.gauges.is_empty());
}

#[test]
fn unsubscribe_stops_delivery() {
    let (bus, _) = bus(true);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let sub = bus.on(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.signal(signal::HEALTH_SNAPSHOT);
    assert!(sub.unsubscribe());
    bus.signal(signal::HEALTH_SNAPSHOT);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn reset_clears_stats() {
    let (bus, _) = bus(true);
    bus.signal(signal::ROUTER_SENT);
    bus.inc_counter("custom", 4);
    bus.set_gauge("g", -2);
    assert_eq!(bus.stats().counters.get("custom"), Some(&4));
    assert_eq!(bus.stats().gauges.get("g"), Some(&-2));

    bus.reset();
    let stats = bus.stats();
    assert!(stats.counters.is_empty());
    assert!(stats.gauges.is_empty());
    assert!(stats.timestamps.is_empty());
}

#[test]
fn handler_may_unsubscribe_while_notified() {
    let list: ObserverList<u32> = ObserverList::new();
    let slot: Arc<std::sync::Mutex<Option<nerv_relay::obs::Subscription>>> = Arc::default();
    let hits = Arc::new(AtomicUsize::new(0));

    let inner_slot = Arc::clone(&slot);
    let counter = Arc::clone(&hits);
    let sub = list.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(s) = inner_slot.lock().unwrap().take() {
            s.unsubscribe();
        }
    });
    *slot.lock().unwrap() = Some(sub);

    assert_eq!(list.notify(&1), 0);
    assert_eq!(list.notify(&2), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(list.is_empty());
}
