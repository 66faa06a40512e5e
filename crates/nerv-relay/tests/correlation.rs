//! Correlation store ordering, TTL expiry and audit reads.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod support;

use std::time::Duration;

use nerv_core::protocol::{action, ActorId, Envelope, Kind};
use nerv_relay::config::CorrelationSection;
use nerv_relay::obs::signal;
use nerv_relay::RelayConfig;

use support::{kinds, manual_ctx, record};

fn with_correlation(ttl_ms: u64, max_entries: usize) -> RelayConfig {
    RelayConfig {
        correlation: CorrelationSection {
            ttl_ms,
            sweep_interval_ms: 10,
            max_entries,
        },
        ..RelayConfig::default()
    }
}

fn chain() -> (Envelope, Envelope, Envelope) {
    let e1 = Envelope::builder(ActorId::Maestro, ActorId::Driver, Kind::Command, action::TASK_START)
        .build()
        .unwrap();
    let e2 = Envelope::ack_for(&e1, ActorId::Driver);
    let e3 = Envelope::builder(ActorId::Driver, ActorId::Maestro, Kind::Event, action::DRIVER_TASK_COMPLETED)
        .correlation_id(e1.correlation_id())
        .build()
        .unwrap();
    (e1, e2, e3)
}

#[test]
fn entries_keep_arrival_order() {
    let (ctx, clock) = manual_ctx(RelayConfig::default(), 1_000);
    let store = ctx.correlation();
    let (e1, e2, e3) = chain();
    let id = e1.correlation_id();

    for e in [&e1, &e2, &e3] {
        store.append(id, e);
        clock.advance(5);
    }

    let got: Vec<_> = store.get(&id).iter().map(|entry| entry.msg_id).collect();
    assert_eq!(got, vec![e1.msg_id(), e2.msg_id(), e3.msg_id()]);

    let entries = store.get(&id);
    assert_eq!(entries[1].kind, Kind::Ack);
    assert_eq!(entries[0].timestamp, 1_000);
    assert_eq!(entries[2].timestamp, 1_010);
    assert_eq!(store.size(&id), 3);
    assert_eq!(store.len(), 1);
}

#[test]
fn record_expires_after_ttl() {
    let (ctx, clock) = manual_ctx(with_correlation(1_000, 1000), 50_000);
    let seen = record(&ctx.telemetry());
    let store = ctx.correlation();
    let (e1, _, _) = chain();
    let id = e1.correlation_id();

    store.append(id, &e1);
    clock.advance(999);
    assert_eq!(store.sweep(), 0);
    assert!(store.has(&id));

    clock.advance(2);
    assert_eq!(store.sweep(), 1);
    assert!(!store.has(&id));
    assert!(store.get(&id).is_empty());

    let expired = kinds(&seen, signal::CORRELATION_EXPIRED);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].meta["correlation_id"], id.to_string());
    assert_eq!(kinds(&seen, signal::CORRELATION_CLEANUP).len(), 2);
}

#[test]
fn ttl_counts_from_creation_not_last_append() {
    let (ctx, clock) = manual_ctx(with_correlation(1_000, 1000), 0);
    let store = ctx.correlation();
    let (e1, e2, _) = chain();
    let id = e1.correlation_id();

    store.append(id, &e1);
    clock.advance(900);
    store.append(id, &e2);
    clock.advance(200);
    assert_eq!(store.sweep(), 1);
}

#[test]
fn oversized_record_is_signalled_not_truncated() {
    let (ctx, _clock) = manual_ctx(with_correlation(60_000, 2), 0);
    let seen = record(&ctx.telemetry());
    let store = ctx.correlation();
    let (e1, e2, e3) = chain();
    let id = e1.correlation_id();

    store.append(id, &e1);
    store.append(id, &e2);
    assert!(kinds(&seen, signal::CORRELATION_SIZE_EXCEEDED).is_empty());
    store.append(id, &e3);

    let exceeded = kinds(&seen, signal::CORRELATION_SIZE_EXCEEDED);
    assert_eq!(exceeded.len(), 1);
    assert_eq!(exceeded[0].meta["size"], 3);
    assert_eq!(store.size(&id), 3);
    assert_eq!(kinds(&seen, signal::CORRELATION_CREATED).len(), 1);
    assert_eq!(kinds(&seen, signal::CORRELATION_APPEND).len(), 3);
}

#[test]
fn audit_reads_emit_read_signal() {
    let (ctx, _clock) = manual_ctx(RelayConfig::default(), 7);
    let seen = record(&ctx.telemetry());
    let store = ctx.correlation();
    let (e1, _, _) = chain();
    let id = e1.correlation_id();
    store.append(id, &e1);

    let rec = store.history(&id).unwrap();
    assert_eq!(rec.correlation_id, id);
    assert_eq!(rec.created_at, 7);
    assert_eq!(rec.entries.len(), 1);

    assert!(store.exists(&id));
    assert!(!store.exists(&uuid::Uuid::new_v4()));

    let reads = kinds(&seen, signal::CORRELATION_READ);
    assert_eq!(reads.len(), 3);
    assert_eq!(reads[2].meta["found"], false);

    // Plain reads stay silent.
    let _ = store.get(&id);
    let _ = store.has(&id);
    assert_eq!(kinds(&seen, signal::CORRELATION_READ).len(), 3);
}

#[test]
fn returned_history_is_a_copy() {
    let (ctx, _clock) = manual_ctx(RelayConfig::default(), 0);
    let store = ctx.correlation();
    let (e1, e2, _) = chain();
    let id = e1.correlation_id();
    store.append(id, &e1);

    let mut copy = store.get(&id);
    copy.clear();
    store.append(id, &e2);
    assert_eq!(store.size(&id), 2);
}

#[tokio::test]
async fn background_sweeper_removes_expired_records() {
    let (ctx, clock) = manual_ctx(with_correlation(100, 1000), 0);
    let store = ctx.correlation();
    let (e1, _, _) = chain();
    let id = e1.correlation_id();
    store.append(id, &e1);
    clock.advance(500);

    let task = store.spawn_sweeper(Duration::from_millis(10));
    assert!(support::eventually(|| !store.has(&id)).await);
    task.abort();
}
