//! Passive telemetry bus.
//!
//! `emit` bumps a counter (`event:<type>`), records a last-seen timestamp
//! (`last:<type>`), logs at trace level and notifies subscribers. Subscribers
//! are isolated from each other and from the emitting call site. Counters and
//! gauges are atomics behind `DashMap`, so emitting never takes a global lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use nerv_core::clock::Clock;

use super::observers::{ObserverList, Subscription};

/// Signal names emitted by the relay.
pub mod signal {
    pub const BUFFER_ENQUEUE: &str = "nerv:buffer:enqueue";
    pub const BUFFER_DEQUEUE: &str = "nerv:buffer:dequeue";
    pub const BUFFER_PRESSURE: &str = "nerv:buffer:pressure";
    pub const BUFFER_RELIEF: &str = "nerv:buffer:relief";
    pub const BUFFER_CLEARED: &str = "nerv:buffer:cleared";

    pub const CORRELATION_CREATED: &str = "nerv:correlation:created";
    pub const CORRELATION_APPEND: &str = "nerv:correlation:append";
    pub const CORRELATION_SIZE_EXCEEDED: &str = "nerv:correlation:size_exceeded";
    pub const CORRELATION_EXPIRED: &str = "nerv:correlation:expired";
    pub const CORRELATION_CLEANUP: &str = "nerv:correlation:cleanup";
    pub const CORRELATION_READ: &str = "nerv:correlation:read";

    pub const EMISSION_ATTEMPT: &str = "nerv:emission:attempt";
    pub const EMISSION_REJECTED: &str = "nerv:emission:rejected";
    pub const EMISSION_QUEUED: &str = "nerv:emission:queued";
    pub const EMISSION_SENT: &str = "nerv:emission:sent";
    pub const EMISSION_ENQUEUE_FAILED: &str = "nerv:emission:enqueue_failed";

    pub const RECEPTION_DELIVERED: &str = "nerv:reception:delivered";
    pub const RECEPTION_DROPPED: &str = "nerv:reception:dropped";
    pub const RECEPTION_HANDLER_ERROR: &str = "nerv:reception:handler_error";

    pub const TRANSPORT_STARTING: &str = "nerv:transport:starting";
    pub const TRANSPORT_STOPPING: &str = "nerv:transport:stopping";
    pub const TRANSPORT_CONNECTED: &str = "nerv:transport:connected";
    pub const TRANSPORT_DISCONNECTED: &str = "nerv:transport:disconnected";
    pub const TRANSPORT_ERROR: &str = "nerv:transport:error";
    pub const TRANSPORT_SEND: &str = "nerv:transport:send";
    pub const TRANSPORT_SEND_FAILED: &str = "nerv:transport:send_failed";
    pub const TRANSPORT_RECEIVE: &str = "nerv:transport:receive";

    pub const RECONNECT_START: &str = "nerv:transport:reconnect:start";
    pub const RECONNECT_ATTEMPT: &str = "nerv:transport:reconnect:attempt";
    pub const RECONNECT_EXHAUSTED: &str = "nerv:transport:reconnect:exhausted";
    pub const RECONNECT_STOP: &str = "nerv:transport:reconnect:stop";

    pub const CHANNEL_STATE: &str = "nerv:channel:state";
    pub const HANDSHAKE_SENT: &str = "nerv:channel:handshake_sent";
    pub const HANDSHAKE_COMPLETED: &str = "nerv:channel:handshake_completed";
    pub const HANDSHAKE_FAILED: &str = "nerv:channel:handshake_failed";
    pub const PROTOCOL_MISMATCH: &str = "nerv:channel:protocol_mismatch";
    pub const OUTBOX_FLUSHED: &str = "nerv:channel:outbox_flushed";

    pub const ROUTER_START: &str = "nerv:router:start";
    pub const ROUTER_STOP: &str = "nerv:router:stop";
    pub const ROUTER_SENT: &str = "nerv:router:sent";
    pub const ROUTER_HANDLER_ERROR: &str = "nerv:router:handler_error";

    pub const HEALTH_UPDATE: &str = "nerv:health:update";
    pub const HEALTH_ANOMALY: &str = "nerv:health:anomaly";
    pub const HEALTH_SNAPSHOT: &str = "nerv:health:snapshot";
}

/// One emitted telemetry event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub meta: Value,
}

/// Pure-read snapshot of counters, gauges and timestamps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetryStats {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub timestamps: BTreeMap<String, i64>,
}

impl TelemetryStats {
    /// Counter for `event:<kind>` (0 when never emitted).
    pub fn count(&self, kind: &str) -> u64 {
        self.counters
            .get(&format!("event:{kind}"))
            .copied()
            .unwrap_or(0)
    }
}

pub struct TelemetryBus {
    enabled: bool,
    clock: Arc<dyn Clock>,
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    timestamps: DashMap<String, AtomicI64>,
    subscribers: ObserverList<TelemetryEvent>,
}

impl TelemetryBus {
    pub fn new(enabled: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled,
            clock,
            counters: DashMap::new(),
            gauges: DashMap::new(),
            timestamps: DashMap::new(),
            subscribers: ObserverList::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Emit a signal with no metadata.
    pub fn signal(&self, kind: &str) {
        self.emit(kind, Value::Null);
    }

    /// Record and fan out one event. No-op when disabled.
    pub fn emit(&self, kind: &str, meta: Value) {
        if !self.enabled {
            return;
        }

        let now = self.clock.now_ms();
        self.inc_counter(&format!("event:{kind}"), 1);
        self.mark(&format!("last:{kind}"), now);

        tracing::trace!(target: "nerv::telemetry", kind, %meta, "telemetry");

        let event = TelemetryEvent {
            timestamp: now,
            kind: kind.to_owned(),
            meta,
        };
        let failures = self.subscribers.notify(&event);
        if failures > 0 {
            tracing::debug!(kind, failures, "telemetry subscriber panicked (isolated)");
        }
    }

    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    pub fn inc_counter(&self, name: &str, v: u64) {
        if let Some(c) = self.counters.get(name) {
            c.fetch_add(v, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(v, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, v: i64) {
        if !self.enabled {
            return;
        }
        if let Some(g) = self.gauges.get(name) {
            g.store(v, Ordering::Relaxed);
            return;
        }
        self.gauges
            .entry(name.to_owned())
            .or_insert_with(|| AtomicI64::new(0))
            .store(v, Ordering::Relaxed);
    }

    fn mark(&self, name: &str, now: i64) {
        if let Some(t) = self.timestamps.get(name) {
            t.store(now, Ordering::Relaxed);
            return;
        }
        self.timestamps
            .entry(name.to_owned())
            .or_insert_with(|| AtomicI64::new(0))
            .store(now, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            counters: self
                .counters
                .iter()
                .map(|r| (r.key().clone(), r.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|r| (r.key().clone(), r.value().load(Ordering::Relaxed)))
                .collect(),
            timestamps: self
                .timestamps
                .iter()
                .map(|r| (r.key().clone(), r.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }

    /// Test-only in spirit: wipes counters, gauges and timestamps.
    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.timestamps.clear();
    }
}
