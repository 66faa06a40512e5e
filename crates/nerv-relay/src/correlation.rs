//! Correlation store: compact per-chain history keyed by `correlationId`.
//!
//! Each record keeps only `(timestamp, kind, msgId)` projections in arrival
//! order. Records expire by age (TTL from creation), never by chain
//! completion, which this layer has no notion of. `max_entries` is advisory:
//! exceeding it emits `size_exceeded` but history is never truncated.
//!
//! Sweeping collects expired keys first and then removes them one by one with
//! `remove_if`, so `append`/`get` only ever wait for a single shard operation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use uuid::Uuid;

use nerv_core::clock::Clock;
use nerv_core::protocol::{Envelope, Kind};

use crate::config::CorrelationSection;
use crate::obs::{signal, TelemetryBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationEntry {
    pub timestamp: i64,
    pub kind: Kind,
    pub msg_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationRecord {
    pub correlation_id: Uuid,
    pub created_at: i64,
    pub entries: Vec<CorrelationEntry>,
}

pub struct CorrelationStore {
    records: DashMap<Uuid, CorrelationRecord>,
    ttl_ms: i64,
    max_entries: Option<usize>,
    telemetry: Arc<TelemetryBus>,
    clock: Arc<dyn Clock>,
}

impl CorrelationStore {
    pub fn new(cfg: &CorrelationSection, telemetry: Arc<TelemetryBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            ttl_ms: i64::try_from(cfg.ttl_ms).unwrap_or(i64::MAX),
            max_entries: (cfg.max_entries > 0).then_some(cfg.max_entries),
            telemetry,
            clock,
        }
    }

    /// Record `env` under `correlation_id`, creating the record on first touch.
    pub fn append(&self, correlation_id: Uuid, env: &Envelope) {
        let now = self.clock.now_ms();
        let entry = CorrelationEntry {
            timestamp: now,
            kind: env.kind(),
            msg_id: env.msg_id(),
        };

        let (created, size) = {
            let mut created = false;
            let mut rec = self.records.entry(correlation_id).or_insert_with(|| {
                created = true;
                CorrelationRecord {
                    correlation_id,
                    created_at: now,
                    entries: Vec::new(),
                }
            });
            rec.entries.push(entry);
            (created, rec.entries.len())
        };

        let id = correlation_id.to_string();
        if created {
            self.telemetry
                .emit(signal::CORRELATION_CREATED, json!({ "correlation_id": id }));
        }
        self.telemetry.emit(
            signal::CORRELATION_APPEND,
            json!({ "correlation_id": id, "size": size }),
        );
        if let Some(limit) = self.max_entries {
            if size > limit {
                tracing::debug!(correlation_id = %correlation_id, size, limit, "correlation record over soft limit");
                self.telemetry.emit(
                    signal::CORRELATION_SIZE_EXCEEDED,
                    json!({ "correlation_id": id, "size": size, "limit": limit }),
                );
            }
        }
    }

    /// Ordered copy of the entries (empty when unknown).
    pub fn get(&self, correlation_id: &Uuid) -> Vec<CorrelationEntry> {
        self.records
            .get(correlation_id)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }

    pub fn has(&self, correlation_id: &Uuid) -> bool {
        self.records.contains_key(correlation_id)
    }

    /// Number of entries recorded for this chain.
    pub fn size(&self, correlation_id: &Uuid) -> usize {
        self.records
            .get(correlation_id)
            .map(|r| r.entries.len())
            .unwrap_or(0)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Known correlation ids. Diagnostic only; order is unspecified.
    pub fn list(&self) -> Vec<Uuid> {
        self.records.iter().map(|r| *r.key()).collect()
    }

    /// Audit read: full record copy, emits `nerv:correlation:read`.
    pub fn history(&self, correlation_id: &Uuid) -> Option<CorrelationRecord> {
        let rec = self.records.get(correlation_id).map(|r| r.clone());
        self.telemetry.emit(
            signal::CORRELATION_READ,
            json!({
                "correlation_id": correlation_id.to_string(),
                "found": rec.is_some(),
            }),
        );
        rec
    }

    /// Audit read: existence check, emits `nerv:correlation:read`.
    pub fn exists(&self, correlation_id: &Uuid) -> bool {
        let found = self.has(correlation_id);
        self.telemetry.emit(
            signal::CORRELATION_READ,
            json!({ "correlation_id": correlation_id.to_string(), "found": found }),
        );
        found
    }

    /// Remove records whose age exceeds the TTL at `now`. Returns how many.
    pub fn sweep_at(&self, now: i64) -> usize {
        let ttl = self.ttl_ms;
        let is_expired = |r: &CorrelationRecord| now.saturating_sub(r.created_at) >= ttl;

        let candidates: Vec<Uuid> = self
            .records
            .iter()
            .filter(|r| is_expired(r.value()))
            .map(|r| *r.key())
            .collect();

        let mut removed = 0;
        for id in candidates {
            if let Some((id, rec)) = self.records.remove_if(&id, |_, r| is_expired(r)) {
                removed += 1;
                self.telemetry.emit(
                    signal::CORRELATION_EXPIRED,
                    json!({
                        "correlation_id": id.to_string(),
                        "entries": rec.entries.len(),
                        "age_ms": now.saturating_sub(rec.created_at),
                    }),
                );
            }
        }

        self.telemetry.emit(
            signal::CORRELATION_CLEANUP,
            json!({ "removed": removed, "remaining": self.records.len() }),
        );
        if removed > 0 {
            tracing::debug!(removed, "correlation sweep");
        }
        removed
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now_ms())
    }

    /// Periodic sweep on the current tokio runtime. The task ends on its own
    /// once the store is dropped; abort the handle to stop it earlier.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
