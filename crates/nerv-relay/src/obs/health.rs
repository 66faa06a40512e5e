//! Health monitor: folds transport/buffer/activity signals into one snapshot.
//!
//! Observation only. It never triggers corrective action; threshold breaches
//! become `nerv:health:anomaly` telemetry.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};

use nerv_core::clock::Clock;

use super::observers::{ObserverList, Subscription};
use super::telemetry::{signal, TelemetryBus};
use crate::config::HealthThresholds;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHealth {
    /// `None` until the transport reported anything.
    pub connected: Option<bool>,
    pub reconnecting: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferHealth {
    pub inbound: usize,
    pub outbound: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityHealth {
    pub last_emission: Option<i64>,
    pub last_reception: Option<i64>,
}

/// Point-in-time copy; callers own it and cannot reach the live state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: i64,
    pub transport: TransportHealth,
    pub buffers: BufferHealth,
    pub activity: ActivityHealth,
}

/// Closed vocabulary of inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    TransportConnected,
    TransportDisconnected,
    TransportError(String),
    TransportReconnecting(bool),
    BufferUpdate {
        inbound: Option<usize>,
        outbound: Option<usize>,
    },
    Emission,
    Reception,
}

impl HealthSignal {
    /// Map a string-typed report (`transport:error`, `buffer:update`, ...).
    /// Unknown types yield `None`.
    pub fn parse(kind: &str, data: &Value) -> Option<Self> {
        let usize_field = |k: &str| data.get(k).and_then(Value::as_u64).map(|n| n as usize);
        match kind {
            "transport:connected" => Some(Self::TransportConnected),
            "transport:disconnected" => Some(Self::TransportDisconnected),
            "transport:error" => Some(Self::TransportError(
                data.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("transport error")
                    .to_owned(),
            )),
            "transport:reconnecting" => Some(Self::TransportReconnecting(
                data.get("active").and_then(Value::as_bool).unwrap_or(true),
            )),
            "buffer:update" => Some(Self::BufferUpdate {
                inbound: usize_field("inbound"),
                outbound: usize_field("outbound"),
            }),
            "emission" => Some(Self::Emission),
            "reception" => Some(Self::Reception),
            _ => None,
        }
    }
}

pub struct HealthMonitor {
    telemetry: Arc<TelemetryBus>,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,
    state: Mutex<HealthSnapshot>,
    listeners: ObserverList<HealthSnapshot>,
}

impl HealthMonitor {
    pub fn new(telemetry: Arc<TelemetryBus>, clock: Arc<dyn Clock>, thresholds: HealthThresholds) -> Self {
        let state = HealthSnapshot {
            timestamp: clock.now_ms(),
            ..HealthSnapshot::default()
        };
        Self {
            telemetry,
            clock,
            thresholds,
            state: Mutex::new(state),
            listeners: ObserverList::new(),
        }
    }

    /// String-typed entry point; unknown types are ignored.
    pub fn report_raw(&self, kind: &str, data: &Value) {
        if let Some(sig) = HealthSignal::parse(kind, data) {
            self.report(sig);
        }
    }

    pub fn report(&self, sig: HealthSignal) {
        let check = matches!(sig, HealthSignal::BufferUpdate { .. });
        let now = self.clock.now_ms();

        let snapshot = {
            let mut s = match self.state.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match sig {
                HealthSignal::TransportConnected => {
                    s.transport.connected = Some(true);
                    s.transport.reconnecting = false;
                    s.transport.last_error = None;
                }
                HealthSignal::TransportDisconnected => s.transport.connected = Some(false),
                HealthSignal::TransportError(msg) => s.transport.last_error = Some(msg),
                HealthSignal::TransportReconnecting(active) => s.transport.reconnecting = active,
                HealthSignal::BufferUpdate { inbound, outbound } => {
                    if let Some(n) = inbound {
                        s.buffers.inbound = n;
                    }
                    if let Some(n) = outbound {
                        s.buffers.outbound = n;
                    }
                }
                HealthSignal::Emission => s.activity.last_emission = Some(now),
                HealthSignal::Reception => s.activity.last_reception = Some(now),
            }
            s.timestamp = now;
            s.clone()
        };

        self.telemetry.emit(
            signal::HEALTH_UPDATE,
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );

        if self.listeners.notify(&snapshot) > 0 {
            tracing::debug!("health listener panicked (isolated)");
        }

        if check {
            self.check_thresholds();
        }
    }

    /// Compare buffer sizes against configured limits; emits anomalies only.
    pub fn check_thresholds(&self) {
        let buffers = match self.state.lock() {
            Ok(g) => g.buffers.clone(),
            Err(poisoned) => poisoned.into_inner().buffers.clone(),
        };

        if let Some(limit) = self.thresholds.max_outbound_buffer {
            if buffers.outbound >= limit {
                self.telemetry.emit(
                    signal::HEALTH_ANOMALY,
                    json!({ "type": "outbound_buffer_pressure", "value": buffers.outbound, "limit": limit }),
                );
            }
        }
        if let Some(limit) = self.thresholds.max_inbound_buffer {
            if buffers.inbound >= limit {
                self.telemetry.emit(
                    signal::HEALTH_ANOMALY,
                    json!({ "type": "inbound_buffer_pressure", "value": buffers.inbound, "limit": limit }),
                );
            }
        }
    }

    pub fn status(&self) -> HealthSnapshot {
        self.telemetry.signal(signal::HEALTH_SNAPSHOT);
        match self.state.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HealthSnapshot) + Send + Sync + 'static,
    {
        self.listeners.subscribe(handler)
    }
}
